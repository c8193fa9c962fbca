//! Per-request connection object handed to filters and handlers.
//!
//! # Data Flow
//! ```text
//! transport
//!     → RequestView (parsed once)
//!     → Connection { request, response, session, sink }
//!     → filters / handler mutate the ResponseBuilder
//!     → flush(): head (first time) + buffered body → FlushChunk → sink
//!     → transport writes chunks to the socket
//! ```
//!
//! # Design Decisions
//! - The head is frozen at the first flush; later head changes are no-ops
//! - The session's cookie rides on the first flush and marks it established
//! - A closed sink turns further flushes into cheap errors, never panics

pub mod cookie;
pub mod date;
pub mod request;
pub mod response;
pub mod sink;
pub mod status;

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

pub use cookie::{Cookie, CookieError, SameSite};
pub use request::RequestView;
pub use response::ResponseBuilder;
pub use sink::{FlushChunk, ResponseHead, ResponseSink, SinkClosed};

use crate::config::schema::EngineConfig;
use crate::session::handle::{removal_cookie, CookieCommand};
use crate::session::{Session, SessionStore};

/// Callback run after every successful flush with the total body bytes
/// sent so far.
pub type FlushCallback = Box<dyn FnMut(u64) + Send>;

const FILE_CHUNK_SIZE: usize = 64 * 1024;

pub struct Connection {
    request: RequestView,
    response: ResponseBuilder,
    session: Session,
    config: Arc<EngineConfig>,
    sink: Box<dyn ResponseSink>,
    sink_closed: bool,
    on_flush: Option<FlushCallback>,
}

impl Connection {
    pub fn new(
        request: RequestView,
        config: Arc<EngineConfig>,
        sessions: SessionStore,
        sink: Box<dyn ResponseSink>,
    ) -> Self {
        let presented = request
            .cookie(&config.session.cookie_name)
            .map(str::to_string);
        let session = Session::new(
            sessions,
            config.session.clone(),
            presented,
            request.remote_addr(),
        );
        Self {
            request,
            response: ResponseBuilder::new(),
            session,
            config,
            sink,
            sink_closed: false,
            on_flush: None,
        }
    }

    pub fn request(&self) -> &RequestView {
        &self.request
    }

    pub(crate) fn request_mut(&mut self) -> &mut RequestView {
        &mut self.request
    }

    pub fn response(&self) -> &ResponseBuilder {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseBuilder {
        &mut self.response
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Configuration snapshot this request was dispatched with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a callback invoked after each flush.
    pub fn on_flush(&mut self, callback: impl FnMut(u64) + Send + 'static) {
        self.on_flush = Some(Box::new(callback));
    }

    /// Send the head (first call only) and any buffered body bytes.
    pub fn flush(&mut self) -> Result<(), SinkClosed> {
        let first = !self.response.is_flushed();
        if !first && self.response.body().is_empty() {
            return if self.sink_closed { Err(SinkClosed) } else { Ok(()) };
        }

        let mut carries_session = false;
        if first {
            if let Some(command) = self.session.take_cookie() {
                carries_session = self.apply_cookie(command);
            }
        }

        let chunk = self.response.take_chunk();
        if self.sink_closed {
            return Err(SinkClosed);
        }
        if let Err(e) = self.sink.send(chunk) {
            debug!(request_id = %self.request.request_id(), "client went away, dropping output");
            self.sink_closed = true;
            return Err(e);
        }

        if carries_session {
            self.session.mark_established();
        }
        if let Some(callback) = self.on_flush.as_mut() {
            callback(self.response.bytes_sent());
        }
        Ok(())
    }

    /// Replace the response with a generated error page. Does nothing once
    /// the head is out.
    pub fn send_error(&mut self, status: u16) {
        if self.response.is_flushed() {
            return;
        }
        self.response.set_status(status);
        self.response
            .set_header("content-type", response::DEFAULT_CONTENT_TYPE);
        self.response.set_body(status::error_page(status));
    }

    /// Stream a file, flushing once per chunk.
    ///
    /// Sets content type, length and `Last-Modified`; answers 304 without a
    /// body when the request's `If-Modified-Since` is not older than the file.
    pub fn send_file(&mut self, path: impl AsRef<Path>, content_type: Option<&str>) -> io::Result<()> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }

        let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::<Utc>::from);
        if let Some(modified) = modified {
            let since = self
                .request
                .header("if-modified-since")
                .and_then(date::parse_http_date);
            if since.is_some_and(|since| modified.timestamp() <= since.timestamp()) {
                self.response.set_status(304);
                self.response.set_body(b"");
                return self.flush().map_err(broken_pipe);
            }
            self.response
                .set_header("last-modified", date::format_http_date(modified));
        }

        let mime = content_type.unwrap_or_else(|| guess_content_type(path));
        self.response.set_header("content-type", mime);
        self.response
            .set_header("content-length", metadata.len().to_string());
        self.response.set_body(b"");

        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            self.response.append_body(&buf[..read]);
            self.flush().map_err(broken_pipe)?;
        }
        // Empty files still need their head.
        self.flush().map_err(broken_pipe)
    }

    /// Final flush, then release the sink so the transport sees the end of
    /// the response.
    pub(crate) fn finish(mut self) {
        if !self.response.is_flushed() || !self.response.body().is_empty() {
            let _ = self.flush();
        }
    }

    fn apply_cookie(&mut self, command: CookieCommand) -> bool {
        match command {
            CookieCommand::Set { name, cookie } => match self.response.set_cookie(&name, cookie) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "session cookie rejected");
                    false
                }
            },
            CookieCommand::Remove { name } => {
                let _ = self.response.set_cookie(&name, removal_cookie());
                false
            }
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.response.append_body(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Connection::flush(self).map_err(broken_pipe)
    }
}

fn broken_pipe(e: SinkClosed) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e)
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn connection(request: RequestView) -> (Connection, Receiver<FlushChunk>, SessionStore) {
        let store = SessionStore::new();
        let (sink, rx) = sink::channel(Duration::from_secs(5));
        let conn = Connection::new(
            request,
            Arc::new(EngineConfig::default()),
            store.clone(),
            Box::new(sink),
        );
        (conn, rx, store)
    }

    fn drain(rx: &mut Receiver<FlushChunk>) -> Vec<FlushChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_streaming_flush_reports_bytes() {
        let (mut conn, mut rx, _) = connection(RequestView::builder("GET", "/").build());
        let reported = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&reported);
        conn.on_flush(move |sent| seen.store(sent, Ordering::SeqCst));

        conn.response_mut().set_status(202);
        write!(conn, "abc").unwrap();
        conn.flush().unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 3);

        conn.response_mut().set_status(500);
        conn.response_mut().set_header("x-late", "1");
        write!(conn, "defg").unwrap();
        conn.flush().unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 7);
        conn.finish();

        let chunks = drain(&mut rx);
        assert_eq!(chunks.len(), 2);
        let head = chunks[0].head.as_ref().unwrap();
        assert_eq!(head.status, 202);
        assert!(head.headers.iter().all(|(name, _)| name != "x-late"));
        assert!(chunks[1].head.is_none());
        assert_eq!(chunks[1].body.as_ref(), b"defg");
    }

    #[test]
    fn test_session_cookie_rides_first_flush() {
        let (mut conn, mut rx, store) = connection(RequestView::builder("GET", "/").build());
        let id = conn.session().start().unwrap().to_string();
        assert!(!conn.session().is_established());
        conn.flush().unwrap();
        assert!(conn.session().is_established());
        conn.finish();

        let chunks = drain(&mut rx);
        let head = chunks[0].head.as_ref().unwrap();
        let cookie = head
            .headers
            .iter()
            .find(|(name, _)| name == "set-cookie")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(cookie.starts_with(&format!("SESSION={}", id)));
        assert_eq!(store.stats().established, 1);
    }

    #[test]
    fn test_closed_sink_makes_flush_fail() {
        let (mut conn, rx, _) = connection(RequestView::builder("GET", "/").build());
        drop(rx);
        conn.response_mut().append_body("x");
        assert_eq!(conn.flush(), Err(SinkClosed));
        conn.response_mut().append_body("y");
        assert_eq!(conn.flush(), Err(SinkClosed));
    }

    #[test]
    fn test_send_error_only_before_flush() {
        let (mut conn, mut rx, _) = connection(RequestView::builder("GET", "/").build());
        conn.send_error(404);
        assert_eq!(conn.response().status(), 404);
        conn.flush().unwrap();
        conn.send_error(500);
        assert_eq!(conn.response().status(), 404);
        conn.finish();
        let chunks = drain(&mut rx);
        let body = String::from_utf8_lossy(&chunks[0].body).to_string();
        assert!(body.contains("404 Not Found"));
    }

    #[test]
    fn test_send_file_streams_and_honours_if_modified_since() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, vec![b'a'; FILE_CHUNK_SIZE + 10]).unwrap();

        let (mut conn, mut rx, _) = connection(RequestView::builder("GET", "/data.txt").build());
        conn.send_file(&path, None).unwrap();
        conn.finish();
        let chunks = drain(&mut rx);
        assert_eq!(chunks.len(), 2);
        let head = chunks[0].head.as_ref().unwrap();
        assert!(head
            .headers
            .contains(&("content-type".into(), "text/plain; charset=utf-8".into())));
        let total: usize = chunks.iter().map(|c| c.body.len()).sum();
        assert_eq!(total, FILE_CHUNK_SIZE + 10);
        let last_modified = head
            .headers
            .iter()
            .find(|(name, _)| name == "last-modified")
            .map(|(_, value)| value.clone())
            .unwrap();

        let request = RequestView::builder("GET", "/data.txt")
            .header("If-Modified-Since", &last_modified)
            .build();
        let (mut conn, mut rx, _) = connection(request);
        conn.send_file(&path, None).unwrap();
        conn.finish();
        let chunks = drain(&mut rx);
        assert_eq!(chunks[0].head.as_ref().unwrap().status, 304);
        assert!(chunks[0].body.is_empty());
    }
}
