//! FastCGI responder transport.
//!
//! # Data Flow
//! ```text
//! socket ─ read task ─→ records ─→ connection loop
//!                                    BEGIN_REQUEST → pending[id]
//!                                    PARAMS / STDIN → pending[id]
//!                                    empty STDIN  → RequestView → Dispatcher
//!                                                     └→ relay task per request
//! relay: FlushChunks → STDOUT records ─┐
//!                                      ├→ write task → socket
//! loop: GET_VALUES_RESULT, END_REQUEST ┘
//! ```
//!
//! # Design Decisions
//! - Requests are multiplexed: several ids may be in flight on one socket
//! - Without FCGI_KEEP_CONN the socket closes after that request ends
//! - ABORT_REQUEST discards output but never interrupts a running handler
//! - Relays share a per-connection write window, so a slow client stalls
//!   the workers' flushes instead of piling output up in memory
//! - Only the responder role is served; others get UNKNOWN_ROLE

pub mod record;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};

use self::record::{BeginRequest, ProtocolStatus, Record, RecordType, ROLE_RESPONDER};
use super::{accept_loop, error_response, ServeContext, TransportError};
use crate::config::schema::{EngineConfig, TransportKind};
use crate::connection::status::status_line;
use crate::connection::{sink, FlushChunk, RequestView, ResponseHead};
use crate::engine::pool::Dispatcher;
use crate::engine::snapshot::SnapshotCell;
use crate::lifecycle::shutdown::triggered;
use crate::net::{BoundAddr, Listener, Peer, Stream};

pub struct FastCgiTransport {
    listener: Listener,
}

impl FastCgiTransport {
    pub(crate) fn new(listener: Listener, _config: &EngineConfig) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> &BoundAddr {
        self.listener.local_addr()
    }

    pub(crate) async fn serve(self, ctx: ServeContext) {
        let shared = Arc::new(Shared {
            dispatcher: ctx.dispatcher.clone(),
            snapshots: Arc::clone(&ctx.snapshots),
            max_connections: self.listener.max_connections(),
        });
        tracing::info!(address = %self.local_addr(), "FastCGI transport starting");

        accept_loop(&self.listener, &ctx.shutdown, &ctx.tracker, |stream, peer, stop| {
            let shared = Arc::clone(&shared);
            async move {
                if let Err(e) = serve_connection(stream, peer, shared, stop).await {
                    tracing::debug!(error = %e, "FastCGI connection ended with error");
                }
            }
        })
        .await;
    }
}

struct Shared {
    dispatcher: Dispatcher,
    snapshots: Arc<SnapshotCell>,
    max_connections: usize,
}

/// A request still receiving PARAMS and STDIN.
struct Pending {
    keep_conn: bool,
    params: BytesMut,
    stdin: BytesMut,
    limit: usize,
    too_large: bool,
    params_overflow: bool,
}

/// Largest accepted PARAMS stream per request. Past it the request is
/// answered 400 without being dispatched.
pub const MAX_PARAMS_LEN: usize = 256 * 1024;

/// STDOUT records a connection's relays may have queued but not yet written.
const WRITE_WINDOW: usize = 8;

/// Bytes for the write task. Relayed output holds a window permit until
/// it reaches the socket.
struct Outgoing {
    bytes: Bytes,
    _permit: Option<OwnedSemaphorePermit>,
}

impl From<Bytes> for Outgoing {
    fn from(bytes: Bytes) -> Self {
        Self {
            bytes,
            _permit: None,
        }
    }
}

/// Sent by a relay once END_REQUEST is queued.
struct Done {
    request_id: u16,
    keep_conn: bool,
}

struct ConnectionState {
    peer: Peer,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<Outgoing>,
    window: Arc<Semaphore>,
    done: mpsc::UnboundedSender<Done>,
    pending: HashMap<u16, Pending>,
    in_flight: HashMap<u16, Arc<AtomicBool>>,
    draining: bool,
    close: bool,
}

async fn serve_connection(
    stream: Stream,
    peer: Peer,
    shared: Arc<Shared>,
    mut stop: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let (read_timeout, write_timeout) = {
        let snapshot = shared.snapshots.load();
        (snapshot.config.timeouts.read(), snapshot.config.timeouts.write())
    };

    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, out_rx, write_timeout));
    let (record_tx, mut records) = mpsc::channel(16);
    let reader_task = tokio::spawn(read_loop(reader, record_tx, read_timeout));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let mut state = ConnectionState {
        peer,
        shared,
        out: out_tx,
        window: Arc::new(Semaphore::new(WRITE_WINDOW)),
        done: done_tx,
        pending: HashMap::new(),
        in_flight: HashMap::new(),
        draining: false,
        close: false,
    };

    loop {
        tokio::select! {
            next = records.recv() => match next {
                Some(Ok(incoming)) => {
                    if let Err(e) = state.handle(incoming) {
                        tracing::warn!(error = %e, "FastCGI protocol error");
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "FastCGI read ended");
                    break;
                }
                None => break,
            },
            Some(done) = done_rx.recv() => {
                state.in_flight.remove(&done.request_id);
                if !done.keep_conn {
                    state.close = true;
                }
            }
            _ = triggered(&mut stop), if !state.draining => {
                state.draining = true;
            }
        }
        if state.close || (state.draining && state.is_idle()) {
            break;
        }
    }

    // In-flight relays keep the writer alive until their END_REQUEST is out.
    reader_task.abort();
    drop(state);
    writer_task
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
}

impl ConnectionState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn handle(&mut self, incoming: Record) -> Result<(), TransportError> {
        let id = incoming.request_id;
        match incoming.kind {
            RecordType::GetValues => self.get_values(&incoming.content)?,
            RecordType::BeginRequest => {
                let begin = BeginRequest::parse(&incoming.content)?;
                if begin.role != ROLE_RESPONDER {
                    tracing::debug!(request_id = id, role = begin.role, "Rejecting unknown role");
                    self.end_request(id, ProtocolStatus::UnknownRole, begin.keep_conn());
                } else if self.draining {
                    self.end_request(id, ProtocolStatus::Overloaded, begin.keep_conn());
                } else if self.pending.contains_key(&id) || self.in_flight.contains_key(&id) {
                    tracing::warn!(request_id = id, "Ignoring BEGIN_REQUEST for an active id");
                } else {
                    let limit = self.shared.snapshots.load().config.post.max_bytes();
                    self.pending.insert(
                        id,
                        Pending {
                            keep_conn: begin.keep_conn(),
                            params: BytesMut::new(),
                            stdin: BytesMut::new(),
                            limit,
                            too_large: false,
                            params_overflow: false,
                        },
                    );
                }
            }
            RecordType::AbortRequest => {
                if let Some(pending) = self.pending.remove(&id) {
                    self.end_request(id, ProtocolStatus::RequestComplete, pending.keep_conn);
                } else if let Some(aborted) = self.in_flight.get(&id) {
                    aborted.store(true, Ordering::Release);
                }
            }
            RecordType::Params => {
                if let Some(pending) = self.pending.get_mut(&id) {
                    if pending.params.len() + incoming.content.len() > MAX_PARAMS_LEN {
                        if !pending.params_overflow {
                            tracing::warn!(request_id = id, "FastCGI params too large");
                        }
                        pending.params_overflow = true;
                        pending.params = BytesMut::new();
                    } else if !pending.params_overflow {
                        pending.params.extend_from_slice(&incoming.content);
                    }
                }
            }
            RecordType::Stdin => {
                if incoming.content.is_empty() {
                    if let Some(pending) = self.pending.remove(&id) {
                        self.dispatch(id, pending)?;
                    }
                } else if let Some(pending) = self.pending.get_mut(&id) {
                    if pending.stdin.len() + incoming.content.len() > pending.limit {
                        pending.too_large = true;
                    } else if !pending.too_large {
                        pending.stdin.extend_from_slice(&incoming.content);
                    }
                }
            }
            // Only the filter role reads DATA.
            RecordType::Data => {}
            RecordType::Other(kind) => {
                let mut buf = BytesMut::new();
                record::encode(RecordType::UnknownType, 0, &record::unknown_type_body(kind), &mut buf);
                self.send(buf);
            }
            other => {
                tracing::debug!(request_id = id, kind = ?other, "Ignoring unexpected record");
            }
        }
        Ok(())
    }

    fn get_values(&mut self, content: &[u8]) -> Result<(), TransportError> {
        let max = self.shared.max_connections.to_string();
        let answers: Vec<(String, String)> = record::parse_pairs(content)?
            .into_iter()
            .filter_map(|(name, _)| {
                let value = match name.as_str() {
                    "FCGI_MAX_CONNS" | "FCGI_MAX_REQS" => max.clone(),
                    "FCGI_MPXS_CONNS" => "1".to_string(),
                    _ => return None,
                };
                Some((name, value))
            })
            .collect();

        let mut content = BytesMut::new();
        record::encode_pairs(
            answers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
            &mut content,
        );
        let mut buf = BytesMut::new();
        record::encode(RecordType::GetValuesResult, 0, &content, &mut buf);
        self.send(buf);
        Ok(())
    }

    fn dispatch(&mut self, id: u16, pending: Pending) -> Result<(), TransportError> {
        if pending.params_overflow {
            self.respond_inline(id, 400, pending.keep_conn);
            return Ok(());
        }
        if pending.too_large {
            self.respond_inline(id, 413, pending.keep_conn);
            return Ok(());
        }
        let request = match build_request(&pending.params, pending.stdin.freeze(), self.peer) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(request_id = id, error = %e, "Malformed FastCGI params");
                self.respond_inline(id, 400, pending.keep_conn);
                return Ok(());
            }
        };

        let write_timeout = self.shared.snapshots.load().config.timeouts.write();
        let (sink, rx) = sink::channel(write_timeout);
        // A rejected job drops its sink, so the relay answers 503.
        if let Err(e) = self
            .shared
            .dispatcher
            .submit(request, Box::new(sink), TransportKind::FastCgi)
        {
            tracing::warn!(request_id = id, error = %e, "Request rejected");
        }

        let aborted = Arc::new(AtomicBool::new(false));
        self.in_flight.insert(id, Arc::clone(&aborted));
        tokio::spawn(relay(
            id,
            rx,
            self.out.clone(),
            Arc::clone(&self.window),
            aborted,
            pending.keep_conn,
            self.done.clone(),
        ));
        Ok(())
    }

    fn respond_inline(&mut self, id: u16, status: u16, keep_conn: bool) {
        let (head, page) = error_response(status);
        let mut buf = BytesMut::new();
        record::encode(RecordType::Stdout, id, &render_head(&head), &mut buf);
        record::encode(RecordType::Stdout, id, page.as_bytes(), &mut buf);
        self.send(buf);
        self.end_request(id, ProtocolStatus::RequestComplete, keep_conn);
    }

    fn end_request(&mut self, id: u16, status: ProtocolStatus, keep_conn: bool) {
        let mut buf = BytesMut::new();
        if status == ProtocolStatus::RequestComplete {
            record::encode(RecordType::Stdout, id, &[], &mut buf);
        }
        record::encode(RecordType::EndRequest, id, &record::end_request_body(0, status), &mut buf);
        self.send(buf);
        if !keep_conn {
            self.close = true;
        }
    }

    fn send(&self, buf: BytesMut) {
        // Fails only once the writer is gone, and then the loop ends anyway.
        let _ = self.out.send(buf.freeze().into());
    }
}

/// Turn one worker's flushes into STDOUT records, then end the request.
async fn relay(
    request_id: u16,
    mut chunks: mpsc::Receiver<FlushChunk>,
    out: mpsc::UnboundedSender<Outgoing>,
    window: Arc<Semaphore>,
    aborted: Arc<AtomicBool>,
    keep_conn: bool,
    done: mpsc::UnboundedSender<Done>,
) {
    let mut head_sent = false;
    while let Some(chunk) = chunks.recv().await {
        if aborted.load(Ordering::Acquire) {
            continue;
        }
        let mut buf = BytesMut::new();
        if let Some(head) = &chunk.head {
            record::encode(RecordType::Stdout, request_id, &render_head(head), &mut buf);
            head_sent = true;
        }
        if !chunk.body.is_empty() {
            record::encode(RecordType::Stdout, request_id, &chunk.body, &mut buf);
        }
        if buf.is_empty() {
            continue;
        }
        // Waiting here leaves `chunks` full, which is what slows the worker.
        let Ok(permit) = Arc::clone(&window).acquire_owned().await else {
            break;
        };
        let outgoing = Outgoing {
            bytes: buf.freeze(),
            _permit: Some(permit),
        };
        if out.send(outgoing).is_err() {
            // Socket gone; dropping the receiver makes the worker's next
            // flush fail.
            break;
        }
    }

    let mut buf = BytesMut::new();
    if !head_sent && !aborted.load(Ordering::Acquire) {
        let (head, page) = error_response(503);
        record::encode(RecordType::Stdout, request_id, &render_head(&head), &mut buf);
        record::encode(RecordType::Stdout, request_id, page.as_bytes(), &mut buf);
    }
    record::encode(RecordType::Stdout, request_id, &[], &mut buf);
    record::encode(
        RecordType::EndRequest,
        request_id,
        &record::end_request_body(0, ProtocolStatus::RequestComplete),
        &mut buf,
    );
    let _ = out.send(buf.freeze().into());
    let _ = done.send(Done {
        request_id,
        keep_conn,
    });
}

/// CGI response head: a `Status:` line, headers, blank line.
fn render_head(head: &ResponseHead) -> Vec<u8> {
    let mut out = format!("Status: {}\r\n", status_line(head.status));
    for (name, value) in &head.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Map CGI params onto a request view.
fn build_request(params: &[u8], body: Bytes, peer: Peer) -> Result<RequestView, record::FrameError> {
    let pairs = record::parse_pairs(params)?;
    let param = |key: &str| {
        pairs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    };

    let method = param("REQUEST_METHOD").unwrap_or("GET");
    let uri = match param("REQUEST_URI") {
        Some(uri) => uri.to_string(),
        None => {
            let mut uri = format!(
                "{}{}",
                param("SCRIPT_NAME").unwrap_or_default(),
                param("PATH_INFO").unwrap_or_default()
            );
            if uri.is_empty() {
                uri.push('/');
            }
            if let Some(query) = param("QUERY_STRING") {
                uri.push('?');
                uri.push_str(query);
            }
            uri
        }
    };

    let mut builder = RequestView::builder(method, uri).body(body);
    for (name, value) in &pairs {
        if let Some(header) = header_name(name) {
            builder = builder.header(&header, value);
        }
        builder = builder.env(name.as_str(), value.as_str());
    }
    if let Some(id) = param("HTTP_X_REQUEST_ID") {
        builder = builder.request_id(id);
    }
    let remote = param("REMOTE_ADDR")
        .and_then(|addr| addr.parse::<IpAddr>().ok())
        .or_else(|| peer.0.map(|addr| addr.ip()));
    if let Some(remote) = remote {
        builder = builder.remote_addr(remote);
    }
    Ok(builder.build())
}

/// `HTTP_ACCEPT_LANGUAGE` → `accept-language`; content headers have no prefix.
fn header_name(param: &str) -> Option<String> {
    match param {
        "CONTENT_TYPE" => Some("content-type".to_string()),
        "CONTENT_LENGTH" => Some("content-length".to_string()),
        _ => param
            .strip_prefix("HTTP_")
            .map(|rest| rest.to_ascii_lowercase().replace('_', "-")),
    }
}

async fn read_loop(
    mut reader: ReadHalf<Stream>,
    records: mpsc::Sender<Result<Record, TransportError>>,
    read_timeout: Duration,
) {
    loop {
        let next = match tokio::time::timeout(read_timeout, record::read_record(&mut reader)).await {
            Ok(Ok(Some(incoming))) => Ok(incoming),
            Ok(Ok(None)) => return,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout(read_timeout)),
        };
        let failed = next.is_err();
        if records.send(next).await.is_err() || failed {
            return;
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<Stream>,
    mut out: mpsc::UnboundedReceiver<Outgoing>,
    write_timeout: Duration,
) -> Result<(), TransportError> {
    while let Some(outgoing) = out.recv().await {
        tokio::time::timeout(write_timeout, writer.write_all(&outgoing.bytes))
            .await
            .map_err(|_| TransportError::Timeout(write_timeout))??;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::sink::ResponseSink;

    fn params(pairs: &[(&str, &str)]) -> BytesMut {
        let mut out = BytesMut::new();
        record::encode_pairs(pairs.iter().copied(), &mut out);
        out
    }

    #[test]
    fn test_params_map_to_request_view() {
        let encoded = params(&[
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", "/login?next=%2Fhome"),
            ("CONTENT_TYPE", "application/x-www-form-urlencoded"),
            ("HTTP_ACCEPT_LANGUAGE", "en"),
            ("HTTP_X_REQUEST_ID", "req-7"),
            ("REMOTE_ADDR", "10.0.0.9"),
        ]);
        let request =
            build_request(&encoded, Bytes::from_static(b"user=ann"), Peer(None)).unwrap();
        assert_eq!(request.method(), "POST");
        assert_eq!(request.path_string(), "/login");
        assert_eq!(request.query("next"), Some("/home"));
        assert_eq!(request.header("Accept-Language"), Some("en"));
        assert_eq!(request.form("user"), Some("ann"));
        assert_eq!(request.request_id(), "req-7");
        assert_eq!(request.env("REMOTE_ADDR"), Some("10.0.0.9"));
        assert_eq!(request.remote_addr(), Some("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_uri_falls_back_to_script_name() {
        let encoded = params(&[
            ("SCRIPT_NAME", "/app"),
            ("PATH_INFO", "/users"),
            ("QUERY_STRING", "page=2"),
        ]);
        let request = build_request(&encoded, Bytes::new(), Peer(None)).unwrap();
        assert_eq!(request.path_string(), "/app/users");
        assert_eq!(request.query("page"), Some("2"));
        assert_eq!(request.method(), "GET");
    }

    #[test]
    fn test_head_renders_status_line() {
        let head = ResponseHead {
            status: 404,
            headers: vec![("content-type".into(), "text/plain".into())],
        };
        assert_eq!(
            String::from_utf8(render_head(&head)).unwrap(),
            "Status: 404 Not Found\r\ncontent-type: text/plain\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_dropped_job_is_answered_503() {
        let (sink, rx) = sink::channel(Duration::from_secs(1));
        drop(sink);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let window = Arc::new(Semaphore::new(WRITE_WINDOW));
        let aborted = Arc::new(AtomicBool::new(false));
        relay(3, rx, out_tx, window, aborted, true, done_tx).await;

        let outgoing = out_rx.recv().await.unwrap();
        let mut reader = &outgoing.bytes[..];
        let head = record::read_record(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.kind, RecordType::Stdout);
        assert!(head.content.starts_with(b"Status: 503 Service Unavailable\r\n"));

        let mut last = None;
        while let Some(record) = record::read_record(&mut reader).await.unwrap() {
            last = Some(record);
        }
        let end = last.unwrap();
        assert_eq!(end.kind, RecordType::EndRequest);
        assert_eq!(end.request_id, 3);
        let done = done_rx.recv().await.unwrap();
        assert!(done.keep_conn);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unwritten_output_stalls_the_worker() {
        let (mut sink, rx) = sink::channel(Duration::from_millis(100));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let window = Arc::new(Semaphore::new(1));
        let aborted = Arc::new(AtomicBool::new(false));
        tokio::spawn(relay(5, rx, out_tx, window, aborted, true, done_tx));

        // Nobody drains `out_rx`, as with a client that stopped reading.
        let worker = tokio::task::spawn_blocking(move || {
            let mut sent = 0;
            loop {
                let chunk = FlushChunk {
                    head: None,
                    body: Bytes::from_static(b"data"),
                };
                if sink.send(chunk).is_err() {
                    return sent;
                }
                sent += 1;
            }
        });
        let sent = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();

        // One record queued for the socket, one held by the relay, the rest
        // in the sink channel.
        assert!(sent >= sink::SINK_CAPACITY);
        assert!(sent <= sink::SINK_CAPACITY + 2);
        let first = out_rx.try_recv();
        assert!(first.is_ok());
        assert!(out_rx.try_recv().is_err());
    }
}
