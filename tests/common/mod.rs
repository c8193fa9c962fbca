//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use request_engine::config::schema::TransportKind;
use request_engine::transport::fastcgi::record::{self, Record, RecordType};
use request_engine::{AccessFilterList, EngineConfig, HandlerRef, RequestHandler};

/// Configuration bound to an ephemeral loopback port.
pub fn test_config(kind: TransportKind) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transport.kind = kind;
    config.transport.bind_address = "127.0.0.1:0".into();
    config.workers.concurrency = 4;
    config.lifecycle.termination_timeout_secs = 2;
    config
}

/// Start an engine and return it with the address it bound.
pub async fn start_engine(
    handler: HandlerRef,
    filters: AccessFilterList,
    config: EngineConfig,
) -> (RequestHandler, SocketAddr) {
    let engine = RequestHandler::new(handler, filters, config).unwrap();
    engine.start().await.unwrap();
    let addr = engine.local_addr().await.unwrap().as_tcp().unwrap();
    (engine, addr)
}

pub fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Records making up one FastCGI responder request.
pub fn fcgi_request(id: u16, keep_conn: bool, params: &[(&str, &str)], stdin: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    let begin = [0, 1, u8::from(keep_conn), 0, 0, 0, 0, 0];
    record::encode(RecordType::BeginRequest, id, &begin, &mut out);

    let mut encoded = BytesMut::new();
    record::encode_pairs(params.iter().copied(), &mut encoded);
    record::encode(RecordType::Params, id, &encoded, &mut out);
    record::encode(RecordType::Params, id, &[], &mut out);

    if !stdin.is_empty() {
        record::encode(RecordType::Stdin, id, stdin, &mut out);
    }
    record::encode(RecordType::Stdin, id, &[], &mut out);
    out
}

pub async fn fcgi_connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

pub async fn fcgi_send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
}

/// Collected output of one request id.
#[derive(Debug, Default)]
pub struct FcgiResponse {
    pub stdout: Vec<u8>,
    pub protocol_status: Option<u8>,
}

impl FcgiResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Status code from the CGI `Status:` line.
    pub fn status(&self) -> Option<u16> {
        let text = self.text();
        let line = text.lines().find(|l| l.starts_with("Status: "))?;
        line["Status: ".len()..].split(' ').next()?.parse().ok()
    }

    pub fn body(&self) -> String {
        let text = self.text();
        text.split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }
}

pub async fn fcgi_read_record(stream: &mut TcpStream) -> Option<Record> {
    tokio::time::timeout(Duration::from_secs(5), record::read_record(stream))
        .await
        .expect("timed out waiting for a FastCGI record")
        .unwrap()
}

/// Read records until every id in `ids` has seen END_REQUEST.
pub async fn fcgi_collect(stream: &mut TcpStream, ids: &[u16]) -> Vec<(u16, FcgiResponse)> {
    let mut responses: Vec<(u16, FcgiResponse)> =
        ids.iter().map(|id| (*id, FcgiResponse::default())).collect();
    while responses.iter().any(|(_, r)| r.protocol_status.is_none()) {
        let rec = fcgi_read_record(stream).await.expect("connection closed early");
        let Some((_, response)) = responses.iter_mut().find(|(id, _)| *id == rec.request_id) else {
            continue;
        };
        match rec.kind {
            RecordType::Stdout => response.stdout.extend_from_slice(&rec.content),
            RecordType::EndRequest => response.protocol_status = Some(rec.content[4]),
            _ => {}
        }
    }
    responses
}
