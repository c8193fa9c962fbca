//! HTTP/1.1 transport.
//!
//! # Responsibilities
//! - Serve each accepted socket with hyper (keep-alive, header-read timeout)
//! - Wire up middleware (request ID, tracing, request timeout)
//! - Turn an axum request into a [`RequestView`] and submit it
//! - Stream the worker's flushes back as the response body

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    response::Response,
    Router,
};
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{accept_loop, error_response, ServeContext};
use crate::config::schema::{EngineConfig, TransportKind};
use crate::connection::{sink, RequestView, ResponseHead};
use crate::engine::pool::Dispatcher;
use crate::engine::snapshot::SnapshotCell;
use crate::lifecycle::shutdown::triggered;
use crate::net::{BoundAddr, Listener, Peer, Stream};

/// State injected into the fallback handler.
#[derive(Clone)]
struct HttpState {
    dispatcher: Dispatcher,
    snapshots: Arc<SnapshotCell>,
}

pub struct HttpTransport {
    listener: Listener,
    request_timeout: Duration,
}

impl HttpTransport {
    pub(crate) fn new(listener: Listener, config: &EngineConfig) -> Self {
        Self {
            listener,
            request_timeout: config.timeouts.request(),
        }
    }

    pub fn local_addr(&self) -> &BoundAddr {
        self.listener.local_addr()
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(&self, state: HttpState) -> Router {
        Router::new()
            .fallback(dispatch_request)
            .with_state(state)
            .layer(TimeoutLayer::new(self.request_timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    pub(crate) async fn serve(self, ctx: ServeContext) {
        let router = self.build_router(HttpState {
            dispatcher: ctx.dispatcher.clone(),
            snapshots: Arc::clone(&ctx.snapshots),
        });
        tracing::info!(address = %self.local_addr(), "HTTP transport starting");

        let snapshots = Arc::clone(&ctx.snapshots);
        accept_loop(&self.listener, &ctx.shutdown, &ctx.tracker, |stream, peer, stop| {
            let read_timeout = snapshots.load().config.timeouts.read();
            serve_connection(stream, peer, router.clone(), read_timeout, stop)
        })
        .await;
    }
}

async fn serve_connection(
    stream: Stream,
    peer: Peer,
    router: Router,
    read_timeout: Duration,
    mut stop: broadcast::Receiver<()>,
) {
    let service = router.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(peer);
        request
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = triggered(&mut stop) => {
            // Finish the in-flight request, then close instead of idling.
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "HTTP connection ended with error");
    }
}

/// Fallback handler: every path goes to the engine.
async fn dispatch_request(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let snapshot = state.snapshots.load();
    let limit = snapshot.config.post.max_bytes();

    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return error(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let peer = request.extensions().get::<Peer>().copied();
    let (parts, body) = request.into_parts();
    let body = match tokio::time::timeout(
        snapshot.config.timeouts.read(),
        axum::body::to_bytes(body, limit),
    )
    .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Failed to read request body");
            return error(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(_) => return error(StatusCode::REQUEST_TIMEOUT),
    };

    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut builder = RequestView::builder(parts.method.as_str(), uri.as_str())
        .env("REQUEST_METHOD", parts.method.as_str())
        .env("REQUEST_URI", uri.as_str())
        .env("QUERY_STRING", parts.uri.query().unwrap_or_default())
        .env("SERVER_PROTOCOL", format!("{:?}", parts.version))
        .body(body);
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }
    if let Some(id) = parts.headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        builder = builder.request_id(id);
    }
    if let Some(addr) = peer.and_then(|p| p.0) {
        builder = builder
            .remote_addr(addr.ip())
            .env("REMOTE_ADDR", addr.ip().to_string())
            .env("REMOTE_PORT", addr.port().to_string());
    }

    let (sink, mut rx) = sink::channel(snapshot.config.timeouts.write());
    if let Err(e) = state
        .dispatcher
        .submit(builder.build(), Box::new(sink), TransportKind::Http)
    {
        tracing::warn!(error = %e, "Request rejected");
        return error(StatusCode::SERVICE_UNAVAILABLE);
    }

    // The first chunk carries the head. No chunk at all means the job was
    // dropped before a worker ran it.
    let Some(first) = rx.recv().await else {
        return error(StatusCode::SERVICE_UNAVAILABLE);
    };
    let Some(head) = first.head else {
        return error(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let first_body = first.body;

    let rest = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk.body, rx))
    });
    let body = stream::once(async move { first_body })
        .chain(rest)
        .filter(|chunk| std::future::ready(!chunk.is_empty()))
        .map(Ok::<Bytes, Infallible>);

    into_response(head, Body::from_stream(body))
}

fn into_response(head: ResponseHead, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = response.headers_mut();
    for (name, value) in head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid response header"),
        }
    }
    response
}

fn error(status: StatusCode) -> Response {
    let (head, page) = error_response(status.as_u16());
    into_response(head, Body::from(page))
}
