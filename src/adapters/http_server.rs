//! HTTP connection manager.
//!
//! Front door for HTTP clients: resolves the route, creates a task, submits
//! it to the looper, and maps the task's terminal status onto an HTTP
//! response. Route misses are answered immediately without creating a task.
use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::Response,
};
use eyre::{Context as _, Result};
use serde_json::Value;

use crate::{
    core::{
        context::SystemCounters,
        inout::Input,
        looper::LooperHandle,
        router::RouterRoot,
        status::Status,
        task::{Protocol, Reply, Task},
    },
    jsonrpc,
    utils::shutdown::ShutdownToken,
};

/// Largest request body accepted before the route handler ever runs.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct HttpConnectionManager {
    router: Arc<RouterRoot>,
    looper: LooperHandle,
    connection_timeout: Duration,
}

impl HttpConnectionManager {
    pub fn new(router: Arc<RouterRoot>, looper: LooperHandle, connection_timeout: Duration) -> Self {
        Self {
            router,
            looper,
            connection_timeout,
        }
    }

    /// Bind and serve until the shutdown token fires.
    pub async fn serve(self: Arc<Self>, addr: &str, mut shutdown: ShutdownToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind HTTP listener to {addr}"))?;
        tracing::info!(%addr, "HTTP connection manager listening");

        let app = axum::Router::new()
            .fallback(dispatch_request)
            .with_state(self);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .context("HTTP server failed")?;
        tracing::info!("HTTP connection manager stopped");
        Ok(())
    }
}

async fn dispatch_request(
    State(cm): State<Arc<HttpConnectionManager>>,
    request: Request<Body>,
) -> Response {
    SystemCounters::bump(&cm.looper.counters().http_requests);

    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let span = crate::tracing_setup::create_request_span("http", parts.method.as_str(), &path);

    let Some(route) = span.in_scope(|| cm.router.resolve(&parts.method, &path)) else {
        tracing::debug!(method = %parts.method, %path, "no route matched");
        return plain_response(StatusCode::NOT_FOUND, "");
    };

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(%path, "failed to read request body: {e}");
            return plain_response(StatusCode::BAD_REQUEST, "");
        }
    };

    let handler_name = route.triple.name.clone();
    let (task, reply_rx) = Task::new_client(
        cm.looper.global(),
        cm.looper.api(),
        route,
        Input::new(body),
        Protocol::Http,
    );
    let task_id = task.id;
    tracing::debug!(task = task_id, method = %parts.method, %path, handler = %handler_name,
        "task created");

    if !cm.looper.submit(task) {
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "");
    }

    match tokio::time::timeout(cm.connection_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply_to_response(task_id, reply),
        Ok(Err(_)) => {
            tracing::error!(task = task_id, "dispatch engine dropped the task");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "")
        }
        Err(_) => {
            tracing::warn!(task = task_id, "connection timeout waiting for reply");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "connection timeout")
        }
    }
}

/// Status → HTTP mapping. Error replies carry a well-formed JSON-RPC
/// failure envelope unless the handler already wrote one to the output.
fn reply_to_response(task_id: u64, reply: Reply) -> Response {
    tracing::debug!(task = task_id, status = %reply.status, "writing HTTP reply");
    match reply.status {
        Status::Ok | Status::Again => json_response(StatusCode::OK, reply.body),
        Status::Error | Status::InternalError => {
            let body = if reply.body.is_empty() {
                jsonrpc::failure(Value::Null, reply.error_code, reply.error_message).to_json()
            } else {
                reply.body
            };
            json_response(StatusCode::INTERNAL_SERVER_ERROR, body)
        }
        Status::Busy => plain_response(StatusCode::SERVICE_UNAVAILABLE, ""),
        Status::Drop => plain_response(StatusCode::BAD_REQUEST, ""),
        _ => {
            tracing::error!(task = task_id, status = %reply.status,
                "non-terminal status reached the connection manager");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "")
        }
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn plain_response(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
