//! JSON-RPC pass-through to the upstream daemon.
//!
//! Demonstrates the Forward cycle end to end: the first worker entry marks
//! the task's local context, sends the client's envelope upstream, and the
//! second entry (after the response is re-injected as input) composes the
//! reply.
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::{
    core::{
        router::{HandlerTriple, Router},
        status::Status,
    },
    jsonrpc,
};

const CALLED_KEY: &str = "called";
const REQUEST_ID_KEY: &str = "request_id";
const ERR_BAD_REQUEST: i64 = -32700;
const ERR_UPSTREAM: i64 = -32010;

/// `POST /node_rpc` — forwards the request to the upstream daemon and wraps
/// its answer in a fresh envelope.
pub fn router() -> Router {
    let mut router = Router::new("");
    let triple = HandlerTriple::worker(
        "node_proxy",
        Arc::new(|_vars, input, ctx, output| {
            if !ctx.local.has(CALLED_KEY) {
                // First entry: validate, remember the envelope id, forward.
                let request: jsonrpc::JsonRpcRequest = match serde_json::from_slice(&input.body) {
                    Ok(request) => request,
                    Err(e) => {
                        ctx.local.set_error_code(ERR_BAD_REQUEST);
                        ctx.local
                            .set_error(format!("malformed JSON-RPC request: {e}"), Status::Error);
                        return Status::Error;
                    }
                };
                ctx.local.set(CALLED_KEY, true);
                ctx.local.set(REQUEST_ID_KEY, request.id.clone());
                output.set_body(input.as_text());
                return Status::Forward;
            }

            // Second entry: the input now holds the upstream response.
            let id = ctx
                .local
                .get_cloned::<Value>(REQUEST_ID_KEY)
                .unwrap_or(Value::Null);
            let upstream: Value = match serde_json::from_slice(&input.body) {
                Ok(value) => value,
                Err(e) => {
                    ctx.local.set_error_code(ERR_UPSTREAM);
                    ctx.local
                        .set_error(format!("malformed upstream response: {e}"), Status::Error);
                    return Status::Error;
                }
            };

            let result = upstream.get("result").cloned().unwrap_or(upstream);
            output.set_body(jsonrpc::success(id, result).to_json());
            Status::Ok
        }),
    );
    router
        .add_route(Method::POST, "/node_rpc", triple)
        .expect("static node_rpc route is valid");
    router
}
