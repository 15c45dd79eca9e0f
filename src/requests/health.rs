//! Liveness probe route.
use std::sync::Arc;

use http::Method;

use crate::core::{
    router::{HandlerTriple, Router},
    status::Status,
};

/// `GET /health` — worker-only, answers Ok in a single dispatch pass.
pub fn router() -> Router {
    let mut router = Router::new("");
    let triple = HandlerTriple::worker(
        "health",
        Arc::new(|_vars, _input, _ctx, _output| Status::Ok),
    );
    router
        .add_route(Method::GET, "/health", triple)
        .expect("static health route is valid");
    router
}
