//! Runtime counters report.
use std::sync::Arc;

use http::Method;
use serde_json::json;

use crate::core::{
    context::{KEY_COUNTERS, KEY_WORKER_POOL, SystemCounters},
    router::{HandlerTriple, Router},
    status::Status,
    worker_pool::WorkerPool,
};

/// `GET /systeminfo` — reports engine counters and worker-pool stats from
/// the global context. A missing counters singleton is an engine invariant
/// violation, so it surfaces as InternalError.
pub fn router() -> Router {
    let mut router = Router::new("");
    let triple = HandlerTriple::worker(
        "system_info",
        Arc::new(|_vars, _input, ctx, output| {
            let counters = match ctx.global.required::<SystemCounters>(KEY_COUNTERS) {
                Ok(counters) => counters,
                Err(e) => {
                    ctx.local.set_error(e.to_string(), Status::InternalError);
                    return Status::InternalError;
                }
            };

            let pool = ctx.global.get::<WorkerPool>(KEY_WORKER_POOL);
            let (live, expelled, capacity) = pool
                .map(|p| (p.live_workers(), p.expelled_workers(), p.capacity()))
                .unwrap_or((0, 0, 0));

            let report = json!({
                "tasks": {
                    "created": SystemCounters::read(&counters.tasks_created),
                    "done": SystemCounters::read(&counters.tasks_done),
                },
                "jobs": {
                    "sent": SystemCounters::read(&counters.jobs_sent),
                    "done": SystemCounters::read(&counters.jobs_done),
                },
                "upstream": {
                    "requests": SystemCounters::read(&counters.upstream_requests),
                    "ok": SystemCounters::read(&counters.upstream_ok),
                    "err": SystemCounters::read(&counters.upstream_err),
                },
                "requests": {
                    "http": SystemCounters::read(&counters.http_requests),
                    "coap": SystemCounters::read(&counters.coap_requests),
                },
                "worker_pool": {
                    "live": live,
                    "expelled": expelled,
                    "queue_capacity": capacity,
                },
            });
            output.set_body(report.to_string());
            Status::Ok
        }),
    );
    router
        .add_route(Method::GET, "/systeminfo", triple)
        .expect("static systeminfo route is valid");
    router
}
