//! Synapse - a request-dispatch server for payment supernodes.
//!
//! Synapse accepts inbound HTTP and CoAP requests, resolves them against a
//! compiled route matcher, and drives each request through up to three
//! handler phases (pre / worker / post) on a bounded worker-thread pool. A
//! data-driven state machine owns all phase-transition policy, including
//! asynchronous upstream round-trips (`Forward`), bounded retries (`Again`),
//! and deferred re-attempts (`Postpone`).
//!
//! # Architecture
//! * `core` — the dispatch engine: two-tier context store, segment-trie
//!   router, task model, transition table, worker pool, and the looper
//!   coordinating them.
//! * `ports` / `adapters` — the upstream-client trait and its reqwest
//!   implementation, plus the HTTP (axum) and CoAP (UDP) front doors.
//! * `requests` — built-in handler sets (health, system info, node proxy)
//!   showing the registration API domain handler packs use.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use synapse::core::{Router, RouterRoot, HandlerTriple, Status};
//!
//! # fn main() -> eyre::Result<()> {
//! let root = RouterRoot::new();
//! let mut router = Router::new("");
//! router.add_route(
//!     http::Method::GET,
//!     "/health",
//!     HandlerTriple::worker("health", Arc::new(|_, _, _, _| Status::Ok)),
//! )?;
//! root.add_router(router)?;
//! root.arm()?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Handlers communicate only through [`core::Status`]; engine-level failures
//! use `thiserror` enums and the binary wires everything with `eyre`.
//!
//! # Concurrency
//! Socket I/O runs on the tokio runtime; handler phases run on OS worker
//! threads because they are synchronous and may block on upstream calls. A
//! task is only ever owned by one thread at a time.
pub mod adapters;
pub mod config;
pub mod core;
pub mod jsonrpc;
pub mod ports;
pub mod requests;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{CoapConnectionManager, HttpConnectionManager, HttpUpstreamClient},
    core::{Looper, LooperHandle, RouterRoot, Status},
    ports::upstream::UpstreamClient,
    utils::{Shutdown, ShutdownToken},
};
