//! The dispatch engine: context store, router, task model, state machine,
//! worker pool, and the looper that coordinates them.
pub mod context;
pub mod error;
pub mod inout;
pub mod looper;
pub mod router;
pub mod state_machine;
pub mod status;
pub mod task;
pub mod worker_pool;

pub use context::{Context, GlobalContext, HandlerApi, LocalContext, SystemCounters};
pub use error::{EngineError, UpstreamError};
pub use inout::{Input, Output};
pub use looper::{Looper, LooperHandle};
pub use router::{Handler, HandlerTriple, RouteMatch, RouteVars, Router, RouterError, RouterRoot};
pub use state_machine::{Phase, StateMachine};
pub use status::Status;
pub use task::{Protocol, Reply, Task};
pub use worker_pool::WorkerPool;
