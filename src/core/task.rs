//! The unit of work driven by the state machine.
//!
//! A `Task` is an owned value: it moves between the coordinator, a worker
//! thread, and the suspension stores (postponed map, pending-upstream map),
//! so exactly one thread can touch it at any moment. That ownership transfer
//! is the single-writer invariant.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use crate::core::{
    context::{Context, GlobalContext, HandlerApi},
    inout::{Input, Output},
    router::{Handler, HandlerTriple, RouteMatch, RouteVars},
    state_machine::Phase,
    status::Status,
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub type TaskId = u64;

/// Which front door created a client task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Coap,
}

/// Terminal outcome delivered back to the connection manager that created
/// the task.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: Status,
    pub body: String,
    pub error_code: i64,
    pub error_message: String,
}

/// What kind of task this is and how it finalizes.
pub enum TaskKind {
    /// Created for one inbound request; finalization sends the reply.
    Client {
        reply: Option<oneshot::Sender<Reply>>,
        protocol: Protocol,
    },
    /// Created by the periodic-task API; finalization reschedules unless the
    /// handler returned Stop.
    Periodic {
        interval: Duration,
        initial_interval: Duration,
        random_factor: f64,
        first_run: bool,
    },
}

pub struct Task {
    pub id: TaskId,
    pub created_at: Instant,
    pub kind: TaskKind,
    pub input: Input,
    pub output: Output,
    pub route: RouteMatch,
    /// Where dispatch (re)enters the machine for this task.
    pub phase: Phase,
    pub again_count: u32,
    pub ctx: Context,
}

impl Task {
    fn new(kind: TaskKind, route: RouteMatch, input: Input, ctx: Context) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            kind,
            input,
            output: Output::default(),
            route,
            phase: Phase::Execute,
            again_count: 0,
            ctx,
        }
    }

    /// Build a task for an inbound request, returning the receiver the
    /// connection manager awaits for the reply.
    pub fn new_client(
        global: GlobalContext,
        api: std::sync::Arc<dyn HandlerApi>,
        route: RouteMatch,
        input: Input,
        protocol: Protocol,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let kind = TaskKind::Client {
            reply: Some(tx),
            protocol,
        };
        (
            Self::new(kind, route, input, Context::new(global, api)),
            rx,
        )
    }

    /// Build a periodic task around a worker-only handler.
    pub fn new_periodic(
        global: GlobalContext,
        api: std::sync::Arc<dyn HandlerApi>,
        handler: Handler,
        interval: Duration,
        initial_interval: Option<Duration>,
        random_factor: f64,
    ) -> Self {
        let kind = TaskKind::Periodic {
            interval,
            initial_interval: initial_interval.unwrap_or(interval),
            random_factor,
            first_run: true,
        };
        let route = RouteMatch {
            triple: HandlerTriple::worker("periodic", handler),
            vars: RouteVars::default(),
        };
        Self::new(kind, route, Input::default(), Context::new(global, api))
    }

    pub fn last_status(&self) -> Status {
        self.ctx.local.last_status()
    }

    pub fn set_last_status(&mut self, status: Status) {
        self.ctx.local.set_last_status(status);
    }

    pub fn set_error(&mut self, message: impl Into<String>, status: Status) {
        self.ctx.local.set_error(message, status);
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.kind, TaskKind::Periodic { .. })
    }

    pub(crate) fn take_reply(&mut self) -> Option<oneshot::Sender<Reply>> {
        match &mut self.kind {
            TaskKind::Client { reply, .. } => reply.take(),
            TaskKind::Periodic { .. } => None,
        }
    }

    /// Delay until the next run of a periodic task: the initial interval on
    /// the first run, afterwards the interval with optional random jitter.
    pub(crate) fn next_timeout(&mut self) -> Duration {
        match &mut self.kind {
            TaskKind::Periodic {
                interval,
                initial_interval,
                random_factor,
                first_run,
            } => {
                if *first_run {
                    *first_run = false;
                    return *initial_interval;
                }
                if *random_factor < 1e-4 {
                    return *interval;
                }
                use rand::Rng;
                let base = interval.as_millis() as u64;
                let upper = ((base as f64) * (1.0 + *random_factor)) as u64;
                Duration::from_millis(rand::rng().random_range(base..=upper.max(base)))
            }
            TaskKind::Client { .. } => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::context::NullHandlerApi;

    fn noop() -> Handler {
        Arc::new(|_, _, _, _| Status::Ok)
    }

    #[test]
    fn task_ids_are_monotonic() {
        let global = GlobalContext::new();
        let api: Arc<dyn HandlerApi> = Arc::new(NullHandlerApi);
        let a = Task::new_periodic(
            global.clone(),
            api.clone(),
            noop(),
            Duration::from_secs(1),
            None,
            0.0,
        );
        let b = Task::new_periodic(global, api, noop(), Duration::from_secs(1), None, 0.0);
        assert!(b.id > a.id);
    }

    #[test]
    fn periodic_first_run_uses_initial_interval() {
        let global = GlobalContext::new();
        let api: Arc<dyn HandlerApi> = Arc::new(NullHandlerApi);
        let mut task = Task::new_periodic(
            global,
            api,
            noop(),
            Duration::from_secs(10),
            Some(Duration::from_secs(1)),
            0.0,
        );
        assert_eq!(task.next_timeout(), Duration::from_secs(1));
        assert_eq!(task.next_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn client_reply_channel_is_single_shot() {
        let global = GlobalContext::new();
        let api: Arc<dyn HandlerApi> = Arc::new(NullHandlerApi);
        let route = RouteMatch {
            triple: HandlerTriple::worker("t", noop()),
            vars: RouteVars::default(),
        };
        let (mut task, _rx) =
            Task::new_client(global, api, route, Input::default(), Protocol::Http);
        assert!(task.take_reply().is_some());
        assert!(task.take_reply().is_none());
    }
}
