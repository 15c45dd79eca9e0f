//! The task dispatch state machine.
//!
//! All phase-transition policy lives in one table of plain-data rows; the
//! looper interprets the row's [`Action`], so the machine itself stays a pure
//! function from `(phase, status, handler-slot presence)` to the next row.
//! Matching is first-match-wins in fixed row order, and a pair with no
//! matching row is a detectable configuration error, never a silent exit.
//!
//! Forward convention: whichever phase returns `Forward`, the task suspends
//! and re-enters the machine at `WorkerAction` once the upstream response has
//! been re-injected as the task input. Post-action therefore runs exactly
//! once per logical request, after the final worker pass.
use crate::core::{
    error::EngineError,
    router::{HandlerTriple, Slot},
    status::Status,
};

/// Machine phases. `Exit` is terminal for one dispatch pass; a suspended task
/// re-enters at the phase recorded on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Execute,
    PreAction,
    ChkPreAction,
    WorkerAction,
    ChkWorkerAction,
    WorkerActionDone,
    PostAction,
    ChkPostAction,
    Again,
    Exit,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Execute => "EXECUTE",
            Phase::PreAction => "PRE_ACTION",
            Phase::ChkPreAction => "CHK_PRE_ACTION",
            Phase::WorkerAction => "WORKER_ACTION",
            Phase::ChkWorkerAction => "CHK_WORKER_ACTION",
            Phase::WorkerActionDone => "WORKER_ACTION_DONE",
            Phase::PostAction => "POST_ACTION",
            Phase::ChkPostAction => "CHK_POST_ACTION",
            Phase::Again => "AGAIN",
            Phase::Exit => "EXIT",
        }
    }
}

/// Pure predicate over handler-slot presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    Has(Slot),
    Hasnt(Slot),
}

impl Guard {
    pub fn admits(self, triple: &HandlerTriple) -> bool {
        match self {
            Guard::Always => true,
            Guard::Has(slot) => triple.has(slot),
            Guard::Hasnt(slot) => !triple.has(slot),
        }
    }
}

/// What the looper must do when a row fires. The table never stores
/// closures; every action is interpreted in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Fail the task with Busy when the worker pool input is saturated.
    CheckOverflow,
    /// Run the pre-action handler synchronously (no-op when absent).
    RunPreAction,
    /// Hand the worker action to the pool; the machine yields until the pool
    /// reports back at `WorkerActionDone`.
    EnqueueWorkerAction,
    /// Run the post-action handler synchronously (no-op when absent).
    RunPostAction,
    /// Increment the again counter, turning bound excess into InternalError.
    BumpAgain,
    /// Terminal replies and suspensions, resolved against the task kind.
    RespondOk,
    RespondError,
    RespondDrop,
    ForwardUpstream,
    PostponeTask,
}

/// One transition. An empty status set matches any status.
#[derive(Debug, Clone)]
pub struct Row {
    pub start: Phase,
    pub statuses: &'static [Status],
    pub end: Phase,
    pub guard: Guard,
    pub action: Action,
}

const ANY: &[Status] = &[];
const RUNNABLE: &[Status] = &[Status::None, Status::Ok, Status::Forward, Status::Postpone];
const FAILED: &[Status] = &[
    Status::Error,
    Status::InternalError,
    Status::Stop,
    Status::Busy,
];

/// The transition table plus the machine-level dispatch bound.
pub struct StateMachine {
    rows: Vec<Row>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        use Action as A;
        use Guard as G;
        use Phase as P;
        use Slot::{Pre, Worker};
        use Status as St;

        let row = |start, statuses, end, guard, action| Row {
            start,
            statuses,
            end,
            guard,
            action,
        };

        #[rustfmt::skip]
        let rows = vec![
            // Start                 Statuses            End                  Guard            Action
            row(P::Execute,          ANY,                P::PreAction,        G::Always,       A::CheckOverflow),
            row(P::PreAction,        &[St::Busy],        P::Exit,             G::Always,       A::RespondError),
            row(P::PreAction,        RUNNABLE,           P::ChkPreAction,     G::Always,       A::RunPreAction),
            row(P::ChkPreAction,     &[St::Again],       P::Again,            G::Has(Pre),     A::BumpAgain),
            row(P::ChkPreAction,     &[St::None, St::Ok], P::WorkerAction,    G::Has(Pre),     A::None),
            row(P::ChkPreAction,     &[St::Forward],     P::Exit,             G::Has(Pre),     A::ForwardUpstream),
            row(P::ChkPreAction,     FAILED,             P::Exit,             G::Has(Pre),     A::RespondError),
            row(P::ChkPreAction,     &[St::Drop],        P::Exit,             G::Has(Pre),     A::RespondDrop),
            row(P::ChkPreAction,     &[St::Postpone],    P::Exit,             G::Has(Pre),     A::PostponeTask),
            row(P::ChkPreAction,     ANY,                P::WorkerAction,     G::Hasnt(Pre),   A::None),
            row(P::WorkerAction,     ANY,                P::ChkWorkerAction,  G::Always,       A::EnqueueWorkerAction),
            row(P::ChkWorkerAction,  ANY,                P::Exit,             G::Has(Worker),  A::None),
            row(P::ChkWorkerAction,  ANY,                P::PostAction,       G::Hasnt(Worker), A::None),
            row(P::WorkerActionDone, &[St::Again],       P::Again,            G::Always,       A::BumpAgain),
            row(P::WorkerActionDone, &[St::Forward],     P::Exit,             G::Always,       A::ForwardUpstream),
            row(P::WorkerActionDone, &[St::Postpone],    P::Exit,             G::Always,       A::PostponeTask),
            row(P::WorkerActionDone, FAILED,             P::Exit,             G::Always,       A::RespondError),
            row(P::WorkerActionDone, &[St::Drop],        P::Exit,             G::Always,       A::RespondDrop),
            row(P::WorkerActionDone, &[St::None, St::Ok], P::PostAction,      G::Always,       A::None),
            row(P::PostAction,       ANY,                P::ChkPostAction,    G::Always,       A::RunPostAction),
            row(P::ChkPostAction,    &[St::Again],       P::Again,            G::Always,       A::BumpAgain),
            row(P::ChkPostAction,    &[St::Forward],     P::Exit,             G::Always,       A::ForwardUpstream),
            row(P::ChkPostAction,    &[St::None, St::Ok], P::Exit,            G::Always,       A::RespondOk),
            row(P::ChkPostAction,    FAILED,             P::Exit,             G::Always,       A::RespondError),
            row(P::ChkPostAction,    &[St::Drop],        P::Exit,             G::Always,       A::RespondDrop),
            row(P::ChkPostAction,    &[St::Postpone],    P::Exit,             G::Always,       A::PostponeTask),
            row(P::Again,            &[St::InternalError], P::Exit,           G::Always,       A::RespondError),
            row(P::Again,            ANY,                P::Execute,          G::Always,       A::None),
        ];

        Self { rows }
    }

    /// Resolve the next transition for `(phase, status)` given which handler
    /// slots the task's route provides. First match in row order wins.
    pub fn next(
        &self,
        phase: Phase,
        status: Status,
        triple: &HandlerTriple,
    ) -> Result<&Row, EngineError> {
        self.rows
            .iter()
            .find(|r| {
                r.start == phase
                    && (r.statuses.is_empty() || r.statuses.contains(&status))
                    && r.guard.admits(triple)
            })
            .ok_or_else(|| EngineError::IncompleteTable {
                phase: phase.name(),
                status,
                triple: format!("{triple:?}"),
            })
    }
}
