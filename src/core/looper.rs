//! The scheduler: one coordinator task owning all dispatch state.
//!
//! Connection managers submit tasks through a [`LooperHandle`]; worker
//! threads, upstream completions, and the periodic timer all report back to
//! the coordinator over one unbounded event channel. The coordinator is the
//! only place a [`Status`] becomes control flow: it steps the state machine,
//! runs pre/post actions synchronously, hands worker actions to the pool,
//! performs Forward round-trips, and parks Postponed tasks.
//!
//! Tasks are owned values. They move from the coordinator into the pool
//! queue, back with the worker's result, into the pending-upstream or
//! postponed stores while suspended, and are consumed on finalization, so no
//! task is ever visible to two threads at once.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    config::models::ServerConfig,
    core::{
        context::{GlobalContext, HandlerApi, SystemCounters},
        error::UpstreamError,
        inout::{Input, Output},
        router::{Handler, Slot},
        state_machine::{Action, Phase, StateMachine},
        status::Status,
        task::{Reply, Task, TaskId, TaskKind},
        worker_pool::WorkerPool,
    },
    ports::upstream::UpstreamClient,
    utils::shutdown::ShutdownToken,
};

pub(crate) enum Event {
    NewTask(Task),
    WorkerDone(Task),
    UpstreamDone {
        id: TaskId,
        result: Result<Input, UpstreamError>,
    },
    UpstreamBlocking {
        output: Output,
        reply: oneshot::Sender<Result<Input, UpstreamError>>,
    },
    AddPeriodic {
        handler: Handler,
        interval: Duration,
        initial_interval: Option<Duration>,
        random_factor: f64,
    },
}

/// Cloneable front door to the looper, used by the connection managers.
#[derive(Clone)]
pub struct LooperHandle {
    events: mpsc::UnboundedSender<Event>,
    counters: Arc<SystemCounters>,
    api: Arc<dyn HandlerApi>,
    global: GlobalContext,
}

impl LooperHandle {
    /// Submit a new task for dispatch. Returns false when the engine has
    /// shut down (the caller maps that to a protocol-level rejection).
    pub fn submit(&self, task: Task) -> bool {
        SystemCounters::bump(&self.counters.tasks_created);
        self.events.send(Event::NewTask(task)).is_ok()
    }

    /// Register a periodic worker-only handler.
    pub fn add_periodic_task(
        &self,
        handler: Handler,
        interval: Duration,
        initial_interval: Option<Duration>,
        random_factor: f64,
    ) -> bool {
        self.events
            .send(Event::AddPeriodic {
                handler,
                interval,
                initial_interval,
                random_factor,
            })
            .is_ok()
    }

    /// The [`HandlerApi`] installed into every task context.
    pub fn api(&self) -> Arc<dyn HandlerApi> {
        Arc::clone(&self.api)
    }

    pub fn global(&self) -> GlobalContext {
        self.global.clone()
    }

    pub fn counters(&self) -> Arc<SystemCounters> {
        Arc::clone(&self.counters)
    }
}

/// [`HandlerApi`] backed by the looper's event channel.
struct LooperApi {
    events: mpsc::UnboundedSender<Event>,
}

impl HandlerApi for LooperApi {
    fn send_upstream_blocking(&self, output: &Output) -> Result<Input, UpstreamError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::UpstreamBlocking {
                output: output.clone(),
                reply: tx,
            })
            .map_err(|_| UpstreamError::ChannelClosed)?;
        rx.blocking_recv().map_err(|_| UpstreamError::ChannelClosed)?
    }

    fn add_periodic_task(
        &self,
        handler: Handler,
        interval: Duration,
        initial_interval: Option<Duration>,
        random_factor: f64,
    ) -> bool {
        self.events
            .send(Event::AddPeriodic {
                handler,
                interval,
                initial_interval,
                random_factor,
            })
            .is_ok()
    }
}

struct TimerEntry {
    deadline: Instant,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

pub struct Looper {
    machine: StateMachine,
    pool: Arc<WorkerPool>,
    upstream: Arc<dyn UpstreamClient>,
    global: GlobalContext,
    counters: Arc<SystemCounters>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    api: Arc<dyn HandlerApi>,

    timer_list: BinaryHeap<Reverse<TimerEntry>>,
    postponed: HashMap<Uuid, Task>,
    postpone_expiry: BinaryHeap<Reverse<(Instant, Uuid)>>,
    /// Inputs that arrived for a task uuid before that task postponed itself.
    parked_inputs: Vec<(Instant, Uuid, Input)>,
    pending_upstream: HashMap<TaskId, Task>,
    ready_to_resume: Vec<Task>,

    again_bound: u32,
    postpone_timeout: Duration,
    timer_poll_interval: Duration,
    shutdown_grace: Duration,
    upstream_address: String,

    shutdown: ShutdownToken,
}

impl Looper {
    /// Build the looper and its submission handle. The worker pool is
    /// created here so its runner can report completions back through the
    /// event channel.
    pub fn new(
        config: &ServerConfig,
        global: GlobalContext,
        counters: Arc<SystemCounters>,
        upstream: Arc<dyn UpstreamClient>,
        shutdown: ShutdownToken,
    ) -> (Self, LooperHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let runner_tx = events_tx.clone();
        let runner_counters = Arc::clone(&counters);
        let pool = Arc::new(WorkerPool::new(
            config.workers_count(),
            config.worker_queue_len,
            Duration::from_millis(config.workers_expelling_interval_ms),
            Box::new(move |mut task| {
                run_phase_handler(&mut task, Slot::Worker);
                SystemCounters::bump(&runner_counters.jobs_done);
                task.phase = Phase::WorkerActionDone;
                if runner_tx.send(Event::WorkerDone(task)).is_err() {
                    tracing::warn!("coordinator gone; worker result dropped");
                }
            }),
        ));

        let api: Arc<dyn HandlerApi> = Arc::new(LooperApi {
            events: events_tx.clone(),
        });

        let handle = LooperHandle {
            events: events_tx.clone(),
            counters: Arc::clone(&counters),
            api: Arc::clone(&api),
            global: global.clone(),
        };

        let looper = Self {
            machine: StateMachine::new(),
            pool,
            upstream,
            global,
            counters,
            events_tx,
            events_rx,
            api,
            timer_list: BinaryHeap::new(),
            postponed: HashMap::new(),
            postpone_expiry: BinaryHeap::new(),
            parked_inputs: Vec::new(),
            pending_upstream: HashMap::new(),
            ready_to_resume: Vec::new(),
            again_bound: config.again_bound,
            postpone_timeout: Duration::from_millis(config.http_connection_timeout_ms),
            timer_poll_interval: Duration::from_millis(config.timer_poll_interval_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            upstream_address: config.upstream_address.clone(),
            shutdown,
        };

        (looper, handle)
    }

    /// Shared pool handle, stored in the global context for stats reporting.
    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool)
    }

    /// The coordinator loop. Runs until shutdown is triggered or every
    /// handle is dropped, then drains in-flight work within the grace
    /// period.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(self.timer_poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("looper started");
        loop {
            tokio::select! {
                maybe = self.events_rx.recv() => match maybe {
                    Some(event) => {
                        self.on_event(event);
                        self.drain_ready();
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    self.on_tick();
                    self.drain_ready();
                }
                _ = shutdown.wait() => {
                    tracing::info!("looper received shutdown signal");
                    break;
                }
            }
        }
        self.drain_before_stop().await;
        tokio::task::block_in_place(|| self.pool.shutdown());
        tracing::info!("looper stopped");
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::NewTask(task) => self.dispatch(task),
            Event::WorkerDone(task) => self.dispatch(task),
            Event::UpstreamDone { id, result } => self.on_upstream_done(id, result),
            Event::UpstreamBlocking { output, reply } => {
                SystemCounters::bump(&self.counters.upstream_requests);
                let upstream = Arc::clone(&self.upstream);
                let target = self.resolve_upstream_target(&output);
                let counters = Arc::clone(&self.counters);
                tokio::spawn(async move {
                    let result = upstream.send(&target, output.body).await.map(Input::new);
                    match &result {
                        Ok(_) => SystemCounters::bump(&counters.upstream_ok),
                        Err(_) => SystemCounters::bump(&counters.upstream_err),
                    }
                    let _ = reply.send(result);
                });
            }
            Event::AddPeriodic {
                handler,
                interval,
                initial_interval,
                random_factor,
            } => {
                let mut task = Task::new_periodic(
                    self.global.clone(),
                    Arc::clone(&self.api),
                    handler,
                    interval,
                    initial_interval,
                    random_factor,
                );
                let deadline = Instant::now() + task.next_timeout();
                tracing::debug!(task = task.id, interval_ms = interval.as_millis() as u64,
                    "periodic task registered");
                self.timer_list.push(Reverse(TimerEntry { deadline, task }));
            }
        }
    }

    /// Step the state machine until the task is consumed or the pass ends.
    fn dispatch(&mut self, mut task: Task) {
        let mut phase = task.phase;
        loop {
            let status = task.last_status();
            let row = match self.machine.next(phase, status, &task.route.triple) {
                Ok(row) => row.clone(),
                Err(e) => {
                    tracing::error!(task = task.id, "{e}");
                    task.set_error(e.to_string(), Status::InternalError);
                    self.respond(task);
                    return;
                }
            };
            tracing::trace!(
                task = task.id,
                "sm: {} -> {}",
                phase.name(),
                row.end.name()
            );
            phase = row.end;
            task.phase = phase;

            match row.action {
                Action::None => {}
                Action::CheckOverflow => self.check_overflow(&mut task),
                Action::RunPreAction => run_phase_handler(&mut task, Slot::Pre),
                Action::RunPostAction => run_phase_handler(&mut task, Slot::Post),
                Action::BumpAgain => self.bump_again(&mut task),
                Action::EnqueueWorkerAction => {
                    if task.route.triple.has(Slot::Worker) {
                        match self.enqueue_worker(task) {
                            // Posted; the machine resumes at WorkerActionDone
                            // when the pool reports back.
                            None => return,
                            Some(bounced) => task = bounced,
                        }
                    }
                }
                Action::RespondOk => {
                    self.process_ok(task);
                    return;
                }
                Action::RespondError | Action::RespondDrop => {
                    self.respond(task);
                    return;
                }
                Action::ForwardUpstream => {
                    self.process_forward(task);
                    return;
                }
                Action::PostponeTask => {
                    self.postpone(task);
                    return;
                }
            }

            if phase == Phase::Exit {
                // Rows that end at Exit without a consuming action (e.g. the
                // worker-queue overflow bounce) finalize here.
                self.respond(task);
                return;
            }
        }
    }

    fn check_overflow(&mut self, task: &mut Task) {
        let sent = SystemCounters::read(&self.counters.jobs_sent);
        let done = SystemCounters::read(&self.counters.jobs_done);
        if task.route.triple.has(Slot::Worker) && sent.saturating_sub(done) >= self.pool.capacity() as u64
        {
            task.ctx
                .local
                .set_error("service unavailable: worker queue full", Status::Busy);
        }
    }

    fn enqueue_worker(&mut self, task: Task) -> Option<Task> {
        match self.pool.try_post(task) {
            Ok(()) => {
                SystemCounters::bump(&self.counters.jobs_sent);
                None
            }
            Err(mut task) => {
                task.ctx
                    .local
                    .set_error("service unavailable: worker queue full", Status::Busy);
                Some(task)
            }
        }
    }

    fn bump_again(&mut self, task: &mut Task) {
        task.again_count += 1;
        if task.again_count > self.again_bound {
            tracing::warn!(
                task = task.id,
                attempts = task.again_count,
                "again bound exceeded"
            );
            task.set_error(
                format!("again bound exceeded after {} attempts", task.again_count),
                Status::InternalError,
            );
        } else {
            task.set_last_status(Status::None);
        }
    }

    fn resolve_upstream_target(&self, output: &Output) -> String {
        output
            .uri
            .clone()
            .unwrap_or_else(|| self.upstream_address.clone())
    }

    /// Suspend the task and perform the upstream call asynchronously. The
    /// response re-enters the machine at WorkerAction.
    fn process_forward(&mut self, task: Task) {
        SystemCounters::bump(&self.counters.upstream_requests);
        let target = self.resolve_upstream_target(&task.output);
        let body = task.output.body.clone();
        let id = task.id;
        tracing::debug!(task = id, target = %target, "forwarding to upstream");
        self.pending_upstream.insert(id, task);

        let upstream = Arc::clone(&self.upstream);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = upstream.send(&target, body).await.map(Input::new);
            let _ = events.send(Event::UpstreamDone { id, result });
        });
    }

    fn on_upstream_done(&mut self, id: TaskId, result: Result<Input, UpstreamError>) {
        let Some(mut task) = self.pending_upstream.remove(&id) else {
            tracing::warn!(task = id, "upstream response for unknown task");
            return;
        };
        match result {
            Ok(input) => {
                SystemCounters::bump(&self.counters.upstream_ok);
                tracing::debug!(task = id, "upstream answered, resuming at worker action");
                task.input = input;
                task.phase = Phase::WorkerAction;
                self.dispatch(task);
            }
            Err(e) => {
                SystemCounters::bump(&self.counters.upstream_err);
                tracing::warn!(task = id, "upstream failed: {e}");
                task.set_error(e.to_string(), Status::Error);
                self.respond(task);
            }
        }
    }

    fn postpone(&mut self, mut task: Task) {
        let uuid = task.ctx.task_uuid();

        // An answer may already have arrived for this uuid.
        if let Some(pos) = self.parked_inputs.iter().position(|(_, u, _)| *u == uuid) {
            let (_, _, input) = self.parked_inputs.swap_remove(pos);
            tracing::debug!(task = task.id, %uuid, "answer already parked; resuming");
            task.input = input;
            task.phase = Phase::Execute;
            self.ready_to_resume.push(task);
            return;
        }

        tracing::debug!(task = task.id, %uuid, "task postponed");
        let deadline = Instant::now() + self.postpone_timeout;
        self.postpone_expiry.push(Reverse((deadline, uuid)));
        self.postponed.insert(uuid, task);
    }

    /// Ok at EXIT: optionally wake the postponed task this one points at,
    /// then reply.
    fn process_ok(&mut self, task: Task) {
        if let Some(next) = task.ctx.next_task_id() {
            match self.postponed.remove(&next) {
                Some(mut target) => {
                    tracing::debug!(task = task.id, next = %next, "resuming postponed task");
                    target.input = task.input.clone();
                    target.phase = Phase::Execute;
                    self.ready_to_resume.push(target);
                }
                None => {
                    // Not postponed yet; park the input until it is.
                    tracing::debug!(task = task.id, next = %next, "parking input for task");
                    let deadline = Instant::now() + self.postpone_timeout;
                    self.parked_inputs.push((deadline, next, task.input.clone()));
                }
            }
        }
        self.respond(task);
    }

    /// Finalize a task: deliver the client reply or reschedule/retire a
    /// periodic task.
    fn respond(&mut self, mut task: Task) {
        let status = task.last_status();
        match &task.kind {
            TaskKind::Client { .. } => {
                let reply = Reply {
                    status,
                    body: task.output.body.clone(),
                    error_code: task.ctx.local.error_code(),
                    error_message: task.ctx.local.error_message().to_string(),
                };
                tracing::debug!(task = task.id, %status, "task finished");
                if let Some(tx) = task.take_reply()
                    && tx.send(reply).is_err()
                {
                    tracing::debug!(task = task.id, "client gone before reply");
                }
                SystemCounters::bump(&self.counters.tasks_done);
            }
            TaskKind::Periodic { .. } => {
                // Periodic tasks are not counted as client work; only their
                // pool jobs show up in the counters.
                if status == Status::Stop {
                    tracing::debug!(task = task.id, "periodic task stopped");
                    return;
                }
                if status == Status::InternalError {
                    tracing::error!(
                        task = task.id,
                        "periodic task hit an internal error: {}",
                        task.ctx.local.error_message()
                    );
                }
                let deadline = Instant::now() + task.next_timeout();
                task.output.reset();
                self.timer_list.push(Reverse(TimerEntry { deadline, task }));
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        // Fire due periodic tasks.
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.timer_list.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.timer_list.pop() {
                due.push(entry.task);
            }
        }
        for mut task in due {
            task.set_last_status(Status::None);
            task.phase = Phase::Execute;
            self.dispatch(task);
        }

        // Expire postponed tasks that never got their answer.
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _))) = self.postpone_expiry.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, uuid))) = self.postpone_expiry.pop() {
                expired.push(uuid);
            }
        }
        for uuid in expired {
            if let Some(mut task) = self.postponed.remove(&uuid) {
                tracing::debug!(task = task.id, %uuid, "postponed task expired");
                task.set_error("postpone timeout", Status::Error);
                self.respond(task);
            }
        }

        self.parked_inputs.retain(|(deadline, _, _)| *deadline > now);
    }

    fn drain_ready(&mut self) {
        while !self.ready_to_resume.is_empty() {
            let ready = std::mem::take(&mut self.ready_to_resume);
            for task in ready {
                self.dispatch(task);
            }
        }
    }

    fn can_stop(&self) -> bool {
        let created = SystemCounters::read(&self.counters.tasks_created);
        let done = SystemCounters::read(&self.counters.tasks_done);
        let sent = SystemCounters::read(&self.counters.jobs_sent);
        let jobs_done = SystemCounters::read(&self.counters.jobs_done);
        created == done && sent == jobs_done && self.pending_upstream.is_empty()
    }

    /// Keep processing events until in-flight work settles or the grace
    /// period runs out.
    async fn drain_before_stop(&mut self) {
        let deadline = Instant::now() + self.shutdown_grace;
        // Periodic tasks waiting on the timer are dropped; they do not
        // count against the drain condition.
        self.timer_list.clear();

        while !self.can_stop() && Instant::now() < deadline {
            match tokio::time::timeout(self.timer_poll_interval, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    self.on_event(event);
                    self.drain_ready();
                }
                Ok(None) => break,
                Err(_) => {
                    self.on_tick();
                    self.drain_ready();
                }
            }
        }
        if !self.can_stop() {
            tracing::warn!("shutdown grace period elapsed with tasks still in flight");
        }
    }
}

/// Invoke one handler slot. Clones the handler Arc first so the triple
/// borrow ends before the context/output are borrowed mutably.
fn invoke_slot(task: &mut Task, slot: Slot) -> Option<Status> {
    let handler = match slot {
        Slot::Pre => task.route.triple.pre_action.clone(),
        Slot::Worker => task.route.triple.worker_action.clone(),
        Slot::Post => task.route.triple.post_action.clone(),
    }?;
    Some(handler(
        &task.route.vars,
        &task.input,
        &mut task.ctx,
        &mut task.output,
    ))
}

/// Run a handler slot and fold its status into the task. When the phase
/// succeeded and a later phase will run (or a Forward is pending), the
/// output becomes the next phase's input.
fn run_phase_handler(task: &mut Task, slot: Slot) {
    let Some(status) = invoke_slot(task, slot) else {
        return;
    };
    task.set_last_status(status);
    let carry = match slot {
        Slot::Pre => {
            status == Status::Forward
                || (status == Status::Ok
                    && (task.route.triple.has(Slot::Worker) || task.route.triple.has(Slot::Post)))
        }
        Slot::Worker => {
            status == Status::Forward
                || (status == Status::Ok && task.route.triple.has(Slot::Post))
        }
        Slot::Post => status == Status::Forward,
    };
    if carry {
        let output = task.output.clone();
        task.input.assign(&output);
    }
    tracing::trace!(task = task.id, %status, "{:?} action completed", slot);
}

