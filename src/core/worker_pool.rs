//! Bounded worker-thread pool with idle-worker expulsion.
//!
//! Worker phases are synchronous and may block on upstream round-trips, so
//! they run on dedicated OS threads rather than on the async runtime. The
//! pool holds one bounded queue of capacity `workers_count *
//! worker_queue_len`; `try_post` never blocks and hands the task back when
//! the queue is full, which the looper surfaces as `Busy`.
//!
//! Workers idle beyond `workers_expelling_interval` retire themselves and are
//! respawned on demand by the next post, bounding resource usage under
//! bursty load while keeping warm capacity under sustained load.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crate::core::task::Task;

/// Runs one task's worker action and reports the result to the coordinator.
pub type JobRunner = Box<dyn Fn(Task) + Send + Sync>;

struct QueueState {
    jobs: VecDeque<Task>,
    stopped: bool,
}

struct PoolShared {
    queue: Mutex<QueueState>,
    cond: Condvar,
    runner: JobRunner,
    live_workers: AtomicUsize,
    expelled_workers: AtomicU64,
    spawned_workers: AtomicU64,
    expelling_interval: Duration,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers_count: usize,
    capacity: usize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        workers_count: usize,
        worker_queue_len: usize,
        expelling_interval: Duration,
        runner: JobRunner,
    ) -> Self {
        let workers_count = workers_count.max(1);
        let worker_queue_len = worker_queue_len.max(1);
        let capacity = workers_count * worker_queue_len;

        let pool = Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(QueueState {
                    jobs: VecDeque::with_capacity(capacity),
                    stopped: false,
                }),
                cond: Condvar::new(),
                runner,
                live_workers: AtomicUsize::new(0),
                expelled_workers: AtomicU64::new(0),
                spawned_workers: AtomicU64::new(0),
                expelling_interval,
            }),
            workers_count,
            capacity,
            handles: Mutex::new(Vec::new()),
        };

        for _ in 0..workers_count {
            pool.spawn_worker();
        }
        tracing::info!(
            workers = workers_count,
            queue_capacity = capacity,
            expelling_interval_ms = expelling_interval.as_millis() as u64,
            "worker pool created"
        );
        pool
    }

    /// Enqueue a task for its worker action. Non-blocking; the task comes
    /// back when the queue is full or the pool is stopped, and the caller
    /// turns that into a `Busy` response.
    pub fn try_post(&self, task: Task) -> Result<(), Task> {
        let respawn_needed = {
            let mut queue = self.shared.queue.lock().expect("worker pool queue lock");
            if queue.stopped || queue.jobs.len() >= self.capacity {
                return Err(task);
            }
            queue.jobs.push_back(task);
            self.shared.live_workers.load(Ordering::Relaxed) < self.workers_count
                && !queue.jobs.is_empty()
        };
        self.shared.cond.notify_one();
        if respawn_needed {
            self.spawn_worker();
        }
        Ok(())
    }

    fn spawn_worker(&self) {
        self.shared.live_workers.fetch_add(1, Ordering::Relaxed);
        self.shared.spawned_workers.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("synapse-worker".to_string())
            .spawn(move || worker_loop(shared))
            .expect("failed to spawn worker thread");
        self.handles
            .lock()
            .expect("worker pool handle lock")
            .push(handle);
    }

    /// Maximum number of queued jobs before `try_post` reports fullness.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queue_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("worker pool queue lock")
            .jobs
            .len()
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Relaxed)
    }

    pub fn expelled_workers(&self) -> u64 {
        self.shared.expelled_workers.load(Ordering::Relaxed)
    }

    /// Stop accepting work and let workers drain the queue, then join them.
    /// Joining is bounded by the workers themselves: they exit as soon as the
    /// queue is empty.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("worker pool queue lock");
            queue.stopped = true;
        }
        self.shared.cond.notify_all();
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("worker pool handle lock")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!(
            expelled = self.expelled_workers(),
            "worker pool shut down"
        );
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let expel = shared.expelling_interval;
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("worker pool queue lock");
            loop {
                if let Some(task) = queue.jobs.pop_front() {
                    break Some(task);
                }
                if queue.stopped {
                    break None;
                }
                if expel.is_zero() {
                    queue = shared
                        .cond
                        .wait(queue)
                        .expect("worker pool queue lock poisoned");
                } else {
                    let (guard, timeout) = shared
                        .cond
                        .wait_timeout(queue, expel)
                        .expect("worker pool queue lock poisoned");
                    queue = guard;
                    if timeout.timed_out() && queue.jobs.is_empty() && !queue.stopped {
                        // Idle beyond the expelling interval: retire. The
                        // decrement happens under the lock so try_post sees a
                        // consistent live count.
                        shared.live_workers.fetch_sub(1, Ordering::Relaxed);
                        shared.expelled_workers.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("idle worker expelled");
                        return;
                    }
                }
            }
        };

        match job {
            Some(task) => (shared.runner)(task),
            None => break,
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc as StdArc,
        atomic::{AtomicUsize as TestCounter, Ordering as TestOrdering},
        mpsc,
    };

    use super::*;
    use crate::core::{
        context::{GlobalContext, HandlerApi, NullHandlerApi},
        inout::Input,
        router::{Handler, HandlerTriple, RouteMatch, RouteVars},
        status::Status,
        task::{Protocol, Task},
    };

    fn make_task() -> Task {
        let global = GlobalContext::new();
        let api: StdArc<dyn HandlerApi> = StdArc::new(NullHandlerApi);
        let handler: Handler = StdArc::new(|_, _, _, _| Status::Ok);
        let route = RouteMatch {
            triple: HandlerTriple::worker("t", handler),
            vars: RouteVars::default(),
        };
        Task::new_client(global, api, route, Input::default(), Protocol::Http).0
    }

    #[test]
    fn posted_jobs_run_on_workers() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(
            2,
            4,
            Duration::ZERO,
            Box::new(move |task| {
                tx.send(task.id).unwrap();
            }),
        );

        let mut ids = Vec::new();
        for _ in 0..4 {
            let task = make_task();
            ids.push(task.id);
            pool.try_post(task).map_err(|_| ()).unwrap();
        }

        let mut seen: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        seen.sort_unstable();
        ids.sort_unstable();
        assert_eq!(seen, ids);
        pool.shutdown();
    }

    #[test]
    fn overflow_returns_the_task() {
        // A runner that parks forever keeps both workers busy, so the queue
        // (capacity 1 * 1 = 1) fills after one extra post.
        let gate = StdArc::new((Mutex::new(false), Condvar::new()));
        let runner_gate = StdArc::clone(&gate);
        let pool = WorkerPool::new(
            1,
            1,
            Duration::ZERO,
            Box::new(move |_task| {
                let (lock, cond) = &*runner_gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cond.wait(open).unwrap();
                }
            }),
        );

        // First task occupies the single worker, second fills the queue.
        pool.try_post(make_task()).map_err(|_| ()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        pool.try_post(make_task()).map_err(|_| ()).unwrap();

        let overflow = pool.try_post(make_task());
        assert!(overflow.is_err());

        let (lock, cond) = &*gate;
        *lock.lock().unwrap() = true;
        cond.notify_all();
        pool.shutdown();
    }

    #[test]
    fn idle_workers_are_expelled_and_respawned() {
        let ran = StdArc::new(TestCounter::new(0));
        let ran_clone = StdArc::clone(&ran);
        let pool = WorkerPool::new(
            2,
            4,
            Duration::from_millis(50),
            Box::new(move |_task| {
                ran_clone.fetch_add(1, TestOrdering::SeqCst);
            }),
        );

        assert_eq!(pool.live_workers(), 2);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.live_workers(), 0);
        assert!(pool.expelled_workers() >= 2);

        // A new post revives capacity.
        pool.try_post(make_task()).map_err(|_| ()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(TestOrdering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_accepted_jobs() {
        let ran = StdArc::new(TestCounter::new(0));
        let ran_clone = StdArc::clone(&ran);
        let pool = WorkerPool::new(
            1,
            8,
            Duration::ZERO,
            Box::new(move |_task| {
                std::thread::sleep(Duration::from_millis(10));
                ran_clone.fetch_add(1, TestOrdering::SeqCst);
            }),
        );

        for _ in 0..5 {
            pool.try_post(make_task()).map_err(|_| ()).unwrap();
        }
        pool.shutdown();
        assert_eq!(ran.load(TestOrdering::SeqCst), 5);
    }
}
