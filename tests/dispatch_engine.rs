// End-to-end tests for the dispatch engine: tasks are submitted straight to
// the looper with hand-built route matches, and a simulated upstream stands
// in for the daemon.
#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc, Condvar, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use synapse::{
        config::models::ServerConfig,
        core::{
            Looper, LooperHandle, Status,
            context::{GlobalContext, KEY_COUNTERS, SystemCounters},
            error::UpstreamError,
            inout::{Input, Output},
            router::{Handler, HandlerTriple, RouteMatch, RouteVars},
            task::{Protocol, Reply, Task},
        },
        ports::upstream::UpstreamClient,
        utils::shutdown::Shutdown,
    };
    use tokio::sync::oneshot;
    use uuid::Uuid;

    /// Simulated upstream daemon: records every request and answers with a
    /// fixed body.
    struct MockUpstream {
        response: String,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl MockUpstream {
        fn new(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.to_string(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn send(&self, target: &str, body: String) -> Result<Bytes, UpstreamError> {
            self.requests
                .lock()
                .unwrap()
                .push((target.to_string(), body));
            Ok(Bytes::from(self.response.clone()))
        }
    }

    struct Engine {
        handle: LooperHandle,
        shutdown: Arc<Shutdown>,
        looper_task: tokio::task::JoinHandle<()>,
    }

    impl Engine {
        fn start(config: ServerConfig, upstream: Arc<dyn UpstreamClient>) -> Self {
            let global = GlobalContext::new();
            let counters = Arc::new(SystemCounters::default());
            global.set_shared(KEY_COUNTERS, Arc::clone(&counters));
            let shutdown = Arc::new(Shutdown::new());
            let (looper, handle) =
                Looper::new(&config, global, counters, upstream, shutdown.token());
            let looper_task = tokio::spawn(looper.run());
            Self {
                handle,
                shutdown,
                looper_task,
            }
        }

        fn submit(&self, triple: HandlerTriple, input: &str) -> oneshot::Receiver<Reply> {
            let route = RouteMatch {
                triple,
                vars: RouteVars::default(),
            };
            let (task, rx) = Task::new_client(
                self.handle.global(),
                self.handle.api(),
                route,
                Input::from_str(input),
                Protocol::Http,
            );
            assert!(self.handle.submit(task), "engine rejected submission");
            rx
        }

        async fn stop(self) {
            self.shutdown.trigger();
            let _ = tokio::time::timeout(Duration::from_secs(10), self.looper_task).await;
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            workers_count: 2,
            worker_queue_len: 8,
            workers_expelling_interval_ms: 0,
            timer_poll_interval_ms: 20,
            again_bound: 2,
            shutdown_grace_ms: 2_000,
            ..ServerConfig::default()
        }
    }

    async fn reply_of(rx: oneshot::Receiver<Reply>) -> Reply {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out waiting for reply")
            .expect("reply channel closed")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_only_route_completes_in_one_pass() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let triple = HandlerTriple::worker("health", Arc::new(|_, _, _, _| Status::Ok));
        let reply = reply_of(engine.submit(triple, "")).await;

        assert_eq!(reply.status, Status::Ok);
        assert!(reply.body.is_empty());
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forward_roundtrip_runs_post_action_exactly_once() {
        let upstream = MockUpstream::new(r#"{"result":{"height":1200}}"#);
        let engine = Engine::start(test_config(), upstream.clone());

        let post_runs = Arc::new(AtomicUsize::new(0));
        let called_at_forward = Arc::new(Mutex::new(None::<bool>));

        let called_probe = Arc::clone(&called_at_forward);
        let worker: Handler = Arc::new(move |_vars, input, ctx, output| {
            if !ctx.local.has("called") {
                ctx.local.set("called", true);
                *called_probe.lock().unwrap() = ctx.local.get_cloned::<bool>("called");
                output.set_body(r#"{"method":"get_info"}"#);
                return Status::Forward;
            }
            // Second entry: the upstream response is the input now.
            output.set_body(format!(
                r#"{{"upstream":{},"called":{}}}"#,
                input.as_text(),
                ctx.local.get_cloned::<bool>("called").unwrap_or(false)
            ));
            Status::Ok
        });

        let post_counter = Arc::clone(&post_runs);
        let post: Handler = Arc::new(move |_vars, _input, _ctx, _output| {
            post_counter.fetch_add(1, Ordering::SeqCst);
            Status::Ok
        });

        let triple = HandlerTriple::new("rpc", None, Some(worker), Some(post));
        let reply = reply_of(engine.submit(triple, r#"{"id":1}"#)).await;

        assert_eq!(reply.status, Status::Ok);
        assert!(reply.body.contains(r#""height":1200"#));
        assert!(reply.body.contains(r#""called":true"#));

        // The local marker was set before the Forward returned.
        assert_eq!(*called_at_forward.lock().unwrap(), Some(true));

        // Exactly one upstream round-trip, carrying the worker's output.
        let requests = upstream.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, r#"{"method":"get_info"}"#);

        // Post-action was neither skipped nor duplicated.
        assert_eq!(post_runs.load(Ordering::SeqCst), 1);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn again_beyond_bound_becomes_internal_error() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_probe = Arc::clone(&attempts);
        let worker: Handler = Arc::new(move |_, _, _, _| {
            attempts_probe.fetch_add(1, Ordering::SeqCst);
            Status::Again
        });

        let triple = HandlerTriple::worker("retry_forever", worker);
        let reply = reply_of(engine.submit(triple, "")).await;

        assert_eq!(reply.status, Status::InternalError);
        assert!(reply.error_message.contains("again bound exceeded"));
        // again_bound = 2: the initial run plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn saturated_pool_yields_busy_without_blocking() {
        let config = ServerConfig {
            workers_count: 1,
            worker_queue_len: 1,
            ..test_config()
        };
        let engine = Engine::start(config, MockUpstream::new("{}"));

        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_gate = Arc::clone(&gate);
        let blocking_worker: Handler = Arc::new(move |_, _, _, _| {
            let (lock, cond) = &*worker_gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
            Status::Ok
        });

        let first = engine.submit(
            HandlerTriple::worker("blocker", Arc::clone(&blocking_worker)),
            "",
        );
        // Let the single worker pick the first task up.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = engine.submit(HandlerTriple::worker("excess", blocking_worker), "");
        let busy_reply = reply_of(second).await;
        assert_eq!(busy_reply.status, Status::Busy);

        // The accepted task is not dropped: it completes once released.
        let (lock, cond) = &*gate;
        *lock.lock().unwrap() = true;
        cond.notify_all();
        let first_reply = reply_of(first).await;
        assert_eq!(first_reply.status, Status::Ok);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_tasks_have_isolated_local_contexts() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let worker: Handler = Arc::new(|_vars, input, ctx, output| {
            ctx.local.set("mine", input.as_text());
            std::thread::sleep(Duration::from_millis(50));
            output.set_body(ctx.local.get_cloned::<String>("mine").unwrap_or_default());
            Status::Ok
        });

        let a = engine.submit(HandlerTriple::worker("iso", Arc::clone(&worker)), "alpha");
        let b = engine.submit(HandlerTriple::worker("iso", worker), "beta");

        let reply_a = reply_of(a).await;
        let reply_b = reply_of(b).await;
        assert_eq!(reply_a.body, "alpha");
        assert_eq!(reply_b.body, "beta");
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn absent_worker_and_post_phases_are_skipped() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let pre: Handler = Arc::new(|_vars, _input, _ctx, output| {
            output.set_body("pre-ran");
            Status::Ok
        });
        let triple = HandlerTriple::new("pre_only", Some(pre), None, None);
        let reply = reply_of(engine.submit(triple, "")).await;

        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.body, "pre-ran");
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drop_reaches_the_caller_as_drop() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let triple = HandlerTriple::worker("dropper", Arc::new(|_, _, _, _| Status::Drop));
        let reply = reply_of(engine.submit(triple, "ignored")).await;

        assert_eq!(reply.status, Status::Drop);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn postponed_task_is_resumed_by_a_later_task() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let parked_uuid = Arc::new(Mutex::new(None::<Uuid>));

        let uuid_store = Arc::clone(&parked_uuid);
        let sleeper: Handler = Arc::new(move |_vars, input, ctx, output| {
            if !ctx.local.has("waiting") {
                ctx.local.set("waiting", true);
                *uuid_store.lock().unwrap() = Some(ctx.task_uuid());
                return Status::Postpone;
            }
            output.set_body(format!("resumed:{}", input.as_text()));
            Status::Ok
        });

        let uuid_source = Arc::clone(&parked_uuid);
        let waker: Handler = Arc::new(move |_vars, _input, ctx, _output| {
            let target = uuid_source.lock().unwrap().expect("sleeper uuid recorded");
            ctx.set_next_task_id(target);
            Status::Ok
        });

        let sleeper_rx = engine.submit(HandlerTriple::worker("sleeper", sleeper), "");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let waker_rx = engine.submit(HandlerTriple::worker("waker", waker), "wake-data");
        assert_eq!(reply_of(waker_rx).await.status, Status::Ok);

        let reply = reply_of(sleeper_rx).await;
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.body, "resumed:wake-data");
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn postponed_task_expires_into_an_error() {
        let config = ServerConfig {
            http_connection_timeout_ms: 150,
            ..test_config()
        };
        let engine = Engine::start(config, MockUpstream::new("{}"));

        let triple = HandlerTriple::worker("forever", Arc::new(|_, _, _, _| Status::Postpone));
        let reply = reply_of(engine.submit(triple, "")).await;

        assert_eq!(reply.status, Status::Error);
        assert!(reply.error_message.contains("postpone timeout"));
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_task_fires_until_it_stops_itself() {
        let engine = Engine::start(test_config(), MockUpstream::new("{}"));

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_probe = Arc::clone(&runs);
        let handler: Handler = Arc::new(move |_, _, _, _| {
            if runs_probe.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                Status::Stop
            } else {
                Status::Ok
            }
        });

        assert!(engine.handle.add_periodic_task(
            handler,
            Duration::from_millis(40),
            Some(Duration::from_millis(10)),
            0.0,
        ));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_upstream_call_from_a_worker() {
        let upstream = MockUpstream::new(r#"{"pong":true}"#);
        let engine = Engine::start(test_config(), upstream.clone());

        let worker: Handler = Arc::new(|_vars, _input, ctx, output| {
            let mut request = Output::default();
            request.set_body(r#"{"ping":true}"#);
            match ctx.api().send_upstream_blocking(&request) {
                Ok(response) => {
                    output.set_body(response.as_text());
                    Status::Ok
                }
                Err(e) => {
                    ctx.local.set_error(e.to_string(), Status::Error);
                    Status::Error
                }
            }
        });

        let reply = reply_of(engine.submit(HandlerTriple::worker("pinger", worker), "")).await;
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.body, r#"{"pong":true}"#);
        assert_eq!(upstream.requests().len(), 1);
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upstream_failure_surfaces_as_error() {
        struct FailingUpstream;

        #[async_trait]
        impl UpstreamClient for FailingUpstream {
            async fn send(&self, _target: &str, _body: String) -> Result<Bytes, UpstreamError> {
                Err(UpstreamError::Connection("connection refused".to_string()))
            }
        }

        let engine = Engine::start(test_config(), Arc::new(FailingUpstream));

        let worker: Handler = Arc::new(|_vars, _input, ctx, output| {
            if !ctx.local.has("called") {
                ctx.local.set("called", true);
                output.set_body("{}");
                return Status::Forward;
            }
            Status::Ok
        });

        let reply = reply_of(engine.submit(HandlerTriple::worker("fwd", worker), "")).await;
        assert_eq!(reply.status, Status::Error);
        assert!(reply.error_message.contains("connection refused"));
        engine.stop().await;
    }
}
