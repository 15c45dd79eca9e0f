//! Two-tier context store.
//!
//! * `GlobalContext` — process-wide key/value state shared by every task and
//!   thread. Populated once at startup (configuration, counters, shared
//!   handles); steady-state access is read-mostly and lock-free thanks to
//!   `scc::HashMap`. Concurrent writes to the same key are not serialized by
//!   the store; shared mutable entries must use interior atomics.
//! * `LocalContext` — owned by exactly one task, created and destroyed with
//!   it. Used to thread flags between the phases of one logical request,
//!   including across Forward round-trips.
use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use uuid::Uuid;

use crate::core::{
    error::{EngineError, UpstreamError},
    inout::{Input, Output},
    router::Handler,
    status::Status,
};

/// Global context key for the deserialized server configuration.
pub const KEY_CONFIG: &str = "config";
/// Global context key for the process-wide [`SystemCounters`].
pub const KEY_COUNTERS: &str = "counters";
/// Global context key for the shared worker pool handle (stats reporting).
pub const KEY_WORKER_POOL: &str = "worker_pool";

type GlobalValue = Arc<dyn Any + Send + Sync>;

/// Process-wide key/value map. Cheap to clone (Arc inside).
#[derive(Clone, Default)]
pub struct GlobalContext {
    map: Arc<scc::HashMap<String, GlobalValue>>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value under `key`.
    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.set_shared(key, Arc::new(value));
    }

    /// Insert or replace an already-shared value, so the caller keeps a
    /// handle to the same instance (counters, pools).
    pub fn set_shared<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) {
        let value: GlobalValue = value;
        match self.map.entry_sync(key.to_string()) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                *entry.get_mut() = value;
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(value);
            }
        }
    }

    /// Fetch a shared handle to the value under `key`, if present and of the
    /// expected type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.map
            .read_sync(key, |_, v| Arc::clone(v))
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Fetch a clone of the value under `key`, or `default` when absent.
    pub fn get_or<T: Any + Send + Sync + Clone>(&self, key: &str, default: T) -> T {
        self.get::<T>(key).map_or(default, |v| (*v).clone())
    }

    /// Fetch a required process-wide singleton. Absence is an engine
    /// invariant violation and surfaces as `InternalError` in dispatch paths.
    pub fn required<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, EngineError> {
        match self.map.read_sync(key, |_, v| Arc::clone(v)) {
            None => Err(EngineError::MissingContextKey(key.to_string())),
            Some(v) => v
                .downcast::<T>()
                .map_err(|_| EngineError::ContextTypeMismatch(key.to_string())),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_sync(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.map.remove_sync(key).is_some()
    }
}

/// Shared engine counters, designed for concurrent increment. Lives in the
/// global context under [`KEY_COUNTERS`].
#[derive(Debug, Default)]
pub struct SystemCounters {
    pub tasks_created: AtomicU64,
    pub tasks_done: AtomicU64,
    pub jobs_sent: AtomicU64,
    pub jobs_done: AtomicU64,
    pub upstream_requests: AtomicU64,
    pub upstream_ok: AtomicU64,
    pub upstream_err: AtomicU64,
    pub http_requests: AtomicU64,
    pub coap_requests: AtomicU64,
}

impl SystemCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Task-scoped key/value map plus the task's last handler status and error
/// slot. Visible only to code operating on the owning task.
#[derive(Default)]
pub struct LocalContext {
    map: HashMap<String, Box<dyn Any + Send>>,
    last_status: Status,
    error_code: i64,
    error_message: String,
}

impl LocalContext {
    pub fn set<T: Any + Send>(&mut self, key: &str, value: T) {
        self.map.insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.map.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_cloned<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.get::<T>(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.map.remove(key);
    }

    pub fn last_status(&self) -> Status {
        self.last_status
    }

    pub(crate) fn set_last_status(&mut self, status: Status) {
        self.last_status = status;
    }

    /// Record an error message (and optional JSON-RPC code) together with the
    /// status that carries it to EXIT.
    pub fn set_error(&mut self, message: impl Into<String>, status: Status) {
        self.error_message = message.into();
        self.last_status = status;
    }

    pub fn set_error_code(&mut self, code: i64) {
        self.error_code = code;
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn error_code(&self) -> i64 {
        self.error_code
    }
}

/// Interface the engine exposes to handler code: synchronous upstream calls
/// and periodic-task registration. Implemented by the looper; tests use
/// [`NullHandlerApi`].
pub trait HandlerApi: Send + Sync {
    /// Perform an upstream round-trip, blocking the calling worker thread
    /// until the response (or an error) arrives. Must not be called from the
    /// engine's event-loop threads.
    fn send_upstream_blocking(&self, output: &Output) -> Result<Input, UpstreamError>;

    /// Register a worker-only handler to run on a fixed interval. Returns
    /// false when the engine is shutting down.
    fn add_periodic_task(
        &self,
        handler: Handler,
        interval: Duration,
        initial_interval: Option<Duration>,
        random_factor: f64,
    ) -> bool;
}

/// No-op [`HandlerApi`] for tests and detached contexts.
pub struct NullHandlerApi;

impl HandlerApi for NullHandlerApi {
    fn send_upstream_blocking(&self, _output: &Output) -> Result<Input, UpstreamError> {
        Err(UpstreamError::ChannelClosed)
    }

    fn add_periodic_task(
        &self,
        _handler: Handler,
        _interval: Duration,
        _initial_interval: Option<Duration>,
        _random_factor: f64,
    ) -> bool {
        false
    }
}

/// Per-task view over both context tiers, handed to every handler phase.
pub struct Context {
    pub global: GlobalContext,
    pub local: LocalContext,
    uuid: Uuid,
    next_task_id: Option<Uuid>,
    api: Arc<dyn HandlerApi>,
}

impl Context {
    pub fn new(global: GlobalContext, api: Arc<dyn HandlerApi>) -> Self {
        Self {
            global,
            local: LocalContext::default(),
            uuid: Uuid::new_v4(),
            next_task_id: None,
            api,
        }
    }

    /// Stable identity of the owning task, used as the postpone/resume key.
    pub fn task_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Point a finishing task at a postponed task to resume with this task's
    /// input.
    pub fn set_next_task_id(&mut self, uuid: Uuid) {
        self.next_task_id = Some(uuid);
    }

    pub fn next_task_id(&self) -> Option<Uuid> {
        self.next_task_id
    }

    /// Engine services available to handler code.
    pub fn api(&self) -> &dyn HandlerApi {
        self.api.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_set_get_roundtrip() {
        let global = GlobalContext::new();
        global.set("answer", 42u32);
        assert_eq!(global.get::<u32>("answer").map(|v| *v), Some(42));
        assert!(global.get::<String>("answer").is_none());
        assert_eq!(global.get_or::<u32>("missing", 7), 7);
    }

    #[test]
    fn global_required_missing_is_error() {
        let global = GlobalContext::new();
        assert!(matches!(
            global.required::<u32>("nope"),
            Err(EngineError::MissingContextKey(_))
        ));
        global.set("present", 1u8);
        assert!(matches!(
            global.required::<u64>("present"),
            Err(EngineError::ContextTypeMismatch(_))
        ));
    }

    #[test]
    fn global_overwrite_replaces_value() {
        let global = GlobalContext::new();
        global.set("k", 1u32);
        global.set("k", 2u32);
        assert_eq!(global.get::<u32>("k").map(|v| *v), Some(2));
    }

    #[test]
    fn local_keys_and_status() {
        let mut local = LocalContext::default();
        assert_eq!(local.last_status(), Status::None);
        local.set("called", true);
        assert_eq!(local.get_cloned::<bool>("called"), Some(true));
        local.set_error("boom", Status::Error);
        assert_eq!(local.last_status(), Status::Error);
        assert_eq!(local.error_message(), "boom");
        local.remove("called");
        assert!(!local.has("called"));
    }
}
