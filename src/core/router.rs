//! Route registration and the compiled path matcher.
//!
//! Registration happens in two stages: individual [`Router`] instances
//! collect `(method, pattern) -> handler triple` entries, then a
//! [`RouterRoot`] merges them and `arm()` compiles everything into an
//! immutable per-method segment trie. Arming detects ambiguous registrations
//! and reports them instead of silently picking one. After a successful arm
//! the matcher is read-only and resolved without locking (`arc-swap`).
//!
//! Pattern language: literal segments, named variables (`:name` or
//! `{name}`), and a trailing wildcard (`*rest`). Trailing slashes and query
//! strings are ignored for matching. Ties are broken by preferring literal
//! segments over variables over wildcards at every level, which yields the
//! most-specific (longest literal prefix) match.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwapOption;
use http::Method;
use thiserror::Error;

use crate::core::{
    context::Context,
    inout::{Input, Output},
    status::Status,
};

/// A single handler phase. Receives the extracted path variables, the task
/// input, the task context, and the output buffer to mutate.
pub type Handler = Arc<dyn Fn(&RouteVars, &Input, &mut Context, &mut Output) -> Status + Send + Sync>;

/// Identifies one of the three optional handler slots of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Pre,
    Worker,
    Post,
}

/// Up to three callable phases for one route; any slot may be absent.
#[derive(Clone, Default)]
pub struct HandlerTriple {
    pub pre_action: Option<Handler>,
    pub worker_action: Option<Handler>,
    pub post_action: Option<Handler>,
    /// Diagnostic name, shown in logs and the router dump.
    pub name: String,
}

impl HandlerTriple {
    pub fn new(
        name: impl Into<String>,
        pre_action: Option<Handler>,
        worker_action: Option<Handler>,
        post_action: Option<Handler>,
    ) -> Self {
        Self {
            pre_action,
            worker_action,
            post_action,
            name: name.into(),
        }
    }

    /// Triple with only a worker action, the common case.
    pub fn worker(name: impl Into<String>, worker_action: Handler) -> Self {
        Self::new(name, None, Some(worker_action), None)
    }

    /// Pure predicate over slot presence; the state machine guards use this.
    pub fn has(&self, slot: Slot) -> bool {
        match slot {
            Slot::Pre => self.pre_action.is_some(),
            Slot::Worker => self.worker_action.is_some(),
            Slot::Post => self.post_action.is_some(),
        }
    }
}

impl fmt::Debug for HandlerTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HandlerTriple({}, {{{},{},{}}})",
            self.name,
            self.pre_action.is_some() as u8,
            self.worker_action.is_some() as u8,
            self.post_action.is_some() as u8
        )
    }
}

/// Ordered set of `name -> value` pairs extracted from the matched path.
#[derive(Debug, Clone, Default)]
pub struct RouteVars(Vec<(String, String)>);

impl RouteVars {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }
}

/// Result of resolving an inbound (method, path).
#[derive(Clone)]
pub struct RouteMatch {
    pub triple: HandlerTriple,
    pub vars: RouteVars,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouterError {
    #[error("router is already armed; no further registration or arming is permitted")]
    AlreadyArmed,

    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("ambiguous route registrations:\n{report}")]
    Conflict { report: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
    Wildcard(String),
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouterError> {
    let mut segments = Vec::new();
    let trimmed = pattern.trim_end_matches('/');
    for (idx, raw) in trimmed.split('/').filter(|s| !s.is_empty()).enumerate() {
        let segment = if let Some(name) = raw.strip_prefix(':') {
            Segment::Var(name.to_string())
        } else if raw.starts_with('{') && raw.ends_with('}') {
            Segment::Var(raw[1..raw.len() - 1].to_string())
        } else if let Some(name) = raw.strip_prefix('*') {
            Segment::Wildcard(if name.is_empty() {
                "rest".to_string()
            } else {
                name.to_string()
            })
        } else {
            Segment::Literal(raw.to_string())
        };

        if matches!(segments.last(), Some(Segment::Wildcard(_))) {
            return Err(RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: format!("wildcard must be the final segment (segment {idx})"),
            });
        }
        segments.push(segment);
    }
    Ok(segments)
}

struct Route {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    triple: HandlerTriple,
}

/// Pre-arm registration collector. Several routers (one per handler set) are
/// merged into a [`RouterRoot`] before arming.
pub struct Router {
    prefix: String,
    routes: Vec<Route>,
}

impl Router {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            routes: Vec::new(),
        }
    }

    /// Register a pattern for `method`. Patterns are validated eagerly so a
    /// typo fails at registration, not at arm time.
    pub fn add_route(
        &mut self,
        method: Method,
        pattern: &str,
        triple: HandlerTriple,
    ) -> Result<(), RouterError> {
        let full = format!("{}{}", self.prefix, pattern);
        let segments = parse_pattern(&full)?;
        self.routes.push(Route {
            method,
            pattern: full,
            segments,
            triple,
        });
        Ok(())
    }
}

#[derive(Default)]
struct Node {
    literal: HashMap<String, usize>,
    var: Option<(String, usize)>,
    wildcard: Option<(String, usize)>,
    /// Index into the compiled route list when a pattern terminates here.
    terminal: Option<usize>,
}

struct CompiledRoute {
    pattern: String,
    method: Method,
    triple: HandlerTriple,
}

/// Immutable compiled matcher. Construction happens exactly once, in
/// [`RouterRoot::arm`].
pub struct ArmedRouter {
    arena: Vec<Node>,
    roots: HashMap<Method, usize>,
    routes: Vec<CompiledRoute>,
}

impl ArmedRouter {
    fn compile(routers: Vec<Router>) -> Result<Self, RouterError> {
        let mut armed = Self {
            arena: Vec::new(),
            roots: HashMap::new(),
            routes: Vec::new(),
        };
        let mut conflicts = Vec::new();

        for router in routers {
            for route in router.routes {
                armed.insert(route, &mut conflicts);
            }
        }

        if conflicts.is_empty() {
            Ok(armed)
        } else {
            Err(RouterError::Conflict {
                report: conflicts.join("\n"),
            })
        }
    }

    fn new_node(&mut self) -> usize {
        self.arena.push(Node::default());
        self.arena.len() - 1
    }

    fn insert(&mut self, route: Route, conflicts: &mut Vec<String>) {
        let root = match self.roots.get(&route.method) {
            Some(&idx) => idx,
            None => {
                let idx = self.new_node();
                self.roots.insert(route.method.clone(), idx);
                idx
            }
        };

        let mut node = root;
        for segment in &route.segments {
            node = match segment {
                Segment::Literal(lit) => match self.arena[node].literal.get(lit) {
                    Some(&next) => next,
                    None => {
                        let next = self.new_node();
                        self.arena[node].literal.insert(lit.clone(), next);
                        next
                    }
                },
                Segment::Var(name) => match &self.arena[node].var {
                    Some((_, next)) => *next,
                    None => {
                        let next = self.new_node();
                        self.arena[node].var = Some((name.clone(), next));
                        next
                    }
                },
                Segment::Wildcard(name) => match &self.arena[node].wildcard {
                    Some((_, next)) => *next,
                    None => {
                        let next = self.new_node();
                        self.arena[node].wildcard = Some((name.clone(), next));
                        next
                    }
                },
            };
        }

        match self.arena[node].terminal {
            Some(existing) => {
                let other = &self.routes[existing];
                conflicts.push(format!(
                    "  {} '{}' ({}) collides with '{}' ({})",
                    route.method,
                    route.pattern,
                    route.triple.name,
                    other.pattern,
                    other.triple.name
                ));
            }
            None => {
                self.routes.push(CompiledRoute {
                    pattern: route.pattern,
                    method: route.method,
                    triple: route.triple,
                });
                self.arena[node].terminal = Some(self.routes.len() - 1);
            }
        }
    }

    /// Resolve `(method, path)` to a handler triple plus extracted variables.
    /// Query strings and trailing slashes are ignored.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let path = path.split('?').next().unwrap_or(path);
        let segments: Vec<&str> = path
            .trim_end_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let root = *self.roots.get(method)?;
        let mut vars = RouteVars::default();
        let route_idx = self.descend(root, &segments, &mut vars)?;
        let route = &self.routes[route_idx];
        Some(RouteMatch {
            triple: route.triple.clone(),
            vars,
        })
    }

    /// Depth-first descent with backtracking; literal children win over
    /// variables, variables over wildcards.
    fn descend(&self, node: usize, segments: &[&str], vars: &mut RouteVars) -> Option<usize> {
        let Some((head, rest)) = segments.split_first() else {
            return self.arena[node].terminal;
        };

        if let Some(&next) = self.arena[node].literal.get(*head)
            && let Some(found) = self.descend(next, rest, vars)
        {
            return Some(found);
        }

        if let Some((name, next)) = &self.arena[node].var {
            vars.push(name.clone(), (*head).to_string());
            if let Some(found) = self.descend(*next, rest, vars) {
                return Some(found);
            }
            vars.0.pop();
        }

        if let Some((name, next)) = &self.arena[node].wildcard {
            vars.push(name.clone(), segments.join("/"));
            if let Some(found) = self.arena[*next].terminal {
                return Some(found);
            }
            vars.0.pop();
        }

        None
    }

    /// Diagnostic listing of every compiled route.
    pub fn dump(&self) -> String {
        let mut lines: Vec<String> = self
            .routes
            .iter()
            .map(|r| format!("{} {} -> {}", r.method, r.pattern, r.triple.name))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Holds registrations until arming, then the immutable matcher. Readers go
/// through `resolve` and never take a lock once armed.
pub struct RouterRoot {
    pending: Mutex<Option<Vec<Router>>>,
    armed: ArcSwapOption<ArmedRouter>,
}

impl Default for RouterRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterRoot {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Some(Vec::new())),
            armed: ArcSwapOption::const_empty(),
        }
    }

    /// Merge a router's registrations. Rejected after arming.
    pub fn add_router(&self, router: Router) -> Result<(), RouterError> {
        let mut pending = self.pending.lock().expect("router registration lock");
        match pending.as_mut() {
            Some(routers) => {
                routers.push(router);
                Ok(())
            }
            None => Err(RouterError::AlreadyArmed),
        }
    }

    /// Compile all registrations into the immutable matcher. Fails on
    /// ambiguous registrations with a diagnostic report; arming twice is
    /// rejected.
    pub fn arm(&self) -> Result<(), RouterError> {
        let routers = {
            let mut pending = self.pending.lock().expect("router registration lock");
            pending.take().ok_or(RouterError::AlreadyArmed)?
        };

        match ArmedRouter::compile(routers) {
            Ok(armed) => {
                tracing::info!(routes = armed.route_count(), "router armed");
                tracing::debug!("routes:\n{}", armed.dump());
                self.armed.store(Some(Arc::new(armed)));
                Ok(())
            }
            Err(e) => {
                tracing::error!("router arming failed: {e}");
                Err(e)
            }
        }
    }

    /// Resolve against the armed matcher. Returns `None` before arming.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        self.armed
            .load()
            .as_ref()
            .and_then(|armed| armed.resolve(method, path))
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load().is_some()
    }

    pub fn dump(&self) -> String {
        self.armed
            .load()
            .as_ref()
            .map(|armed| armed.dump())
            .unwrap_or_else(|| "<not armed>".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_, _, _, _| Status::Ok)
    }

    fn triple(name: &str) -> HandlerTriple {
        HandlerTriple::worker(name, noop())
    }

    fn armed(patterns: &[(&str, Method)]) -> RouterRoot {
        let root = RouterRoot::new();
        let mut router = Router::new("");
        for (pattern, method) in patterns {
            router
                .add_route(method.clone(), pattern, triple(pattern))
                .unwrap();
        }
        root.add_router(router).unwrap();
        root.arm().unwrap();
        root
    }

    #[test]
    fn resolves_each_registered_pattern_to_its_own_triple() {
        let root = armed(&[
            ("/health", Method::GET),
            ("/wallets/:id", Method::GET),
            ("/wallets/:id/balance", Method::GET),
            ("/files/*path", Method::GET),
        ]);

        let m = root.resolve(&Method::GET, "/health").unwrap();
        assert_eq!(m.triple.name, "/health");
        assert!(m.vars.is_empty());

        let m = root.resolve(&Method::GET, "/wallets/w17").unwrap();
        assert_eq!(m.triple.name, "/wallets/:id");
        assert_eq!(m.vars.get("id"), Some("w17"));

        let m = root.resolve(&Method::GET, "/wallets/w17/balance").unwrap();
        assert_eq!(m.triple.name, "/wallets/:id/balance");

        let m = root.resolve(&Method::GET, "/files/a/b/c.txt").unwrap();
        assert_eq!(m.vars.get("path"), Some("a/b/c.txt"));

        assert!(root.resolve(&Method::GET, "/unknown").is_none());
        assert!(root.resolve(&Method::POST, "/health").is_none());
    }

    #[test]
    fn literal_wins_over_variable_and_wildcard() {
        let root = armed(&[
            ("/tx/:id", Method::GET),
            ("/tx/latest", Method::GET),
            ("/tx/*rest", Method::GET),
        ]);

        assert_eq!(
            root.resolve(&Method::GET, "/tx/latest").unwrap().triple.name,
            "/tx/latest"
        );
        assert_eq!(
            root.resolve(&Method::GET, "/tx/abc").unwrap().triple.name,
            "/tx/:id"
        );
        assert_eq!(
            root.resolve(&Method::GET, "/tx/a/b").unwrap().triple.name,
            "/tx/*rest"
        );
    }

    #[test]
    fn trailing_slash_and_query_ignored() {
        let root = armed(&[("/health", Method::GET)]);
        assert!(root.resolve(&Method::GET, "/health/").is_some());
        assert!(root.resolve(&Method::GET, "/health?verbose=1").is_some());
    }

    #[test]
    fn ambiguous_registrations_are_reported_not_picked() {
        let root = RouterRoot::new();
        let mut router = Router::new("");
        router
            .add_route(Method::GET, "/w/:id", triple("first"))
            .unwrap();
        router
            .add_route(Method::GET, "/w/:name", triple("second"))
            .unwrap();
        root.add_router(router).unwrap();

        match root.arm() {
            Err(RouterError::Conflict { report }) => {
                assert!(report.contains("first"));
                assert!(report.contains("second"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(!root.is_armed());
    }

    #[test]
    fn same_pattern_different_methods_do_not_conflict() {
        let root = armed(&[("/rpc", Method::GET), ("/rpc", Method::POST)]);
        assert!(root.resolve(&Method::GET, "/rpc").is_some());
        assert!(root.resolve(&Method::POST, "/rpc").is_some());
    }

    #[test]
    fn registration_after_arm_is_rejected() {
        let root = armed(&[("/health", Method::GET)]);
        assert!(matches!(
            root.add_router(Router::new("")),
            Err(RouterError::AlreadyArmed)
        ));
        assert!(matches!(root.arm(), Err(RouterError::AlreadyArmed)));
    }

    #[test]
    fn wildcard_must_be_final_segment() {
        let mut router = Router::new("");
        assert!(matches!(
            router.add_route(Method::GET, "/a/*rest/b", triple("bad")),
            Err(RouterError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn prefix_is_applied_to_registrations() {
        let root = RouterRoot::new();
        let mut router = Router::new("/api");
        router
            .add_route(Method::GET, "/health", triple("health"))
            .unwrap();
        root.add_router(router).unwrap();
        root.arm().unwrap();
        assert!(root.resolve(&Method::GET, "/api/health").is_some());
        assert!(root.resolve(&Method::GET, "/health").is_none());
    }
}
