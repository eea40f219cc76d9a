use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::warn;

/// One of the three probe axes an orchestrator can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKey {
    Started,
    Ready,
    Live,
}

impl StatusKey {
    pub const ALL: [StatusKey; 3] = [StatusKey::Started, StatusKey::Ready, StatusKey::Live];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKey::Started => "started",
            StatusKey::Ready => "ready",
            StatusKey::Live => "live",
        }
    }
}

impl std::str::FromStr for StatusKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "started" | "startup" => Ok(StatusKey::Started),
            "ready" | "readiness" => Ok(StatusKey::Ready),
            "live" | "liveness" => Ok(StatusKey::Live),
            _ => Err(format!("unknown status key: {s}")),
        }
    }
}

/// Point-in-time copy of the process health, as served to the probes.
///
/// The flags are negative: `true` means "not started", "not ready", "not live".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessStatus {
    pub not_started: bool,
    pub not_ready: bool,
    pub not_live: bool,
    pub annotations: HashMap<String, String>,
}

impl ReadinessStatus {
    pub fn is_unhealthy(&self, key: StatusKey) -> bool {
        match key {
            StatusKey::Started => self.not_started,
            StatusKey::Ready => self.not_ready,
            StatusKey::Live => self.not_live,
        }
    }
}

#[derive(Debug)]
struct Inner {
    not_started: bool,
    not_ready: bool,
    not_live: bool,
    annotations: HashMap<String, String>,
    // probe ids currently failing, per axis
    failing: HashMap<StatusKey, HashSet<String>>,
}

impl Inner {
    fn flag(&mut self, key: StatusKey) -> &mut bool {
        match key {
            StatusKey::Started => &mut self.not_started,
            StatusKey::Ready => &mut self.not_ready,
            StatusKey::Live => &mut self.not_live,
        }
    }

    fn dependency_failing(&self, key: StatusKey) -> bool {
        self.failing.get(&key).is_some_and(|ids| !ids.is_empty())
    }

    fn effective(&self, key: StatusKey) -> bool {
        let explicit = match key {
            StatusKey::Started => self.not_started,
            StatusKey::Ready => self.not_ready,
            StatusKey::Live => self.not_live,
        };
        explicit || self.dependency_failing(key)
    }
}

/// Process-wide health flags and free-form annotations.
///
/// Cheap to clone, every clone shares the same state. All the mutators go through a
/// single mutex and never hold it across an await point, so they only ever block on
/// contention. At process start every axis reports unhealthy.
///
/// An axis is unhealthy when it was explicitly flagged (startup not finished, shutdown
/// started) or when at least one dependency probe affecting it is failing.
#[derive(Clone, Debug)]
pub struct ReadinessState {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                not_started: true,
                not_ready: true,
                not_live: true,
                annotations: HashMap::new(),
                failing: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the flags half-written, keep serving
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("poisoned ReadinessState mutex");
            poisoned.into_inner()
        })
    }

    pub fn set_not_started(&self, value: bool) {
        self.set_status(StatusKey::Started, value)
    }

    pub fn set_not_ready(&self, value: bool) {
        self.set_status(StatusKey::Ready, value)
    }

    pub fn set_not_live(&self, value: bool) {
        self.set_status(StatusKey::Live, value)
    }

    /// Explicitly flag (or clear) one axis.
    pub fn set_status(&self, key: StatusKey, unhealthy: bool) {
        *self.lock().flag(key) = unhealthy;
    }

    /// Add or overwrite an annotation shown on the health endpoint.
    pub fn append_health_response(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.lock();
        inner.annotations.insert(key.into(), value.into());
    }

    /// Record the outcome of one dependency probe for every axis it affects.
    pub fn report_dependency(&self, probe_id: &str, affected: &[StatusKey], healthy: bool) {
        let mut inner = self.lock();
        for key in affected {
            let failing = inner.failing.entry(*key).or_default();
            if healthy {
                failing.remove(probe_id);
            } else {
                failing.insert(probe_id.to_owned());
            }
        }
    }

    /// Ids of the probes currently failing on the given axis.
    pub fn failing_dependencies(&self, key: StatusKey) -> Vec<String> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner
            .failing
            .get(&key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> ReadinessStatus {
        let inner = self.lock();
        ReadinessStatus {
            not_started: inner.effective(StatusKey::Started),
            not_ready: inner.effective(StatusKey::Ready),
            not_live: inner.effective(StatusKey::Live),
            annotations: inner.annotations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_unhealthy() {
        let state = ReadinessState::new();
        let status = state.snapshot();
        assert!(status.not_started);
        assert!(status.not_ready);
        assert!(status.not_live);
        assert!(status.annotations.is_empty());
    }

    #[test]
    fn axes_are_independent() {
        let state = ReadinessState::new();
        state.set_not_live(false);

        let status = state.snapshot();
        assert!(!status.not_live);
        assert!(status.not_ready);
        assert!(status.not_started);
    }

    #[test]
    fn annotations_are_overwritten() {
        let state = ReadinessState::new();
        state.append_health_response("shutdown", "initiated");
        state.append_health_response("shutdown", "completed");
        state.append_health_response("app->version", "v1");

        let status = state.snapshot();
        assert_eq!(status.annotations.len(), 2);
        assert_eq!(status.annotations["shutdown"], "completed");
    }

    #[test]
    fn failing_dependency_overrides_cleared_flag() {
        let state = ReadinessState::new();
        state.set_not_ready(false);
        state.report_dependency("postgres", &[StatusKey::Ready], false);
        assert!(state.snapshot().not_ready);
        assert!(!state.snapshot().not_live);

        state.report_dependency("postgres", &[StatusKey::Ready], true);
        assert!(!state.snapshot().not_ready);
    }

    #[test]
    fn dependency_recovery_does_not_clear_explicit_flag() {
        let state = ReadinessState::new();
        state.report_dependency("kafka", &[StatusKey::Ready], true);
        assert!(state.snapshot().not_ready);
    }

    #[test]
    fn status_key_from_str() {
        assert_eq!("READY".parse::<StatusKey>().unwrap(), StatusKey::Ready);
        assert_eq!("liveness".parse::<StatusKey>().unwrap(), StatusKey::Live);
        assert_eq!("startup".parse::<StatusKey>().unwrap(), StatusKey::Started);
        assert!("healthy".parse::<StatusKey>().is_err());
    }
}
