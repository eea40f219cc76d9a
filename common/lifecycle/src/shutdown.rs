use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use health::{timestamp, ProbeStopper, ReadinessState};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::ShutdownError;
use crate::fatal::FatalSignal;
use crate::metrics::{
    emit_shutdown_completed, emit_shutdown_initiated, emit_task_shutdown_duration,
    emit_task_shutdown_result,
};

/// Components facing clients stop first, so no new work comes in while the connections
/// they rely on are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownPhase {
    Api,
    Dependency,
}

impl ShutdownPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownPhase::Api => "api",
            ShutdownPhase::Dependency => "dependency",
        }
    }
}

type ShutdownAction = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A named piece of teardown, run once during its phase.
pub struct ShutdownTask {
    name: String,
    phase: ShutdownPhase,
    action: ShutdownAction,
}

impl ShutdownTask {
    pub fn new<F, Fut>(name: impl Into<String>, phase: ShutdownPhase, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            phase,
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn api<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, ShutdownPhase::Api, action)
    }

    pub fn dependency<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, ShutdownPhase::Dependency, action)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }
}

impl fmt::Debug for ShutdownTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownTask")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`ShutdownOrchestrator::run`].
#[derive(Debug)]
pub struct ShutdownReport {
    pub signal: FatalSignal,
    pub errors: Vec<ShutdownError>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        self.signal.exit_code(self.is_clean())
    }
}

/// Drives the process from "serving" to "ready to exit".
///
/// The sequence is fixed:
/// 1. every probe axis is flagged unhealthy, dependency probes stop and a `shutdown`
///    annotation is written;
/// 2. wait `drain_delay` so the orchestrator sees the failing readiness probe and stops
///    routing traffic;
/// 3. all [`ShutdownPhase::Api`] tasks run concurrently, then
/// 4. all [`ShutdownPhase::Dependency`] tasks run concurrently;
/// 5. the probe server goes down last.
///
/// Each phase is bounded by `phase_timeout`. Tasks still running then are aborted and
/// annotated as abandoned; a failing task never cancels its siblings.
pub struct ShutdownOrchestrator {
    service_name: String,
    readiness: ReadinessState,
    drain_delay: Duration,
    phase_timeout: Duration,
    probes: Option<ProbeStopper>,
    tasks: Vec<ShutdownTask>,
    probe_server: Option<ShutdownTask>,
}

impl ShutdownOrchestrator {
    pub fn new(service_name: impl Into<String>, readiness: ReadinessState) -> Self {
        Self {
            service_name: service_name.into(),
            readiness,
            drain_delay: Duration::from_secs(3),
            phase_timeout: Duration::from_secs(60),
            probes: None,
            tasks: Vec::new(),
            probe_server: None,
        }
    }

    pub fn with_drain_delay(mut self, drain_delay: Duration) -> Self {
        self.drain_delay = drain_delay;
        self
    }

    pub fn with_phase_timeout(mut self, phase_timeout: Duration) -> Self {
        self.phase_timeout = phase_timeout;
        self
    }

    pub fn with_probe_stopper(mut self, probes: ProbeStopper) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn with_task(mut self, task: ShutdownTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn add_task(&mut self, task: ShutdownTask) {
        self.tasks.push(task);
    }

    /// The server exposing the probe endpoints. Its phase is ignored, it always runs after
    /// the dependency phase so the orchestrator keeps seeing the shutdown state until the
    /// very end.
    pub fn with_probe_server(mut self, task: ShutdownTask) -> Self {
        self.probe_server = Some(task);
        self
    }

    pub async fn run(self, signal: FatalSignal) -> ShutdownReport {
        let started = Instant::now();
        match signal.is_clean_quit() {
            true => info!(service = %self.service_name, reason = %signal, "shutting down"),
            false => error!(service = %self.service_name, reason = %signal, "shutting down"),
        }
        emit_shutdown_initiated(&self.service_name, signal.kind());

        self.readiness.set_not_ready(true);
        self.readiness.set_not_started(true);
        self.readiness.set_not_live(true);
        if let Some(probes) = &self.probes {
            probes.stop();
        }
        self.readiness
            .append_health_response("shutdown", format!("initiated {}", timestamp()));

        info!(delay = ?self.drain_delay, "draining before stopping API components");
        tokio::time::sleep(self.drain_delay).await;

        let (api, dependencies): (Vec<_>, Vec<_>) = self
            .tasks
            .into_iter()
            .partition(|task| task.phase == ShutdownPhase::Api);

        let phases = PhaseRunner {
            service_name: &self.service_name,
            readiness: &self.readiness,
            timeout: self.phase_timeout,
        };

        let mut errors = phases.run(ShutdownPhase::Api.as_str(), api).await;
        errors.extend(
            phases
                .run(ShutdownPhase::Dependency.as_str(), dependencies)
                .await,
        );

        let verdict = match errors.is_empty() {
            true => "completed",
            false => "failed",
        };
        self.readiness
            .append_health_response("shutdown", format!("{verdict} {}", timestamp()));

        if let Some(server) = self.probe_server {
            errors.extend(phases.run("probe_server", vec![server]).await);
        }

        let clean = errors.is_empty();
        emit_shutdown_completed(&self.service_name, clean);
        let elapsed = started.elapsed();
        match clean {
            true => info!(elapsed = ?elapsed, "shutdown completed"),
            false => {
                for e in &errors {
                    error!("{e}");
                }
                error!(elapsed = ?elapsed, failed = errors.len(), "shutdown completed with errors");
            }
        }

        ShutdownReport {
            signal,
            errors,
            elapsed,
        }
    }
}

struct PhaseRunner<'a> {
    service_name: &'a str,
    readiness: &'a ReadinessState,
    timeout: Duration,
}

type TaskOutcome = (usize, Result<(), String>, bool, Duration);

impl PhaseRunner<'_> {
    async fn run(&self, phase: &'static str, tasks: Vec<ShutdownTask>) -> Vec<ShutdownError> {
        if tasks.is_empty() {
            return Vec::new();
        }
        info!(phase, tasks = tasks.len(), "starting shutdown phase");

        let mut pending: HashMap<usize, String> = HashMap::new();
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();

        for (idx, task) in tasks.into_iter().enumerate() {
            pending.insert(idx, task.name.clone());
            let readiness = self.readiness.clone();
            set.spawn(async move {
                let key = format!("shutdown/{}", task.name);
                readiness.append_health_response(&key, format!("initiated {}", timestamp()));
                let start = Instant::now();

                let result = AssertUnwindSafe((task.action)()).catch_unwind().await;
                let (outcome, panicked) = match result {
                    Ok(Ok(())) => (Ok(()), false),
                    Ok(Err(e)) => (Err(format!("{e:#}")), false),
                    Err(_) => (Err("panicked".to_owned()), true),
                };

                match &outcome {
                    Ok(()) => {
                        readiness.append_health_response(key, format!("completed {}", timestamp()))
                    }
                    Err(reason) => readiness
                        .append_health_response(key, format!("failed {}: {reason}", timestamp())),
                }
                (idx, outcome, panicked, start.elapsed())
            });
        }

        let mut errors = Vec::new();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((idx, outcome, panicked, elapsed))) => {
                        let name = pending.remove(&idx).unwrap_or_default();
                        errors.extend(self.record(&name, outcome, panicked, elapsed));
                    }
                    Some(Err(e)) => warn!(phase, "shutdown task did not report: {e}"),
                },
                _ = &mut deadline => {
                    set.abort_all();
                    for name in pending.values() {
                        warn!(phase, task = %name, timeout = ?self.timeout, "abandoning shutdown task");
                        self.readiness.append_health_response(
                            format!("shutdown/{name}"),
                            format!("abandoned {}", timestamp()),
                        );
                        emit_task_shutdown_result(self.service_name, name, "abandoned");
                    }
                    errors.extend(pending.drain().map(|(_, name)| ShutdownError::TaskAbandoned {
                        name,
                        timeout: self.timeout,
                    }));
                    break;
                }
            }
        }

        // joined without a result, the task was cancelled out from under us
        errors.extend(
            pending
                .drain()
                .map(|(_, name)| ShutdownError::TaskPanicked { name }),
        );

        info!(phase, "shutdown phase finished");
        errors
    }

    fn record(
        &self,
        name: &str,
        outcome: Result<(), String>,
        panicked: bool,
        elapsed: Duration,
    ) -> Option<ShutdownError> {
        let result = match (&outcome, panicked) {
            (Ok(()), _) => "completed",
            (Err(_), false) => "failed",
            (Err(_), true) => "panicked",
        };
        emit_task_shutdown_result(self.service_name, name, result);
        emit_task_shutdown_duration(self.service_name, name, result, elapsed.as_secs_f64());

        match outcome {
            Ok(()) => {
                info!(task = %name, elapsed = ?elapsed, "shutdown task completed");
                None
            }
            Err(_) if panicked => {
                error!(task = %name, "shutdown task panicked");
                Some(ShutdownError::TaskPanicked {
                    name: name.to_owned(),
                })
            }
            Err(reason) => {
                warn!(task = %name, elapsed = ?elapsed, "shutdown task failed: {reason}");
                Some(ShutdownError::TaskFailed {
                    name: name.to_owned(),
                    reason,
                })
            }
        }
    }
}
