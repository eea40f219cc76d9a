use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::readiness::{ReadinessState, StatusKey};
use crate::timestamp;

const DEPENDENCY_PROBE_HEALTHY: &str = "dependency_probe_healthy";
const DEPENDENCY_PROBE_FAILURES: &str = "dependency_probe_failures_total";

/// Something an external dependency can be pinged with.
#[async_trait]
pub trait DependencyCheck: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`DependencyCheck`].
pub struct CheckerFn<F>(F);

pub fn checker_fn<F, Fut>(f: F) -> CheckerFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    CheckerFn(f)
}

#[async_trait]
impl<F, Fut> DependencyCheck for CheckerFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn check(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

/// A dependency to ping, and the probe axes its failure takes down.
#[derive(Clone)]
pub struct DependencyProbe {
    id: String,
    affected: Vec<StatusKey>,
    checker: Arc<dyn DependencyCheck>,
}

impl DependencyProbe {
    pub fn new<C>(id: impl Into<String>, affected: &[StatusKey], checker: C) -> Self
    where
        C: DependencyCheck + 'static,
    {
        Self {
            id: id.into(),
            affected: affected.to_vec(),
            checker: Arc::new(checker),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn affected(&self) -> &[StatusKey] {
        &self.affected
    }
}

/// Stops the probe tasks started by [`start_probes`]. Safe to call any number of times.
#[derive(Clone, Debug)]
pub struct ProbeStopper {
    token: CancellationToken,
}

impl ProbeStopper {
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            info!("stopping dependency probes");
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Spawn one task per probe, each running its checker every `interval`, independently
/// of the others. A check is bounded by `timeout`; exceeding it counts as a failure.
///
/// Must be called from within a tokio runtime.
pub fn start_probes(
    state: ReadinessState,
    interval: Duration,
    timeout: Duration,
    probes: Vec<DependencyProbe>,
) -> ProbeStopper {
    let token = CancellationToken::new();

    for probe in probes {
        let state = state.clone();
        let token = token.clone();
        tokio::spawn(async move { run_probe(probe, state, interval, timeout, token).await });
    }

    ProbeStopper { token }
}

async fn run_probe(
    probe: DependencyProbe,
    state: ReadinessState,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut healthy: Option<bool> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = tokio::time::timeout(timeout, probe.checker.check()) => result,
        };

        let outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("check timed out after {timeout:?}")),
        };

        let ok = outcome.is_ok();
        state.report_dependency(&probe.id, &probe.affected, ok);
        metrics::gauge!(DEPENDENCY_PROBE_HEALTHY, "dependency" => probe.id.clone())
            .set(if ok { 1.0 } else { 0.0 });

        let annotation_key = format!("dependency/{}", probe.id);
        match outcome {
            Ok(()) => {
                state.append_health_response(annotation_key, format!("OK: {}", timestamp()));
                if healthy == Some(false) {
                    info!(dependency = %probe.id, "dependency recovered");
                }
            }
            Err(reason) => {
                metrics::counter!(DEPENDENCY_PROBE_FAILURES, "dependency" => probe.id.clone())
                    .increment(1);
                warn!(dependency = %probe.id, affected = ?probe.affected, "dependency check failed: {reason}");
                state.append_health_response(
                    annotation_key,
                    format!("FAILED: {}: {reason}", timestamp()),
                );
            }
        }
        healthy = Some(ok);
    }

    debug!(dependency = %probe.id, "dependency probe stopped");
}
