use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::emit_fatal_signal;

/// Exit code when shutdown was requested by the operator but did not finish cleanly.
pub const EXIT_SHUTDOWN_FAILED: i32 = 1;
/// Exit code when a component took the process down.
pub const EXIT_COMPONENT_FAILURE: i32 = 3;

/// The reason the process is going down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalSignal {
    /// Operator asked the process to quit (SIGINT, SIGTERM, SIGQUIT). The only clean reason.
    Quit(String),
    /// A component hit an error it cannot recover from.
    ComponentFailure { component: String, reason: String },
    /// A long-running component returned while it was expected to keep running.
    ComponentExited { component: String },
}

impl FatalSignal {
    pub fn failure(component: impl Into<String>, reason: impl fmt::Display) -> Self {
        FatalSignal::ComponentFailure {
            component: component.into(),
            reason: reason.to_string(),
        }
    }

    pub fn exited(component: impl Into<String>) -> Self {
        FatalSignal::ComponentExited {
            component: component.into(),
        }
    }

    pub fn is_clean_quit(&self) -> bool {
        matches!(self, FatalSignal::Quit(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FatalSignal::Quit(_) => "quit",
            FatalSignal::ComponentFailure { .. } => "component_failure",
            FatalSignal::ComponentExited { .. } => "component_exited",
        }
    }

    /// Process exit code for this signal given how the shutdown went.
    pub fn exit_code(&self, shutdown_clean: bool) -> i32 {
        match (self.is_clean_quit(), shutdown_clean) {
            (true, true) => 0,
            (true, false) => EXIT_SHUTDOWN_FAILED,
            (false, _) => EXIT_COMPONENT_FAILURE,
        }
    }
}

impl fmt::Display for FatalSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalSignal::Quit(signal) => write!(f, "quit requested by {signal}"),
            FatalSignal::ComponentFailure { component, reason } => {
                write!(f, "component '{component}' failed: {reason}")
            }
            FatalSignal::ComponentExited { component } => {
                write!(f, "component '{component}' exited unexpectedly")
            }
        }
    }
}

#[derive(Debug, Default)]
struct BusInner {
    slot: OnceLock<FatalSignal>,
    reported: CancellationToken,
}

/// Single-slot, first-wins channel for the reason the process must stop.
///
/// Every component gets a clone and may [`report`](Self::report) at any time without
/// blocking. Only the first report is kept; the shutdown path waits on it with
/// [`wait`](Self::wait).
#[derive(Clone, Debug, Default)]
pub struct FatalSignalBus {
    inner: Arc<BusInner>,
}

impl FatalSignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this was the first signal and it will drive the shutdown.
    pub fn report(&self, signal: FatalSignal) -> bool {
        let kind = signal.kind();
        match self.inner.slot.set(signal) {
            Ok(()) => {
                if let Some(accepted) = self.inner.slot.get() {
                    match accepted.is_clean_quit() {
                        true => info!(signal = %accepted, "shutdown requested"),
                        false => error!(signal = %accepted, "fatal signal reported"),
                    }
                }
                emit_fatal_signal(kind, true);
                self.inner.reported.cancel();
                true
            }
            Err(dropped) => {
                debug!(signal = %dropped, "fatal signal already reported, dropping");
                emit_fatal_signal(kind, false);
                false
            }
        }
    }

    pub fn report_failure(&self, component: &str, reason: impl fmt::Display) -> bool {
        self.report(FatalSignal::failure(component, reason))
    }

    pub fn report_exited(&self, component: &str) -> bool {
        self.report(FatalSignal::exited(component))
    }

    pub fn get(&self) -> Option<FatalSignal> {
        self.inner.slot.get().cloned()
    }

    pub fn is_reported(&self) -> bool {
        self.inner.reported.is_cancelled()
    }

    /// Resolves with the first reported signal.
    pub async fn wait(&self) -> FatalSignal {
        self.inner.reported.cancelled().await;
        match self.inner.slot.get() {
            Some(signal) => signal.clone(),
            // the token is only cancelled after the slot was filled
            None => unreachable!("fatal signal bus woke up without a signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_report_wins() {
        let bus = FatalSignalBus::new();
        assert!(!bus.is_reported());

        assert!(bus.report_failure("kafka/subscriber", "broker unreachable"));
        assert!(!bus.report(FatalSignal::Quit("SIGTERM".to_owned())));
        assert!(!bus.report_exited("http/itemserver"));

        assert_eq!(
            bus.wait().await,
            FatalSignal::failure("kafka/subscriber", "broker unreachable")
        );
    }

    #[tokio::test]
    async fn wait_resolves_for_every_clone() {
        let bus = FatalSignalBus::new();
        let waiter = bus.clone();
        let waiting = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.report(FatalSignal::Quit("SIGINT".to_owned()));

        let signal = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("timed out")
            .unwrap();
        assert!(signal.is_clean_quit());
        assert_eq!(bus.get(), Some(signal));
    }

    #[test]
    fn exit_codes() {
        let quit = FatalSignal::Quit("SIGTERM".to_owned());
        assert_eq!(quit.exit_code(true), 0);
        assert_eq!(quit.exit_code(false), EXIT_SHUTDOWN_FAILED);

        let failure = FatalSignal::failure("grpc/itemserver", "address in use");
        assert_eq!(failure.exit_code(true), EXIT_COMPONENT_FAILURE);
        assert_eq!(
            FatalSignal::exited("kafka/subscriber").exit_code(false),
            EXIT_COMPONENT_FAILURE
        );
    }
}
