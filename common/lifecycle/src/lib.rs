//! Process lifecycle: how a service learns it has to stop, and how it stops.
//!
//! Components push the reason to a [`FatalSignalBus`]; the first one wins. `main` waits on
//! the bus and hands the signal to a [`ShutdownOrchestrator`], which flips the health
//! probes, waits for traffic to drain and tears components down in two ordered phases.

mod error;
mod fatal;
mod metrics;
mod shutdown;
mod signals;

pub use error::ShutdownError;
pub use fatal::{FatalSignal, FatalSignalBus, EXIT_COMPONENT_FAILURE, EXIT_SHUTDOWN_FAILED};
pub use shutdown::{ShutdownOrchestrator, ShutdownPhase, ShutdownReport, ShutdownTask};
pub use signals::trap_quit_signals;
