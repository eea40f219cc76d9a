use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::fatal::{FatalSignal, FatalSignalBus};

/// Installs SIGINT, SIGTERM and SIGQUIT handlers that report [`FatalSignal::Quit`] to the
/// bus. The handlers are registered before this returns, so a signal arriving right after
/// is not lost.
pub fn trap_quit_signals(bus: FatalSignalBus) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };
        info!("received {name}");
        bus.report(FatalSignal::Quit(name.to_owned()));
    });

    Ok(())
}
