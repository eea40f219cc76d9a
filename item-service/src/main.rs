use anyhow::Context;
use common_kafka::config::ConsumerConfig;
use envconfig::Envconfig;
use health::ReadinessState;
use lifecycle::{
    trap_quit_signals, FatalSignalBus, ShutdownOrchestrator, ShutdownTask, EXIT_COMPONENT_FAILURE,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use item_service::app::{self, Component};
use item_service::config::Config;
use item_service::metrics::setup_metrics_router;
use item_service::telemetry::Telemetry;

const PROBE_SERVER: &str = "health/probeserver";

async fn run() -> anyhow::Result<i32> {
    ConsumerConfig::set_defaults("item-service", "item_create");
    let config = Config::init_from_env().context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    let telemetry = Telemetry::init(&config)?;
    info!(service = %config.full_name(), environment = %config.environment, "starting");

    let readiness = ReadinessState::new();
    readiness.append_health_response("app->version", config.app_version.clone());
    readiness.append_health_response("app->built", config.app_built_at.clone());

    let bus = FatalSignalBus::new();
    trap_quit_signals(bus.clone()).context("failed to install signal handlers")?;

    // Up before anything else, so the orchestrator can watch the startup.
    let probe_router = health::router(readiness.clone()).merge(
        setup_metrics_router().context("failed to install the prometheus recorder")?,
    );
    let probe_listener = TcpListener::bind(config.health_address)
        .await
        .with_context(|| format!("failed to bind {}", config.health_address))?;
    let probe_server = {
        let token = CancellationToken::new();
        let stopped = token.clone().cancelled_owned();
        Component::spawn(PROBE_SERVER, &bus, token, async move {
            axum::serve(probe_listener, probe_router)
                .with_graceful_shutdown(stopped)
                .await
                .context("probe server failed")
        })
    };
    info!(address = %config.health_address, "probe server listening");

    let started = match app::start(&config, &readiness, &bus).await {
        Ok(started) => started,
        Err(e) => {
            error!("failed to start: {e:#}");
            if let Err(e) = telemetry.shutdown().await {
                error!("{e:#}");
            }
            return Ok(EXIT_COMPONENT_FAILURE);
        }
    };

    readiness.set_not_started(false);
    readiness.set_not_ready(false);
    readiness.set_not_live(false);
    info!("started");

    let signal = bus.wait().await;

    let mut orchestrator = ShutdownOrchestrator::new(config.app_name.clone(), readiness)
        .with_drain_delay(config.drain_delay.0)
        .with_phase_timeout(config.shutdown_phase_timeout.0)
        .with_probe_stopper(started.probes)
        .with_probe_server(probe_server.stop_task());
    for task in started.shutdown_tasks {
        orchestrator.add_task(task);
    }
    orchestrator.add_task(ShutdownTask::dependency("telemetry", move || {
        telemetry.shutdown()
    }));

    let report = orchestrator.run(signal).await;
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // Tracing may not be up yet.
            eprintln!("item-service: {e:#}");
            EXIT_COMPONENT_FAILURE
        }
    };
    std::process::exit(code);
}
