use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use health::ReadinessState;
use item_service::app::Component;
use lifecycle::{FatalSignal, FatalSignalBus, ShutdownOrchestrator, EXIT_COMPONENT_FAILURE};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn serving_state() -> ReadinessState {
    let state = ReadinessState::new();
    state.set_not_started(false);
    state.set_not_ready(false);
    state.set_not_live(false);
    state
}

#[tokio::test]
async fn failing_component_reports_to_bus() {
    let bus = FatalSignalBus::new();
    let component = Component::spawn("kafka/subscriber", &bus, CancellationToken::new(), async {
        Err::<(), _>(anyhow::anyhow!("broker transport failure"))
    });

    let signal = tokio::time::timeout(Duration::from_secs(5), bus.wait())
        .await
        .expect("no fatal signal reported");
    match &signal {
        FatalSignal::ComponentFailure { component, reason } => {
            assert_eq!(component, "kafka/subscriber");
            assert!(reason.contains("broker transport failure"));
        }
        other => panic!("unexpected signal {other:?}"),
    }

    let report = ShutdownOrchestrator::new("item-service", serving_state())
        .with_drain_delay(Duration::ZERO)
        .with_task(component.stop_task())
        .run(signal)
        .await;
    assert_eq!(report.exit_code(), EXIT_COMPONENT_FAILURE);
}

#[tokio::test]
async fn component_returning_early_is_an_exit() {
    let bus = FatalSignalBus::new();
    let _component = Component::spawn("grpc/itemserver", &bus, CancellationToken::new(), async {
        Ok::<(), anyhow::Error>(())
    });

    let signal = tokio::time::timeout(Duration::from_secs(5), bus.wait())
        .await
        .expect("no fatal signal reported");
    assert_eq!(signal, FatalSignal::exited("grpc/itemserver"));
    assert_eq!(signal.exit_code(true), EXIT_COMPONENT_FAILURE);
}

#[tokio::test]
async fn panicking_component_reports_to_bus() {
    let bus = FatalSignalBus::new();
    let component = Component::spawn("kafka/subscriber", &bus, CancellationToken::new(), async {
        Option::<()>::None.expect("handler panicked");
        Ok::<(), anyhow::Error>(())
    });

    let signal = tokio::time::timeout(Duration::from_secs(5), bus.wait())
        .await
        .expect("no fatal signal reported");
    assert_eq!(signal, FatalSignal::failure("kafka/subscriber", "panicked"));

    let report = ShutdownOrchestrator::new("item-service", serving_state())
        .with_drain_delay(Duration::ZERO)
        .with_task(component.stop_task())
        .run(signal)
        .await;
    assert_eq!(report.exit_code(), EXIT_COMPONENT_FAILURE);
}

#[tokio::test]
async fn stopped_server_shuts_down_cleanly() {
    let bus = FatalSignalBus::new();
    let readiness = serving_state();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let router = Router::new().route("/", get(|| async { "items" }));
    let token = CancellationToken::new();
    let stopped = token.clone().cancelled_owned();
    let server = Component::spawn("http/itemserver", &bus, token, async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(stopped)
            .await
            .context("http server failed")
    });

    let report = ShutdownOrchestrator::new("item-service", readiness.clone())
        .with_drain_delay(Duration::ZERO)
        .with_task(server.stop_task())
        .run(FatalSignal::Quit("SIGTERM".to_owned()))
        .await;

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.exit_code(), 0);
    // A component stopped on purpose is not a failure.
    assert!(!bus.is_reported());

    let annotations = readiness.snapshot().annotations;
    assert!(annotations["shutdown/http/itemserver"].starts_with("completed"));
    assert!(annotations["shutdown"].starts_with("completed"));
}
