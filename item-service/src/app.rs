use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_kafka::kafka_producer::create_kafka_producer;
use common_kafka::{ConsumerLoop, KafkaRecordSource, RecordHandler, RecordSource};
use futures::FutureExt;
use health::{checker_fn, start_probes, DependencyProbe, ProbeStopper, ReadinessState, StatusKey};
use lifecycle::{FatalSignalBus, ShutdownTask};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::config::Config;
use crate::item::ItemService;
use crate::publisher::KafkaItemPublisher;
use crate::rpc;
use crate::store::PgItemStore;
use crate::subscriber::ItemCreateHandler;

pub const HTTP_SERVER: &str = "http/itemserver";
pub const GRPC_SERVER: &str = "grpc/itemserver";
pub const KAFKA_SUBSCRIBER: &str = "kafka/subscriber";
pub const KAFKA_PUBLISHER: &str = "kafka/publisher";
pub const POSTGRES: &str = "postgres";

/// A long-running component, stopped by cancelling its token.
pub struct Component {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Component {
    /// Run `future` in its own task. If it ends before `token` is cancelled, the component
    /// died on its own and the whole process has to go down.
    pub fn spawn<F>(
        name: &'static str,
        bus: &FatalSignalBus,
        token: CancellationToken,
        future: F,
    ) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let bus = bus.clone();
        let stopped = token.clone();
        let handle = tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("panicked")),
            };
            if !stopped.is_cancelled() {
                match &result {
                    Ok(()) => {
                        error!(component = name, "component exited unexpectedly");
                        bus.report_exited(name);
                    }
                    Err(e) => {
                        error!(component = name, "component failed: {e:#}");
                        bus.report_failure(name, format!("{e:#}"));
                    }
                }
            }
            result
        });

        Self {
            name,
            token,
            handle,
        }
    }

    /// Cancel the component and wait for it to return.
    pub fn stop_task(self) -> ShutdownTask {
        ShutdownTask::api(self.name, move || async move {
            self.token.cancel();
            self.handle
                .await
                .with_context(|| format!("{} task panicked", self.name))?
        })
    }
}

/// Everything [`start`] brought up, waiting to be torn down.
pub struct App {
    pub probes: ProbeStopper,
    pub shutdown_tasks: Vec<ShutdownTask>,
}

/// Connect to the dependencies, then start the servers and the queue subscriber.
///
/// Each successfully started component is annotated on `readiness`. Failures past this
/// point reach the process through `bus`.
pub async fn start(
    config: &Config,
    readiness: &ReadinessState,
    bus: &FatalSignalBus,
) -> anyhow::Result<App> {
    let store = Arc::new(
        PgItemStore::connect(
            &config.database_url,
            config.max_pg_connections,
            config.probe_timeout.0,
        )
        .await
        .context("failed to connect to postgres")?,
    );
    if config.database_migrate {
        store.migrate().await.context("failed to run migrations")?;
    }

    let producer = create_kafka_producer(&config.kafka)
        .await
        .context("failed to create kafka producer")?;
    let publisher = Arc::new(KafkaItemPublisher::new(
        producer,
        config.item_created_topic.as_str(),
    ));
    let items = ItemService::new(store.clone(), publisher.clone(), config.publish_timeout.0);

    let source = Arc::new(
        KafkaRecordSource::from_config(&config.kafka, &config.consumer)
            .context("failed to create kafka consumer")?,
    );
    let handler: Arc<dyn RecordHandler> = Arc::new(ItemCreateHandler::new(items.clone()));
    let mut consumer = ConsumerLoop::new(source.clone())
        .with_handler_timeout(config.consumer.handler_timeout())
        .with_commit_timeout(config.consumer.commit_timeout());
    for topic in config.consumer.topics() {
        consumer.register(topic, handler.clone());
    }

    let http_listener = TcpListener::bind(config.http_address)
        .await
        .with_context(|| format!("failed to bind {}", config.http_address))?;
    let grpc_listener = TcpListener::bind(config.grpc_address)
        .await
        .with_context(|| format!("failed to bind {}", config.grpc_address))?;

    let http = {
        let router = api::router(items.clone(), config.access_log_enabled());
        let token = CancellationToken::new();
        let stopped = token.clone().cancelled_owned();
        Component::spawn(HTTP_SERVER, bus, token, async move {
            axum::serve(http_listener, router)
                .with_graceful_shutdown(stopped)
                .await
                .context("http server failed")
        })
    };
    info!(address = %config.http_address, "http server listening");
    annotate_started(readiness, HTTP_SERVER);

    let grpc = {
        let token = CancellationToken::new();
        let server = rpc::serve(
            grpc_listener,
            items.clone(),
            readiness.clone(),
            config.rpc_health_interval.0,
            token.clone(),
        );
        Component::spawn(GRPC_SERVER, bus, token, async move {
            server.await.context("grpc server failed")
        })
    };
    annotate_started(readiness, GRPC_SERVER);

    let subscriber = {
        let token = CancellationToken::new();
        let stopped = token.clone();
        Component::spawn(KAFKA_SUBSCRIBER, bus, token, async move {
            consumer
                .subscribe(stopped)
                .await
                .context("kafka subscriber failed")
        })
    };
    annotate_started(readiness, KAFKA_SUBSCRIBER);

    let probes = start_probes(
        readiness.clone(),
        config.probe_interval.0,
        config.probe_timeout.0,
        vec![
            DependencyProbe::new(POSTGRES, &[StatusKey::Ready], {
                let store = store.clone();
                checker_fn(move || {
                    let store = store.clone();
                    async move { store.ping().await.context("postgres ping failed") }
                })
            }),
            DependencyProbe::new("kafka", &[StatusKey::Ready], {
                let source = source.clone();
                let timeout = config.probe_timeout.0;
                checker_fn(move || {
                    let source = source.clone();
                    async move { source.ping(timeout).await }
                })
            }),
        ],
    );

    let flush_timeout = config.publish_timeout.0;
    let shutdown_tasks = vec![
        http.stop_task(),
        grpc.stop_task(),
        subscriber.stop_task(),
        ShutdownTask::dependency(POSTGRES, move || async move {
            store.close().await;
            Ok::<_, anyhow::Error>(())
        }),
        ShutdownTask::dependency(KAFKA_PUBLISHER, move || {
            stop_publisher(items, publisher, flush_timeout)
        }),
    ];

    Ok(App {
        probes,
        shutdown_tasks,
    })
}

async fn stop_publisher(
    items: ItemService,
    publisher: Arc<KafkaItemPublisher>,
    timeout: Duration,
) -> anyhow::Result<()> {
    items.drain_publishes().await;
    tokio::task::spawn_blocking(move || publisher.flush(timeout))
        .await
        .context("producer flush task panicked")?
        .context("failed to flush kafka producer")
}

fn annotate_started(readiness: &ReadinessState, component: &str) {
    readiness.append_health_response(component, format!("OK: {}", health::timestamp()));
}
