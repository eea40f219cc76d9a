use std::time::Duration;

use health::{ReadinessState, StatusKey};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tonic_health::server::{health_reporter, HealthReporter};
use tonic_health::ServingStatus;
use tracing::{error, info, warn};

use crate::api::DEFAULT_LIST_LIMIT;
use crate::item::{self, ItemError, ItemService};
use crate::proto::item_service_server::{ItemService as ItemRpc, ItemServiceServer};
use crate::proto::{CreateItemRequest, Item, ItemListRequest, ItemListResponse};

/// Service name reported next to the overall ("") status.
pub const ITEM_SERVICE_NAME: &str = "item.v1.ItemService";

impl From<ItemError> for Status {
    fn from(e: ItemError) -> Self {
        match e {
            ItemError::InvalidId(_) | ItemError::InvalidLimit(_) => {
                Status::invalid_argument(e.to_string())
            }
            ItemError::Duplicate(_) => Status::already_exists(e.to_string()),
            ItemError::Store(store) => {
                error!("item store failed: {store}");
                Status::internal("item store failed")
            }
        }
    }
}

impl From<item::Item> for Item {
    fn from(item: item::Item) -> Self {
        Item {
            id: item.id,
            name: item.name,
        }
    }
}

pub struct ItemRpcService {
    items: ItemService,
}

impl ItemRpcService {
    pub fn new(items: ItemService) -> Self {
        Self { items }
    }
}

#[tonic::async_trait]
impl ItemRpc for ItemRpcService {
    async fn create_item(
        &self,
        request: Request<CreateItemRequest>,
    ) -> Result<Response<Item>, Status> {
        let request = request.into_inner();
        let created = self
            .items
            .create_if_not_exists(item::Item {
                id: request.id,
                name: request.name,
            })
            .await?;

        info!(id = created.id, "created item over grpc");
        Ok(Response::new(created.into()))
    }

    async fn list_items(
        &self,
        request: Request<ItemListRequest>,
    ) -> Result<Response<ItemListResponse>, Status> {
        let limit = match request.into_inner().limit {
            0 => DEFAULT_LIST_LIMIT,
            limit => limit,
        };
        let items = self.items.list(limit).await?;

        Ok(Response::new(ItemListResponse {
            items: items.into_iter().map(Item::from).collect(),
        }))
    }
}

/// Serve the item RPCs and `grpc.health.v1.Health` on `listener` until `shutdown` is
/// cancelled.
///
/// The health status follows the readiness axis of `readiness`, re-checked every
/// `interval`, so gRPC load balancers stop sending traffic once draining starts.
pub async fn serve(
    listener: TcpListener,
    items: ItemService,
    readiness: ReadinessState,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let (reporter, health_service) = health_reporter();
    let local_addr = listener.local_addr().ok();

    let mirror = tokio::spawn(mirror_readiness(
        reporter,
        readiness,
        interval,
        shutdown.clone(),
    ));

    info!(address = ?local_addr, "grpc server listening");
    let served = Server::builder()
        .add_service(health_service)
        .add_service(ItemServiceServer::new(ItemRpcService::new(items)))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown.clone().cancelled_owned(),
        )
        .await;

    shutdown.cancel();
    mirror.abort();
    served
}

async fn mirror_readiness(
    mut reporter: HealthReporter,
    readiness: ReadinessState,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut current: Option<ServingStatus> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let status = match readiness.snapshot().is_unhealthy(StatusKey::Ready) {
            true => ServingStatus::NotServing,
            false => ServingStatus::Serving,
        };
        if current == Some(status) {
            continue;
        }

        reporter.set_service_status("", status).await;
        reporter
            .set_service_status(ITEM_SERVICE_NAME, status)
            .await;
        match status {
            ServingStatus::Serving => info!("grpc health serving"),
            _ => warn!(?status, "grpc health not serving"),
        }
        current = Some(status);
    }
}
