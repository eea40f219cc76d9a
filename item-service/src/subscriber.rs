use async_trait::async_trait;
use common_kafka::{HandlerError, RecordHandler};
use tracing::info;

use crate::item::{Item, ItemError, ItemService};
use crate::metrics_consts::ITEMS_CREATED;

/// Creates the items requested on the consumer topic.
///
/// An item that already exists is reported as [`HandlerError::AlreadyExists`], so the record
/// is committed and not redelivered.
pub struct ItemCreateHandler {
    items: ItemService,
}

impl ItemCreateHandler {
    pub fn new(items: ItemService) -> Self {
        Self { items }
    }
}

#[async_trait]
impl RecordHandler for ItemCreateHandler {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let item: Item = serde_json::from_slice(payload)?;

        match self.items.create_if_not_exists(item).await {
            Ok(created) => {
                info!(id = created.id, "created item from queue");
                metrics::counter!(ITEMS_CREATED, "source" => "kafka").increment(1);
                Ok(())
            }
            Err(ItemError::Duplicate(_)) => Err(HandlerError::AlreadyExists),
            Err(e @ ItemError::InvalidId(_)) => Err(HandlerError::Malformed(e.to_string())),
            Err(e) => Err(HandlerError::Failed(e.into())),
        }
    }
}
