use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::metrics_consts::ITEMS_PUBLISHED;
use crate::store::{ItemStore, StoreError};

/// Most items a single list call returns.
pub const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

impl Item {
    pub fn validate(&self) -> Result<(), ItemError> {
        if self.id <= 0 {
            return Err(ItemError::InvalidId(self.id));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item ID should be > 0, got {0}")]
    InvalidId(i64),
    #[error("list limit should be between 1 and {MAX_LIST_LIMIT}, got {0}")]
    InvalidLimit(i64),
    #[error("item with ID {0} already exists")]
    Duplicate(i64),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ItemError {
    fn from(e: StoreError) -> Self {
        match e {
            // lost an insert race against another writer
            StoreError::Conflict(id) => ItemError::Duplicate(id),
            other => ItemError::Store(other),
        }
    }
}

/// Tells the rest of the system an item was created.
#[async_trait]
pub trait ItemPublisher: Send + Sync {
    async fn publish(&self, item: &Item) -> anyhow::Result<()>;
}

/// Item use cases, shared by the HTTP API and the queue subscriber.
#[derive(Clone)]
pub struct ItemService {
    store: Arc<dyn ItemStore>,
    publisher: Arc<dyn ItemPublisher>,
    publish_timeout: Duration,
    publishes: TaskTracker,
}

impl ItemService {
    pub fn new(
        store: Arc<dyn ItemStore>,
        publisher: Arc<dyn ItemPublisher>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            publish_timeout,
            publishes: TaskTracker::new(),
        }
    }

    /// Persist the item with a random suffix appended to its name, then publish it in the
    /// background. The caller does not wait for the publish.
    pub async fn create(&self, mut item: Item) -> Result<Item, ItemError> {
        item.validate()?;
        item.name = format!("{}-{}", item.name, rand::random::<u32>());

        let created = self.store.insert_item(&item).await?;
        self.publish_in_background(created.clone());
        Ok(created)
    }

    pub async fn create_if_not_exists(&self, item: Item) -> Result<Item, ItemError> {
        item.validate()?;
        if self.store.item(item.id).await?.is_some() {
            return Err(ItemError::Duplicate(item.id));
        }
        self.create(item).await
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Item>, ItemError> {
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(ItemError::InvalidLimit(limit));
        }
        Ok(self.store.list_items(limit).await?)
    }

    /// Stop accepting background publishes and wait for the ones in flight.
    pub async fn drain_publishes(&self) {
        self.publishes.close();
        self.publishes.wait().await;
    }

    fn publish_in_background(&self, item: Item) {
        if self.publishes.is_closed() {
            error!(id = item.id, "shutting down, not publishing created item");
            return;
        }

        let publisher = self.publisher.clone();
        let timeout = self.publish_timeout;
        self.publishes.spawn(async move {
            let outcome = match tokio::time::timeout(timeout, publisher.publish(&item)).await {
                Ok(Ok(())) => {
                    info!(id = item.id, "published created item");
                    "success"
                }
                Ok(Err(e)) => {
                    error!(id = item.id, "failed to publish created item: {e:#}");
                    "failure"
                }
                Err(_) => {
                    error!(id = item.id, timeout = ?timeout, "publishing created item timed out");
                    "timeout"
                }
            };
            metrics::counter!(ITEMS_PUBLISHED, "outcome" => outcome).increment(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryItemStore, RecordingPublisher};

    fn service(store: Arc<MemoryItemStore>, publisher: Arc<RecordingPublisher>) -> ItemService {
        ItemService::new(store, publisher, Duration::from_secs(3))
    }

    fn item(id: i64, name: &str) -> Item {
        Item {
            id,
            name: name.to_owned(),
        }
    }

    #[tokio::test]
    async fn create_suffixes_name_and_publishes() {
        let store = Arc::new(MemoryItemStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let items = service(store.clone(), publisher.clone());

        let created = items.create(item(1, "pen")).await.unwrap();
        assert_eq!(created.id, 1);
        assert!(created.name.starts_with("pen-"));
        assert_ne!(created.name, "pen-");

        items.drain_publishes().await;
        assert_eq!(publisher.published(), vec![created.clone()]);
        assert_eq!(store.get(1), Some(created));
    }

    #[tokio::test]
    async fn rejects_non_positive_ids() {
        let store = Arc::new(MemoryItemStore::default());
        let items = service(store.clone(), Default::default());

        assert!(matches!(
            items.create(item(0, "pen")).await,
            Err(ItemError::InvalidId(0))
        ));
        assert!(matches!(
            items.create_if_not_exists(item(-4, "pen")).await,
            Err(ItemError::InvalidId(-4))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn create_if_not_exists_reports_duplicates() {
        let store = Arc::new(MemoryItemStore::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let items = service(store, publisher.clone());

        items.create_if_not_exists(item(7, "cup")).await.unwrap();
        let again = items.create_if_not_exists(item(7, "mug")).await;

        assert!(matches!(again, Err(ItemError::Duplicate(7))));
        items.drain_publishes().await;
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn insert_conflict_is_a_duplicate() {
        let store = Arc::new(MemoryItemStore::default());
        store.fail_next_insert(StoreError::Conflict(3));
        let items = service(store, Default::default());

        assert!(matches!(
            items.create(item(3, "lamp")).await,
            Err(ItemError::Duplicate(3))
        ));
    }

    #[tokio::test]
    async fn failed_publish_does_not_fail_create() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let items = service(Default::default(), publisher.clone());

        assert!(items.create(item(2, "book")).await.is_ok());
        items.drain_publishes().await;
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn no_publishes_after_drain() {
        let publisher = Arc::new(RecordingPublisher::default());
        let items = service(Default::default(), publisher.clone());

        items.drain_publishes().await;
        items.create(item(5, "desk")).await.unwrap();

        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn list_checks_limit() {
        let store = Arc::new(MemoryItemStore::default());
        let items = service(store, Default::default());
        for id in 1..=3 {
            items.create(item(id, "chair")).await.unwrap();
        }

        assert_eq!(items.list(2).await.unwrap().len(), 2);
        assert!(matches!(items.list(0).await, Err(ItemError::InvalidLimit(0))));
        assert!(matches!(
            items.list(MAX_LIST_LIMIT + 1).await,
            Err(ItemError::InvalidLimit(_))
        ));
    }
}
