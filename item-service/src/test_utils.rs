use std::sync::Mutex;

use async_trait::async_trait;

use crate::item::{Item, ItemPublisher};
use crate::store::{ItemStore, StoreError};

/// Keeps items in insertion order and lists them newest first, like the Postgres store.
#[derive(Default)]
pub struct MemoryItemStore {
    items: Mutex<Vec<Item>>,
    next_insert_error: Mutex<Option<StoreError>>,
}

impl MemoryItemStore {
    pub fn get(&self, id: i64) -> Option<Item> {
        let items = self.items.lock().unwrap();
        items.iter().find(|item| item.id == id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn fail_next_insert(&self, error: StoreError) {
        *self.next_insert_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn insert_item(&self, item: &Item) -> Result<Item, StoreError> {
        if let Some(error) = self.next_insert_error.lock().unwrap().take() {
            return Err(error);
        }

        let mut items = self.items.lock().unwrap();
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(StoreError::Conflict(item.id));
        }
        items.push(item.clone());
        Ok(item.clone())
    }

    async fn item(&self, id: i64) -> Result<Option<Item>, StoreError> {
        Ok(self.get(id))
    }

    async fn list_items(&self, limit: i64) -> Result<Vec<Item>, StoreError> {
        let items = self.items.lock().unwrap();
        let limit = usize::try_from(limit).unwrap_or_default();
        Ok(items.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Item>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            published: Mutex::default(),
            fail: true,
        }
    }

    pub fn published(&self) -> Vec<Item> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemPublisher for RecordingPublisher {
    async fn publish(&self, item: &Item) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("broker unavailable");
        }
        self.published.lock().unwrap().push(item.clone());
        Ok(())
    }
}
