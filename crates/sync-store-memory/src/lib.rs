#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sync-store-memory** – In-memory [`EventStore`] driver.
//!
//! Non-persistent: all data lives in a `HashMap` guarded by a `RwLock` and is
//! lost when the process exits. Intended for tests and for `sync-server
//! --storage memory` ephemeral deployments (`spec.md` §4.1 Non-goals call out
//! that persistence is driver-specific, not a store-level guarantee).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use sync_store_core::{EventStore, StorageError, StorageResult, StoreId, StoredEvent};
use sync_wire::EventEncoded;

/// An in-memory, non-persistent [`EventStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    stores: Arc<RwLock<HashMap<StoreId, Vec<StoredEvent>>>>,
}

impl MemoryEventStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stores currently tracked. Exposed for `AdminInfoRes`
    /// plumbing and tests; not part of the [`EventStore`] trait.
    pub async fn store_count(&self) -> usize {
        self.stores.read().await.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ensure_store(&self, store_id: &str) -> StorageResult<()> {
        self.stores
            .write()
            .await
            .entry(store_id.to_string())
            .or_default();
        Ok(())
    }

    async fn get_head(&self, store_id: &str) -> StorageResult<u64> {
        Ok(self
            .stores
            .read()
            .await
            .get(store_id)
            .and_then(|events| events.last())
            .map(|e| e.event.seq_num)
            .unwrap_or(0))
    }

    async fn get_events(
        &self,
        store_id: &str,
        cursor: Option<u64>,
    ) -> StorageResult<Vec<StoredEvent>> {
        let cursor = cursor.unwrap_or(0);
        Ok(self
            .stores
            .read()
            .await
            .get(store_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event.seq_num > cursor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_events(
        &self,
        store_id: &str,
        batch: &[EventEncoded],
        created_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut stores = self.stores.write().await;
        let events = stores
            .get_mut(store_id)
            .ok_or_else(|| StorageError::NotFound(store_id.to_string()))?;

        for event in batch {
            if events.iter().any(|e| e.event.seq_num == event.event.seq_num) {
                return Err(StorageError::Backend(format!(
                    "seq_num {} already present in store {store_id}",
                    event.seq_num
                )));
            }
        }
        events.extend(batch.iter().cloned().map(|event| StoredEvent {
            event,
            created_at,
        }));
        Ok(())
    }

    async fn reset_store(&self, store_id: &str) -> StorageResult<()> {
        self.stores
            .write()
            .await
            .insert(store_id.to_string(), Vec::new());
        Ok(())
    }
}
