#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sync-session** – Per-store session registry.
//!
//! Tracks which duplex channels are attached to which store, caches each
//! store's head so push validation doesn't round-trip to durable storage,
//! gates concurrent writers behind a per-store mutex, and fans broadcasts
//! out to subscribers. The Session Manager owns this state exclusively;
//! the event store owns durable state exclusively (`spec.md` §4.2, §5).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};

use sync_wire::ServerMessage;

/// Identifies one attached duplex channel within its store's subscriber set.
pub type ChannelId = u64;

/// The sending half handed to a channel on attach; the connection task reads
/// from the paired receiver and forwards frames to the wire.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

type StoreId = String;

struct StoreState {
    /// `None` until the first attached session populates it from the
    /// durable head (`initialize_head_if_needed`).
    head: RwLock<Option<u64>>,
    subscribers: RwLock<HashMap<ChannelId, Outbox>>,
    writer_lock: Mutex<()>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            head: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            writer_lock: Mutex::new(()),
        }
    }
}

/// Registry of live sessions across every store this server process serves.
#[derive(Default)]
pub struct SessionManager {
    stores: DashMap<StoreId, Arc<StoreState>>,
    next_channel_id: AtomicU64,
}

impl SessionManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, store_id: &str) -> Arc<StoreState> {
        self.stores
            .entry(store_id.to_string())
            .or_insert_with(|| Arc::new(StoreState::new()))
            .clone()
    }

    /// Attach a new duplex channel to `store_id`, allocating the store's
    /// writer mutex and head cache if this is the first attach.
    pub async fn attach(&self, store_id: &str, outbox: Outbox) -> ChannelId {
        let state = self.store(store_id);
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        state.subscribers.write().await.insert(id, outbox);
        id
    }

    /// Detach `channel_id` from `store_id`. If the subscriber set becomes
    /// empty, the head cache and writer mutex are released — the store's
    /// durable state is untouched.
    pub async fn detach(&self, store_id: &str, channel_id: ChannelId) {
        let Some(state) = self.stores.get(store_id).map(|e| e.clone()) else {
            return;
        };
        let is_empty = {
            let mut subs = state.subscribers.write().await;
            subs.remove(&channel_id);
            subs.is_empty()
        };
        if is_empty {
            self.stores.remove(store_id);
        }
    }

    /// The cached head for `store_id`, or `None` if no session has attached
    /// (or the cache has not yet been initialized from durable storage).
    pub async fn current_head(&self, store_id: &str) -> Option<u64> {
        let state = self.stores.get(store_id)?.clone();
        *state.head.read().await
    }

    /// Populate the head cache from `true_head` only if it is still
    /// uninitialized. Safe to call redundantly from every attaching session.
    pub async fn initialize_head_if_needed(&self, store_id: &str, true_head: u64) {
        let state = self.store(store_id);
        let mut head = state.head.write().await;
        if head.is_none() {
            *head = Some(true_head);
        }
    }

    /// Overwrite the cached head for `store_id`. Callers hold the writer
    /// lock whenever this changes the value that concurrent pushes validate
    /// against.
    pub async fn set_head(&self, store_id: &str, new_head: u64) {
        let state = self.store(store_id);
        *state.head.write().await = Some(new_head);
    }

    /// Send `message` to every subscriber of `store_id` except `exclude`.
    /// A subscriber whose channel has closed is dropped from the set;
    /// broadcast is best-effort, not delivery-guaranteed (`spec.md` §5).
    pub async fn broadcast(&self, store_id: &str, message: ServerMessage, exclude: Option<ChannelId>) {
        let Some(state) = self.stores.get(store_id).map(|e| e.clone()) else {
            return;
        };
        let mut dead = Vec::new();
        {
            let subs = state.subscribers.read().await;
            for (id, outbox) in subs.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                if outbox.send(message.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = state.subscribers.write().await;
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    /// Acquire the per-store writer mutex, run `critical_section`, and
    /// release it. The only place the server serializes anything; reads
    /// never hold this lock.
    pub async fn with_writer_lock<F, Fut, T>(&self, store_id: &str, critical_section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let state = self.store(store_id);
        let _guard = state.writer_lock.lock().await;
        critical_section().await
    }

    /// Number of channels currently attached to `store_id`.
    pub async fn subscriber_count(&self, store_id: &str) -> usize {
        match self.stores.get(store_id) {
            Some(state) => state.subscribers.read().await.len(),
            None => 0,
        }
    }
}
