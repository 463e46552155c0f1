#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sync-store-core** – Core storage abstraction for the event-sync server.
//!
//! This crate defines the [`EventStore`] trait and the shared types around
//! it, without committing to a concrete driver. Storage drivers (`sqlite`,
//! in-memory, ...) implement this trait in their own crates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sync_wire::EventEncoded;

//─────────────────────────────
//  Core types
//─────────────────────────────

/// Opaque identifier for a logical store partition.
pub type StoreId = String;

/// A durably persisted event, as returned by reads.
///
/// Wraps the wire-level [`EventEncoded`] with the server-assigned
/// `created_at` timestamp fixed at the moment of durable append
/// (`spec.md` §3).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// The event itself.
    pub event: EventEncoded,
    /// When the event was durably appended.
    pub created_at: DateTime<Utc>,
}

/// The coarse global reset knob folded into every partition name
/// (`spec.md` §4.1, §6.4). Bumping this discards all stores' history.
pub const FORMAT_VERSION: u32 = 1;

/// Derive the physical partition name for a store.
///
/// A pure function of `store_id` and `format_version`: every character of
/// `store_id` outside `[A-Za-z0-9]` is replaced with `_`, per `spec.md`
/// §4.1 / §6.4.
pub fn partition_name(format_version: u32, store_id: &str) -> String {
    let sanitized: String = store_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("eventlog_{format_version}_{sanitized}")
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by an [`EventStore`] implementation.
///
/// Every variant is fatal for the current request; the store performs no
/// retries (`spec.md` §4.1).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying I/O or database driver failed.
    #[error("storage backend failed: {0}")]
    Backend(String),
    /// A stored payload could not be (de)serialized into its structured form.
    #[error("failed to (de)serialize event payload: {0}")]
    Serialization(String),
    /// The store referenced does not exist (should not occur after `ensure_store`).
    #[error("store not found: {0}")]
    NotFound(String),
}

/// Convenience result alias for [`EventStore`] operations.
pub type StorageResult<T> = Result<T, StorageError>;

//─────────────────────────────
//  Event store trait
//─────────────────────────────

/// Durable, per-store append-only event log (`spec.md` §4.1).
///
/// Implementations own all durable state; callers (the session manager and
/// sync handler) never mutate an event after append and never bypass
/// `append_events`'s ordering contract.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotently create the physical partition for `store_id`.
    async fn ensure_store(&self, store_id: &str) -> StorageResult<()>;

    /// Return the largest `seq_num` present, or 0 if the store is empty.
    ///
    /// Always reads the authoritative value, never a cache.
    async fn get_head(&self, store_id: &str) -> StorageResult<u64>;

    /// Return every event with `seq_num > cursor` (or all events if `cursor`
    /// is `None`), ordered by ascending `seq_num`.
    async fn get_events(
        &self,
        store_id: &str,
        cursor: Option<u64>,
    ) -> StorageResult<Vec<StoredEvent>>;

    /// Durably persist `batch` (must be non-empty), assigning `created_at`
    /// to every event in the batch.
    ///
    /// Atomic per batch: on failure, no event from `batch` becomes visible.
    /// Callers have already validated internal linkage and the connection to
    /// the current head; this operation does not re-validate it.
    async fn append_events(
        &self,
        store_id: &str,
        batch: &[EventEncoded],
        created_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Destroy all events for `store_id` and recreate an empty partition.
    async fn reset_store(&self, store_id: &str) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_sanitizes_and_embeds_version() {
        assert_eq!(partition_name(1, "my-store/42"), "eventlog_1_my_store_42");
        assert_eq!(partition_name(3, "abc123"), "eventlog_3_abc123");
    }

    #[test]
    fn partition_name_is_pure() {
        assert_eq!(partition_name(1, "same"), partition_name(1, "same"));
        assert_ne!(partition_name(1, "s"), partition_name(2, "s"));
    }
}
