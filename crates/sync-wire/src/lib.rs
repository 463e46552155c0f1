#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sync-wire** – Wire protocol envelopes for the event-sync server.
//!
//! The sync core talks to clients over a persistent duplex text channel
//! carrying tagged JSON objects (a `_tag` field discriminates the variant).
//! This crate owns that wire format: the shared [`EventEncoded`] shape, the
//! client→server [`ClientMessage`] envelope, the server→client
//! [`ServerMessage`] envelope, and the `encode`/`decode` helpers used on
//! either side of the channel.
//!
//! Field naming on the wire is camelCase; Rust-side fields stay snake_case
//! and are translated by `serde(rename_all = "camelCase")`.

use serde::{Deserialize, Serialize};

/// Default number of events per `PullRes` chunk (`spec.md` §4.3).
pub const DEFAULT_PULL_CHUNK_SIZE: usize = 100;

//─────────────────────────────
//  Shared shapes
//─────────────────────────────

/// The wire/domain representation of a single event (`spec.md` §3, §6.1).
///
/// This is the unit of replication: clients send batches of these in
/// `PushReq`, and the server returns them (enriched with [`OptionMetadata`])
/// in `PullRes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEncoded {
    /// Monotonically increasing, dense sequence number within the store.
    pub seq_num: u64,
    /// `seq_num` of the immediately preceding event, or 0 for the first.
    pub parent_seq_num: u64,
    /// Opaque event kind identifier.
    pub name: String,
    /// Opaque structured payload. May be `null`.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Opaque originating client identifier.
    pub client_id: String,
    /// Opaque originating session identifier.
    pub session_id: String,
}

/// Server-assigned metadata attached to an event once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// ISO-8601 UTC timestamp of durable append.
    pub created_at: String,
}

/// Rust encoding of the wire's `{_tag:"None"} | {_tag:"Some", value:...}` option.
///
/// The wire protocol represents optional metadata as a tagged union rather
/// than a bare nullable field, so this is not `Option<SyncMetadata>` even
/// though it carries the same information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum OptionMetadata {
    /// No metadata is available for this event.
    None,
    /// Metadata is present.
    Some {
        /// The wrapped metadata value.
        value: SyncMetadata,
    },
}

impl OptionMetadata {
    /// Build the `Some` variant from a timestamp already in ISO-8601 form.
    pub fn some(created_at: impl Into<String>) -> Self {
        OptionMetadata::Some {
            value: SyncMetadata {
                created_at: created_at.into(),
            },
        }
    }
}

/// One item of a `PullRes` batch: an event plus its optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResBatchItem {
    /// The event itself.
    pub event_encoded: EventEncoded,
    /// Metadata known about the event, if any.
    pub metadata: OptionMetadata,
}

/// The context a `PullRes` is answering: a `PullReq`, or the broadcast frame
/// that follows a successful `PushReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullContext {
    /// This `PullRes` answers a `PullReq`.
    Pull,
    /// This `PullRes` is the broadcast confirmation of a committed `PushReq`.
    Push,
}

/// Request id echoed back on a `PullRes`, tagged with its originating context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResRequestId {
    /// Whether this reply originated from a pull or a push.
    pub context: PullContext,
    /// The original request id.
    pub request_id: String,
}

//─────────────────────────────
//  Client → Server
//─────────────────────────────

/// Every message a client may send, discriminated by `_tag` (`spec.md` §6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Request replay of every event with `seqNum > cursor`.
    #[serde(rename = "WSMessage.PullReq")]
    PullReq {
        /// Caller-chosen id echoed back on the response(s).
        request_id: String,
        /// Replay from strictly after this sequence number, or the whole log if absent.
        cursor: Option<u64>,
    },
    /// Append a batch of events, contingent on a matching parent sequence number.
    #[serde(rename = "WSMessage.PushReq")]
    PushReq {
        /// Caller-chosen id echoed back on the ack/error.
        request_id: String,
        /// The events to append, in order.
        batch: Vec<EventEncoded>,
    },
    /// Liveness probe.
    #[serde(rename = "WSMessage.Ping")]
    Ping {
        /// Always `"ping"`.
        request_id: String,
    },
    /// Privileged: destroy and recreate the store's partition.
    #[serde(rename = "WSMessage.AdminResetRoomReq")]
    AdminResetRoomReq {
        /// Caller-chosen id echoed back on the response.
        request_id: String,
        /// Shared admin secret.
        admin_secret: String,
    },
    /// Privileged: introspect the store's current state.
    #[serde(rename = "WSMessage.AdminInfoReq")]
    AdminInfoReq {
        /// Caller-chosen id echoed back on the response.
        request_id: String,
        /// Shared admin secret.
        admin_secret: String,
    },
}

impl ClientMessage {
    /// The `requestId` carried by every variant, for error reporting when a
    /// later validation step fails.
    pub fn request_id(&self) -> &str {
        match self {
            ClientMessage::PullReq { request_id, .. }
            | ClientMessage::PushReq { request_id, .. }
            | ClientMessage::Ping { request_id }
            | ClientMessage::AdminResetRoomReq { request_id, .. }
            | ClientMessage::AdminInfoReq { request_id, .. } => request_id,
        }
    }
}

//─────────────────────────────
//  Server → Client
//─────────────────────────────

/// Every message the server may send, discriminated by `_tag` (`spec.md` §6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all = "camelCase")]
pub enum ServerMessage {
    /// A chunk of replayed or broadcast events.
    #[serde(rename = "WSMessage.PullRes")]
    PullRes {
        /// The events in this chunk, in order.
        batch: Vec<PullResBatchItem>,
        /// Which request this answers, and from which context.
        request_id: PullResRequestId,
        /// Events still to be sent after this chunk; 0 on the final chunk.
        remaining: u64,
    },
    /// Acknowledges a `PushReq` was accepted for processing.
    #[serde(rename = "WSMessage.PushAck")]
    PushAck {
        /// Echoes the `PushReq`'s `requestId`.
        request_id: String,
    },
    /// Reply to `Ping`.
    #[serde(rename = "WSMessage.Pong")]
    Pong {
        /// Always `"ping"`.
        request_id: String,
    },
    /// Reply to a successful `AdminResetRoomReq`.
    #[serde(rename = "WSMessage.AdminResetRoomRes")]
    AdminResetRoomRes {
        /// Echoes the request's `requestId`.
        request_id: String,
    },
    /// Reply to a successful `AdminInfoReq`.
    #[serde(rename = "WSMessage.AdminInfoRes")]
    AdminInfoRes {
        /// Echoes the request's `requestId`.
        request_id: String,
        /// Free-form introspection payload.
        info: AdminInfo,
    },
    /// Reports a failure while keeping the channel open.
    #[serde(rename = "WSMessage.Error")]
    Error {
        /// Echoes the originating request's `requestId`, or `"unknown"`.
        request_id: String,
        /// Human-readable failure description.
        message: String,
    },
}

/// Body of `AdminInfoRes.info` (`spec.md` §4.3, `AdminInfoReq`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminInfo {
    /// The store this info describes.
    pub store_id: String,
    /// The store's current head.
    pub current_head: u64,
    /// Number of live subscribers attached to the store.
    pub active_connections: usize,
    /// Synthetic identifier for the store's durable partition.
    pub durable_object_id: String,
}

//─────────────────────────────
//  Encode / decode helpers
//─────────────────────────────

/// Errors surfaced while decoding a client frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame was not valid JSON, or didn't match any known `_tag`.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse an incoming text frame into a [`ClientMessage`].
///
/// On failure, callers should still try to recover a `requestId` from the
/// raw JSON (see [`extract_request_id`]) so the `Error` reply can echo it.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, WireError> {
    serde_json::from_str(raw).map_err(WireError::from)
}

/// Serialize an outgoing [`ServerMessage`] into a text frame.
///
/// Only fails if the message somehow contains non-finite floats or similar
/// values `serde_json` refuses to encode; in practice this is infallible for
/// the shapes this crate defines, so callers may `expect` it.
pub fn encode_server_message(message: &ServerMessage) -> Result<String, WireError> {
    serde_json::to_string(message).map_err(WireError::from)
}

/// Best-effort extraction of a `requestId` field from a raw (possibly
/// malformed) frame, used to populate `Error.requestId` when the frame
/// didn't parse as any known [`ClientMessage`] variant.
pub fn extract_request_id(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("requestId").and_then(|r| r.as_str()).map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_string())
}
