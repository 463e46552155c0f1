#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sync-handler** – Per-connection sync state machine.
//!
//! Owns one duplex channel's `store_id`, authorization record, and message
//! loop: handshake, then dispatch of `PullReq`/`PushReq`/`Ping`/
//! `AdminResetRoomReq`/`AdminInfoReq`, unknown tags, and malformed frames
//! (`spec.md` §4.3). Reads against `Arc<dyn EventStore>` and
//! `Arc<SessionManager>`; writes to its own channel go straight to its
//! [`Outbox`], while the push broadcast frame goes through
//! `SessionManager::broadcast`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use sync_auth::{AuthRecord, IdentityVerifier};
use sync_session::{Outbox, SessionManager};
use sync_store_core::EventStore;
use sync_wire::{
    decode_client_message, extract_request_id, AdminInfo, ClientMessage, EventEncoded,
    OptionMetadata, PullContext, PullResBatchItem, PullResRequestId, ServerMessage,
};

/// `_tag` values this server recognizes. Anything JSON-valid but outside
/// this set is an *unknown tag* (logged, silently ignored); anything else
/// that fails to decode is *malformed* (logged, answered with `Error`).
const KNOWN_TAGS: &[&str] = &[
    "WSMessage.PullReq",
    "WSMessage.PushReq",
    "WSMessage.Ping",
    "WSMessage.AdminResetRoomReq",
    "WSMessage.AdminInfoReq",
];

/// Shared collaborators every connection on this server dispatches against.
pub struct HandlerContext {
    store: Arc<dyn EventStore>,
    sessions: Arc<SessionManager>,
    verifier: Arc<dyn IdentityVerifier>,
    admin_secret: Option<String>,
    pull_chunk_size: usize,
}

impl HandlerContext {
    /// Construct a context. `pull_chunk_size` of 0 is treated as 1.
    pub fn new(
        store: Arc<dyn EventStore>,
        sessions: Arc<SessionManager>,
        verifier: Arc<dyn IdentityVerifier>,
        admin_secret: Option<String>,
        pull_chunk_size: usize,
    ) -> Self {
        Self {
            store,
            sessions,
            verifier,
            admin_secret,
            pull_chunk_size: pull_chunk_size.max(1),
        }
    }
}

/// Failure during handshake; the connection must be closed with
/// [`HandshakeError::close_code`] and never reach `ATTACHED`.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The `payload` query parameter was present but not valid JSON.
    #[error("invalid JSON payload format")]
    MalformedPayload,
    /// The identity verifier rejected the payload outright.
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    /// The event store failed while preparing the partition.
    #[error("storage error: {0}")]
    Storage(String),
}

impl HandshakeError {
    /// The WebSocket close code to send for this failure (`spec.md` §6.5).
    pub fn close_code(&self) -> u16 {
        match self {
            HandshakeError::MalformedPayload => 1003,
            HandshakeError::PolicyViolation(_) => 1008,
            HandshakeError::Storage(_) => 1011,
        }
    }
}

/// A single `ATTACHED` connection's dispatch state.
///
/// Constructed via [`ConnectionHandler::handshake`]; every subsequent
/// frame is driven through [`ConnectionHandler::handle_message`]. Channel
/// close must call [`ConnectionHandler::detach`] exactly once.
pub struct ConnectionHandler {
    ctx: Arc<HandlerContext>,
    store_id: String,
    channel_id: sync_session::ChannelId,
    auth: AuthRecord,
    outbox: Outbox,
}

impl ConnectionHandler {
    /// Perform the handshake: verify `payload`, ensure the store's
    /// partition exists, attach to the session registry, and (if this is
    /// the first subscriber) prime the head cache from durable storage.
    pub async fn handshake(
        ctx: Arc<HandlerContext>,
        store_id: impl Into<String>,
        payload: Option<Value>,
        outbox: Outbox,
    ) -> Result<Self, HandshakeError> {
        let store_id = store_id.into();

        let auth = ctx
            .verifier
            .verify_payload(payload.as_ref())
            .map_err(|e| HandshakeError::PolicyViolation(e.to_string()))?;

        ctx.store
            .ensure_store(&store_id)
            .await
            .map_err(|e| HandshakeError::Storage(e.to_string()))?;

        let channel_id = ctx.sessions.attach(&store_id, outbox.clone()).await;

        let true_head = ctx
            .store
            .get_head(&store_id)
            .await
            .map_err(|e| HandshakeError::Storage(e.to_string()))?;
        ctx.sessions.initialize_head_if_needed(&store_id, true_head).await;

        tracing::debug!(store_id = %store_id, authenticated = auth.authenticated, is_admin = auth.is_admin, "attached");

        Ok(Self {
            ctx,
            store_id,
            channel_id,
            auth,
            outbox,
        })
    }

    /// Detach from the session registry. Must be called exactly once, when
    /// the channel closes from either side.
    pub async fn detach(&self) {
        self.ctx.sessions.detach(&self.store_id, self.channel_id).await;
        tracing::debug!(store_id = %self.store_id, "detached");
    }

    /// Dispatch one incoming text frame.
    pub async fn handle_message(&self, raw: &str) {
        match decode_client_message(raw) {
            Ok(message) => self.dispatch(message).await,
            Err(_) => self.handle_decode_failure(raw),
        }
    }

    async fn dispatch(&self, message: ClientMessage) {
        match message {
            ClientMessage::PullReq { request_id, cursor } => self.handle_pull(request_id, cursor).await,
            ClientMessage::PushReq { request_id, batch } => self.handle_push(request_id, batch).await,
            ClientMessage::Ping { request_id } => self.send(ServerMessage::Pong { request_id }),
            ClientMessage::AdminResetRoomReq {
                request_id,
                admin_secret,
            } => self.handle_admin_reset(request_id, admin_secret).await,
            ClientMessage::AdminInfoReq {
                request_id,
                admin_secret,
            } => self.handle_admin_info(request_id, admin_secret).await,
        }
    }

    fn handle_decode_failure(&self, raw: &str) {
        let tag = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.get("_tag").and_then(Value::as_str).map(str::to_owned));

        match tag {
            Some(tag) if !KNOWN_TAGS.contains(&tag.as_str()) => {
                tracing::debug!(tag = %tag, "ignoring unrecognized message tag");
            }
            _ => {
                let request_id = extract_request_id(raw);
                tracing::warn!(request_id = %request_id, "malformed message");
                self.send(ServerMessage::Error {
                    request_id,
                    message: "malformed message".to_string(),
                });
            }
        }
    }

    async fn handle_pull(&self, request_id: String, cursor: Option<u64>) {
        let events = match self.ctx.store.get_events(&self.store_id, cursor).await {
            Ok(events) => events,
            Err(e) => {
                self.send(ServerMessage::Error {
                    request_id,
                    message: e.to_string(),
                });
                return;
            }
        };

        if events.is_empty() {
            self.send(ServerMessage::PullRes {
                batch: Vec::new(),
                request_id: PullResRequestId {
                    context: PullContext::Pull,
                    request_id,
                },
                remaining: 0,
            });
            return;
        }

        let total = events.len();
        let mut sent = 0usize;
        for chunk in events.chunks(self.ctx.pull_chunk_size) {
            sent += chunk.len();
            let remaining = (total - sent) as u64;
            let batch = chunk
                .iter()
                .map(|stored| PullResBatchItem {
                    event_encoded: stored.event.clone(),
                    metadata: OptionMetadata::some(stored.created_at.to_rfc3339()),
                })
                .collect();
            self.send(ServerMessage::PullRes {
                batch,
                request_id: PullResRequestId {
                    context: PullContext::Pull,
                    request_id: request_id.clone(),
                },
                remaining,
            });
        }
    }

    async fn handle_push(&self, request_id: String, batch: Vec<EventEncoded>) {
        if !self.auth.authenticated {
            self.send(ServerMessage::Error {
                request_id,
                message: "Authentication required for push operations".to_string(),
            });
            return;
        }

        if batch.is_empty() {
            self.send(ServerMessage::PushAck { request_id });
            return;
        }

        let store = self.ctx.store.clone();
        let sessions = self.ctx.sessions.clone();
        let store_id = self.store_id.clone();
        let outbox = self.outbox.clone();
        let lock_key = store_id.clone();

        sessions
            .with_writer_lock(&lock_key, || async move {
                let expected = sessions.current_head(&store_id).await.unwrap_or(0);
                let first = &batch[0];
                if first.parent_seq_num != expected {
                    let message = format!(
                        "Invalid parent event number. Received e{} but expected e{}",
                        first.parent_seq_num, expected
                    );
                    tracing::warn!(store_id = %store_id, %message, "rejecting push");
                    let _ = outbox.send(ServerMessage::Error {
                        request_id: request_id.clone(),
                        message,
                    });
                    return;
                }

                let _ = outbox.send(ServerMessage::PushAck {
                    request_id: request_id.clone(),
                });

                let created_at = Utc::now();
                if let Err(e) = store.append_events(&store_id, &batch, created_at).await {
                    tracing::error!(store_id = %store_id, error = %e, "append_events failed");
                    let _ = outbox.send(ServerMessage::Error {
                        request_id,
                        message: e.to_string(),
                    });
                    return;
                }

                let new_head = batch.last().expect("checked non-empty above").seq_num;
                sessions.set_head(&store_id, new_head).await;

                let items = batch
                    .iter()
                    .cloned()
                    .map(|event| PullResBatchItem {
                        event_encoded: event,
                        metadata: OptionMetadata::some(created_at.to_rfc3339()),
                    })
                    .collect();
                let frame = ServerMessage::PullRes {
                    batch: items,
                    request_id: PullResRequestId {
                        context: PullContext::Push,
                        request_id,
                    },
                    remaining: 0,
                };
                sessions.broadcast(&store_id, frame, None).await;
            })
            .await;
    }

    async fn handle_admin_reset(&self, request_id: String, admin_secret: String) {
        if !self.is_admin_authorized(&admin_secret) {
            self.send(ServerMessage::Error {
                request_id,
                message: "Invalid admin secret or insufficient privileges".to_string(),
            });
            return;
        }

        if let Err(e) = self.ctx.store.reset_store(&self.store_id).await {
            self.send(ServerMessage::Error {
                request_id,
                message: e.to_string(),
            });
            return;
        }
        self.ctx.sessions.set_head(&self.store_id, 0).await;
        tracing::warn!(store_id = %self.store_id, "store reset by admin");
        self.send(ServerMessage::AdminResetRoomRes { request_id });
    }

    async fn handle_admin_info(&self, request_id: String, admin_secret: String) {
        if !self.is_admin_authorized(&admin_secret) {
            self.send(ServerMessage::Error {
                request_id,
                message: "Invalid admin secret or insufficient privileges".to_string(),
            });
            return;
        }

        let current_head = self.ctx.sessions.current_head(&self.store_id).await.unwrap_or(0);
        let active_connections = self.ctx.sessions.subscriber_count(&self.store_id).await;
        let info = AdminInfo {
            store_id: self.store_id.clone(),
            current_head,
            active_connections,
            durable_object_id: format!("sync-server-{}", self.store_id),
        };
        self.send(ServerMessage::AdminInfoRes { request_id, info });
    }

    fn is_admin_authorized(&self, presented_secret: &str) -> bool {
        self.auth.is_admin || self.ctx.admin_secret.as_deref() == Some(presented_secret)
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.outbox.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_auth::AuthError;
    use sync_store_memory::MemoryEventStore;
    use tokio::sync::mpsc;

    struct AlwaysAuthenticated {
        is_admin: bool,
    }

    impl IdentityVerifier for AlwaysAuthenticated {
        fn verify_payload(&self, _payload: Option<&Value>) -> Result<AuthRecord, AuthError> {
            Ok(AuthRecord {
                authenticated: true,
                is_admin: self.is_admin,
                user_id: Some("tester".to_string()),
                workspace_id: None,
                workspaces: Vec::new(),
            })
        }
    }

    struct AlwaysRejected;

    impl IdentityVerifier for AlwaysRejected {
        fn verify_payload(&self, _payload: Option<&Value>) -> Result<AuthRecord, AuthError> {
            Err(AuthError::InvalidAuthToken)
        }
    }

    fn event(seq_num: u64, parent_seq_num: u64) -> EventEncoded {
        EventEncoded {
            seq_num,
            parent_seq_num,
            name: "x".to_string(),
            args: json!({"k": seq_num}),
            client_id: "c1".to_string(),
            session_id: "s1".to_string(),
        }
    }

    async fn attached_handler(is_admin: bool) -> (Arc<HandlerContext>, ConnectionHandler, mpsc::UnboundedReceiver<ServerMessage>) {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let sessions = Arc::new(SessionManager::new());
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(AlwaysAuthenticated { is_admin });
        let ctx = Arc::new(HandlerContext::new(store, sessions, verifier, Some("admin-secret".to_string()), 100));

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = ConnectionHandler::handshake(ctx.clone(), "S", None, tx).await.unwrap();
        (ctx, handler, rx)
    }

    #[tokio::test]
    async fn handshake_rejected_payload_fails_closed() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let sessions = Arc::new(SessionManager::new());
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(AlwaysRejected);
        let ctx = Arc::new(HandlerContext::new(store, sessions, verifier, None, 100));

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ConnectionHandler::handshake(ctx, "S", None, tx).await.unwrap_err();
        assert_eq!(err.close_code(), 1008);
    }

    #[test]
    fn malformed_payload_closes_with_1003() {
        assert_eq!(HandshakeError::MalformedPayload.close_code(), 1003);
    }

    #[tokio::test]
    async fn pull_on_empty_store_returns_single_empty_batch() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;
        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.PullReq", "requestId": "r1", "cursor": null
            })).unwrap())
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::PullRes { batch, remaining, .. } => {
                assert!(batch.is_empty());
                assert_eq!(remaining, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_then_broadcast_pull_res_matches_scenario_s2() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;

        handler
            .handle_message(
                &serde_json::to_string(&json!({
                    "_tag": "WSMessage.PushReq",
                    "requestId": "p1",
                    "batch": [{
                        "seqNum": 1, "parentSeqNum": 0, "name": "x",
                        "args": {"k": 1}, "clientId": "c1", "sessionId": "s1"
                    }]
                }))
                .unwrap(),
            )
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::PushAck { request_id } => assert_eq!(request_id, "p1"),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            ServerMessage::PullRes { batch, request_id, remaining } => {
                assert_eq!(batch.len(), 1);
                assert_eq!(request_id.context, PullContext::Push);
                assert_eq!(request_id.request_id, "p1");
                assert_eq!(remaining, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_push_broadcasts_to_other_attached_subscribers_without_an_ack() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let sessions = Arc::new(SessionManager::new());
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(AlwaysAuthenticated { is_admin: false });
        let ctx = Arc::new(HandlerContext::new(store, sessions, verifier, None, 100));

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let handler_a = ConnectionHandler::handshake(ctx.clone(), "S", None, tx_a).await.unwrap();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let handler_b = ConnectionHandler::handshake(ctx.clone(), "S", None, tx_b).await.unwrap();

        handler_a
            .handle_message(
                &serde_json::to_string(&json!({
                    "_tag": "WSMessage.PushReq",
                    "requestId": "p1",
                    "batch": [{
                        "seqNum": 1, "parentSeqNum": 0, "name": "x",
                        "args": {"k": 1}, "clientId": "c1", "sessionId": "s1"
                    }]
                }))
                .unwrap(),
            )
            .await;

        // A sees its own ack, then the authoritative broadcast.
        assert!(matches!(rx_a.try_recv().unwrap(), ServerMessage::PushAck { .. }));
        match rx_a.try_recv().unwrap() {
            ServerMessage::PullRes { request_id, .. } => assert_eq!(request_id.context, PullContext::Push),
            other => panic!("unexpected: {other:?}"),
        }

        // B receives only the broadcast, never an ack of someone else's push.
        match rx_b.try_recv().unwrap() {
            ServerMessage::PullRes { batch, request_id, .. } => {
                assert_eq!(batch.len(), 1);
                assert_eq!(request_id.context, PullContext::Push);
                assert_eq!(request_id.request_id, "p1");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());

        handler_b.detach().await;
    }

    #[tokio::test]
    async fn push_with_wrong_parent_yields_error_and_no_mutation() {
        let (ctx, handler, mut rx) = attached_handler(false).await;

        handler
            .handle_message(
                &serde_json::to_string(&json!({
                    "_tag": "WSMessage.PushReq",
                    "requestId": "p2",
                    "batch": [{
                        "seqNum": 6, "parentSeqNum": 5, "name": "x",
                        "args": null, "clientId": "c1", "sessionId": "s1"
                    }]
                }))
                .unwrap(),
            )
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::Error { request_id, message } => {
                assert_eq!(request_id, "p2");
                assert_eq!(message, "Invalid parent event number. Received e5 but expected e0");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ctx.store.get_head("S").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_push_batch_acks_without_broadcast() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;
        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.PushReq", "requestId": "p3", "batch": []
            })).unwrap())
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::PushAck { request_id } => assert_eq!(request_id, "p3"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unauthenticated_push_is_rejected_without_a_close() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let sessions = Arc::new(SessionManager::new());
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(StubVerifier);
        let ctx = Arc::new(HandlerContext::new(store, sessions, verifier, None, 100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = ConnectionHandler::handshake(ctx, "S", None, tx).await.unwrap();

        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.PushReq", "requestId": "p4",
                "batch": [{"seqNum":1,"parentSeqNum":0,"name":"x","args":null,"clientId":"c1","sessionId":"s1"}]
            })).unwrap())
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::Error { request_id, .. } => assert_eq!(request_id, "p4"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct StubVerifier;
    impl IdentityVerifier for StubVerifier {
        fn verify_payload(&self, _payload: Option<&Value>) -> Result<AuthRecord, AuthError> {
            Ok(AuthRecord::default())
        }
    }

    #[tokio::test]
    async fn ping_replies_pong_with_no_state_change() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;
        handler
            .handle_message(&serde_json::to_string(&json!({"_tag":"WSMessage.Ping","requestId":"ping"})).unwrap())
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Pong { request_id } => assert_eq!(request_id, "ping"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn admin_reset_requires_secret_or_admin_flag() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;
        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.AdminResetRoomReq", "requestId": "a1", "adminSecret": "wrong"
            })).unwrap())
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { request_id, .. } => assert_eq!(request_id, "a1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn admin_reset_with_correct_secret_resets_head() {
        let (ctx, handler, mut rx) = attached_handler(false).await;
        handler
            .handle_message(
                &serde_json::to_string(&json!({
                    "_tag": "WSMessage.PushReq", "requestId": "p1",
                    "batch": [{"seqNum":1,"parentSeqNum":0,"name":"x","args":null,"clientId":"c1","sessionId":"s1"}]
                }))
                .unwrap(),
            )
            .await;
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.AdminResetRoomReq", "requestId": "a2", "adminSecret": "admin-secret"
            })).unwrap())
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::AdminResetRoomRes { request_id } => assert_eq!(request_id, "a2"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ctx.store.get_head("S").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn admin_flag_authorizes_without_secret() {
        let (_ctx, handler, mut rx) = attached_handler(true).await;
        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.AdminInfoReq", "requestId": "a3", "adminSecret": ""
            })).unwrap())
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::AdminInfoRes { request_id, info } => {
                assert_eq!(request_id, "a3");
                assert_eq!(info.store_id, "S");
                assert_eq!(info.active_connections, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tag_is_ignored_without_response() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;
        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.NotARealTag", "requestId": "u1"
            })).unwrap())
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_json_emits_error_with_recovered_request_id() {
        let (_ctx, handler, mut rx) = attached_handler(false).await;
        let raw = r#"{"requestId": "r9", "_tag": "WSMessage.PullReq", "cursor": "not-a-number""#;
        handler.handle_message(raw).await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { request_id, .. } => assert_eq!(request_id, "r9"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn detach_removes_subscriber() {
        let (ctx, handler, _rx) = attached_handler(false).await;
        handler.detach().await;
        assert_eq!(ctx.sessions.subscriber_count("S").await, 0);
    }

    #[tokio::test]
    async fn pull_chunks_large_result_sets() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let sessions = Arc::new(SessionManager::new());
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(AlwaysAuthenticated { is_admin: false });
        let ctx = Arc::new(HandlerContext::new(store.clone(), sessions, verifier, None, 2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = ConnectionHandler::handshake(ctx, "S", None, tx).await.unwrap();

        store.ensure_store("S").await.unwrap();
        let batch: Vec<EventEncoded> = (1..=5).map(|n| event(n, n - 1)).collect();
        store.append_events("S", &batch, Utc::now()).await.unwrap();

        handler
            .handle_message(&serde_json::to_string(&json!({
                "_tag": "WSMessage.PullReq", "requestId": "r1", "cursor": null
            })).unwrap())
            .await;

        let mut remainings = Vec::new();
        while let Ok(ServerMessage::PullRes { remaining, .. }) = rx.try_recv() {
            remainings.push(remaining);
        }
        assert_eq!(remainings, vec![3, 1, 0]);
    }
}
