//! WebSocket upgrade handler and the per-connection session lifecycle.

use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbox};
use crate::router::MessageRouter;
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, Utf8Bytes},
        Extension, Query, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use chatline_messages::CreateMessageParams;
use chatline_types::{InboundFrame, UserId};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::{fmt::Display, sync::Arc, time::Duration};
use thiserror::Error;
use uuid::Uuid;

/// How long teardown waits for the writer to flush and close before aborting it.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Query parameters for the upgrade endpoint.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Raw identity; parsed after the upgrade so a bad value closes the socket
    /// instead of failing the HTTP request.
    pub user_id: Option<String>,
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Bound,
    Reading,
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Bound)
                | (SessionState::Bound, SessionState::Reading)
                | (_, SessionState::Closed)
        ) && self != SessionState::Closed
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection or the stream ended.
    RemoteClosed,
    /// Reading from the transport failed.
    ReadError,
    /// Writing to the transport failed.
    WriteError,
    /// An inbound frame was not a valid message.
    DecodeError,
    /// A newer connection for the same user took over.
    Replaced,
    /// The `user_id` query parameter was missing or not a number.
    InvalidIdentity,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user_id is required")]
    Missing,
    #[error("user_id {0:?} is not an unsigned integer")]
    Malformed(String),
}

/// Parses the identity carried by the upgrade request.
pub fn parse_user_id(raw: Option<&str>) -> Result<UserId, IdentityError> {
    let raw = raw.ok_or(IdentityError::Missing)?;
    raw.parse()
        .map_err(|_| IdentityError::Malformed(raw.to_string()))
}

/// What a session needs from the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: ConnectionRegistry,
    pub router: MessageRouter,
    pub outbound_buffer: usize,
}

/// `GET /api/messages/ws?user_id=<id>`
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<WsConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::warn!(
                user_id = ?params.user_id,
                "websocket upgrade rejected: {}",
                rejection
            );
            return rejection.into_response();
        }
    };

    let ctx = state.session_context();
    let raw_user_id = params.user_id;
    ws.on_failed_upgrade(|e| {
        tracing::warn!("websocket upgrade failed: {}", e);
    })
    .on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        drive_session(sink, stream, ctx, raw_user_id.as_deref()).await;
    })
}

/// Runs one connection from identity binding to teardown.
///
/// `sink` and `stream` are the two halves of the transport. Returns why the
/// session ended; by then the registry entry (if any) is gone and the
/// writer has stopped.
pub async fn drive_session<W, R>(
    sink: W,
    stream: R,
    ctx: SessionContext,
    raw_user_id: Option<&str>,
) -> SessionEnd
where
    W: Sink<Message> + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, axum::Error>>,
{
    let mut state = SessionState::Connecting;
    let mut sink = Box::pin(sink);

    let user_id = match parse_user_id(raw_user_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("rejecting connection: {}", e);
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: Utf8Bytes::from_static("invalid user_id"),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                tracing::debug!("failed to send close frame: {}", e);
            }
            advance(&mut state, SessionState::Closed, None);
            return SessionEnd::InvalidIdentity;
        }
    };

    let (handle, outbox) = ConnectionHandle::new(ctx.outbound_buffer);
    let session_id = handle.session_id();
    let mut writer = tokio::spawn(write_loop(sink, outbox, user_id, session_id));

    ctx.registry.register(user_id, handle.clone());
    let guard = SessionGuard {
        registry: ctx.registry.clone(),
        user_id,
        handle,
    };
    advance(&mut state, SessionState::Bound, Some(user_id));
    tracing::info!(user_id, session_id = %session_id, "websocket connected");

    advance(&mut state, SessionState::Reading, Some(user_id));
    let mut stream = std::pin::pin!(stream);
    let mut writer_finished = false;

    let end = loop {
        tokio::select! {
            incoming = stream.next() => {
                let msg = match incoming {
                    None => break SessionEnd::RemoteClosed,
                    Some(Err(e)) => {
                        tracing::warn!(user_id, session_id = %session_id, "websocket read error: {}", e);
                        break SessionEnd::ReadError;
                    }
                    Some(Ok(msg)) => msg,
                };

                let decoded = match msg {
                    Message::Text(text) => serde_json::from_str::<InboundFrame>(text.as_str()),
                    Message::Binary(bytes) => serde_json::from_slice::<InboundFrame>(&bytes),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => break SessionEnd::RemoteClosed,
                };

                let frame = match decoded {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(user_id, session_id = %session_id, "failed to decode inbound frame: {}", e);
                        break SessionEnd::DecodeError;
                    }
                };

                ctx.router
                    .route(CreateMessageParams {
                        content: frame.content,
                        sender_id: user_id,
                        receiver_id: frame.receiver_id,
                    })
                    .await;
            }
            exit = &mut writer => {
                writer_finished = true;
                break match exit {
                    Ok(WriterExit::Closed) => SessionEnd::Replaced,
                    Ok(WriterExit::SinkFailed) | Ok(WriterExit::Drained) => SessionEnd::WriteError,
                    Err(e) => {
                        tracing::error!(user_id, session_id = %session_id, "writer task failed: {}", e);
                        SessionEnd::WriteError
                    }
                };
            }
        }
    };

    drop(guard);
    if !writer_finished
        && tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer)
            .await
            .is_err()
    {
        tracing::debug!(user_id, session_id = %session_id, "writer did not stop in time, aborting");
        writer.abort();
    }

    advance(&mut state, SessionState::Closed, Some(user_id));
    tracing::info!(user_id, session_id = %session_id, reason = ?end, "websocket disconnected");
    end
}

fn advance(state: &mut SessionState, next: SessionState, user_id: Option<UserId>) {
    debug_assert!(
        state.can_advance_to(next),
        "invalid session transition {state:?} -> {next:?}"
    );
    tracing::trace!(?user_id, from = ?*state, to = ?next, "session state");
    *state = next;
}

/// Unregisters and closes the session's handle when dropped.
struct SessionGuard {
    registry: ConnectionRegistry,
    user_id: UserId,
    handle: ConnectionHandle,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self
            .registry
            .unregister_session(self.user_id, self.handle.session_id());
        self.handle.close();
        tracing::debug!(
            user_id = self.user_id,
            session_id = %self.handle.session_id(),
            removed,
            "session torn down"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    /// The handle was closed; queued frames were flushed and a close frame sent.
    Closed,
    SinkFailed,
    /// Every sender went away.
    Drained,
}

async fn write_loop<W>(
    mut sink: std::pin::Pin<Box<W>>,
    mut outbox: Outbox,
    user_id: UserId,
    session_id: Uuid,
) -> WriterExit
where
    W: Sink<Message>,
    W::Error: Display + Send,
{
    let exit = loop {
        tokio::select! {
            biased;
            _ = outbox.closed.notified() => {
                while let Ok(frame) = outbox.rx.try_recv() {
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        tracing::debug!(user_id, session_id = %session_id, "websocket write failed: {}", e);
                        return WriterExit::SinkFailed;
                    }
                }
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::debug!(user_id, session_id = %session_id, "failed to send close frame: {}", e);
                }
                break WriterExit::Closed;
            }
            frame = outbox.rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        tracing::debug!(user_id, session_id = %session_id, "websocket write failed: {}", e);
                        break WriterExit::SinkFailed;
                    }
                }
                None => break WriterExit::Drained,
            },
        }
    };

    if let Err(e) = sink.close().await {
        tracing::debug!(user_id, session_id = %session_id, "failed to close websocket: {}", e);
    }
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use chatline_types::DeliveryEnvelope;
    use futures_util::{sink, stream};
    use std::convert::Infallible;
    use tokio::sync::mpsc;

    fn context(store: Arc<MemoryStore>) -> SessionContext {
        let registry = ConnectionRegistry::new();
        SessionContext {
            router: MessageRouter::new(registry.clone(), store),
            registry,
            outbound_buffer: 16,
        }
    }

    fn text(frame: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(frame.to_string().into()))
    }

    /// A sink that forwards everything written to it into a channel.
    fn recording_sink() -> (
        impl Sink<Message, Error = Infallible> + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, msg: Message| async move {
            let _ = tx.send(msg);
            Ok::<_, Infallible>(tx)
        });
        (sink, rx)
    }

    fn envelopes(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<DeliveryEnvelope> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(text.as_str()).expect("envelope"));
            }
        }
        out
    }

    #[test]
    fn parse_user_id_accepts_unsigned_integers_only() {
        assert_eq!(parse_user_id(Some("7")), Ok(7));
        assert_eq!(parse_user_id(None), Err(IdentityError::Missing));
        assert!(matches!(
            parse_user_id(Some("abc")),
            Err(IdentityError::Malformed(_))
        ));
        assert!(matches!(
            parse_user_id(Some("-1")),
            Err(IdentityError::Malformed(_))
        ));
        assert!(matches!(
            parse_user_id(Some("")),
            Err(IdentityError::Malformed(_))
        ));
    }

    #[test]
    fn state_machine_only_moves_forward() {
        assert!(SessionState::Connecting.can_advance_to(SessionState::Bound));
        assert!(SessionState::Bound.can_advance_to(SessionState::Reading));
        assert!(SessionState::Connecting.can_advance_to(SessionState::Closed));
        assert!(SessionState::Reading.can_advance_to(SessionState::Closed));
        assert!(!SessionState::Reading.can_advance_to(SessionState::Bound));
        assert!(!SessionState::Closed.can_advance_to(SessionState::Closed));
    }

    #[tokio::test]
    async fn malformed_identity_closes_without_registering() {
        let store = Arc::new(MemoryStore::default());
        let ctx = context(store.clone());
        let (sink, mut sent) = recording_sink();

        let frames = stream::iter(vec![text(r#"{"content":"x","receiver_id":9}"#)]);

        let end = drive_session(sink, frames, ctx.clone(), Some("seven")).await;

        assert_eq!(end, SessionEnd::InvalidIdentity);
        assert!(ctx.registry.is_empty());
        assert!(store.saved().is_empty(), "no frame is read before binding");
        match sent.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::POLICY),
            other => panic!("expected a policy close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_are_routed_in_order_with_bound_sender() {
        let store = Arc::new(MemoryStore::default());
        let ctx = context(store.clone());
        let (sink, mut sent) = recording_sink();
        let frames = stream::iter(vec![
            text(r#"{"content":"first","receiver_id":9}"#),
            Ok(Message::Binary(br#"{"content":"second","receiver_id":3}"#.to_vec().into())),
            Ok(Message::Ping(Default::default())),
        ]);

        let end = drive_session(sink, frames, ctx.clone(), Some("7")).await;
        assert_eq!(end, SessionEnd::RemoteClosed);

        let saved = store.saved();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].content, "first");
        assert_eq!(saved[1].content, "second");
        assert!(saved.iter().all(|m| m.sender_id == 7));
        assert_eq!(saved[1].receiver_id, 3);

        // Both echoes were flushed before the close frame.
        let echoes = envelopes(&mut sent);
        assert_eq!(echoes.len(), 2);
        assert!(echoes.iter().all(|e| e.is_self));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn decode_failure_ends_session_before_next_frame() {
        let store = Arc::new(MemoryStore::default());
        let ctx = context(store.clone());
        let frames = stream::iter(vec![
            text(r#"{"content":"ok","receiver_id":9}"#),
            text(r#"{"content":"missing receiver"}"#),
            text(r#"{"content":"never","receiver_id":9}"#),
        ]);

        let end = drive_session(sink::drain(), frames, ctx.clone(), Some("7")).await;

        assert_eq!(end, SessionEnd::DecodeError);
        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, "ok");
        assert!(ctx.registry.lookup(7).is_none());
    }

    #[tokio::test]
    async fn persistence_failure_keeps_reading() {
        let store = Arc::new(MemoryStore::failing_on("boom"));
        let ctx = context(store.clone());
        let (sink, mut sent) = recording_sink();
        let frames = stream::iter(vec![
            text(r#"{"content":"boom","receiver_id":9}"#),
            text(r#"{"content":"after","receiver_id":9}"#),
        ]);

        let end = drive_session(sink, frames, ctx, Some("7")).await;

        assert_eq!(end, SessionEnd::RemoteClosed);
        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, "after");

        let echoes = envelopes(&mut sent);
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].message, "after");
    }

    #[tokio::test]
    async fn read_error_ends_session() {
        let store = Arc::new(MemoryStore::default());
        let ctx = context(store);
        let frames = stream::iter(vec![Err(axum::Error::new("connection reset"))]);

        let end = drive_session(sink::drain(), frames, ctx.clone(), Some("7")).await;
        assert_eq!(end, SessionEnd::ReadError);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn replaced_session_ends_and_keeps_successor_registered() {
        let store = Arc::new(MemoryStore::default());
        let ctx = context(store);
        let (sink, mut sent) = recording_sink();

        let session = tokio::spawn(drive_session(
            sink,
            stream::pending::<Result<Message, axum::Error>>(),
            ctx.clone(),
            Some("7"),
        ));

        let first = loop {
            if let Some(handle) = ctx.registry.lookup(7) {
                break handle;
            }
            tokio::task::yield_now().await;
        };

        let (successor, _outbox) = ConnectionHandle::new(4);
        ctx.registry.register(7, successor.clone());

        let end = tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("stale session should end")
            .expect("session task");
        assert_eq!(end, SessionEnd::Replaced);
        assert_ne!(first.session_id(), successor.session_id());
        assert_eq!(
            ctx.registry.lookup(7).map(|h| h.session_id()),
            Some(successor.session_id())
        );
        assert!(matches!(sent.try_recv(), Ok(Message::Close(None))));
    }
}
