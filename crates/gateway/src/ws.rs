//! `GET /v1/ws`: one WebSocket connection per session.
//!
//! Text frames carry JSON envelopes both ways. The socket is split: a reader
//! task feeds frames into the session, and this task writes the session's
//! outbound envelopes until the session closes, then sends a close frame
//! naming the reason.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use agentwire_core::envelope::{Envelope, OutboundEvent};
use agentwire_core::error::SessionError;
use agentwire_session::{CloseReason, SessionHandle, TransportEvent};

use crate::{ErrorResponse, SharedState};

/// WebSocket close code for a normal closure.
const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for a server going away.
const CLOSE_GOING_AWAY: u16 = 1001;
/// WebSocket close code for a policy violation (missed heartbeats).
const CLOSE_POLICY: u16 = 1008;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Re-attach to this session's stored history.
    pub session_id: Option<String>,
}

pub(crate) async fn ws_handler(
    State(state): State<SharedState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let max_bytes = state.manager.config().session.max_message_bytes;
    let handle = match state.manager.open(params.session_id).await {
        Ok(handle) => handle,
        Err(e) => return open_error(e),
    };
    // Oversized frames still reach the session so it can answer with an error
    // event instead of the socket being torn down.
    ws.max_message_size(max_bytes.saturating_mul(2).max(64 * 1024))
        .on_upgrade(move |socket| pump(socket, handle))
}

/// HTTP response for a session that could not be opened.
pub(crate) fn open_error(e: SessionError) -> Response {
    let status = match &e {
        SessionError::AlreadyAttached(_) => StatusCode::CONFLICT,
        SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(status = status.as_u16(), "Session open refused: {e}");
    let code = e.code();
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code,
            number: code.as_u16(),
        }),
    )
        .into_response()
}

async fn pump(socket: WebSocket, handle: SessionHandle) {
    let session_id = handle.session_id().to_string();
    info!(session_id = %session_id, resumed = handle.resumed(), "WebSocket connected");

    let (inbound, outbound, task) = handle.into_parts();
    let (sink, stream) = socket.split();

    let reader = tokio::spawn(read_frames(stream, inbound));
    let sink = write_envelopes(sink, outbound).await;
    // Dropping the inbound side tells a still-running session the peer is gone.
    reader.abort();

    let summary = match task.await {
        Ok(summary) => summary,
        Err(e) => {
            error!(session_id = %session_id, "Session task failed: {e}");
            return;
        }
    };
    if let Some(mut sink) = sink {
        let code = match summary.reason {
            CloseReason::ServerShutdown => CLOSE_GOING_AWAY,
            CloseReason::HeartbeatTimeout => CLOSE_POLICY,
            CloseReason::ClientClosed | CloseReason::TransportError => CLOSE_NORMAL,
        };
        let frame = CloseFrame {
            code,
            reason: summary.reason.as_str().into(),
        };
        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
            debug!(session_id = %session_id, "Close frame not delivered: {e}");
        }
    }
    info!(
        session_id = %session_id,
        reason = %summary.reason,
        turns = summary.turns,
        "WebSocket disconnected"
    );
}

/// Map one socket message onto a session transport event. Protocol-level
/// ping/pong yields `None`.
fn transport_event(message: Result<WsMessage, axum::Error>) -> Option<TransportEvent> {
    let event = match message {
        Ok(WsMessage::Text(text)) => TransportEvent::Frame(text.as_str().to_owned()),
        Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
            Ok(text) => TransportEvent::Frame(text.to_owned()),
            Err(e) => TransportEvent::Unreadable(format!("binary frame is not UTF-8: {e}")),
        },
        Ok(WsMessage::Close(_)) => TransportEvent::Disconnected,
        Ok(_) => return None,
        Err(e) => TransportEvent::Failed(e.to_string()),
    };
    Some(event)
}

async fn read_frames(mut stream: SplitStream<WebSocket>, inbound: mpsc::Sender<TransportEvent>) {
    while let Some(message) = stream.next().await {
        let Some(event) = transport_event(message) else {
            continue;
        };
        let last = matches!(
            event,
            TransportEvent::Disconnected | TransportEvent::Failed(_)
        );
        if inbound.send(event).await.is_err() || last {
            return;
        }
    }
    let _ = inbound.send(TransportEvent::Disconnected).await;
}

/// Write until the session closes its outbound queue. Returns the sink if
/// the socket is still writable.
async fn write_envelopes(
    mut sink: SplitSink<WebSocket, WsMessage>,
    outbound: mpsc::Receiver<Envelope<OutboundEvent>>,
) -> Option<SplitSink<WebSocket, WsMessage>> {
    let frames = ReceiverStream::new(outbound).filter_map(|envelope| async move {
        match envelope.encode() {
            Ok(text) => Some(Ok::<_, axum::Error>(WsMessage::Text(text.into()))),
            Err(e) => {
                error!(event = envelope.event_type(), "Failed to encode envelope: {e}");
                None
            }
        }
    });
    let mut frames = std::pin::pin!(frames);
    match sink.send_all(&mut frames).await {
        Ok(()) => Some(sink),
        Err(e) => {
            debug!("Socket write failed: {e}");
            None
        }
    }
}
