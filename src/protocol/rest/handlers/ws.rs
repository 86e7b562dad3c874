//! WebSocket Handler
//!
//! One task per connection. Binary frames carry a 1-byte message type and a
//! MessagePack map payload.
//!
//! ## Protocol
//!
//! **Client → Server:**
//! - `0x10` ping, answered at once with `0x11 0x80`, never rate limited
//! - `0xA0` identify `{image: bin}`
//! - `0xB0` verify `{first_image: bin, second_image: bin}`
//! - `0xF0` diagnostic `{}`
//!
//! **Server → Client:**
//! - `0xA1` / `0xB1` job result `{ok, detail, faces_count | is_match, similarity_confidence, faces}`
//! - `0xF1` diagnostic `{alive, queue_len, ws_clients}`
//! - `0xFF` throttled `{ok: false, detail}`
//!
//! Frames that are too short, carry an unknown type, or do not decode to a
//! map are dropped without a reply. Identify and verify frames missing an
//! image are dropped as well.
//!
//! ## Result delivery
//!
//! Jobs complete on the dispatch thread. Their callback encodes the response
//! and posts it to the connection's outbox together with an ack channel; the
//! connection task sends the frame and reports back, and the dispatch thread
//! waits for that report up to the delivery timeout. When the connection is
//! already gone the post fails and the result is dropped with a log line.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension,
};
use crossbeam_channel::RecvTimeoutError;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::dispatch::SHUTTING_DOWN;
use crate::protocol::error::CodecError;
use crate::protocol::wire::{self, MessageType, RequestFields, PONG_FRAME};
use crate::protocol::{Gateway, CLOSE_TRY_AGAIN_LATER, CLOSE_TRY_AGAIN_LATER_REASON};
use crate::queue::{JobPayload, Outcome, QueueError};

/// Client key used when the peer address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

/// A response frame posted from the dispatch thread, plus the channel on
/// which the connection task reports the send result.
struct Outbound {
    frame: Vec<u8>,
    ack: crossbeam_channel::Sender<Result<(), String>>,
}

type Outbox = mpsc::UnboundedSender<Outbound>;

/// Upgrade to the binary job protocol.
///
/// The global connect-rate limit is charged here, once per attempt. A
/// rejected connection is closed with code 1013 right after the upgrade.
pub async fn websocket(
    Extension(gateway): Extension<Arc<Gateway>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client = connect_info.map_or_else(
        || UNKNOWN_CLIENT.to_string(),
        |ConnectInfo(addr)| addr.ip().to_string(),
    );
    let admitted = gateway.admit_connection();
    let max_size = gateway.config().http.max_message_size;

    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| async move {
            if admitted {
                handle_connection(socket, gateway, client).await;
            } else {
                reject_connection(socket, &client).await;
            }
        })
}

async fn reject_connection(mut socket: WebSocket, client: &str) {
    warn!(client = %client, "ws_connection_rejected");
    let close = CloseFrame {
        code: CLOSE_TRY_AGAIN_LATER,
        reason: Cow::Borrowed(CLOSE_TRY_AGAIN_LATER_REASON),
    };
    let _ = socket.send(Message::Close(Some(close))).await;
}

async fn handle_connection(socket: WebSocket, gateway: Arc<Gateway>, client: String) {
    let _connection = gateway.open_connection();
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Outbound>();

    info!(
        client = %client,
        active_connections = gateway.active_connections(),
        "ws_connection_accepted"
    );

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(frame))) => {
                        if let Some(reply) = handle_frame(&gateway, &client, &frame, &outbox) {
                            if sender.send(Message::Binary(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client = %client, error = %e, "ws_receive_error");
                        break;
                    }
                    Some(Ok(_)) => {} // text frames are not part of the protocol
                }
            }
            Some(outbound) = outbox_rx.recv() => {
                let bytes = outbound.frame.len();
                let result = sender.send(Message::Binary(outbound.frame)).await;
                let failed = result.is_err();
                trace!(client = %client, bytes, failed, "ws_result_frame_sent");
                let _ = outbound.ack.send(result.map_err(|e| e.to_string()));
                if failed {
                    break;
                }
            }
        }
    }

    close_connection(sender, outbox_rx).await;
    info!(client = %client, "ws_connection_closed");
}

/// Release the outbox, then say goodbye.
///
/// Results posted while the close frame is in flight fail at once instead of
/// holding the dispatch thread for the delivery timeout.
async fn close_connection<S>(mut sender: S, outbox_rx: mpsc::UnboundedReceiver<Outbound>)
where
    S: Sink<Message> + Unpin,
{
    drop(outbox_rx);
    let _ = sender.send(Message::Close(None)).await;
}

/// Handle one inbound frame. Returns a frame to send back immediately, if any.
fn handle_frame(gateway: &Gateway, client: &str, frame: &[u8], outbox: &Outbox) -> Option<Vec<u8>> {
    trace!(client = %client, bytes = frame.len(), "ws_frame_received");

    let (kind, mut fields) = match wire::decode_request(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(client = %client, error = %e, "ws_frame_dropped");
            return None;
        }
    };

    if kind == MessageType::PingRequest {
        return Some(PONG_FRAME.to_vec());
    }

    if !gateway.admit_message(client) {
        info!(client = %client, kind = %kind, "ws_request_throttled");
        return encoded(wire::encode_throttled());
    }

    match kind {
        MessageType::IdentifyRequest => {
            let payload = identify_payload(&mut fields)?;
            enqueue(gateway, payload, MessageType::IdentifyResponse, outbox)
        }
        MessageType::VerifyRequest => {
            let payload = verify_payload(&mut fields)?;
            enqueue(gateway, payload, MessageType::VerifyResponse, outbox)
        }
        MessageType::DiagnosticRequest => encoded(wire::encode(
            MessageType::DiagnosticResponse,
            &gateway.diagnostic(),
        )),
        _ => {
            debug!(client = %client, kind = %kind, "ws_unexpected_message_type");
            None
        }
    }
}

fn identify_payload(fields: &mut RequestFields) -> Option<JobPayload> {
    let image = fields.take_image("image");
    if image.is_none() {
        debug!("identify_request_missing_image");
    }
    image.map(JobPayload::identify)
}

fn verify_payload(fields: &mut RequestFields) -> Option<JobPayload> {
    match (fields.take_image("first_image"), fields.take_image("second_image")) {
        (Some(first), Some(second)) => Some(JobPayload::verify(first, second)),
        _ => {
            debug!("verify_request_missing_image");
            None
        }
    }
}

fn encoded(frame: Result<Vec<u8>, CodecError>) -> Option<Vec<u8>> {
    match frame {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, "ws_response_encode_failed");
            None
        }
    }
}

/// Push a job whose result is posted back to this connection's outbox.
///
/// Enqueueing never waits for the job. If the queue is already closed the
/// shutdown failure is returned for immediate sending instead.
fn enqueue(
    gateway: &Gateway,
    payload: JobPayload,
    response: MessageType,
    outbox: &Outbox,
) -> Option<Vec<u8>> {
    let mode = payload.mode();
    let outbox = outbox.clone();
    let delivery_timeout = gateway.config().dispatch.delivery_timeout();

    match gateway.submit(payload, move |outcome| {
        deliver(&outbox, response, outcome, delivery_timeout);
    }) {
        Ok(id) => {
            info!(job_id = %id, mode, queue_len = gateway.queue().len(), "job_enqueued");
            None
        }
        Err(QueueError::Closed(_)) => {
            warn!(mode, "job_rejected_queue_closed");
            encoded(wire::encode_outcome(response, Outcome::failure(SHUTTING_DOWN)))
        }
    }
}

/// Runs on the dispatch thread: post the response and wait for the send.
///
/// Every failure is logged and swallowed.
fn deliver(outbox: &Outbox, kind: MessageType, outcome: Outcome, timeout: Duration) {
    let frame = match wire::encode_outcome(kind, outcome) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "ws_response_encode_failed");
            return;
        }
    };
    let bytes = frame.len();

    let (ack, ack_rx) = crossbeam_channel::bounded(1);
    if outbox.send(Outbound { frame, ack }).is_err() {
        warn!(kind = %kind, "ws_result_dropped_connection_closed");
        return;
    }

    match ack_rx.recv_timeout(timeout) {
        Ok(Ok(())) => info!(kind = %kind, bytes, "ws_result_delivered"),
        Ok(Err(e)) => warn!(kind = %kind, error = %e, "ws_result_send_failed"),
        Err(RecvTimeoutError::Timeout) => {
            warn!(kind = %kind, timeout_ms = timeout.as_millis(), "ws_result_send_timed_out");
        }
        Err(RecvTimeoutError::Disconnected) => {
            warn!(kind = %kind, "ws_result_dropped_connection_closed");
        }
    }
}
