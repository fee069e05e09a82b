//! WebSocket adapter: accepts connections on `/ws/sessions/{roomCode}`,
//! parses inbound envelopes into typed events for the owning room actor,
//! and drains the actor's outbound queue back onto the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{Request, Response},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error, Message, Result,
    },
    WebSocketStream,
};

use crate::heartbeat::HeartbeatState;
use crate::model::client_message::{ClientEvent, InboundEnvelope};
use crate::model::server_message::{ErrorCode, ServerEvent};
use crate::outbound::{CloseReason, Delivery, OutboundQueue};
use crate::registry::{AcquireError, RoomHandle, RoomRegistry};
use crate::room::messages::{ConnHandle, ConnId, RoomEvent};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn start_ws_server(listener: TcpListener, registry: Arc<RoomRegistry>) {
    let addr = listener.local_addr().expect("listener has a local address");
    info!("WebSocket server listening on {addr}");

    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(accept_connection(stream, registry.clone()));
    }
}

async fn accept_connection(stream: TcpStream, registry: Arc<RoomRegistry>) {
    if let Err(e) = handle_connection(stream, registry).await {
        match e {
            Error::ConnectionClosed | Error::Protocol(_) | Error::Utf8 => (),
            err => error!("error processing connection: {err}"),
        }
    }
}

fn room_code_from_path(path: &str) -> Option<&str> {
    let code = path.strip_prefix("/ws/sessions/")?;
    (!code.is_empty() && !code.contains('/')).then_some(code)
}

async fn handle_connection(stream: TcpStream, registry: Arc<RoomRegistry>) -> Result<()> {
    let mut requested_path = None;
    let callback = |request: &Request, response: Response| {
        requested_path = Some(request.uri().path().to_string());
        Ok(response)
    };
    let mut ws_stream = accept_hdr_async(stream, callback).await?;

    let room_code = requested_path.as_deref().and_then(room_code_from_path);
    let Some(room_code) = room_code else {
        return refuse(
            &mut ws_stream,
            ServerEvent::bad_request(ErrorCode::RoomNotFound, "expected /ws/sessions/{roomCode}"),
        )
        .await;
    };

    match registry.acquire(room_code).await {
        Ok(room) => run_connection(ws_stream, room, &registry).await,
        Err(AcquireError::NotFound) => {
            refuse(
                &mut ws_stream,
                ServerEvent::bad_request(ErrorCode::RoomNotFound, "no session carries this room code"),
            )
            .await
        }
        Err(AcquireError::Closed) => {
            refuse(
                &mut ws_stream,
                ServerEvent::bad_request(ErrorCode::RoomClosed, "session already finished"),
            )
            .await
        }
        Err(AcquireError::Store(err)) => {
            warn!("could not load session for room {room_code}: {err}");
            refuse(&mut ws_stream, ServerEvent::internal_error("could not load session")).await
        }
    }
}

/// Terminal frame for connections that never make it to a room.
async fn refuse(ws_stream: &mut WebSocketStream<TcpStream>, event: ServerEvent) -> Result<()> {
    let envelope = event.into_envelope(None);
    let text = serde_json::to_string(&envelope)
        .expect("outbound envelopes contain no non-serialisable values");
    ws_stream.send(Message::text(text)).await?;
    ws_stream.close(None).await?;
    Ok(())
}

fn close_frame(reason: CloseReason) -> Option<CloseFrame> {
    let code = match reason {
        CloseReason::Normal => CloseCode::Normal,
        _ => CloseCode::Policy,
    };
    Some(CloseFrame { code, reason: reason.as_str().into() })
}

async fn run_connection(
    ws_stream: WebSocketStream<TcpStream>,
    room: RoomHandle,
    registry: &RoomRegistry,
) -> Result<()> {
    let config = registry.config();
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let queue = Arc::new(OutboundQueue::new(config.outbound_capacity, config.drain_timeout));

    let mut ws_stream = ws_stream;
    let conn = ConnHandle { id: conn_id, queue: queue.clone() };
    if room.events.send(RoomEvent::Connected { conn }).await.is_err() {
        return refuse(
            &mut ws_stream,
            ServerEvent::bad_request(ErrorCode::RoomClosed, "session already finished"),
        )
        .await;
    }

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let mut heartbeat = HeartbeatState::new(config.pong_timeout);
    let mut ping_interval = interval(config.ping_interval);

    loop {
        tokio::select! {
            // Frames the actor queued for this connection
            delivery = queue.recv() => match delivery {
                Delivery::Frame(envelope) => {
                    let text = serde_json::to_string(&envelope)
                        .expect("outbound envelopes contain no non-serialisable values");
                    if ws_write.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Delivery::Closed(reason) => {
                    let _ = ws_write.send(Message::Close(close_frame(reason))).await;
                    break;
                }
            },

            // Incoming frames from the client
            msg_result = ws_read.next() => {
                match msg_result {
                    Some(Ok(Message::Pong(_))) => {
                        heartbeat.record_pong();
                    }
                    Some(Ok(Message::Text(text))) => {
                        dispatch_inbound(&text, conn_id, &room, &queue).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(_)) => {
                        break;
                    }
                    _ => {} // Ignore Ping (auto-handled by tungstenite), Binary
                }
            }

            // Heartbeat ping timer
            _ = ping_interval.tick() => {
                if !heartbeat.is_alive() {
                    info!("connection {conn_id} timed out (no pong received)");
                    let _ = ws_write.send(Message::Close(close_frame(CloseReason::Timeout))).await;
                    break;
                }
                if ws_write.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                heartbeat.record_ping_sent();
            }
        }
    }

    let _ = room.events.send(RoomEvent::Disconnected { conn_id }).await;
    Ok(())
}

/// Parse and forward one inbound frame. Malformed input is answered on this
/// connection only; nothing reaches the actor.
async fn dispatch_inbound(
    text: &str,
    conn_id: ConnId,
    room: &RoomHandle,
    queue: &OutboundQueue,
) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            queue.push(
                ServerEvent::bad_request(ErrorCode::BadRequest, format!("invalid envelope: {err}")),
                None,
            );
            return;
        }
    };
    let request_id = envelope.request_id.clone();
    let event = match ClientEvent::parse(&envelope) {
        Ok(event) => event,
        Err(err) => {
            queue.push(
                ServerEvent::bad_request(ErrorCode::BadRequest, err.to_string()),
                request_id,
            );
            return;
        }
    };

    let sent = room
        .events
        .send(RoomEvent::Inbound { conn_id, event, request_id: envelope.request_id })
        .await;
    if sent.is_err() {
        // The room wound down while this frame was in flight.
        queue.push(
            ServerEvent::bad_request(ErrorCode::RoomClosed, "session already finished"),
            None,
        );
        queue.close_after_drain(CloseReason::Normal);
    }
}
