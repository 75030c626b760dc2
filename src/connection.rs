//! WebSocket connection handler
//!
//! Admits one socket for a pre-validated user, then runs the pump pair:
//! - inbound: socket → decode → registry (ping answered in place)
//! - outbound: session queue → socket, until the registry closes the queue

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::envelope::{decode_frame, ClientFrame, FrameRejection, ServerEnvelope};
use crate::error::AppError;
use crate::registry::RegistryHandle;
use crate::session::{Outbound, Session, SessionRef};
use crate::types::UserId;

/// Extract the pre-validated `user_id` query parameter
pub fn user_id_from_query(query: Option<&str>) -> Option<UserId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user_id")
        .and_then(|(_, value)| value.parse().ok())
        .map(UserId)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("missing or invalid user_id".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, registers the session and runs both
/// pumps until the socket closes.
pub async fn handle_connection(
    stream: TcpStream,
    registry: RegistryHandle,
    outbound_capacity: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // identity is resolved by the fronting auth layer before upgrade
    let mut admitted = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match user_id_from_query(req.uri().query()) {
            Some(user_id) => {
                admitted = Some(user_id);
                Ok(resp)
            }
            None => Err(unauthorized()),
        }
    })
    .await?;
    let Some(user_id) = admitted else {
        return Ok(());
    };

    let (ws_sender, ws_receiver) = ws_stream.split();
    let (session, outbound_rx) = Session::new(user_id, outbound_capacity);
    let handle = session.handle();
    let session_id = session.id;
    info!("Session {} for user {} from {}", session_id, user_id, peer_addr);

    registry.register(session).await?;

    let mut write_task = tokio::spawn(outbound_pump(ws_sender, outbound_rx));
    let mut read_task = tokio::spawn(inbound_pump(ws_receiver, handle, registry.clone()));

    // Wait for either task to complete
    let write_done = tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", session_id);
            false
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", session_id);
            read_task.abort();
            true
        }
    };

    if registry.unregister(session_id, user_id).await.is_err() {
        // registry gone: nobody will close the queue for us
        write_task.abort();
    } else if !write_done {
        let _ = write_task.await;
    }

    info!("Session {} for user {} disconnected", session_id, user_id);

    Ok(())
}

/// Read frames until the socket errors or closes
pub async fn inbound_pump<S>(mut stream: S, session: SessionRef, registry: RegistryHandle)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match decode_frame(&text) {
                Ok(ClientFrame::Ping) => {
                    if let Err(e) = session.reply(&ServerEnvelope::Pong) {
                        debug!("Pong to session {} dropped: {}", session.id, e);
                    }
                }
                Ok(frame) => {
                    if registry.admit(session.clone(), frame).await.is_err() {
                        debug!("Registry closed, ending read task for {}", session.id);
                        break;
                    }
                }
                Err(FrameRejection::UnknownKind(kind)) => {
                    debug!("Ignoring '{}' frame from session {}", kind, session.id);
                }
                Err(e) => {
                    warn!("Dropping frame from session {}: {}", session.id, e);
                }
            },
            Ok(Message::Close(_)) => {
                debug!("Session {} sent close frame", session.id);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // protocol-level pong is answered by tungstenite
            }
            Ok(_) => {
                // Binary and raw frames are not part of the protocol
            }
            Err(e) => {
                warn!("WebSocket error for session {}: {}", session.id, e);
                break;
            }
        }
    }
    debug!("Read task ended for {}", session.id);
}

/// Write queued frames until the queue is closed, then close the socket
pub async fn outbound_pump<W>(mut sink: W, mut queue: mpsc::Receiver<Outbound>)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
            debug!("WebSocket send failed, ending write task: {}", e);
            break;
        }
    }
    debug!("Write task ended");

    // Send close frame when done
    let _ = sink.close().await;
}
