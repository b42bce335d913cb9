/// WebSocket front end for the broadcast hub
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::messages::WsMessage;
use super::session::SessionRole;
use super::BroadcastHub;
use crate::error::{EngineError, Result};

/// Bind the hub listener. Kept separate from the serve loop so a bad
/// bind address fails during startup.
pub async fn bind_ws(bind: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| EngineError::WebSocket(format!("bind {} failed: {}", bind, e)))?;
    info!(%bind, "WebSocket hub listening");
    Ok(listener)
}

pub async fn run_ws_server(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    read_deadline: Duration,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    debug!(%peer, "Incoming WebSocket connection");
                    handle_connection(stream, hub, read_deadline).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, hub: Arc<BroadcastHub>, read_deadline: Duration) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let session = hub.attach().await;
    let session_id = session.id;

    // Writer: drains the session queue until the session closes. A
    // failed socket write removes only this session.
    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        while let Some(batch) = writer_session.next_batch().await {
            for msg in batch {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize outbound message");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    return;
                }
            }
        }
    });

    // Reader: any inbound frame resets the read deadline
    loop {
        match tokio::time::timeout(read_deadline, read.next()).await {
            Err(_) => {
                warn!(%session_id, "Session read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(%session_id, error = %e, "Session read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                session.touch().await;
                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::Login { account_id, role }) => {
                        let role = match role.as_deref() {
                            Some("admin") => SessionRole::Admin,
                            _ => SessionRole::Trader,
                        };
                        session.login(account_id, role).await;
                        debug!(%session_id, ?account_id, "Session login");
                    }
                    Ok(WsMessage::Subscribe { symbols }) => {
                        session.subscribe(symbols).await;
                    }
                    Ok(WsMessage::Unsubscribe { symbols }) => {
                        session.unsubscribe(symbols).await;
                    }
                    Ok(WsMessage::Pong) => {}
                    Ok(other) => {
                        debug!(%session_id, ?other, "Ignoring unexpected inbound message");
                    }
                    Err(e) => {
                        debug!(%session_id, error = %e, "Unparseable inbound message");
                    }
                }
            }
            Ok(Some(Ok(Message::Pong(_)))) | Ok(Some(Ok(Message::Ping(_)))) => {
                session.touch().await;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }

    hub.detach(session_id).await;
    let _ = writer.await;
}
