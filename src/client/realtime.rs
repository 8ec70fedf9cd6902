//! Real-time connection task.
//!
//! Keeps a WebSocket open to the server, merging pushed events as they
//! arrive. Each successful (re)connect triggers a catch-up `sync_all`, so
//! anything missed while offline is pulled. On loss the client goes
//! OFFLINE and retries after `reconnect_delay`.

use eventsync_core::ServerEvent;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::error::ClientError;
use super::transport::{build_ws_url, SyncTransport};
use super::SyncClient;

pub(crate) async fn run<T: SyncTransport>(
    client: SyncClient<T>,
    socket_url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = build_ws_url(&socket_url, client.config().auth_token.as_deref());
    let reconnect_delay = client.config().reconnect_delay;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                tracing::info!("Connected to {}", socket_url);

                let catch_up = client.clone();
                client.track_task(tokio::spawn(async move {
                    if let Err(e) = catch_up.sync_all().await {
                        tracing::warn!("Catch-up sync failed: {}", e);
                    }
                }));

                let (mut sender, mut receiver) = stream.split();
                loop {
                    tokio::select! {
                        frame = receiver.next() => match frame {
                            Some(Ok(Message::Text(text))) => handle_frame(&client, text.as_str()).await,
                            Some(Ok(Message::Ping(data))) => {
                                let _ = sender.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("WebSocket error: {}", e);
                                break;
                            }
                        },
                        _ = shutdown.changed() => {
                            let _ = sender.send(Message::Close(None)).await;
                            return;
                        }
                    }
                }

                client.mark_offline(&ClientError::WebSocket("connection lost".to_string()));
            }
            Err(e) => {
                tracing::debug!("Failed to connect to {}: {}", socket_url, e);
                client.mark_offline(&ClientError::Connection(e.to_string()));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Applies one pushed frame. Frames that fail to parse are skipped and
/// reported to the `on_error` handlers of the collection they name, or of
/// every watched collection when they name none.
pub(crate) async fn handle_frame<T: SyncTransport>(client: &SyncClient<T>, text: &str) {
    let event = match ServerEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Ignoring malformed frame: {}", e);
            let error = ClientError::Core(e);
            match frame_collection(text) {
                Some(collection) => client.report_error(&collection, &error),
                None => {
                    for collection in client.state().collections {
                        client.report_error(&collection, &error);
                    }
                }
            }
            return;
        }
    };

    let collection = event.collection().to_string();
    if let Err(e) = client.apply_server_event(event).await {
        tracing::warn!("Failed to apply pushed event for {}: {}", collection, e);
        client.report_error(&collection, &e);
    }
}

/// `payload.collection` of a frame that may not be a valid event.
fn frame_collection(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("payload")?
        .get("collection")?
        .as_str()
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}
