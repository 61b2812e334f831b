use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::ChannelError;

#[derive(Debug)]
pub enum LinkEvent {
    Event(ServerEvent),
    /// One outbound frame was written to the transport, in queue order.
    Flushed,
    Closed(ChannelError),
}

/// One open realtime connection. Frames sent after the link closes are discarded with it.
pub struct RealtimeLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, url: &Url, access_token: &str) -> Result<RealtimeLink, ChannelError>;
}

pub struct WebSocketConnector;

pub fn authenticated_url(url: &Url, access_token: &str) -> Url {
    let mut url = url.clone();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair("token", access_token);
    }
    url
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self, url: &Url, access_token: &str) -> Result<RealtimeLink, ChannelError> {
        let ws_url = authenticated_url(url, access_token);
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_events = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "realtime: failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    let _ = writer_events.send(LinkEvent::Closed(ChannelError::Closed(format!(
                        "websocket send failed: {err}"
                    ))));
                    return;
                }
                if writer_events.send(LinkEvent::Flushed).is_err() {
                    return;
                }
            }
            // Channel manager dropped the link.
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if inbound_tx.send(LinkEvent::Event(event)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "realtime: invalid server event");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let detail = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                        break ChannelError::Closed(detail);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break ChannelError::Closed(format!("websocket receive failed: {err}"));
                    }
                    None => break ChannelError::Closed("websocket stream ended".to_string()),
                }
            };
            debug!(reason = %reason, "realtime: websocket reader finished");
            let _ = inbound_tx.send(LinkEvent::Closed(reason));
        });

        Ok(RealtimeLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
