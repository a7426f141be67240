use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{domain::ConnectionEpoch, error::SyncError};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use super::{Connector, Link};

/// Opens links over a WebSocket endpoint such as `ws://host:7341/ws`.
/// The epoch travels as the `epoch` query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    capacity: usize,
}

impl WsConnector {
    pub fn new(endpoint: &str, capacity: usize) -> Result<Self, SyncError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| SyncError::unavailable(format!("invalid endpoint '{endpoint}': {err}")))?;
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SyncError::unavailable(format!(
                    "endpoint scheme must be ws or wss, got '{other}'"
                )))
            }
        }
        Ok(Self {
            endpoint,
            capacity: capacity.max(1),
        })
    }

    pub fn url_for(&self, epoch: ConnectionEpoch) -> Url {
        let mut url = self.endpoint.clone();
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "epoch")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("epoch", &epoch.to_string());
        url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, epoch: ConnectionEpoch) -> Result<Link, SyncError> {
        let url = self.url_for(epoch);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SyncError::unavailable(format!("failed to connect websocket {url}: {err}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (local, remote) = Link::pair(self.capacity);
        let Link {
            outbound: to_local,
            inbound: mut from_local,
        } = remote;

        tokio::spawn(async move {
            while let Some(text) = from_local.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(%epoch, %err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if to_local.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%epoch, %err, "websocket receive failed");
                        break;
                    }
                }
            }
            debug!(%epoch, "websocket reader finished");
        });

        Ok(local)
    }
}
