use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{ChimeError, Result};
use crate::net::protocol::{ClientMessage, ServerMessage};
use crate::net::session::{Connector, Link};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

/// Opens the Live session over a TLS WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Endpoint URL with the API key attached as the `key` query parameter.
pub fn endpoint_url(config: &Config) -> Result<Url> {
    let key = config.require_api_key()?;
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| ChimeError::Config(format!("invalid endpoint '{}': {e}", config.endpoint)))?;
    url.query_pairs_mut().append_pair("key", key);
    Ok(url)
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, config: &Config) -> Result<Link> {
        let url = endpoint_url(config)?;

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChimeError::Connection(format!("websocket connect failed: {e}")))?;

        tracing::debug!("connected to {}", config.endpoint);

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<ServerMessage>>(INBOUND_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    queued = outbound_rx.recv() => {
                        let Some(message) = queued else {
                            // Owner dropped the link.
                            if let Err(e) = sink.send(Message::Close(None)).await {
                                tracing::debug!("close frame not sent: {e}");
                            }
                            break;
                        };
                        let json = match serde_json::to_string(&message) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!("failed to serialize {}: {e}", message.kind());
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            let _ = inbound_tx
                                .send(Err(ChimeError::Connection(format!("send failed: {e}"))))
                                .await;
                            break;
                        }
                    }
                    incoming = source.next() => {
                        let payload = match incoming {
                            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                            Some(Ok(Message::Binary(data))) => data.to_vec(),
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = sink.send(Message::Pong(data)).await {
                                    tracing::warn!("failed to send pong: {e}");
                                }
                                continue;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::info!("websocket closed by server: {frame:?}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = inbound_tx
                                    .send(Err(ChimeError::Connection(e.to_string())))
                                    .await;
                                break;
                            }
                            None => break,
                        };

                        match ServerMessage::parse(&payload) {
                            Ok(message) => {
                                if inbound_tx.send(Ok(message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "ignoring unparseable server message ({} bytes): {e}",
                                    payload.len()
                                );
                            }
                        }
                    }
                }
            }
            tracing::debug!("websocket pump finished");
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_appends_key() {
        let config = Config {
            api_key: Some("abc 123".to_string()),
            endpoint: "wss://example.test/ws/Service?alt=x".to_string(),
            ..Config::default()
        };
        let url = endpoint_url(&config).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(url.scheme(), "wss");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("alt".to_string(), "x".to_string()),
                ("key".to_string(), "abc 123".to_string())
            ]
        );
    }

    #[test]
    fn endpoint_url_requires_key() {
        let config = Config {
            api_key: None,
            ..Config::default()
        };
        assert!(matches!(endpoint_url(&config), Err(ChimeError::Config(_))));
    }

    #[test]
    fn endpoint_url_rejects_garbage() {
        let config = Config {
            api_key: Some("k".to_string()),
            endpoint: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(endpoint_url(&config), Err(ChimeError::Config(_))));
    }

    #[tokio::test]
    async fn open_without_key_fails_before_dialing() {
        let config = Config {
            api_key: None,
            ..Config::default()
        };
        let result = WsConnector::new().open(&config).await;
        assert!(matches!(result, Err(ChimeError::Config(_))));
    }
}
