//! Realtime push channel.
//!
//! Keeps a WebSocket open to the content server for live playlist and
//! profile updates, and owns the reconnection policy for the source.

use crate::config::NetworkSettings;
use crate::content::ContentItem;
use crate::profile::ProfileUpdate;
use crate::source::{
    parse_playlist, Connectivity, ContentSource, HttpContentSource, SourceEvent,
};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire frame in both directions.
#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// `contentUpdate` carries either a whole playlist or one item.
#[derive(Debug, Default, Deserialize)]
struct ContentUpdatePayload {
    #[serde(default)]
    playlist: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    content: Option<ContentItem>,
}

/// Realtime connection manager.
pub struct RealtimeManager {
    source: HttpContentSource,
    settings: NetworkSettings,
}

impl RealtimeManager {
    pub fn new(source: HttpContentSource, settings: NetworkSettings) -> Self {
        Self { source, settings }
    }

    /// Build the WebSocket URL.
    fn ws_url(&self) -> Result<Url> {
        let mut url = Url::parse(self.source.server_url()).context("Invalid server URL")?;

        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Failed to set WebSocket scheme"))?;

        url.set_path("/ws");

        let scope = self.source.scope();
        url.query_pairs_mut()
            .append_pair("networkId", &scope.network_id)
            .append_pair("subnetworkId", &scope.subnetwork_id)
            .append_pair("deviceId", &scope.device_id);

        Ok(url)
    }

    /// Connection loop: bounded retries, then slow probing while offline.
    pub async fn run(&self) {
        let mut failures: u32 = 0;

        loop {
            tracing::info!("Connecting to realtime channel...");

            match self.connect().await {
                Ok(stream) => {
                    failures = 0;
                    let recovering = self.source.connectivity() != Connectivity::Online;
                    self.source.set_connectivity(Connectivity::Online);
                    if recovering {
                        self.source.refresh().await;
                    }

                    tracing::info!("Realtime connected");
                    match self.listen(stream).await {
                        Ok(()) => tracing::warn!("Realtime connection closed"),
                        Err(e) => tracing::error!("Realtime connection error: {:#}", e),
                    }
                    self.source.set_connectivity(Connectivity::Reconnecting);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Realtime connect failed (attempt {}/{}): {:#}",
                        failures,
                        self.settings.reconnect_attempts,
                        e
                    );

                    if failures >= self.settings.reconnect_attempts {
                        self.source.set_connectivity(Connectivity::Offline);
                        sleep(self.settings.offline_probe()).await;
                        continue;
                    }
                    self.source.set_connectivity(Connectivity::Reconnecting);
                }
            }

            sleep(self.settings.reconnect_delay()).await;
        }
    }

    async fn connect(&self) -> Result<WsStream> {
        let url = self.ws_url()?;
        tracing::debug!("Connecting to: {}", url);

        let (stream, _response) = connect_async(url.as_str())
            .await
            .context("Failed to connect to WebSocket")?;
        Ok(stream)
    }

    /// Process frames until the server closes the connection.
    async fn listen(&self, stream: WsStream) -> Result<()> {
        let (mut write, mut read) = stream.split();

        let mut heartbeat =
            tokio::time::interval(self.settings.heartbeat().max(Duration::from_secs(1)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(());
                    };
                    let msg = msg.context("Failed to receive message")?;

                    match msg {
                        Message::Text(text) => {
                            if let Some(reply) = self.handle_message(&text).await {
                                write
                                    .send(Message::Text(reply))
                                    .await
                                    .context("Failed to send reply")?;
                            }
                        }
                        Message::Ping(data) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .context("Failed to send pong")?;
                        }
                        Message::Close(_) => {
                            tracing::info!("WebSocket closed by server");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    write
                        .send(Message::Text(self.heartbeat_frame()))
                        .await
                        .context("Failed to send heartbeat")?;
                }
            }
        }
    }

    fn heartbeat_frame(&self) -> String {
        serde_json::json!({
            "event": "heartbeat",
            "data": {
                "deviceId": self.source.scope().device_id,
                "timestamp": Utc::now().to_rfc3339(),
            }
        })
        .to_string()
    }

    /// Handle one text frame. Returns a reply frame when the server expects one.
    async fn handle_message(&self, text: &str) -> Option<String> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("Failed to parse realtime message: {} - {}", e, text);
                return None;
            }
        };

        match frame.event.as_str() {
            "contentUpdate" => {
                let payload: ContentUpdatePayload = match serde_json::from_value(frame.data) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("Failed to parse content update: {}", e);
                        return None;
                    }
                };

                let items = if let Some(raw) = payload.playlist {
                    let items = parse_playlist(raw);
                    self.source.replace_snapshot(items.clone()).await;
                    items
                } else if let Some(item) = payload.content {
                    self.source.upsert(item).await
                } else {
                    tracing::debug!("Content update without content");
                    return None;
                };

                self.source.emit(SourceEvent::ContentUpdate(items));
                None
            }
            "contentDelete" => {
                let id = match frame.data {
                    serde_json::Value::String(id) => Some(id),
                    ref data => data.get("id").and_then(|v| v.as_str()).map(str::to_owned),
                };

                if let Some(id) = id {
                    let items = self.source.remove(&id).await;
                    self.source.emit(SourceEvent::ContentUpdate(items));
                }
                None
            }
            "profileUpdate" => {
                match serde_json::from_value::<ProfileUpdate>(frame.data) {
                    Ok(update) if !update.is_empty() => {
                        self.source.emit(SourceEvent::ProfileUpdate(update));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to parse profile update: {}", e),
                }
                None
            }
            "syncRequest" => {
                let scope = self.source.scope();
                let ids: Vec<String> = self
                    .source
                    .snapshot()
                    .await
                    .into_iter()
                    .map(|item| item.id)
                    .collect();

                let reply = serde_json::json!({
                    "event": "syncStatus",
                    "data": {
                        "deviceId": scope.device_id,
                        "networkId": scope.network_id,
                        "subnetworkId": scope.subnetwork_id,
                        "timestamp": Utc::now().to_rfc3339(),
                        "contentCache": ids,
                    }
                });
                Some(reply.to_string())
            }
            other => {
                tracing::debug!("Ignoring realtime event {}", other);
                None
            }
        }
    }
}

/// Spawn the realtime manager as a background task.
pub fn spawn_realtime(source: HttpContentSource, settings: NetworkSettings) -> JoinHandle<()> {
    let manager = RealtimeManager::new(source, settings);

    tokio::spawn(async move {
        manager.run().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::content::ContentType;
    use crate::source::Scope;

    fn manager(server_url: &str, network: NetworkSettings) -> RealtimeManager {
        let mut settings = Settings::default();
        settings.server_url = server_url.into();
        settings.network = network.clone();
        let scope = Scope {
            device_id: "dev 1".into(),
            network_id: "net".into(),
            subnetwork_id: "sub".into(),
        };
        let source = HttpContentSource::new(&settings, scope).unwrap();
        RealtimeManager::new(source, network)
    }

    fn item(id: &str) -> ContentItem {
        ContentItem::new(id, ContentType::Image, format!("http://cdn/{}.jpg", id), 10.0)
    }

    #[test]
    fn test_ws_url() {
        let m = manager("https://cms.example.com", NetworkSettings::default());
        let url = m.ws_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/ws");
        assert_eq!(
            url.query(),
            Some("networkId=net&subnetworkId=sub&deviceId=dev+1")
        );
    }

    #[tokio::test]
    async fn test_playlist_update_replaces_snapshot() {
        let m = manager("http://127.0.0.1:9", NetworkSettings::default());
        let mut events = m.source.subscribe();
        let frame = serde_json::json!({
            "event": "contentUpdate",
            "data": { "playlist": [item("a"), item("b")] }
        });

        assert!(m.handle_message(&frame.to_string()).await.is_none());
        match events.try_recv().unwrap() {
            SourceEvent::ContentUpdate(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(m.source.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_playlist_update_skips_malformed_entries() {
        let m = manager("http://127.0.0.1:9", NetworkSettings::default());
        let mut events = m.source.subscribe();
        let frame = serde_json::json!({
            "event": "contentUpdate",
            "data": { "playlist": [
                item("a"),
                { "id": "broken", "type": "hologram", "url": "/x", "duration": 10 },
                item("b")
            ]}
        });

        m.handle_message(&frame.to_string()).await;
        match events.try_recv().unwrap() {
            SourceEvent::ContentUpdate(items) => {
                let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(m.source.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_single_content_update_and_delete() {
        let m = manager("http://127.0.0.1:9", NetworkSettings::default());
        m.source.replace_snapshot(vec![item("a")]).await;
        let mut events = m.source.subscribe();

        let upsert = serde_json::json!({ "event": "contentUpdate", "data": { "content": item("b") } });
        m.handle_message(&upsert.to_string()).await;
        match events.try_recv().unwrap() {
            SourceEvent::ContentUpdate(items) => {
                let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        m.handle_message(r#"{"event":"contentDelete","data":"a"}"#).await;
        match events.try_recv().unwrap() {
            SourceEvent::ContentUpdate(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, "b");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_profile_update_and_sync_request() {
        let m = manager("http://127.0.0.1:9", NetworkSettings::default());
        m.source.replace_snapshot(vec![item("a")]).await;
        let mut events = m.source.subscribe();

        m.handle_message(r#"{"event":"profileUpdate","data":{"maxBitrate":2500}}"#)
            .await;
        match events.try_recv().unwrap() {
            SourceEvent::ProfileUpdate(update) => assert_eq!(update.max_bitrate, Some(2500)),
            other => panic!("unexpected event {:?}", other),
        }

        let reply = m
            .handle_message(r#"{"event":"syncRequest","data":{}}"#)
            .await
            .unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["event"], "syncStatus");
        assert_eq!(reply["data"]["contentCache"], serde_json::json!(["a"]));
    }

    #[tokio::test]
    async fn test_garbage_frames_are_ignored() {
        let m = manager("http://127.0.0.1:9", NetworkSettings::default());
        let mut events = m.source.subscribe();
        assert!(m.handle_message("not json").await.is_none());
        assert!(m.handle_message(r#"{"event":"mystery"}"#).await.is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_offline() {
        let network = NetworkSettings {
            reconnect_attempts: 2,
            reconnect_delay_ms: 10,
            ..Default::default()
        };
        let m = manager("http://127.0.0.1:9", network);
        let mut events = m.source.subscribe();

        let handle = tokio::spawn(async move { m.run().await });

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        handle.abort();

        assert_eq!(first, SourceEvent::Disconnected);
        assert_eq!(second, SourceEvent::Offline);
    }
}
