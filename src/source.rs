//! Network content source.
//!
//! Pulls the playlist, resolves device-optimized URLs and reports playback
//! over HTTP. The push side lives in [`crate::realtime`] and feeds the same
//! snapshot and event channel.

use crate::config::Settings;
use crate::content::ContentItem;
use crate::error::{PlayerError, Result};
use crate::profile::{DeviceProfile, ProfileUpdate};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, RwLock};

/// Network, subnetwork and device this player belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub device_id: String,
    pub network_id: String,
    pub subnetwork_id: String,
}

impl Scope {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            device_id: settings.device.device_id.clone(),
            network_id: settings.device.network_id.clone(),
            subnetwork_id: settings.device.subnetwork_id.clone(),
        }
    }
}

/// Events pushed to subscribers of a content source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// The full playlist after a replacement, upsert or delete.
    ContentUpdate(Vec<ContentItem>),
    ProfileUpdate(ProfileUpdate),
    Disconnected,
    Reconnected,
    /// Reconnection attempts are exhausted.
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Reconnecting,
    Offline,
}

/// Body of a device status update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub status: String,
    pub connectivity: Connectivity,
    pub current_content_id: Option<String>,
}

/// Where playlists come from and where playback goes.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Current playlist, or the last-known-good one when the network fails.
    async fn fetch_playlist(&self) -> Result<Vec<ContentItem>>;

    /// Device-optimized URL for `id`, or its raw URL when the server can't help.
    async fn resolve_optimized_url(&self, id: &str, profile: &DeviceProfile) -> Result<String>;

    /// Stored profile refinements for this device, if the server has any.
    async fn fetch_profile(&self) -> Result<Option<ProfileUpdate>>;

    /// Record that `id` went on screen. Never fails the caller.
    fn report_playback(&self, id: &str);

    /// Publish device status. Never fails the caller.
    fn update_device_status(&self, status: DeviceStatus);

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;

    fn connectivity(&self) -> Connectivity;
}

#[derive(Debug, Deserialize)]
struct OptimizedUrl {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackReport<'a> {
    device_id: &'a str,
    network_id: &'a str,
    subnetwork_id: &'a str,
    content_id: &'a str,
    timestamp: String,
}

struct SourceInner {
    client: reqwest::Client,
    server_url: String,
    scope: Scope,
    /// Last-known-good playlist. `None` until one has been obtained.
    snapshot: RwLock<Option<Vec<ContentItem>>>,
    snapshot_path: Option<PathBuf>,
    events: broadcast::Sender<SourceEvent>,
    connectivity: Mutex<Connectivity>,
}

/// HTTP implementation of [`ContentSource`].
#[derive(Clone)]
pub struct HttpContentSource {
    inner: Arc<SourceInner>,
}

impl HttpContentSource {
    pub fn new(settings: &Settings, scope: Scope) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.network.request_timeout())
            .build()?;

        let snapshot_path = settings.network.snapshot_path.clone();
        let snapshot = snapshot_path.as_deref().and_then(load_snapshot);
        if let Some(ref items) = snapshot {
            tracing::info!("Loaded {} items from stored playlist snapshot", items.len());
        }

        let (events, _) = broadcast::channel(32);

        Ok(Self {
            inner: Arc::new(SourceInner {
                client,
                server_url: settings.server_url.trim_end_matches('/').to_string(),
                scope,
                snapshot: RwLock::new(snapshot),
                snapshot_path,
                events,
                connectivity: Mutex::new(Connectivity::Online),
            }),
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.server_url, path)
    }

    async fn request_playlist(&self) -> anyhow::Result<Vec<ContentItem>> {
        let scope = &self.inner.scope;
        let url = self.url(&format!(
            "/api/networks/{}/subnetworks/{}/content",
            urlencoding::encode(&scope.network_id),
            urlencoding::encode(&scope.subnetwork_id)
        ));

        let raw: Vec<serde_json::Value> = self
            .inner
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Server returned error")?
            .json()
            .await
            .context("Failed to parse playlist")?;

        Ok(parse_playlist(raw))
    }

    async fn request_optimized_url(
        &self,
        id: &str,
        profile: &DeviceProfile,
    ) -> anyhow::Result<String> {
        let mut query = vec![
            ("deviceId", self.inner.scope.device_id.clone()),
            ("resolution", profile.resolution.to_string()),
            ("format", profile.preferred_format.clone().unwrap_or_default()),
        ];
        if let Some(bitrate) = profile.max_bitrate {
            query.push(("bitrate", bitrate.to_string()));
        }

        let url = self.url(&format!("/api/content/{}/optimized", urlencoding::encode(id)));
        let body: OptimizedUrl = self
            .inner
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Server returned error")?
            .json()
            .await
            .context("Failed to parse optimized URL")?;

        Ok(body.url)
    }

    /// Current snapshot, empty when none has been obtained.
    pub async fn snapshot(&self) -> Vec<ContentItem> {
        self.inner.snapshot.read().await.clone().unwrap_or_default()
    }

    /// Replace the snapshot and persist it.
    pub(crate) async fn replace_snapshot(&self, items: Vec<ContentItem>) {
        *self.inner.snapshot.write().await = Some(items.clone());
        self.persist_snapshot(&items).await;
    }

    /// Insert or replace one item. Returns the new playlist.
    pub(crate) async fn upsert(&self, item: ContentItem) -> Vec<ContentItem> {
        let items = {
            let mut snapshot = self.inner.snapshot.write().await;
            let items = snapshot.get_or_insert_with(Vec::new);
            match items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
            items.clone()
        };
        self.persist_snapshot(&items).await;
        items
    }

    /// Remove an item by id. Returns the new playlist.
    pub(crate) async fn remove(&self, id: &str) -> Vec<ContentItem> {
        let items = {
            let mut snapshot = self.inner.snapshot.write().await;
            let items = snapshot.get_or_insert_with(Vec::new);
            items.retain(|item| item.id != id);
            items.clone()
        };
        self.persist_snapshot(&items).await;
        items
    }

    async fn persist_snapshot(&self, items: &[ContentItem]) {
        let Some(ref path) = self.inner.snapshot_path else {
            return;
        };

        let result = async {
            let json = serde_json::to_vec(items).context("Failed to serialize snapshot")?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create snapshot directory")?;
            }
            tokio::fs::write(path, json)
                .await
                .context("Failed to write snapshot")?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Could not persist playlist snapshot: {:#}", e);
        }
    }

    pub(crate) fn emit(&self, event: SourceEvent) {
        tracing::debug!("Source event: {:?}", event);
        let _ = self.inner.events.send(event);
    }

    /// Record a connectivity change, emitting the matching event on transitions.
    pub(crate) fn set_connectivity(&self, next: Connectivity) {
        let previous = {
            let mut current = self
                .inner
                .connectivity
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, next)
        };

        if previous == next {
            return;
        }

        tracing::info!("Connectivity {:?} -> {:?}", previous, next);
        match next {
            Connectivity::Online => self.emit(SourceEvent::Reconnected),
            Connectivity::Reconnecting => self.emit(SourceEvent::Disconnected),
            Connectivity::Offline => self.emit(SourceEvent::Offline),
        }
    }

    /// Refetch the playlist after a reconnection and push it to subscribers.
    pub(crate) async fn refresh(&self) {
        match self.request_playlist().await {
            Ok(items) => {
                self.replace_snapshot(items.clone()).await;
                self.emit(SourceEvent::ContentUpdate(items));
            }
            Err(e) => tracing::warn!("Playlist refresh failed: {:#}", e),
        }
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch_playlist(&self) -> Result<Vec<ContentItem>> {
        match self.request_playlist().await {
            Ok(items) => {
                tracing::info!("Fetched playlist with {} items", items.len());
                self.replace_snapshot(items.clone()).await;
                Ok(items)
            }
            Err(e) => {
                tracing::warn!("Playlist fetch failed: {:#}", e);
                match self.inner.snapshot.read().await.clone() {
                    Some(items) => {
                        tracing::info!("Using last-known-good playlist ({} items)", items.len());
                        Ok(items)
                    }
                    None => Err(PlayerError::ContentUnavailable),
                }
            }
        }
    }

    async fn resolve_optimized_url(&self, id: &str, profile: &DeviceProfile) -> Result<String> {
        match self.request_optimized_url(id, profile).await {
            Ok(url) => Ok(url),
            Err(e) => {
                tracing::debug!("Optimized URL for {} unavailable: {:#}", id, e);
                self.inner
                    .snapshot
                    .read()
                    .await
                    .iter()
                    .flatten()
                    .find(|item| item.id == id)
                    .map(|item| item.url.clone())
                    .ok_or_else(|| PlayerError::UrlResolutionFailed(id.to_string()))
            }
        }
    }

    async fn fetch_profile(&self) -> Result<Option<ProfileUpdate>> {
        let url = self.url(&format!(
            "/api/devices/{}/profile",
            urlencoding::encode(&self.inner.scope.device_id)
        ));

        let response = self.inner.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let update: ProfileUpdate = response.error_for_status()?.json().await?;
        Ok(Some(update).filter(|u| !u.is_empty()))
    }

    fn report_playback(&self, id: &str) {
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let scope = &this.inner.scope;
            let report = PlaybackReport {
                device_id: &scope.device_id,
                network_id: &scope.network_id,
                subnetwork_id: &scope.subnetwork_id,
                content_id: &id,
                timestamp: Utc::now().to_rfc3339(),
            };

            let result = this
                .inner
                .client
                .post(this.url("/api/analytics/playback"))
                .json(&report)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            if let Err(e) = result {
                tracing::debug!("Playback report for {} failed: {}", id, e);
            }
        });
    }

    fn update_device_status(&self, status: DeviceStatus) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut body = serde_json::to_value(&status).unwrap_or_default();
            if let Some(map) = body.as_object_mut() {
                map.insert("timestamp".into(), Utc::now().to_rfc3339().into());
            }

            let url = this.url(&format!(
                "/api/devices/{}/status",
                urlencoding::encode(&this.inner.scope.device_id)
            ));
            let result = this
                .inner
                .client
                .put(url)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            if let Err(e) = result {
                tracing::debug!("Device status update failed: {}", e);
            }
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.inner.events.subscribe()
    }

    fn connectivity(&self) -> Connectivity {
        *self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decode playlist entries, skipping the ones that do not parse.
/// One malformed entry should not cost the whole playlist.
pub(crate) fn parse_playlist(raw: Vec<serde_json::Value>) -> Vec<ContentItem> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<ContentItem>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Skipping malformed playlist entry: {}", e);
                None
            }
        })
        .collect()
}

fn load_snapshot(path: &Path) -> Option<Vec<ContentItem>> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(items) => Some(items),
        Err(e) => {
            tracing::warn!("Ignoring unreadable playlist snapshot {:?}: {}", path, e);
            None
        }
    }
}
