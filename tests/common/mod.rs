//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use signage_player::assets::{AssetLoader, AssetMetadata, AssetPayload, FetchedAsset};
use signage_player::content::{ContentItem, ContentType};
use signage_player::profile::{DeviceProfile, ProfileUpdate};
use signage_player::source::{Connectivity, ContentSource, DeviceStatus, SourceEvent};
use signage_player::surface::{HeadlessSurface, SurfaceProbe, Surfaces};
use signage_player::{PlayerError, Result, Settings, SignagePlayer};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// In-memory content source that records what the player reports.
pub struct FakeSource {
    playlist: Option<Vec<ContentItem>>,
    reports: Mutex<Vec<String>>,
    statuses: Mutex<Vec<DeviceStatus>>,
    events: broadcast::Sender<SourceEvent>,
}

impl FakeSource {
    pub fn new(items: Vec<ContentItem>) -> Arc<Self> {
        Arc::new(Self {
            playlist: Some(items),
            reports: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            events: broadcast::channel(16).0,
        })
    }

    /// A source that behaves like an unreachable server with no snapshot.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            playlist: None,
            reports: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            events: broadcast::channel(16).0,
        })
    }

    pub fn push(&self, event: SourceEvent) {
        self.events.send(event).unwrap();
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.status.clone())
            .collect()
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    async fn fetch_playlist(&self) -> Result<Vec<ContentItem>> {
        self.playlist.clone().ok_or(PlayerError::ContentUnavailable)
    }

    async fn resolve_optimized_url(&self, id: &str, _: &DeviceProfile) -> Result<String> {
        Ok(format!("http://cdn/{}?optimized", id))
    }

    async fn fetch_profile(&self) -> Result<Option<ProfileUpdate>> {
        Ok(None)
    }

    fn report_playback(&self, id: &str) {
        self.reports.lock().unwrap().push(id.to_string());
    }

    fn update_device_status(&self, status: DeviceStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    fn connectivity(&self) -> Connectivity {
        Connectivity::Online
    }
}

/// Loader that succeeds immediately unless told otherwise.
#[derive(Default)]
pub struct InstantLoader {
    failing: HashSet<String>,
}

impl InstantLoader {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl AssetLoader for InstantLoader {
    async fn load(&self, item: &ContentItem, _: &DeviceProfile) -> anyhow::Result<FetchedAsset> {
        if self.failing.contains(&item.id) {
            anyhow::bail!("origin returned 503");
        }
        Ok(FetchedAsset {
            url: item.url.clone(),
            payload: AssetPayload::Remote(format!("{}#prefetched", item.url)),
            metadata: AssetMetadata::default(),
            extension: "url",
        })
    }
}

pub fn video(id: &str, secs: f64) -> ContentItem {
    ContentItem::new(id, ContentType::Video, format!("http://cdn/{}.mp4", id), secs)
}

pub fn image(id: &str, secs: f64) -> ContentItem {
    ContentItem::new(id, ContentType::Image, format!("http://cdn/{}.jpg", id), secs)
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.device.device_id = "test-device".into();
    settings.profile.fetch_remote = false;
    settings
}

pub struct Harness {
    pub player: SignagePlayer,
    pub source: Arc<FakeSource>,
    pub probe: SurfaceProbe,
}

pub async fn start_with(settings: &Settings, source: Arc<FakeSource>) -> Result<Harness> {
    let (a, b, probe) = HeadlessSurface::pair();
    let surfaces = Surfaces::new(Box::new(a), Box::new(b));
    let player = SignagePlayer::start(
        settings,
        source.clone(),
        Arc::new(InstantLoader::default()),
        surfaces,
    )
    .await?;
    Ok(Harness {
        player,
        source,
        probe,
    })
}

pub async fn start_player(items: Vec<ContentItem>) -> Harness {
    start_with(&settings(), FakeSource::new(items)).await.unwrap()
}

/// Let spawned work finish without moving the clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn sleep_secs(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}
