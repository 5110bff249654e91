//! Player facade for the shell.
//!
//! Wires settings, the content source, the cache and the scheduler
//! together and exposes the playback controls.

use crate::assets::{AssetLoader, HttpAssetLoader};
use crate::cache::PlaybackCache;
use crate::config::Settings;
use crate::content::ContentItem;
use crate::error::{PlayerError, Result};
use crate::profile::DeviceProfile;
use crate::realtime::spawn_realtime;
use crate::scheduler::{PlaybackStatus, Scheduler, SchedulerConfig, SchedulerHandle};
use crate::source::{ContentSource, HttpContentSource, Scope};
use crate::surface::Surfaces;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct SignagePlayer {
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    cache: PlaybackCache,
}

impl SignagePlayer {
    /// Connect to the content server described by `settings` and start playing.
    pub async fn initialize(settings: Settings, scope: Scope, surfaces: Surfaces) -> Result<Self> {
        let source = HttpContentSource::new(&settings, scope)?;
        let loader = HttpAssetLoader::new(source.client().clone(), settings.server_url.clone());

        let mut player =
            Self::start(&settings, Arc::new(source.clone()), Arc::new(loader), surfaces).await?;

        if settings.network.realtime {
            player
                .background
                .push(spawn_realtime(source, settings.network.clone()));
        }

        Ok(player)
    }

    /// Start with an explicit source and loader.
    ///
    /// Fails with `ContentUnavailable` when there is no playlist from the
    /// source, no stored snapshot and no configured fallback.
    pub async fn start(
        settings: &Settings,
        source: Arc<dyn ContentSource>,
        loader: Arc<dyn AssetLoader>,
        surfaces: Surfaces,
    ) -> Result<Self> {
        let profile = load_profile(settings, source.as_ref()).await;
        tracing::info!(
            "Device {} at {} ({} formats)",
            profile.device_id,
            profile.resolution,
            profile.supported_formats.len()
        );

        let playlist = match source.fetch_playlist().await {
            Ok(items) => items,
            Err(PlayerError::ContentUnavailable) if !settings.fallback_playlist.is_empty() => {
                tracing::warn!(
                    "No content from the network, using fallback playlist ({} items)",
                    settings.fallback_playlist.len()
                );
                settings.fallback_playlist.clone()
            }
            Err(e) => return Err(e),
        };

        let cache = PlaybackCache::new(settings.cache.clone(), loader);
        let sweeper = cache.spawn_sweeper();

        let config = SchedulerConfig {
            skip_grace: settings.playback.skip_grace(),
            preroll: settings.playback.preroll(),
        };
        let (scheduler, scheduler_task) =
            Scheduler::spawn(config, source, cache.clone(), surfaces, profile, playlist);

        scheduler.play().await?;

        Ok(Self {
            scheduler,
            scheduler_task,
            background: vec![sweeper],
            cache,
        })
    }

    pub async fn play(&self) -> Result<()> {
        self.scheduler.play().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.scheduler.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.scheduler.resume().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop().await
    }

    pub async fn next(&self) -> Result<()> {
        self.scheduler.next().await
    }

    pub async fn previous(&self) -> Result<()> {
        self.scheduler.previous().await
    }

    pub async fn status(&self) -> Result<PlaybackStatus> {
        self.scheduler.status().await
    }

    pub async fn current_content(&self) -> Result<Option<ContentItem>> {
        self.scheduler.current_item().await
    }

    /// The effective (filtered and optimized) playlist.
    pub async fn playlist(&self) -> Result<Vec<ContentItem>> {
        self.scheduler.playlist().await
    }

    pub fn cache(&self) -> &PlaybackCache {
        &self.cache
    }

    /// Stop the scheduler and background tasks.
    pub async fn shutdown(self) -> Result<()> {
        let result = self.scheduler.shutdown().await;

        if let Err(e) = self.scheduler_task.await {
            tracing::warn!("Scheduler task ended abnormally: {}", e);
        }
        for task in self.background {
            task.abort();
        }

        result
    }
}

/// Configured profile, refined by whatever the server has stored.
async fn load_profile(settings: &Settings, source: &dyn ContentSource) -> DeviceProfile {
    let mut profile = settings.device_profile(&settings.device.device_id);

    if settings.profile.fetch_remote {
        match source.fetch_profile().await {
            Ok(Some(update)) => {
                tracing::info!("Applying stored device profile");
                profile.update(update);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not load stored device profile: {}", e),
        }
    }

    profile
}
