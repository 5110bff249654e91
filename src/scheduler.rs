//! Playback scheduler.
//!
//! A single task owns the surfaces, the playlist cursor and the advance
//! timer. Everything else talks to it through [`SchedulerHandle`]. Asset
//! resolution runs in spawned tasks and reports back tagged with a ticket;
//! a result whose ticket is no longer current is dropped.

use crate::assets::AssetHandle;
use crate::cache::{CacheStats, PlaybackCache};
use crate::content::ContentItem;
use crate::error::{PlayerError, Result};
use crate::profile::DeviceProfile;
use crate::source::{Connectivity, ContentSource, DeviceStatus, SourceEvent};
use crate::surface::{MountedAsset, SlotId, Surfaces};
use crate::timer::{sleep_until_opt, AdvanceTimer, TimerPhase};
use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Error,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading => "loading",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Error => "error",
        }
    }
}

/// Snapshot of the scheduler for the shell.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub current_index: usize,
    pub current_id: Option<String>,
    pub playlist_len: usize,
    /// Playlist snapshot version, bumped on every replacement.
    pub snapshot: u64,
    /// Time left on the current item, when a timer is pending or frozen.
    pub remaining: Option<Duration>,
    pub front: SlotId,
    pub connectivity: Connectivity,
    pub cache: CacheStats,
}

/// Scheduler tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub skip_grace: Duration,
    pub preroll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            skip_grace: Duration::from_secs(5),
            preroll: Duration::ZERO,
        }
    }
}

/// Items the profile can play, rewritten for the device.
///
/// Items without a usable slot length are dropped too.
pub fn effective_playlist(raw: &[ContentItem], profile: &DeviceProfile) -> Vec<ContentItem> {
    raw.iter()
        .filter(|item| {
            if item.slot_duration().is_none() {
                tracing::warn!("Dropping {}: invalid duration {}", item.id, item.duration);
                return false;
            }
            if !profile.accepts(item) {
                tracing::debug!("Dropping {}: not supported by this display", item.id);
                return false;
            }
            true
        })
        .map(|item| profile.optimize(item))
        .collect()
}

/// Find something renderable for `item`: a fresh cache entry, the result of
/// an in-flight prefetch, or a direct optimized URL.
pub async fn resolve_asset(
    cache: &PlaybackCache,
    source: &dyn ContentSource,
    profile: &DeviceProfile,
    item: &ContentItem,
) -> Result<AssetHandle> {
    if let Some(entry) = cache.lookup_fresh(item) {
        return Ok(entry.handle);
    }

    if cache.is_in_flight(&item.id) {
        match cache.prefetch(item, profile).await {
            Ok(entry) => return Ok(entry.handle),
            Err(e) => tracing::debug!("In-flight prefetch failed, resolving directly: {}", e),
        }
    }

    let url = source.resolve_optimized_url(&item.id, profile).await?;
    Ok(AssetHandle::Remote(url))
}

enum Command {
    Play,
    Pause,
    Resume,
    Stop,
    Next,
    Previous,
    Status(oneshot::Sender<PlaybackStatus>),
    Current(oneshot::Sender<Option<ContentItem>>),
    Playlist(oneshot::Sender<Vec<ContentItem>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    /// Load into the back and swap straight away.
    Present,
    /// Load into the back and wait for the timer.
    Preload,
}

struct Resolved {
    ticket: u64,
    snapshot: u64,
    purpose: Purpose,
    index: usize,
    item: ContentItem,
    result: Result<AssetHandle>,
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PlayerError::SchedulerClosed)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| PlayerError::SchedulerClosed)
    }

    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn next(&self) -> Result<()> {
        self.send(Command::Next).await
    }

    pub async fn previous(&self) -> Result<()> {
        self.send(Command::Previous).await
    }

    pub async fn status(&self) -> Result<PlaybackStatus> {
        self.ask(Command::Status).await
    }

    pub async fn current_item(&self) -> Result<Option<ContentItem>> {
        self.ask(Command::Current).await
    }

    pub async fn playlist(&self) -> Result<Vec<ContentItem>> {
        self.ask(Command::Playlist).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    source: Arc<dyn ContentSource>,
    cache: PlaybackCache,
    surfaces: Surfaces,
    profile: DeviceProfile,

    raw_playlist: Vec<ContentItem>,
    playlist: Vec<ContentItem>,
    snapshot: u64,
    index: usize,

    state: PlaybackState,
    paused_from: PlaybackState,
    /// Set by `play()`; content arriving while idle starts playback.
    wants_playback: bool,
    /// Resume must present the cursor item instead of thawing the timer.
    present_on_resume: bool,
    /// Visible item that is no longer in the playlist. It stays current
    /// until the next swap; meanwhile the cursor rests on its predecessor.
    detached: Option<ContentItem>,

    timer: AdvanceTimer,
    ticket: u64,
    pending: Option<Purpose>,

    commands: mpsc::Receiver<Command>,
    events: Option<broadcast::Receiver<SourceEvent>>,
    results_tx: mpsc::UnboundedSender<Resolved>,
    results_rx: mpsc::UnboundedReceiver<Resolved>,
}

impl Scheduler {
    /// Start the scheduler task with `playlist` loaded but not playing.
    pub fn spawn(
        config: SchedulerConfig,
        source: Arc<dyn ContentSource>,
        cache: PlaybackCache,
        surfaces: Surfaces,
        profile: DeviceProfile,
        playlist: Vec<ContentItem>,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let events = Some(source.subscribe());

        let mut scheduler = Scheduler {
            config,
            source,
            cache,
            surfaces,
            profile,
            raw_playlist: Vec::new(),
            playlist: Vec::new(),
            snapshot: 0,
            index: 0,
            state: PlaybackState::Idle,
            paused_from: PlaybackState::Playing,
            wants_playback: false,
            present_on_resume: false,
            detached: None,
            timer: AdvanceTimer::new(),
            ticket: 0,
            pending: None,
            commands: rx,
            events,
            results_tx,
            results_rx,
        };

        let task = tokio::spawn(async move {
            scheduler.replace_playlist(playlist);
            scheduler.run().await;
        });

        (SchedulerHandle { commands: tx }, task)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.timer.deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(resolved) = self.results_rx.recv() => self.handle_resolved(resolved).await,
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.events = None,
                },
                _ = sleep_until_opt(deadline) => self.handle_timer(),
            }
        }

        self.timer.cancel();
        self.surfaces.pause_front();
        tracing::info!("Scheduler stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::Next => self.step(true),
            Command::Previous => self.step(false),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Current(reply) => {
                let _ = reply.send(self.current_item().cloned());
            }
            Command::Playlist(reply) => {
                let _ = reply.send(self.playlist.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::ContentUpdate(items) => self.replace_playlist(items),
            SourceEvent::ProfileUpdate(update) => {
                tracing::info!("Device profile updated");
                self.profile.update(update);
                let raw = std::mem::take(&mut self.raw_playlist);
                self.replace_playlist(raw);
            }
            SourceEvent::Disconnected | SourceEvent::Reconnected | SourceEvent::Offline => {
                tracing::info!("Source connectivity: {:?}", event);
                self.publish_status();
            }
        }
    }

    fn handle_timer(&mut self) {
        match self.timer.fire() {
            Some(TimerPhase::Preroll) => {
                self.surfaces.preroll_back();
                self.timer.arm(self.config.preroll, TimerPhase::Advance);
            }
            Some(TimerPhase::Advance) => {
                if !matches!(self.state, PlaybackState::Paused | PlaybackState::Idle) {
                    self.advance();
                }
            }
            None => {}
        }
    }

    async fn handle_resolved(&mut self, resolved: Resolved) {
        if resolved.ticket != self.ticket || resolved.snapshot != self.snapshot {
            tracing::debug!("Discarding stale resolution for {}", resolved.item.id);
            return;
        }
        self.pending = None;

        let Resolved {
            purpose,
            index,
            item,
            result,
            snapshot,
            ..
        } = resolved;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => return self.resolution_failed(purpose, &item, e),
        };

        let asset = MountedAsset {
            item: item.clone(),
            handle,
            snapshot,
        };
        if let Err(e) = self.surfaces.load_back(asset).await {
            return self.resolution_failed(purpose, &item, e.into());
        }
        self.cache.pin(self.surfaces.mounted_ids());

        match purpose {
            Purpose::Preload => {
                tracing::debug!("Preloaded {} (index {})", item.id, index);
            }
            Purpose::Present if self.state == PlaybackState::Paused => {
                self.present_on_resume = true;
            }
            Purpose::Present => {
                self.index = index;
                self.present_back();
            }
        }
    }

    fn resolution_failed(&mut self, purpose: Purpose, item: &ContentItem, error: PlayerError) {
        match purpose {
            // The advance will try again and skip if it still fails.
            Purpose::Preload => tracing::warn!("Preload of {} failed: {}", item.id, error),
            Purpose::Present if self.state == PlaybackState::Paused => {
                tracing::warn!("Render of {} failed while paused: {}", item.id, error);
            }
            Purpose::Present => {
                tracing::error!("Render of {} failed: {}", item.id, error);
                self.set_state(PlaybackState::Error);
                self.timer.arm(self.config.skip_grace, TimerPhase::Advance);
            }
        }
    }

    fn play(&mut self) {
        match self.state {
            PlaybackState::Idle => self.start(),
            PlaybackState::Paused => self.resume(),
            _ => {}
        }
    }

    fn start(&mut self) {
        self.wants_playback = true;
        if self.playlist.is_empty() {
            tracing::warn!("Nothing to play");
            return;
        }

        self.timer.cancel();
        match self.first_active_from(self.index) {
            Some(index) => {
                self.index = index;
                self.request(Purpose::Present, index);
            }
            None => {
                tracing::info!("No content is scheduled right now");
                self.set_state(PlaybackState::Loading);
                self.timer.arm(self.config.skip_grace, TimerPhase::Advance);
            }
        }
    }

    fn pause(&mut self) {
        if matches!(
            self.state,
            PlaybackState::Playing | PlaybackState::Error | PlaybackState::Loading
        ) {
            self.paused_from = self.state;
            self.timer.freeze();
            self.surfaces.pause_front();
            self.set_state(PlaybackState::Paused);
        }
    }

    fn resume(&mut self) {
        if self.state != PlaybackState::Paused {
            return;
        }

        if self.playlist.is_empty() {
            self.go_idle();
            return;
        }

        if std::mem::take(&mut self.present_on_resume) {
            self.present_index(self.index);
        } else if self.timer.thaw() {
            self.surfaces.play_front();
            self.set_state(self.paused_from);
        } else if self.pending == Some(Purpose::Present) {
            self.set_state(PlaybackState::Loading);
        } else {
            self.present_index(self.index);
        }
    }

    fn stop(&mut self) {
        self.detached = None;
        self.timer.cancel();
        self.surfaces.pause_front();
        self.index = 0;
        self.discard_pending();
        self.present_on_resume = true;
        self.paused_from = PlaybackState::Playing;
        self.set_state(PlaybackState::Paused);
    }

    /// Manual skip: exactly one position, regardless of scheduling windows.
    fn step(&mut self, forward: bool) {
        let len = self.playlist.len();
        if len == 0 {
            return;
        }

        self.detached = None;
        self.index = if forward {
            (self.index + 1) % len
        } else {
            (self.index + len - 1) % len
        };

        match self.state {
            PlaybackState::Idle => {}
            PlaybackState::Paused => {
                self.timer.cancel();
                self.discard_pending();
                self.present_on_resume = true;
            }
            _ => {
                self.timer.cancel();
                self.present_index(self.index);
            }
        }
    }

    /// Timer-driven move to the next scheduled item.
    fn advance(&mut self) {
        if self.playlist.is_empty() {
            self.go_idle();
            return;
        }

        match self.next_active_index(self.index) {
            Some(target) => {
                self.index = target;
                self.present_index(target);
            }
            None => {
                tracing::info!("No content is scheduled right now, checking again shortly");
                self.timer.arm(self.config.skip_grace, TimerPhase::Advance);
            }
        }
    }

    fn go_idle(&mut self) {
        self.detached = None;
        self.timer.cancel();
        self.discard_pending();
        self.surfaces.clear_all();
        self.cache.pin(Vec::new());
        self.set_state(PlaybackState::Idle);
    }

    /// Swap in the back if it already holds `index`, else resolve it first.
    fn present_index(&mut self, index: usize) {
        if self.back_matches(index) {
            self.present_back();
        } else {
            self.request(Purpose::Present, index);
        }
    }

    fn back_matches(&self, index: usize) -> bool {
        match (self.surfaces.back_asset(), self.playlist.get(index)) {
            (Some(asset), Some(item)) => {
                asset.snapshot == self.snapshot
                    && asset.item.id == item.id
                    && asset.item.url == item.url
            }
            _ => false,
        }
    }

    fn present_back(&mut self) {
        self.timer.cancel();
        self.discard_pending();

        let Some(asset) = self.surfaces.swap().cloned() else {
            self.request(Purpose::Present, self.index);
            return;
        };
        self.detached = None;

        tracing::info!(
            "Now playing {} ({}/{}) on surface {}",
            asset.item.id,
            self.index + 1,
            self.playlist.len(),
            self.surfaces.front()
        );
        self.source.report_playback(&asset.item.id);
        self.set_state(PlaybackState::Playing);

        let slot = asset.item.slot_duration().unwrap_or(self.config.skip_grace);
        self.timer.arm_slot(slot, self.config.preroll);

        self.cache.pin(self.surfaces.mounted_ids());
        self.cache.schedule(&self.playlist, &self.profile, self.index);
        self.preload_next();
    }

    fn preload_next(&mut self) {
        let len = self.playlist.len();
        if len == 0 {
            return;
        }
        let next = self
            .next_active_index(self.index)
            .unwrap_or((self.index + 1) % len);
        if !self.back_matches(next) {
            self.request(Purpose::Preload, next);
        }
    }

    /// Resolve `index` in the background. Supersedes any pending resolution.
    fn request(&mut self, purpose: Purpose, index: usize) {
        let Some(item) = self.playlist.get(index).cloned() else {
            return;
        };

        self.ticket += 1;
        self.pending = Some(purpose);
        if purpose == Purpose::Present {
            self.detached = None;
        }
        if purpose == Purpose::Present && self.state != PlaybackState::Paused {
            self.set_state(PlaybackState::Loading);
        }

        let ticket = self.ticket;
        let snapshot = self.snapshot;
        let cache = self.cache.clone();
        let source = self.source.clone();
        let profile = self.profile.clone();
        let results = self.results_tx.clone();

        tokio::spawn(async move {
            let result = resolve_asset(&cache, source.as_ref(), &profile, &item).await;
            let _ = results.send(Resolved {
                ticket,
                snapshot,
                purpose,
                index,
                item,
                result,
            });
        });
    }

    fn discard_pending(&mut self) {
        if self.pending.take().is_some() {
            self.ticket += 1;
        }
    }

    fn replace_playlist(&mut self, items: Vec<ContentItem>) {
        let cursor_id = self.playlist.get(self.index).map(|item| item.id.clone());
        let was_detached = self.detached.is_some();
        let visible = self.detached.take().or_else(|| self.visible_cursor_item());

        self.raw_playlist = items;
        self.playlist = effective_playlist(&self.raw_playlist, &self.profile);
        self.snapshot += 1;

        let len = self.playlist.len();
        tracing::info!(
            "Playlist replaced: {} of {} items playable (snapshot {})",
            len,
            self.raw_playlist.len(),
            self.snapshot
        );

        let position_of =
            |playlist: &[ContentItem], id: &str| playlist.iter().position(|item| item.id == id);
        let cursor_position = cursor_id
            .as_deref()
            .and_then(|id| position_of(&self.playlist, id));
        let visible_position = visible
            .as_ref()
            .and_then(|item| position_of(&self.playlist, &item.id));

        match (visible, visible_position) {
            (Some(_), Some(position)) => self.index = position,
            (Some(item), None) if len > 0 => {
                // Step back so the next advance lands on whatever took its place.
                self.index = match cursor_position {
                    Some(position) if was_detached => position,
                    _ => (self.index.min(len) + len - 1) % len,
                };
                tracing::debug!("{} left the playlist, finishing its slot", item.id);
                self.detached = Some(item);
            }
            _ => match cursor_position {
                Some(position) => self.index = position,
                None if self.index >= len => self.index = 0,
                None => {}
            },
        }

        let stale_back = self
            .surfaces
            .back_asset()
            .map(|asset| asset.snapshot != self.snapshot)
            .unwrap_or(false);
        if stale_back {
            self.surfaces.clear_back();
        }

        let pending = self.pending.take();
        self.ticket += 1;
        self.cache.pin(self.surfaces.mounted_ids());

        if len == 0 {
            // The visible item finishes its slot; the next advance goes idle.
            if !self.timer.is_armed()
                && matches!(self.state, PlaybackState::Loading | PlaybackState::Playing)
            {
                self.advance();
            }
            return;
        }

        self.cache.schedule(&self.playlist, &self.profile, self.index);

        match self.state {
            PlaybackState::Idle if self.wants_playback => self.start(),
            PlaybackState::Idle => {}
            PlaybackState::Loading if pending == Some(Purpose::Present) => {
                self.request(Purpose::Present, self.index);
            }
            PlaybackState::Loading => {}
            PlaybackState::Paused if pending == Some(Purpose::Present) => {
                self.present_on_resume = true;
            }
            PlaybackState::Paused | PlaybackState::Playing | PlaybackState::Error => {
                self.preload_next();
            }
        }
    }

    /// First item at or after `from` whose scheduling window is open.
    fn first_active_from(&self, from: usize) -> Option<usize> {
        let len = self.playlist.len();
        (0..len)
            .map(|step| (from + step) % len)
            .find(|&i| self.playlist[i].is_active())
    }

    /// Next scheduled item after `from`, looking at most one lap ahead.
    fn next_active_index(&self, from: usize) -> Option<usize> {
        let len = self.playlist.len();
        (1..=len)
            .map(|step| (from + step) % len)
            .find(|&i| self.playlist[i].is_active())
    }

    fn current_item(&self) -> Option<&ContentItem> {
        self.detached.as_ref().or_else(|| self.playlist.get(self.index))
    }

    /// The cursor item, when it is the one on screen.
    fn visible_cursor_item(&self) -> Option<ContentItem> {
        if self.present_on_resume
            || !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused)
        {
            return None;
        }
        let front = self.surfaces.front_asset()?;
        let cursor = self.playlist.get(self.index)?;
        (front.item.id == cursor.id).then(|| front.item.clone())
    }

    fn set_state(&mut self, next: PlaybackState) {
        if self.state == next {
            return;
        }
        tracing::info!("Playback {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.source.update_device_status(DeviceStatus {
            status: self.state.as_str().to_string(),
            connectivity: self.source.connectivity(),
            current_content_id: self.current_item().map(|item| item.id.clone()),
        });
    }

    fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            current_index: self.index,
            current_id: self.current_item().map(|item| item.id.clone()),
            playlist_len: self.playlist.len(),
            snapshot: self.snapshot,
            remaining: self.timer.remaining(),
            front: self.surfaces.front(),
            connectivity: self.source.connectivity(),
            cache: self.cache.stats(),
        }
    }
}

async fn next_event(events: &mut Option<broadcast::Receiver<SourceEvent>>) -> Option<SourceEvent> {
    let Some(rx) = events.as_mut() else {
        return pending().await;
    };

    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Missed {} source events", missed);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetLoader, AssetMetadata, AssetPayload, FetchedAsset};
    use crate::config::CacheSettings;
    use crate::content::{ContentType, Resolution};
    use crate::profile::ProfileUpdate;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct StaticSource {
        items: Vec<ContentItem>,
        events: broadcast::Sender<SourceEvent>,
    }

    impl StaticSource {
        fn new(items: Vec<ContentItem>) -> Self {
            Self {
                items,
                events: broadcast::channel(8).0,
            }
        }
    }

    #[async_trait]
    impl ContentSource for StaticSource {
        async fn fetch_playlist(&self) -> Result<Vec<ContentItem>> {
            Ok(self.items.clone())
        }

        async fn resolve_optimized_url(&self, id: &str, _: &DeviceProfile) -> Result<String> {
            self.items
                .iter()
                .find(|item| item.id == id)
                .map(|item| format!("{}?optimized", item.url))
                .ok_or_else(|| PlayerError::UrlResolutionFailed(id.to_string()))
        }

        async fn fetch_profile(&self) -> Result<Option<ProfileUpdate>> {
            Ok(None)
        }

        fn report_playback(&self, _: &str) {}

        fn update_device_status(&self, _: DeviceStatus) {}

        fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
            self.events.subscribe()
        }

        fn connectivity(&self) -> Connectivity {
            Connectivity::Online
        }
    }

    struct FixedLoader {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetLoader for FixedLoader {
        async fn load(
            &self,
            item: &ContentItem,
            _: &DeviceProfile,
        ) -> anyhow::Result<FetchedAsset> {
            self.calls.lock().unwrap().push(item.id.clone());
            Ok(FetchedAsset {
                url: item.url.clone(),
                payload: AssetPayload::Remote(format!("{}#cached", item.url)),
                metadata: AssetMetadata::default(),
                extension: "url",
            })
        }
    }

    fn profile(formats: &[&str]) -> DeviceProfile {
        let mut profile = DeviceProfile::new("dev", Resolution::new(1920, 1080));
        profile.supported_formats = formats.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>();
        profile.max_bitrate = Some(5_000);
        profile
    }

    fn item(id: &str, content_type: ContentType) -> ContentItem {
        ContentItem::new(id, content_type, format!("http://cdn/{}", id), 10.0)
    }

    #[test]
    fn test_effective_playlist_filters_and_optimizes() {
        let mut too_large = item("big", ContentType::Image);
        too_large.resolution = Some(Resolution::new(7680, 4320));
        let mut wrong_format = item("webm", ContentType::Video);
        wrong_format.format = Some("video/webm".into());
        let mut zero = item("zero", ContentType::Image);
        zero.duration = 0.0;
        let mut heavy = item("heavy", ContentType::Video);
        heavy.bitrate = Some(4_000);

        let raw = vec![
            item("img", ContentType::Image),
            too_large,
            wrong_format,
            zero,
            heavy,
        ];
        let effective = effective_playlist(&raw, &profile(&["video/mp4", "image/jpeg"]));

        let ids: Vec<_> = effective.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["img", "heavy"]);
        assert_eq!(effective[1].bitrate, Some(4_000));
    }

    #[test]
    fn test_oversized_duration_is_dropped() {
        let mut huge = item("huge", ContentType::Image);
        huge.duration = 1e20;
        let raw = vec![huge, item("i", ContentType::Image)];

        let effective = effective_playlist(&raw, &profile(&["image/jpeg"]));
        let ids: Vec<_> = effective.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i"]);
    }

    #[test]
    fn test_video_dropped_without_video_formats() {
        let raw = vec![item("v", ContentType::Video), item("i", ContentType::Image)];
        let effective = effective_playlist(&raw, &profile(&["image/jpeg"]));
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].id, "i");
    }

    #[tokio::test]
    async fn test_resolve_prefers_cache_then_url() {
        let items = vec![item("a", ContentType::Image), item("b", ContentType::Image)];
        let source = StaticSource::new(items.clone());
        let loader = Arc::new(FixedLoader {
            calls: Mutex::new(Vec::new()),
        });
        let cache = PlaybackCache::new(CacheSettings::default(), loader.clone());
        let profile = profile(&["image/jpeg"]);

        cache.prefetch(&items[0], &profile).await.unwrap();

        let cached = resolve_asset(&cache, &source, &profile, &items[0]).await.unwrap();
        assert_eq!(cached, AssetHandle::Remote("http://cdn/a#cached".into()));

        let direct = resolve_asset(&cache, &source, &profile, &items[1]).await.unwrap();
        assert_eq!(direct, AssetHandle::Remote("http://cdn/b?optimized".into()));

        let unknown = item("zzz", ContentType::Image);
        let err = resolve_asset(&cache, &source, &profile, &unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::UrlResolutionFailed(_)));
        assert_eq!(*loader.calls.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_scheduler() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = SchedulerHandle { commands: tx };
        assert!(matches!(handle.play().await, Err(PlayerError::SchedulerClosed)));
    }
}
