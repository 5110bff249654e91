//! Playback cache and prefetch engine.
//!
//! Keeps a rolling window of upcoming content ready to render. Fetches run
//! under a concurrency ceiling, at most one per content id, and entries age
//! out after a fixed TTL. A disk directory makes entries survive restarts
//! when it is available; without it the cache works from memory.

use crate::assets::{AssetHandle, AssetLoader, AssetMetadata, AssetPayload, FetchedAsset};
use crate::config::CacheSettings;
use crate::content::ContentItem;
use crate::error::PrefetchError;
use crate::prefetch::{build_queue, PrefetchQueueEntry};
use crate::profile::DeviceProfile;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

type InFlightFuture = Shared<BoxFuture<'static, Result<CacheEntry, PrefetchError>>>;

/// A fully fetched, render-ready asset.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: String,
    /// Playlist URL the entry was loaded for.
    pub source_url: String,
    /// URL actually fetched (with device hints).
    pub fetched_url: String,
    pub handle: AssetHandle,
    pub metadata: AssetMetadata,
    pub loaded_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether this entry was loaded for the item as it appears now.
    pub fn is_fresh_for(&self, item: &ContentItem) -> bool {
        self.id == item.id && self.source_url == item.url
    }
}

/// Notifications about prefetch outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    ContentReady { id: String },
    PrefetchFailed(PrefetchError),
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub pinned: usize,
    pub bytes: u64,
    pub fetches_started: u64,
    pub failures: u64,
    pub durable: bool,
}

struct InFlight {
    source_url: String,
    future: InFlightFuture,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    in_flight: HashMap<String, InFlight>,
    queue: Vec<PrefetchQueueEntry>,
    pinned: HashSet<String>,
    profile: Option<DeviceProfile>,
    fetches_started: u64,
    failures: u64,
}

struct Inner {
    state: Mutex<CacheState>,
    loader: Arc<dyn AssetLoader>,
    store: Option<DiskStore>,
    settings: CacheSettings,
    events: broadcast::Sender<CacheEvent>,
    draining: AtomicBool,
}

/// Shared handle to the playback cache.
#[derive(Clone)]
pub struct PlaybackCache {
    inner: Arc<Inner>,
}

enum Step {
    Ready(CacheEntry),
    Wait(InFlightFuture),
    WaitStale(InFlightFuture),
}

impl PlaybackCache {
    /// Create a cache. Restores durable entries when `settings.dir` is usable.
    pub fn new(settings: CacheSettings, loader: Arc<dyn AssetLoader>) -> Self {
        let store = settings.dir.as_ref().and_then(|dir| match DiskStore::open(dir) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(
                    "Cache directory {:?} unavailable, using memory only: {:#}",
                    dir,
                    e
                );
                None
            }
        });

        let mut entries = LruCache::unbounded();
        if let Some(ref store) = store {
            for entry in store.scan() {
                entries.put(entry.id.clone(), entry);
            }
            tracing::info!("Cache restored {} entries from {:?}", entries.len(), store.dir);
        }

        let (events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    entries,
                    in_flight: HashMap::new(),
                    queue: Vec::new(),
                    pinned: HashSet::new(),
                    profile: None,
                    fetches_started: 0,
                    failures: 0,
                }),
                loader,
                store,
                settings,
                events,
                draining: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Non-blocking lookup by id.
    pub fn lookup(&self, id: &str) -> Option<CacheEntry> {
        self.state().entries.get(id).cloned()
    }

    /// Lookup that misses when the entry was loaded for a different URL.
    pub fn lookup_fresh(&self, item: &ContentItem) -> Option<CacheEntry> {
        self.state()
            .entries
            .get(&item.id)
            .filter(|entry| entry.is_fresh_for(item))
            .cloned()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.state().in_flight.contains_key(id)
    }

    /// Fetch `item` unless it is cached; attach to an in-flight fetch if there is one.
    pub async fn prefetch(
        &self,
        item: &ContentItem,
        profile: &DeviceProfile,
    ) -> Result<CacheEntry, PrefetchError> {
        loop {
            let step = {
                let mut state = self.state();
                let fresh = state
                    .entries
                    .get(&item.id)
                    .filter(|e| e.is_fresh_for(item))
                    .cloned();
                let pending = state
                    .in_flight
                    .get(&item.id)
                    .map(|p| (p.future.clone(), p.source_url == item.url));

                match (fresh, pending) {
                    (Some(entry), _) => Step::Ready(entry),
                    (None, Some((future, true))) => Step::Wait(future),
                    (None, Some((future, false))) => Step::WaitStale(future),
                    (None, None) => {
                        Step::Wait(self.start_fetch(&mut state, item.clone(), profile.clone()))
                    }
                }
            };

            match step {
                Step::Ready(entry) => return Ok(entry),
                Step::Wait(future) => return future.await,
                // A fetch for an older URL of this id must finish first.
                Step::WaitStale(future) => {
                    let _ = future.await;
                }
            }
        }
    }

    fn start_fetch(
        &self,
        state: &mut CacheState,
        item: ContentItem,
        profile: DeviceProfile,
    ) -> InFlightFuture {
        state.fetches_started += 1;

        let id = item.id.clone();
        let source_url = item.url.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.fetch_and_store(item, profile).await });

        let task_id = id.clone();
        let future = async move {
            handle.await.unwrap_or_else(|e| {
                Err(PrefetchError::Load {
                    id: task_id,
                    reason: format!("fetch task failed: {}", e),
                })
            })
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            id,
            InFlight {
                source_url,
                future: future.clone(),
            },
        );
        future
    }

    async fn fetch_and_store(
        &self,
        item: ContentItem,
        profile: DeviceProfile,
    ) -> Result<CacheEntry, PrefetchError> {
        let timeout = self.inner.settings.fetch_timeout();
        let loaded = tokio::time::timeout(timeout, self.inner.loader.load(&item, &profile)).await;

        let result = match loaded {
            Ok(Ok(fetched)) => Ok(self.persist(&item, fetched).await),
            Ok(Err(e)) => Err(PrefetchError::Load {
                id: item.id.clone(),
                reason: format!("{:#}", e),
            }),
            Err(_) => Err(PrefetchError::Timeout {
                id: item.id.clone(),
                after: timeout,
            }),
        };

        {
            let mut state = self.state();
            state.in_flight.remove(&item.id);
            match result {
                Ok(ref entry) => {
                    state.entries.put(entry.id.clone(), entry.clone());
                    self.enforce_capacity(&mut state);
                }
                Err(_) => state.failures += 1,
            }
        }

        match result {
            Ok(ref entry) => {
                tracing::debug!(
                    "Cached {} ({}, {:.2} KB)",
                    entry.id,
                    entry.handle.describe(),
                    entry.metadata.size as f64 / 1024.0
                );
                let _ = self.inner.events.send(CacheEvent::ContentReady {
                    id: entry.id.clone(),
                });
            }
            Err(ref e) => {
                let _ = self.inner.events.send(CacheEvent::PrefetchFailed(e.clone()));
            }
        }

        result
    }

    /// Store the fetched asset on disk when possible, else keep it in memory.
    async fn persist(&self, item: &ContentItem, fetched: FetchedAsset) -> CacheEntry {
        let FetchedAsset {
            url,
            payload,
            metadata,
            extension,
        } = fetched;

        let mut entry = CacheEntry {
            id: item.id.clone(),
            source_url: item.url.clone(),
            fetched_url: url,
            handle: match payload {
                AssetPayload::Remote(ref remote) => AssetHandle::Remote(remote.clone()),
                AssetPayload::Bytes(ref bytes) => AssetHandle::Memory(bytes.clone()),
            },
            metadata,
            loaded_at: Utc::now(),
        };

        if let Some(ref store) = self.inner.store {
            match store.write(&entry, &payload, extension).await {
                Ok(handle) => entry.handle = handle,
                Err(e) => tracing::warn!("Failed to persist {} to disk: {:#}", item.id, e),
            }
        }

        entry
    }

    /// Evict least recently used entries above capacity, skipping pinned ones.
    fn enforce_capacity(&self, state: &mut CacheState) {
        while state.entries.len() > self.inner.settings.max_entries {
            let victim = state
                .entries
                .iter()
                .rev()
                .map(|(key, _)| key.clone())
                .find(|key| !state.pinned.contains(key));

            let Some(key) = victim else {
                break;
            };

            if let Some(entry) = state.entries.pop(&key) {
                tracing::debug!("Evicting {} (capacity)", key);
                self.remove_stored(&entry);
            }
        }
    }

    fn remove_stored(&self, entry: &CacheEntry) {
        if let Some(ref store) = self.inner.store {
            store.remove(&entry.id);
        }
    }

    /// Rebuild the prefetch queue for `playlist` around `position` and start draining.
    pub fn schedule(&self, playlist: &[ContentItem], profile: &DeviceProfile, position: usize) {
        let queue = build_queue(playlist, position);

        {
            let mut state = self.state();
            state.profile = Some(profile.clone());

            // Entries loaded for a URL the new snapshot no longer uses are stale.
            let stale: Vec<String> = playlist
                .iter()
                .filter(|item| !state.pinned.contains(&item.id))
                .filter(|item| {
                    state
                        .entries
                        .peek(&item.id)
                        .map(|entry| entry.source_url != item.url)
                        .unwrap_or(false)
                })
                .map(|item| item.id.clone())
                .collect();
            for id in stale {
                if let Some(entry) = state.entries.pop(&id) {
                    tracing::debug!("Dropping {} cached for an outdated URL", id);
                    self.remove_stored(&entry);
                }
            }

            let pending: Vec<PrefetchQueueEntry> = queue
                .into_iter()
                .filter(|queued| {
                    !state
                        .entries
                        .peek(&queued.item.id)
                        .map(|entry| entry.is_fresh_for(&queued.item))
                        .unwrap_or(false)
                })
                .collect();
            state.queue = pending;

            tracing::debug!("Prefetch queue rebuilt with {} items", state.queue.len());
        }

        self.spawn_drain();
    }

    fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    fn spawn_drain(&self) {
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.drain().await;
                this.inner.draining.store(false, Ordering::SeqCst);
                // A schedule() may have refilled the queue after the last check.
                if this.queue_len() == 0 || this.inner.draining.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        });
    }

    /// Take the next batch: highest priority first, not cached, not in flight.
    fn next_batch(&self) -> Option<(Vec<ContentItem>, DeviceProfile)> {
        let mut state = self.state();
        let profile = state.profile.clone()?;

        let CacheState {
            ref mut queue,
            ref entries,
            ref in_flight,
            ..
        } = *state;

        queue.retain(|queued| {
            !entries
                .peek(&queued.item.id)
                .map(|entry| entry.is_fresh_for(&queued.item))
                .unwrap_or(false)
        });

        let batch: Vec<ContentItem> = queue
            .iter()
            .filter(|queued| !in_flight.contains_key(&queued.item.id))
            .take(self.inner.settings.max_concurrent.max(1))
            .map(|queued| queued.item.clone())
            .collect();

        Some((batch, profile))
    }

    /// Work through the queue in bounded batches with a cooldown between them.
    pub async fn drain(&self) {
        loop {
            let Some((batch, profile)) = self.next_batch() else {
                break;
            };

            if !batch.is_empty() {
                let results = join_all(batch.iter().map(|item| self.prefetch(item, &profile))).await;

                let mut state = self.state();
                for (item, result) in batch.iter().zip(results) {
                    state.queue.retain(|queued| queued.item.id != item.id);
                    if let Err(e) = result {
                        tracing::warn!("Prefetch failed, dropped from queue: {}", e);
                    }
                }
            }

            if self.queue_len() == 0 {
                break;
            }

            tokio::time::sleep(self.inner.settings.cooldown()).await;
        }
    }

    /// Replace the set of ids currently mounted on a surface.
    pub fn pin<I>(&self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.state().pinned = ids.into_iter().collect();
    }

    /// Purge entries older than the TTL.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Purge entries older than the TTL as of `now`. Pinned entries stay.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.inner.settings.ttl())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let mut state = self.state();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(id, entry)| now - entry.loaded_at > ttl && !state.pinned.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = state.entries.pop(id) {
                self.remove_stored(&entry);
            }
        }

        if !expired.is_empty() {
            tracing::info!("Swept {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Run `sweep` periodically in the background.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.inner.settings.sweep_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }

    /// Drop every entry that is not mounted and forget the queue.
    pub fn clear(&self) {
        let mut state = self.state();
        state.queue.clear();
        let ids: Vec<String> = state
            .entries
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !state.pinned.contains(id))
            .collect();
        for id in ids {
            if let Some(entry) = state.entries.pop(&id) {
                self.remove_stored(&entry);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            entries: state.entries.len(),
            in_flight: state.in_flight.len(),
            queued: state.queue.len(),
            pinned: state.pinned.len(),
            bytes: state.entries.iter().map(|(_, e)| e.metadata.size).sum(),
            fetches_started: state.fetches_started,
            failures: state.failures,
            durable: self.inner.store.is_some(),
        }
    }
}

/// On-disk layout: `<dir>/<sha256(id)>/{asset.<ext>, meta.json}`.
struct DiskStore {
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    id: String,
    source_url: String,
    fetched_url: String,
    metadata: AssetMetadata,
    loaded_at: DateTime<Utc>,
    /// Asset file name, or `None` for remote-only assets.
    file: Option<String>,
}

const META_FILE: &str = "meta.json";

impl DiskStore {
    fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).context("Failed to create cache directory")?;
        // Probe writability up front so a read-only mount degrades to memory.
        let probe = dir.join(".probe");
        fs::write(&probe, b"").context("Cache directory is not writable")?;
        let _ = fs::remove_file(&probe);
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_dir(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{:x}", Sha256::digest(id.as_bytes())))
    }

    async fn write(
        &self,
        entry: &CacheEntry,
        payload: &AssetPayload,
        extension: &str,
    ) -> Result<AssetHandle> {
        let dir = self.entry_dir(&entry.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create entry directory")?;

        let (handle, file) = match payload {
            AssetPayload::Bytes(bytes) => {
                let name = format!("asset.{}", extension);
                let path = dir.join(&name);
                let mut out = tokio::fs::File::create(&path)
                    .await
                    .context("Failed to create cache file")?;
                out.write_all(bytes)
                    .await
                    .context("Failed to write cache file")?;
                out.flush().await.context("Failed to flush cache file")?;
                (AssetHandle::File(path), Some(name))
            }
            AssetPayload::Remote(url) => (AssetHandle::Remote(url.clone()), None),
        };

        let stored = StoredEntry {
            id: entry.id.clone(),
            source_url: entry.source_url.clone(),
            fetched_url: entry.fetched_url.clone(),
            metadata: entry.metadata.clone(),
            loaded_at: entry.loaded_at,
            file,
        };
        let json = serde_json::to_vec_pretty(&stored).context("Failed to serialize entry")?;
        tokio::fs::write(dir.join(META_FILE), json)
            .await
            .context("Failed to write entry metadata")?;

        Ok(handle)
    }

    fn remove(&self, id: &str) {
        let dir = self.entry_dir(id);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!("Failed to remove cached entry {:?}: {}", dir, e);
            }
        }
    }

    /// Restore entries written by a previous run.
    fn scan(&self) -> Vec<CacheEntry> {
        let mut restored = Vec::new();

        for meta in WalkDir::new(&self.dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == META_FILE)
        {
            let Some(dir) = meta.path().parent() else {
                continue;
            };

            let stored = fs::read(meta.path())
                .ok()
                .and_then(|bytes| serde_json::from_slice::<StoredEntry>(&bytes).ok());

            let Some(stored) = stored else {
                tracing::debug!("Discarding unreadable cache entry {:?}", dir);
                let _ = fs::remove_dir_all(dir);
                continue;
            };

            let handle = match stored.file {
                Some(ref name) => {
                    let path = dir.join(name);
                    if !path.exists() {
                        let _ = fs::remove_dir_all(dir);
                        continue;
                    }
                    AssetHandle::File(path)
                }
                None => AssetHandle::Remote(stored.fetched_url.clone()),
            };

            restored.push(CacheEntry {
                id: stored.id,
                source_url: stored.source_url,
                fetched_url: stored.fetched_url,
                handle,
                metadata: stored.metadata,
                loaded_at: stored.loaded_at,
            });
        }

        restored
    }
}
