//! Render surfaces and the double buffer.
//!
//! Two surfaces alternate between front (visible) and back (hidden,
//! preloading). The scheduler never talks to a surface directly; it goes
//! through [`Surfaces`], which keeps exactly one of them visible.

use crate::assets::AssetHandle;
use crate::content::ContentItem;
use crate::error::RenderError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Names the two surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::A => write!(f, "A"),
            SlotId::B => write!(f, "B"),
        }
    }
}

/// An item together with the asset a surface should render for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MountedAsset {
    pub item: ContentItem,
    pub handle: AssetHandle,
    /// Playlist snapshot this asset was resolved against.
    pub snapshot: u64,
}

/// A display region that can render one asset at a time.
#[async_trait]
pub trait RenderSurface: Send {
    /// Mount `asset` without making it visible.
    async fn load(&mut self, asset: &MountedAsset) -> Result<(), RenderError>;
    fn show(&mut self);
    fn hide(&mut self);
    /// Drop whatever is mounted.
    fn clear(&mut self);
    fn play_media(&mut self);
    fn pause_media(&mut self);
}

/// The front/back pair.
pub struct Surfaces {
    a: Box<dyn RenderSurface>,
    b: Box<dyn RenderSurface>,
    front: SlotId,
    mounted_a: Option<MountedAsset>,
    mounted_b: Option<MountedAsset>,
}

impl Surfaces {
    pub fn new(a: Box<dyn RenderSurface>, b: Box<dyn RenderSurface>) -> Self {
        Self {
            a,
            b,
            front: SlotId::A,
            mounted_a: None,
            mounted_b: None,
        }
    }

    pub fn front(&self) -> SlotId {
        self.front
    }

    pub fn back(&self) -> SlotId {
        self.front.other()
    }

    fn surface(&mut self, slot: SlotId) -> &mut dyn RenderSurface {
        match slot {
            SlotId::A => self.a.as_mut(),
            SlotId::B => self.b.as_mut(),
        }
    }

    fn mounted_mut(&mut self, slot: SlotId) -> &mut Option<MountedAsset> {
        match slot {
            SlotId::A => &mut self.mounted_a,
            SlotId::B => &mut self.mounted_b,
        }
    }

    pub fn mounted(&self, slot: SlotId) -> Option<&MountedAsset> {
        match slot {
            SlotId::A => self.mounted_a.as_ref(),
            SlotId::B => self.mounted_b.as_ref(),
        }
    }

    pub fn front_asset(&self) -> Option<&MountedAsset> {
        self.mounted(self.front)
    }

    pub fn back_asset(&self) -> Option<&MountedAsset> {
        self.mounted(self.back())
    }

    /// Load into the hidden surface. The back is cleared first so a failed
    /// load never leaves the previous asset ready to swap in.
    pub async fn load_back(&mut self, asset: MountedAsset) -> Result<(), RenderError> {
        let back = self.back();
        self.clear_slot(back);
        self.surface(back).load(&asset).await?;
        *self.mounted_mut(back) = Some(asset);
        Ok(())
    }

    /// Make the back surface visible and retire the old front.
    ///
    /// Returns the newly visible asset, or `None` when nothing was preloaded
    /// (in which case nothing changes).
    pub fn swap(&mut self) -> Option<&MountedAsset> {
        let back = self.back();
        let front = self.front;
        let is_video = self.mounted(back)?.item.is_video();

        {
            let incoming = self.surface(back);
            incoming.show();
            if is_video {
                incoming.play_media();
            }
        }

        {
            let outgoing = self.surface(front);
            outgoing.pause_media();
            outgoing.hide();
        }
        self.clear_slot(front);

        self.front = back;
        tracing::debug!("Surface {} is now front", self.front);
        self.front_asset()
    }

    pub fn clear_back(&mut self) {
        let back = self.back();
        self.clear_slot(back);
    }

    fn clear_slot(&mut self, slot: SlotId) {
        if self.mounted_mut(slot).take().is_some() {
            self.surface(slot).clear();
        }
    }

    /// Clear and hide both surfaces.
    pub fn clear_all(&mut self) {
        for slot in [SlotId::A, SlotId::B] {
            let surface = self.surface(slot);
            surface.pause_media();
            surface.hide();
            self.clear_slot(slot);
        }
    }

    /// Start the back surface's media ahead of a swap.
    pub fn preroll_back(&mut self) {
        let back = self.back();
        if self.mounted(back).map(|m| m.item.is_video()).unwrap_or(false) {
            self.surface(back).play_media();
        }
    }

    pub fn pause_front(&mut self) {
        let front = self.front;
        self.surface(front).pause_media();
    }

    pub fn play_front(&mut self) {
        let front = self.front;
        if self.mounted(front).map(|m| m.item.is_video()).unwrap_or(false) {
            self.surface(front).play_media();
        }
    }

    /// Ids currently mounted on either surface.
    pub fn mounted_ids(&self) -> Vec<String> {
        [self.mounted_a.as_ref(), self.mounted_b.as_ref()]
            .into_iter()
            .flatten()
            .map(|m| m.item.id.clone())
            .collect()
    }
}

/// Observable state of one headless surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceState {
    pub visible: bool,
    pub loaded: Option<String>,
    pub media_playing: bool,
    pub loads: usize,
}

/// A surface becoming visible.
#[derive(Debug, Clone, PartialEq)]
pub struct ShowRecord {
    pub slot: SlotId,
    pub id: Option<String>,
    pub at: Instant,
}

#[derive(Default)]
struct ProbeState {
    a: SurfaceState,
    b: SurfaceState,
    shows: Vec<ShowRecord>,
    failing: HashSet<String>,
}

impl ProbeState {
    fn slot(&mut self, slot: SlotId) -> &mut SurfaceState {
        match slot {
            SlotId::A => &mut self.a,
            SlotId::B => &mut self.b,
        }
    }
}

/// Read side of a headless surface pair.
#[derive(Clone, Default)]
pub struct SurfaceProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl SurfaceProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, slot: SlotId) -> SurfaceState {
        self.lock().slot(slot).clone()
    }

    /// Slots currently visible.
    pub fn visible(&self) -> Vec<SlotId> {
        let state = self.lock();
        let mut visible = Vec::new();
        if state.a.visible {
            visible.push(SlotId::A);
        }
        if state.b.visible {
            visible.push(SlotId::B);
        }
        visible
    }

    /// Id of the item on the visible surface.
    pub fn showing(&self) -> Option<String> {
        let state = self.lock();
        let showing = [&state.a, &state.b]
            .into_iter()
            .find(|s| s.visible)
            .and_then(|s| s.loaded.clone());
        showing
    }

    pub fn shows(&self) -> Vec<ShowRecord> {
        self.lock().shows.clone()
    }

    /// Make loads of `id` fail from now on.
    pub fn fail_on(&self, id: impl Into<String>) {
        self.lock().failing.insert(id.into());
    }
}

/// Surface that renders nothing. It records what a real one would show.
pub struct HeadlessSurface {
    slot: SlotId,
    probe: SurfaceProbe,
}

impl HeadlessSurface {
    /// Create both surfaces plus a probe observing them.
    pub fn pair() -> (HeadlessSurface, HeadlessSurface, SurfaceProbe) {
        let probe = SurfaceProbe::default();
        (
            HeadlessSurface {
                slot: SlotId::A,
                probe: probe.clone(),
            },
            HeadlessSurface {
                slot: SlotId::B,
                probe: probe.clone(),
            },
            probe,
        )
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SurfaceState) -> R) -> R {
        let mut state = self.probe.lock();
        f(state.slot(self.slot))
    }
}

#[async_trait]
impl RenderSurface for HeadlessSurface {
    async fn load(&mut self, asset: &MountedAsset) -> Result<(), RenderError> {
        let mut state = self.probe.lock();
        if state.failing.contains(&asset.item.id) {
            return Err(RenderError {
                id: asset.item.id.clone(),
                reason: "surface rejected asset".into(),
            });
        }

        let surface = state.slot(self.slot);
        surface.loaded = Some(asset.item.id.clone());
        surface.media_playing = false;
        surface.loads += 1;
        tracing::debug!(
            "[{}] loaded {} ({})",
            self.slot,
            asset.item.id,
            asset.handle.describe()
        );
        Ok(())
    }

    fn show(&mut self) {
        let mut state = self.probe.lock();
        let surface = state.slot(self.slot);
        surface.visible = true;
        let id = surface.loaded.clone();
        tracing::info!("[{}] showing {}", self.slot, id.as_deref().unwrap_or("-"));
        state.shows.push(ShowRecord {
            slot: self.slot,
            id,
            at: Instant::now(),
        });
    }

    fn hide(&mut self) {
        self.with_state(|s| s.visible = false);
    }

    fn clear(&mut self) {
        self.with_state(|s| {
            s.loaded = None;
            s.media_playing = false;
        });
    }

    fn play_media(&mut self) {
        self.with_state(|s| s.media_playing = true);
    }

    fn pause_media(&mut self) {
        self.with_state(|s| s.media_playing = false);
    }
}
