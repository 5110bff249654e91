//! Digital signage player core.
//!
//! Schedules a playlist onto two alternating render surfaces, keeps the
//! upcoming content prefetched, and stays in sync with a content server.

pub mod assets;
pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod player;
pub mod prefetch;
pub mod profile;
pub mod realtime;
pub mod scheduler;
pub mod source;
pub mod surface;
pub mod timer;

pub use config::Settings;
pub use content::{ContentItem, ContentType};
pub use error::{PlayerError, Result};
pub use player::SignagePlayer;
pub use scheduler::{PlaybackState, PlaybackStatus};
pub use source::{ContentSource, Scope, SourceEvent};
pub use surface::{HeadlessSurface, RenderSurface, SlotId, Surfaces};
