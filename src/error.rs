//! Error types for the signage player.
//!
//! Per-item failures are contained by the scheduler and turn into a skip.
//! Only `ContentUnavailable` is fatal to playback and reaches the shell.

use std::time::Duration;
use thiserror::Error;

/// Player-level errors.
#[derive(Error, Debug)]
pub enum PlayerError {
    /// No playlist from the network, no last-known-good snapshot, no fallback.
    #[error("no content available: network unreachable and no fallback playlist")]
    ContentUnavailable,

    /// A single item's URL could not be resolved.
    #[error("could not resolve a URL for content {0}")]
    UrlResolutionFailed(String),

    #[error(transparent)]
    Prefetch(#[from] PrefetchError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The scheduler task is gone.
    #[error("scheduler has shut down")]
    SchedulerClosed,
}

/// Failure of a single prefetch. Cloneable so it can be shared by every
/// waiter attached to the same in-flight load.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrefetchError {
    #[error("prefetch of {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("failed to load {id}: {reason}")]
    Load { id: String, reason: String },
}

impl PrefetchError {
    pub fn id(&self) -> &str {
        match self {
            PrefetchError::Timeout { id, .. } | PrefetchError::Load { id, .. } => id,
        }
    }
}

/// A surface refused or failed to mount an asset.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("render failed for {id}: {reason}")]
pub struct RenderError {
    pub id: String,
    pub reason: String,
}

/// Convenience Result type for player operations.
pub type Result<T> = std::result::Result<T, PlayerError>;
