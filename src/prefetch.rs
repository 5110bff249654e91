//! Prefetch priority queue.
//!
//! Recomputed from scratch whenever the playlist or the playback position
//! changes; playlists are small enough that an incremental heap is not worth it.

use crate::content::ContentItem;
use std::cmp::Ordering;

/// Items this close to the current position get the distance weight.
const NEAR_WINDOW: usize = 3;
const NEAR_BASE: f64 = 100.0;
const NEAR_STEP: f64 = 10.0;
const VIDEO_BONUS: f64 = 50.0;
const SIZE_BONUS_CAP: f64 = 50.0;
const BITRATE_BONUS_CAP: f64 = 30.0;

/// One pending prefetch.
#[derive(Debug, Clone)]
pub struct PrefetchQueueEntry {
    pub item: ContentItem,
    pub original_index: usize,
    pub priority: f64,
}

/// Ring distance from `position` to `index` in a playlist of `len` items.
fn distance(index: usize, position: usize, len: usize) -> usize {
    (index + len - position % len) % len
}

/// Priority score of the item at `index` when playback sits at `position`.
pub fn priority(item: &ContentItem, index: usize, position: usize, len: usize) -> f64 {
    let mut score = 0.0;

    let d = distance(index, position, len);
    if d < NEAR_WINDOW {
        score += NEAR_BASE - NEAR_STEP * d as f64;
    }

    // Videos are heavier and slower to warm up.
    if item.is_video() {
        score += VIDEO_BONUS;
    }

    if let Some(size) = item.file_size {
        score += (size as f64 / 1024.0 / 1024.0).min(SIZE_BONUS_CAP);
    }

    if let Some(bitrate) = item.bitrate {
        score += (bitrate as f64 / 1000.0).min(BITRATE_BONUS_CAP);
    }

    score
}

/// Build the descending-priority queue for `playlist`. Ties keep playlist order.
pub fn build_queue(playlist: &[ContentItem], position: usize) -> Vec<PrefetchQueueEntry> {
    let len = playlist.len();
    let mut queue: Vec<PrefetchQueueEntry> = playlist
        .iter()
        .enumerate()
        .map(|(index, item)| PrefetchQueueEntry {
            item: item.clone(),
            original_index: index,
            priority: priority(item, index, position, len),
        })
        .collect();

    queue.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(Ordering::Equal)
            .then(a.original_index.cmp(&b.original_index))
    });

    // The same id listed twice only needs one fetch; keep its best slot.
    let mut seen = std::collections::HashSet::new();
    queue.retain(|entry| seen.insert(entry.item.id.clone()));

    queue
}
