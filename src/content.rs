//! Playlist content model.
//!
//! Items arrive from the content server as camelCase JSON and are never
//! mutated once they are part of a snapshot; a new snapshot replaces them.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of media an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Video,
    Image,
    Web,
    Interactive,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Video => "video",
            ContentType::Image => "image",
            ContentType::Web => "web",
            ContentType::Interactive => "interactive",
        }
    }

    /// Whether the asset has to be downloaded before it can be shown.
    pub fn is_downloadable(&self) -> bool {
        matches!(self, ContentType::Video | ContentType::Image)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel dimensions, `WxH` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True if `self` fits inside `other` on both axes.
    pub fn fits_within(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid resolution '{}', expected WxH", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid width in resolution '{}'", s))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height in resolution '{}'", s))?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// Hour and minute of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl TimeOfDay {
    fn minutes(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

/// Weekly recurring window. Days use 0 = Sunday.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklySchedule {
    #[serde(default)]
    pub days: Option<Vec<u32>>,
    #[serde(default)]
    pub start_time: Option<TimeOfDay>,
    #[serde(default)]
    pub end_time: Option<TimeOfDay>,
}

impl WeeklySchedule {
    fn matches<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if let Some(ref days) = self.days {
            if !days.contains(&now.weekday().num_days_from_sunday()) {
                return false;
            }
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            let current = now.hour() * 60 + now.minute();
            return current >= start.minutes() && current <= end.minutes();
        }

        true
    }
}

fn default_priority() -> u32 {
    1
}

fn default_object_fit() -> String {
    "cover".into()
}

fn default_transition() -> String {
    "fade".into()
}

/// A single playlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub url: String,
    /// Slot length in seconds.
    pub duration: f64,
    #[serde(default)]
    pub title: String,

    #[serde(default = "default_object_fit")]
    pub object_fit: String,
    #[serde(default = "default_transition")]
    pub transition: String,

    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,

    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule: Option<WeeklySchedule>,
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub subnetwork_id: Option<String>,
    #[serde(default)]
    pub is_global: bool,
}

impl ContentItem {
    /// Create an item with default hints and no scheduling window.
    pub fn new(
        id: impl Into<String>,
        content_type: ContentType,
        url: impl Into<String>,
        duration: f64,
    ) -> Self {
        Self {
            id: id.into(),
            content_type,
            url: url.into(),
            duration,
            title: String::new(),
            object_fit: default_object_fit(),
            transition: default_transition(),
            resolution: None,
            bitrate: None,
            format: None,
            file_size: None,
            start_date: None,
            end_date: None,
            schedule: None,
            priority: default_priority(),
            network_id: None,
            subnetwork_id: None,
            is_global: false,
        }
    }

    pub fn is_video(&self) -> bool {
        self.content_type == ContentType::Video
    }

    /// Slot length as a `Duration`, or `None` for zero, negative, non-finite
    /// or unrepresentably large values.
    pub fn slot_duration(&self) -> Option<std::time::Duration> {
        if self.duration > 0.0 {
            std::time::Duration::try_from_secs_f64(self.duration).ok()
        } else {
            None
        }
    }

    /// Whether the scheduling window includes the current local time.
    pub fn is_active(&self) -> bool {
        self.is_active_at(&Local::now())
    }

    /// Whether the scheduling window includes `now`.
    pub fn is_active_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        let instant = now.with_timezone(&Utc);

        if let Some(start) = self.start_date {
            if instant < start {
                return false;
            }
        }

        if let Some(end) = self.end_date {
            if instant > end {
                return false;
            }
        }

        match self.schedule {
            Some(ref schedule) => schedule.matches(now),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, FixedOffset};

    fn item() -> ContentItem {
        ContentItem::new("a", ContentType::Image, "http://cdn/a.jpg", 10.0)
    }

    #[test]
    fn test_item_without_window_is_active() {
        assert!(item().is_active());
    }

    #[test]
    fn test_expired_item_is_inactive() {
        let mut expired = item();
        expired.end_date = Some(Utc::now() - ChronoDuration::hours(1));
        assert!(!expired.is_active());
    }

    #[test]
    fn test_future_item_is_inactive() {
        let mut future = item();
        future.start_date = Some(Utc::now() + ChronoDuration::days(1));
        assert!(!future.is_active());
    }

    #[test]
    fn test_weekly_schedule() {
        // 2024-06-05 was a Wednesday (day 3).
        let tz = FixedOffset::east_opt(0).unwrap();
        let wednesday_noon = tz.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap();
        let wednesday_night = tz.with_ymd_and_hms(2024, 6, 5, 22, 30, 0).unwrap();
        let thursday_noon = tz.with_ymd_and_hms(2024, 6, 6, 12, 0, 0).unwrap();

        let mut scheduled = item();
        scheduled.schedule = Some(WeeklySchedule {
            days: Some(vec![1, 2, 3]),
            start_time: Some(TimeOfDay { hour: 9, minute: 0 }),
            end_time: Some(TimeOfDay { hour: 17, minute: 30 }),
        });

        assert!(scheduled.is_active_at(&wednesday_noon));
        assert!(!scheduled.is_active_at(&wednesday_night));
        assert!(!scheduled.is_active_at(&thursday_noon));
    }

    #[test]
    fn test_parse_wire_item() {
        let json = r#"{
            "id": "v1",
            "type": "video",
            "url": "https://cdn.example.com/v1.mp4",
            "duration": 15,
            "resolution": "3840x2160",
            "bitrate": 8000,
            "fileSize": 52428800,
            "endDate": "2030-01-01T00:00:00Z",
            "schedule": { "days": [0, 6] }
        }"#;

        let parsed: ContentItem = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content_type, ContentType::Video);
        assert_eq!(parsed.resolution, Some(Resolution::new(3840, 2160)));
        assert_eq!(parsed.priority, 1);
        assert_eq!(parsed.object_fit, "cover");
        assert_eq!(parsed.slot_duration(), Some(std::time::Duration::from_secs(15)));
    }

    #[test]
    fn test_bad_resolution_is_rejected() {
        assert!("1920by1080".parse::<Resolution>().is_err());
        assert!("x1080".parse::<Resolution>().is_err());
        assert_eq!("1280X720".parse::<Resolution>().unwrap(), Resolution::new(1280, 720));
    }

    #[test]
    fn test_non_positive_duration_has_no_slot() {
        let mut zero = item();
        zero.duration = 0.0;
        assert_eq!(zero.slot_duration(), None);
        zero.duration = f64::NAN;
        assert_eq!(zero.slot_duration(), None);
    }

    #[test]
    fn test_oversized_duration_has_no_slot() {
        let mut huge = item();
        huge.duration = 1e20;
        assert_eq!(huge.slot_duration(), None);
        huge.duration = f64::INFINITY;
        assert_eq!(huge.slot_duration(), None);

        huge.duration = 1e19;
        assert!(huge.slot_duration().is_some());
    }
}
