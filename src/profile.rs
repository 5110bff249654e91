//! Device capability profile.
//!
//! Pure queries over what the playback surface supports. The profile is
//! built once per session and refreshed by field-level overwrites pushed from
//! the content server.

use crate::content::{ContentItem, ContentType, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

/// Capability facts for the display this player drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub supported_formats: BTreeSet<String>,
    pub resolution: Resolution,
    #[serde(default)]
    pub max_bitrate: Option<u64>,
    #[serde(default)]
    pub preferred_format: Option<String>,
}

/// Partial profile as pushed by the server. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub supported_formats: Option<BTreeSet<String>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub max_bitrate: Option<u64>,
    #[serde(default)]
    pub preferred_format: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.supported_formats.is_none()
            && self.resolution.is_none()
            && self.max_bitrate.is_none()
            && self.preferred_format.is_none()
    }
}

impl DeviceProfile {
    pub fn new(device_id: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            device_id: device_id.into(),
            supported_formats: BTreeSet::new(),
            resolution,
            max_bitrate: None,
            preferred_format: None,
        }
    }

    pub fn supports_format(&self, format: &str) -> bool {
        self.supported_formats.contains(format)
    }

    /// A display that lists no `video/` format at all cannot play video.
    pub fn supports_type(&self, content_type: ContentType) -> bool {
        match content_type {
            ContentType::Video => self
                .supported_formats
                .iter()
                .any(|f| f.starts_with("video/")),
            _ => true,
        }
    }

    pub fn supports_resolution(&self, resolution: &Resolution) -> bool {
        resolution.fits_within(&self.resolution)
    }

    pub fn supports_bitrate(&self, bitrate: u64) -> bool {
        match self.max_bitrate {
            Some(ceiling) => bitrate <= ceiling,
            None => true,
        }
    }

    /// Content resolution scaled down uniformly to fit the screen.
    pub fn optimal_resolution(&self, content: &Resolution) -> Resolution {
        if self.supports_resolution(content) || content.width == 0 || content.height == 0 {
            return *content;
        }

        let scale = f64::min(
            self.resolution.width as f64 / content.width as f64,
            self.resolution.height as f64 / content.height as f64,
        );

        Resolution::new(
            (content.width as f64 * scale).round() as u32,
            (content.height as f64 * scale).round() as u32,
        )
    }

    pub fn optimal_bitrate(&self, bitrate: u64) -> u64 {
        match self.max_bitrate {
            Some(ceiling) => bitrate.min(ceiling),
            None => bitrate,
        }
    }

    /// Preferred format for video; other types keep whatever they carry.
    pub fn optimal_format(
        &self,
        content_type: ContentType,
        current: Option<&str>,
    ) -> Option<String> {
        match content_type {
            ContentType::Video => self
                .preferred_format
                .clone()
                .or_else(|| current.map(str::to_owned)),
            _ => current.map(str::to_owned),
        }
    }

    /// Whether every technical hint on the item is within this profile.
    pub fn accepts(&self, item: &ContentItem) -> bool {
        if !self.supports_type(item.content_type) {
            return false;
        }

        if let Some(ref format) = item.format {
            if !self.supports_format(format) {
                return false;
            }
        }

        if let Some(ref resolution) = item.resolution {
            if !self.supports_resolution(resolution) {
                return false;
            }
        }

        if let Some(bitrate) = item.bitrate {
            if !self.supports_bitrate(bitrate) {
                return false;
            }
        }

        true
    }

    /// Copy of `item` with resolution, bitrate and format rewritten for this device.
    pub fn optimize(&self, item: &ContentItem) -> ContentItem {
        let mut optimized = item.clone();
        optimized.resolution = item.resolution.map(|r| self.optimal_resolution(&r));
        optimized.bitrate = item.bitrate.map(|b| self.optimal_bitrate(b));
        optimized.format = self.optimal_format(item.content_type, item.format.as_deref());
        optimized
    }

    /// Append device hints to an asset URL so the origin can serve a fitting rendition.
    ///
    /// URLs that do not parse are returned unchanged.
    pub fn optimized_url(&self, raw: &str) -> String {
        let Ok(mut url) = Url::parse(raw) else {
            return raw.to_string();
        };

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("resolution", &self.resolution.to_string());
            if let Some(bitrate) = self.max_bitrate {
                query.append_pair("bitrate", &bitrate.to_string());
            }
            if let Some(ref format) = self.preferred_format {
                query.append_pair("format", format);
            }
        }

        url.to_string()
    }

    /// Overwrite the fields present in `update`, last write wins.
    pub fn update(&mut self, update: ProfileUpdate) {
        if let Some(formats) = update.supported_formats {
            self.supported_formats = formats;
        }
        if let Some(resolution) = update.resolution {
            self.resolution = resolution;
        }
        if let Some(bitrate) = update.max_bitrate {
            self.max_bitrate = Some(bitrate);
        }
        if let Some(format) = update.preferred_format {
            self.preferred_format = Some(format);
        }
    }
}
