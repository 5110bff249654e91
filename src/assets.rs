//! Asset loading for prefetch.
//!
//! Turns a playlist item into a render-ready asset: downloaded and validated
//! bytes for video and images, the page URL for web and interactive content.

use crate::content::{ContentItem, ContentType};
use crate::profile::DeviceProfile;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;

/// Intrinsic facts about a loaded asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Natural media length in seconds, when known.
    pub duration: Option<f64>,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Where the renderable representation lives.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetHandle {
    /// Stored in the durable cache directory.
    File(PathBuf),
    /// Held in memory (durable storage unavailable).
    Memory(Bytes),
    /// Rendered straight from a URL by the surface.
    Remote(String),
}

impl AssetHandle {
    pub fn describe(&self) -> String {
        match self {
            AssetHandle::File(path) => format!("file {}", path.display()),
            AssetHandle::Memory(bytes) => format!("{} bytes in memory", bytes.len()),
            AssetHandle::Remote(url) => format!("remote {}", url),
        }
    }
}

/// Payload returned by a loader.
#[derive(Debug, Clone)]
pub enum AssetPayload {
    Bytes(Bytes),
    Remote(String),
}

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    /// URL the asset was fetched from.
    pub url: String,
    pub payload: AssetPayload,
    pub metadata: AssetMetadata,
    /// File extension to use when stored on disk.
    pub extension: &'static str,
}

/// Fetches assets for the prefetch engine.
#[async_trait]
pub trait AssetLoader: Send + Sync {
    async fn load(&self, item: &ContentItem, profile: &DeviceProfile) -> Result<FetchedAsset>;
}

/// Loader that downloads over HTTP with `reqwest`.
pub struct HttpAssetLoader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAssetLoader {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Get the full URL for an asset.
    pub fn full_url(&self, relative_url: &str) -> String {
        if relative_url.contains("://") {
            relative_url.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), relative_url)
        }
    }

    async fn download(&self, item: &ContentItem, url: &str) -> Result<FetchedAsset> {
        tracing::debug!("Downloading {} from {}", item.id, url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Server returned error")?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response.bytes().await.context("Failed to read response")?;
        let metadata = validate(item, &bytes, content_type)?;
        let extension = extension_for(item, metadata.content_type.as_deref());

        Ok(FetchedAsset {
            url: url.to_string(),
            payload: AssetPayload::Bytes(bytes),
            metadata,
            extension,
        })
    }
}

#[async_trait]
impl AssetLoader for HttpAssetLoader {
    async fn load(&self, item: &ContentItem, profile: &DeviceProfile) -> Result<FetchedAsset> {
        let url = profile.optimized_url(&self.full_url(&item.url));

        match item.content_type {
            ContentType::Video | ContentType::Image => self.download(item, &url).await,
            ContentType::Web | ContentType::Interactive => Ok(FetchedAsset {
                url: url.clone(),
                payload: AssetPayload::Remote(url),
                metadata: AssetMetadata::default(),
                extension: "url",
            }),
        }
    }
}

/// Check that downloaded bytes are what the item claims to be.
pub fn validate(
    item: &ContentItem,
    bytes: &[u8],
    content_type: Option<String>,
) -> Result<AssetMetadata> {
    if bytes.is_empty() {
        bail!("empty response body for {}", item.id);
    }

    if let Some(ref ct) = content_type {
        if ct.starts_with("text/") {
            bail!("unexpected content type {} for {} {}", ct, item.content_type, item.id);
        }
    }

    let mut metadata = AssetMetadata {
        size: bytes.len() as u64,
        content_type,
        ..Default::default()
    };

    match item.content_type {
        ContentType::Image => {
            let (width, height) = image::ImageReader::new(Cursor::new(bytes))
                .with_guessed_format()
                .context("Failed to read image header")?
                .into_dimensions()
                .context("Failed to decode image")?;
            metadata.width = Some(width);
            metadata.height = Some(height);
        }
        ContentType::Video => {
            // Container parsing is left to the surface; trust the declared hints.
            if let Some(resolution) = item.resolution {
                metadata.width = Some(resolution.width);
                metadata.height = Some(resolution.height);
            }
        }
        ContentType::Web | ContentType::Interactive => {}
    }

    Ok(metadata)
}

fn extension_for(item: &ContentItem, content_type: Option<&str>) -> &'static str {
    let ct = content_type.unwrap_or_default();
    match item.content_type {
        ContentType::Video if ct.contains("webm") => "webm",
        ContentType::Video => "mp4",
        ContentType::Image if ct.contains("png") => "png",
        ContentType::Image if ct.contains("webp") => "webp",
        ContentType::Image if ct.contains("gif") => "gif",
        ContentType::Image => "jpg",
        ContentType::Web | ContentType::Interactive => "url",
    }
}
