//! Object upload client for images and videos attached to entities.
//!
//! Forms upload a file and then store the returned URL in an entity field;
//! the sync core never calls this module.

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur during uploads
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Upload response has no URL")]
    MissingUrl,

    #[error("Empty upload")]
    Empty,

    #[error("Missing upload configuration: {0}")]
    MissingConfig(String),

    #[error("Unknown media kind: {0}")]
    UnknownKind(String),
}

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// What is being uploaded; decides the target folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn folder(&self) -> &'static str {
        match self {
            MediaKind::Image => "blog-images",
            MediaKind::Video => "blog-videos",
        }
    }

    /// Resource type sent alongside videos
    pub fn resource_type(&self) -> Option<&'static str> {
        match self {
            MediaKind::Image => None,
            MediaKind::Video => Some("video"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" | "images" => Ok(MediaKind::Image),
            "video" | "videos" => Ok(MediaKind::Video),
            other => Err(UploadError::UnknownKind(other.to_string())),
        }
    }
}

/// Configuration for the upload service
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Upload endpoint
    pub url: String,
    /// Unsigned upload preset
    pub preset: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl UploadConfig {
    pub fn new(url: impl Into<String>, preset: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            preset: preset.into(),
            timeout_seconds: 120,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> UploadResult<Self> {
        let url = std::env::var("UPLOAD_URL")
            .map_err(|_| UploadError::MissingConfig("UPLOAD_URL".to_string()))?;
        let preset = std::env::var("UPLOAD_PRESET")
            .map_err(|_| UploadError::MissingConfig("UPLOAD_PRESET".to_string()))?;
        Ok(Self::new(url, preset))
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Reply of the upload endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub secure_url: Option<String>,
    #[serde(default)]
    pub error: Option<UploadFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadFailure {
    #[serde(default)]
    pub message: String,
}

impl UploadResponse {
    /// Durable URL of the stored object
    pub fn into_url(self) -> UploadResult<String> {
        self.secure_url
            .filter(|url| !url.is_empty())
            .ok_or(UploadError::MissingUrl)
    }
}

/// Client of the object upload service
pub struct UploadService {
    client: reqwest::Client,
    config: UploadConfig,
}

impl UploadService {
    pub fn new(config: UploadConfig) -> UploadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    /// Build the multipart form sent for one file
    pub fn form(&self, bytes: Vec<u8>, file_name: &str, kind: MediaKind) -> Form {
        let mut form = Form::new()
            .text("upload_preset", self.config.preset.clone())
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()))
            .text("folder", kind.folder());
        if let Some(resource_type) = kind.resource_type() {
            form = form.text("resource_type", resource_type);
        }
        form
    }

    /// Upload a file and return its durable URL
    pub async fn upload(&self, bytes: Vec<u8>, file_name: &str, kind: MediaKind) -> UploadResult<String> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        let size = bytes.len();

        let response = self
            .client
            .post(&self.config.url)
            .multipart(self.form(bytes, file_name, kind))
            .send()
            .await?;

        let status = response.status();
        let body: UploadResponse = response.json().await?;

        if !status.is_success() {
            let message = body
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "upload failed".to_string());
            warn!("Upload of {} rejected ({}): {}", file_name, status, message);
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let url = body.into_url()?;
        info!("Uploaded {} ({} bytes) to {}", file_name, size, kind.folder());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_folders() {
        assert_eq!(MediaKind::Image.folder(), "blog-images");
        assert_eq!(MediaKind::Video.folder(), "blog-videos");
        assert_eq!(MediaKind::Video.resource_type(), Some("video"));
        assert!(MediaKind::Image.resource_type().is_none());
    }

    #[test]
    fn test_media_kind_from_str() {
        assert_eq!("Video".parse::<MediaKind>().unwrap(), MediaKind::Video);
        assert_eq!("images".parse::<MediaKind>().unwrap(), MediaKind::Image);
        assert!(matches!(
            "audio".parse::<MediaKind>(),
            Err(UploadError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_response_parsing() {
        let ok: UploadResponse =
            serde_json::from_str(r#"{"secure_url":"https://cdn/x.png","bytes":10}"#).unwrap();
        assert_eq!(ok.into_url().unwrap(), "https://cdn/x.png");

        let missing: UploadResponse = serde_json::from_str(r#"{"public_id":"x"}"#).unwrap();
        assert!(matches!(missing.into_url(), Err(UploadError::MissingUrl)));

        let failed: UploadResponse =
            serde_json::from_str(r#"{"error":{"message":"Invalid preset"}}"#).unwrap();
        assert_eq!(failed.error.unwrap().message, "Invalid preset");
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected_locally() {
        let service = UploadService::new(UploadConfig::new("http://127.0.0.1:9/upload", "preset")).unwrap();
        assert!(matches!(
            service.upload(Vec::new(), "x.png", MediaKind::Image).await,
            Err(UploadError::Empty)
        ));
    }

    #[test]
    fn test_config_builder() {
        let config = UploadConfig::new("https://upload", "preset").with_timeout(5);
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.preset, "preset");
    }
}
