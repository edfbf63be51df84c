//! Shared types for the 123 Cloud provider
//!
//! This module contains the types shared by the provider components:
//! mount configuration, the remote entry representation, and the error type.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default open-platform API endpoint
pub const DEFAULT_API_BASE: &str = "https://open-api.123pan.com";

/// Drive namespace a mount operates on.
///
/// Selected once when the mount is created; the wire name is forwarded as
/// `drive_id` on listing and link calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Default,
    #[default]
    Resource,
    Backup,
}

impl DriveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveType::Default => "default",
            DriveType::Resource => "resource",
            DriveType::Backup => "backup",
        }
    }
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveType::Default => write!(f, "Default drive"),
            DriveType::Resource => write!(f, "Resource drive"),
            DriveType::Backup => write!(f, "Backup drive"),
        }
    }
}

/// Server-side sort field, forwarded verbatim to the listing endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    Name,
    Size,
    UpdatedAt,
    CreatedAt,
}

impl OrderBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderBy::Name => "name",
            OrderBy::Size => "size",
            OrderBy::UpdatedAt => "updated_at",
            OrderBy::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// Mount configuration
///
/// This is what gets persisted for a mount, tokens included. Refreshes write
/// the new token pair back through the mount's `ConfigStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Open123Config {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_root_folder_id")]
    pub root_folder_id: String,
    #[serde(default)]
    pub drive_type: DriveType,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub order_direction: Option<OrderDirection>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Reject refreshed tokens whose subject differs from the previous one
    #[serde(default)]
    pub verify_token_subject: bool,
    /// Attempts per chunk transmission (first try included)
    #[serde(default = "default_chunk_attempts")]
    pub chunk_attempts: u32,
    /// Fixed pause between chunk attempts, in milliseconds
    #[serde(default = "default_chunk_retry_delay_ms")]
    pub chunk_retry_delay_ms: u64,
    /// Folder (host path) used as the landing area for offline downloads
    #[serde(default)]
    pub offline_temp_dir: Option<String>,
    /// Listing page requests per second, 0 for no limit
    #[serde(default = "default_list_calls_per_sec")]
    pub list_calls_per_sec: u32,
    /// Download-link requests per second, 0 for no limit
    #[serde(default = "default_link_calls_per_sec")]
    pub link_calls_per_sec: u32,
}

fn default_root_folder_id() -> String {
    "0".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_chunk_attempts() -> u32 {
    3
}

fn default_chunk_retry_delay_ms() -> u64 {
    1000
}

fn default_list_calls_per_sec() -> u32 {
    3
}

fn default_link_calls_per_sec() -> u32 {
    1
}

impl Open123Config {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: String::new(),
            access_token: String::new(),
            root_folder_id: default_root_folder_id(),
            drive_type: DriveType::default(),
            order_by: None,
            order_direction: None,
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
            verify_token_subject: false,
            chunk_attempts: default_chunk_attempts(),
            chunk_retry_delay_ms: default_chunk_retry_delay_ms(),
            offline_temp_dir: None,
            list_calls_per_sec: default_list_calls_per_sec(),
            link_calls_per_sec: default_link_calls_per_sec(),
        }
    }

    /// Check the fields a mount with its own credential cannot work without
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.client_id.trim().is_empty() {
            return Err(ProviderError::InvalidConfig("client_id is required".to_string()));
        }
        if self.client_secret.trim().is_empty() {
            return Err(ProviderError::InvalidConfig("client_secret is required".to_string()));
        }
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(ProviderError::InvalidConfig(format!(
                "api_base must be an http(s) URL: {}",
                self.api_base
            )));
        }
        self.validate_mount_settings()
    }

    /// Check only what a mount reads regardless of whose credential it uses
    pub fn validate_mount_settings(&self) -> Result<(), ProviderError> {
        if self.root_folder_id.trim().is_empty() {
            return Err(ProviderError::InvalidConfig("root_folder_id is required".to_string()));
        }
        if self.chunk_attempts == 0 {
            return Err(ProviderError::InvalidConfig("chunk_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Remote file/directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Backend identifier, unique across the drive
    pub id: String,
    /// Entry name; not unique within a parent
    pub name: String,
    /// Host path from the mount root
    pub path: String,
    pub parent_id: String,
    /// Size in bytes (0 for folders)
    pub size: u64,
    pub is_dir: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// Content hash as reported by the backend (MD5 hex for files)
    pub hash: Option<String>,
}

impl RemoteEntry {
    pub fn directory(id: &str, name: &str, path: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            parent_id: String::new(),
            size: 0,
            is_dir: true,
            created: None,
            modified: None,
            hash: None,
        }
    }

    pub fn file(id: &str, name: &str, path: &str, size: u64) -> Self {
        Self {
            size,
            is_dir: false,
            ..Self::directory(id, name, path)
        }
    }
}

/// Direct download URL for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLink {
    pub url: String,
    /// How long the caller may reuse the URL before asking again
    pub expires_in: Duration,
}

/// Join a host path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() || parent == "." {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of a host path; `/` for top-level entries and empty input.
pub fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => trimmed[..pos].to_string(),
    }
}

/// Parse the timestamp formats the backend emits.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Provider error type
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Upload negotiation failed: {0}")]
    Negotiation(String),

    #[error("Chunk {chunk} upload failed: {message}")]
    Transfer { chunk: u32, message: String },

    #[error("Upload completion failed: {0}")]
    Completion(String),

    #[error("Listing failed: {0}")]
    Listing(String),

    #[error("Duplicate cleanup failed: {0}")]
    Reconciliation(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProviderError {
    /// Message reported by the backend, if this error carries one
    pub fn backend_message(&self) -> Option<&str> {
        match self {
            ProviderError::Api { message, .. } => Some(message),
            _ => None,
        }
    }
}
