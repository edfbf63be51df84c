//! Cursor-paginated folder listing.
//!
//! The backend pages folder contents behind an opaque marker: an empty marker
//! requests the first page and an empty marker in the response means there
//! are no more pages. `ListingEngine::pages` exposes that as a lazy stream,
//! `list_children` drains it. Listing never caches; every call is a fresh
//! traversal, which is what duplicate reconciliation relies on.

use futures_util::stream::{self, Stream, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::rate_limit::RateLimiter;
use super::transport::{id_string, id_value, ApiClient, ApiRequest};
use super::types::{join_path, parse_timestamp};
use super::{DriveType, OrderBy, OrderDirection, ProviderError, RemoteEntry};

const LIST_PATH: &str = "/api/v2/file/list";

/// Entries requested per page
pub const PAGE_SIZE: u32 = 200;

/// File object as returned by the listing, detail and mkdir endpoints
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiFile {
    #[serde(alias = "fileId", alias = "fileID")]
    file_id: Value,
    #[serde(alias = "filename", alias = "fileName")]
    name: String,
    #[serde(default, alias = "parentFileId", alias = "parentFileID")]
    parent_file_id: Value,
    #[serde(default)]
    size: u64,
    #[serde(default, rename = "type")]
    kind: Value,
    #[serde(default, alias = "createAt", alias = "created_at")]
    create_at: Option<String>,
    #[serde(default, alias = "updateAt", alias = "updated_at")]
    update_at: Option<String>,
    #[serde(default)]
    etag: Option<String>,
}

impl ApiFile {
    fn is_dir(&self) -> bool {
        match &self.kind {
            Value::Number(n) => n.as_i64() == Some(1),
            Value::String(s) => s == "folder" || s == "1",
            _ => false,
        }
    }

    /// Convert to an entry placed under `parent_path`.
    pub(crate) fn into_entry(self, parent_path: &str) -> RemoteEntry {
        let is_dir = self.is_dir();
        RemoteEntry {
            id: id_string(&self.file_id),
            path: join_path(parent_path, &self.name),
            parent_id: id_string(&self.parent_file_id),
            size: if is_dir { 0 } else { self.size },
            is_dir,
            created: self.create_at.as_deref().and_then(parse_timestamp),
            modified: self.update_at.as_deref().and_then(parse_timestamp),
            hash: self.etag.filter(|h| !h.is_empty()),
            name: self.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FilePage {
    #[serde(default, alias = "fileList")]
    items: Vec<ApiFile>,
    #[serde(default, alias = "nextMarker")]
    next_marker: Value,
}

/// One page of a folder listing
#[derive(Debug, Clone)]
pub struct ListingPage {
    /// Continuation marker; empty when this is the last page
    pub next_cursor: String,
    pub entries: Vec<RemoteEntry>,
}

enum Cursor {
    First,
    Next(String),
    Done,
}

/// Listing settings fixed for the lifetime of a mount
#[derive(Debug, Clone)]
pub struct ListingOptions {
    pub drive: DriveType,
    pub order_by: Option<OrderBy>,
    pub order_direction: Option<OrderDirection>,
}

#[derive(Clone)]
pub struct ListingEngine {
    api: ApiClient,
    options: ListingOptions,
    limiter: Arc<RateLimiter>,
}

impl ListingEngine {
    pub fn new(api: ApiClient, options: ListingOptions) -> Self {
        Self {
            api,
            options,
            limiter: Arc::new(RateLimiter::unlimited()),
        }
    }

    /// Pace page requests through `limiter`, which may be shared.
    pub fn with_rate_limit(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Fetch a single page starting at `marker`.
    pub async fn fetch_page(&self, folder_id: &str, marker: &str) -> Result<ListingPage, ProviderError> {
        let mut body = Map::new();
        body.insert("drive_id".into(), json!(self.options.drive.as_str()));
        body.insert("limit".into(), json!(PAGE_SIZE));
        body.insert("marker".into(), json!(marker));
        body.insert("parent_file_id".into(), id_value(folder_id));
        if let Some(order_by) = self.options.order_by {
            body.insert("order_by".into(), json!(order_by.as_str()));
        }
        if let Some(direction) = self.options.order_direction {
            body.insert("order_direction".into(), json!(direction.as_str()));
        }

        self.limiter.acquire().await;
        let page: FilePage = self
            .api
            .call(ApiRequest::post(LIST_PATH, Value::Object(body)))
            .await
            .map_err(|e| ProviderError::Listing(format!("folder {}: {}", folder_id, e)))?;

        let next_cursor = match page.next_marker {
            // Some deployments signal the last page with -1
            Value::Number(ref n) if n.as_i64() == Some(-1) => String::new(),
            ref other => id_string(other),
        };
        debug!(
            "[123open] listed {} entries of folder {} (next marker {:?})",
            page.items.len(), folder_id, next_cursor
        );
        Ok(ListingPage {
            next_cursor,
            // Paths are filled in by the caller, who knows where the folder lives
            entries: page.items.into_iter().map(|f| f.into_entry("")).collect(),
        })
    }

    /// Lazily walk all pages of a folder in backend order.
    ///
    /// Each call starts from the first page. The stream ends after the page
    /// whose marker is empty; an error ends it immediately.
    pub fn pages(&self, folder_id: &str) -> impl Stream<Item = Result<ListingPage, ProviderError>> + Send + 'static {
        let engine = self.clone();
        let folder_id = folder_id.to_string();
        stream::try_unfold(Cursor::First, move |cursor| {
            let engine = engine.clone();
            let folder_id = folder_id.clone();
            async move {
                let marker = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::First => String::new(),
                    Cursor::Next(marker) => marker,
                };
                let page = engine.fetch_page(&folder_id, &marker).await?;
                let next = if page.next_cursor.is_empty() {
                    Cursor::Done
                } else {
                    Cursor::Next(page.next_cursor.clone())
                };
                Ok(Some((page, next)))
            }
        })
    }

    /// Every child of a folder. Fails as a whole if any page fails.
    pub async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, ProviderError> {
        self.pages(folder_id)
            .try_fold(Vec::new(), |mut all, page| async move {
                all.extend(page.entries);
                Ok(all)
            })
            .await
    }

    /// Children of a folder with their host paths set.
    pub async fn list_at(&self, folder_id: &str, folder_path: &str) -> Result<Vec<RemoteEntry>, ProviderError> {
        let mut entries = self.list_children(folder_id).await?;
        for entry in &mut entries {
            entry.path = join_path(folder_path, &entry.name);
        }
        Ok(entries)
    }
}

/// Normalize a host path: leading slash, no trailing slash, `/` for root.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Maps host paths to folder ids by walking from the mount root.
#[derive(Clone)]
pub struct PathResolver {
    listing: ListingEngine,
    root_id: String,
    cache: Arc<Mutex<HashMap<String, String>>>,
}

impl PathResolver {
    pub fn new(listing: ListingEngine, root_id: &str) -> Self {
        Self {
            listing,
            root_id: root_id.to_string(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn remember(&self, path: &str, folder_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(normalize_path(path), folder_id.to_string());
        }
    }

    /// Drop `path` and everything below it.
    pub fn forget(&self, path: &str) {
        let path = normalize_path(path);
        let prefix = format!("{}/", path);
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|key, _| *key != path && !key.starts_with(&prefix));
        }
    }

    fn cached(&self, path: &str) -> Option<String> {
        self.cache.lock().ok().and_then(|cache| cache.get(path).cloned())
    }

    /// Find a direct child by exact name (first match in listing order).
    pub async fn find_child(
        &self,
        parent_id: &str,
        parent_path: &str,
        name: &str,
    ) -> Result<Option<RemoteEntry>, ProviderError> {
        let children = self.listing.list_at(parent_id, parent_path).await?;
        Ok(children.into_iter().find(|entry| entry.name == name))
    }

    /// Resolve a folder path to its id.
    pub async fn resolve_folder(&self, path: &str) -> Result<String, ProviderError> {
        let normalized = normalize_path(path);
        if normalized == "/" {
            return Ok(self.root_id.clone());
        }
        if let Some(id) = self.cached(&normalized) {
            return Ok(id);
        }

        let mut current_id = self.root_id.clone();
        let mut current_path = String::new();
        for part in normalized.split('/').filter(|s| !s.is_empty()) {
            let parent_path = if current_path.is_empty() { "/".to_string() } else { current_path.clone() };
            current_path = format!("{}/{}", current_path, part);
            if let Some(id) = self.cached(&current_path) {
                current_id = id;
                continue;
            }
            let children = self.listing.list_at(&current_id, &parent_path).await?;
            match children.into_iter().find(|e| e.is_dir && e.name == part) {
                Some(folder) => {
                    self.remember(&current_path, &folder.id);
                    current_id = folder.id;
                }
                None => {
                    return Err(ProviderError::NotFound(format!(
                        "Folder '{}' not found in {}",
                        part, parent_path
                    )))
                }
            }
        }
        Ok(current_id)
    }
}
