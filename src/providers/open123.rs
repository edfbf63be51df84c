//! 123 Cloud storage driver.
//!
//! Entries are addressed by backend id; host paths are carried along for
//! display. Move and rename clean up same-named leftovers in the affected
//! folder afterwards, and a failed cleanup is only logged since the primary
//! operation has already happened. Listing and link calls are paced per
//! account.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http_retry::RetryPolicy;
use super::listing::{normalize_path, ListingEngine, ListingOptions, PathResolver};
use super::rate_limit::RateLimiter;
use super::reconcile::{EntryRemover, Reconciler, TrashRemover};
use super::token::{Credential, SubjectCheck, TokenManager};
use super::transport::{id_string, id_value, ApiClient, ApiRequest, ReqwestTransport, Transport};
use super::types::{join_path, parent_path};
use super::upload::{ContentSource, ProgressFn, UploadSessionManager};
use super::{DownloadLink, Open123Config, ProviderError, RemoteEntry, StorageProvider};
use crate::cloud_config::ConfigStore;

const LINK_PATH: &str = "/api/v1/file/download_info";
const MKDIR_PATH: &str = "/upload/v1/file/mkdir";
const MOVE_PATH: &str = "/api/v1/file/move";
const RENAME_PATH: &str = "/api/v1/file/name";

/// Lifetime requested for download URLs on the backend side
const LINK_EXPIRE_SECS: u64 = 14400;
/// How long a caller should reuse a download URL
const LINK_REUSE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct LinkResp {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct IdResp {
    #[serde(
        default,
        alias = "fileID",
        alias = "fileId",
        alias = "file_id",
        alias = "dirID",
        alias = "dirId"
    )]
    id: Value,
}

/// 123 Cloud mount
pub struct Open123Provider {
    config: Open123Config,
    transport: Arc<dyn Transport>,
    api: ApiClient,
    listing: ListingEngine,
    resolver: PathResolver,
    uploads: UploadSessionManager,
    reconciler: Reconciler,
    trash: Arc<TrashRemover>,
    limits: CallLimits,
}

/// Pacing for the throttled endpoints, shared by mounts on one account
#[derive(Clone)]
struct CallLimits {
    list: Arc<RateLimiter>,
    link: Arc<RateLimiter>,
}

impl CallLimits {
    fn from_config(config: &Open123Config) -> Self {
        Self {
            list: Arc::new(RateLimiter::per_second(config.list_calls_per_sec)),
            link: Arc::new(RateLimiter::per_second(config.link_calls_per_sec)),
        }
    }
}

impl Open123Provider {
    /// Mount with its own credential over HTTPS.
    pub fn new(config: Open123Config, store: Arc<dyn ConfigStore>) -> Result<Self, ProviderError> {
        config.validate()?;
        let transport = Arc::new(ReqwestTransport::new(&config.api_base, config.request_timeout())?);
        Self::with_transport(config, transport, store)
    }

    /// Mount with its own credential over the given transport.
    pub fn with_transport(
        config: Open123Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, ProviderError> {
        config.validate()?;
        let subject_check = if config.verify_token_subject {
            SubjectCheck::RequireMatch
        } else {
            SubjectCheck::Relaxed
        };
        let tokens = TokenManager::owned(
            Credential::new(&config.access_token, &config.refresh_token),
            &config.client_id,
            &config.client_secret,
            subject_check,
            transport.clone(),
            store,
        );
        info!("[123open] mounted {} at folder {}", config.drive_type, config.root_folder_id);
        let limits = CallLimits::from_config(&config);
        Ok(Self::assemble(config, transport, tokens, limits))
    }

    /// Mount that shares `authority`'s authenticated session.
    ///
    /// Token reads and refreshes go to the authority, and so do the list and
    /// link call budgets. This mount keeps its own root folder, drive,
    /// ordering and upload retry settings; its credentials and endpoint
    /// fields are ignored.
    pub fn referencing(config: Open123Config, authority: &Open123Provider) -> Result<Self, ProviderError> {
        config.validate_mount_settings()?;
        let tokens = TokenManager::referencing(authority.tokens());
        info!(
            "[123open] mounted {} at folder {} (sharing session)",
            config.drive_type, config.root_folder_id
        );
        Ok(Self::assemble(config, authority.transport.clone(), tokens, authority.limits.clone()))
    }

    fn assemble(
        config: Open123Config,
        transport: Arc<dyn Transport>,
        tokens: TokenManager,
        limits: CallLimits,
    ) -> Self {
        let api = ApiClient::new(transport.clone(), tokens);
        let listing = ListingEngine::new(
            api.clone(),
            ListingOptions {
                drive: config.drive_type,
                order_by: config.order_by,
                order_direction: config.order_direction,
            },
        )
        .with_rate_limit(limits.list.clone());
        let resolver = PathResolver::new(listing.clone(), &config.root_folder_id);
        let trash = Arc::new(TrashRemover::new(api.clone()));
        let reconciler = Reconciler::new(resolver.clone(), listing.clone(), trash.clone());
        let retry = RetryPolicy::new(config.chunk_attempts, Duration::from_millis(config.chunk_retry_delay_ms));
        let uploads = UploadSessionManager::new(api.clone(), retry);
        Self {
            config,
            transport,
            api,
            listing,
            resolver,
            uploads,
            reconciler,
            trash,
            limits,
        }
    }

    pub fn config(&self) -> &Open123Config {
        &self.config
    }

    pub fn tokens(&self) -> &TokenManager {
        self.api.tokens()
    }

    pub(crate) fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Look up an entry by host path.
    pub async fn stat(&self, path: &str) -> Result<RemoteEntry, ProviderError> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(self.root());
        }
        let parent = parent_path(&path);
        let name = path.rsplit('/').next().unwrap_or_default();
        let parent_id = self.resolver.resolve_folder(&parent).await?;
        self.resolver
            .find_child(&parent_id, &parent, name)
            .await?
            .ok_or_else(|| ProviderError::NotFound(path.clone()))
    }

    /// Resolve a folder path, creating missing folders along the way.
    pub async fn ensure_dir(&self, path: &str) -> Result<RemoteEntry, ProviderError> {
        let path = normalize_path(path);
        let mut current = self.root();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            current = match self.resolver.find_child(&current.id, &current.path, part).await? {
                Some(existing) if existing.is_dir => {
                    self.resolver.remember(&existing.path, &existing.id);
                    existing
                }
                Some(existing) => {
                    return Err(ProviderError::InvalidConfig(format!(
                        "{} exists and is not a folder",
                        existing.path
                    )))
                }
                None => self.make_dir(&current, part).await?,
            };
        }
        Ok(current)
    }

    /// Run duplicate cleanup, downgrading failure to a warning.
    async fn reconcile_after(
        &self,
        operation: &str,
        parent_id: Option<&str>,
        parent: &str,
        name: &str,
        keep_id: &str,
    ) {
        match self.reconciler.reconcile_duplicates(parent_id, parent, name, keep_id).await {
            Ok(0) => {}
            Ok(n) => debug!("[123open] {} left {} duplicate(s) of {}", operation, n, name),
            Err(e) => warn!("[123open] failed to remove duplicates after {}: {}", operation, e),
        }
    }
}

#[async_trait]
impl StorageProvider for Open123Provider {
    fn display_name(&self) -> String {
        format!("123 Cloud ({})", self.config.drive_type)
    }

    fn root(&self) -> RemoteEntry {
        RemoteEntry::directory(&self.config.root_folder_id, "root", "/")
    }

    async fn list(&self, dir: &RemoteEntry) -> Result<Vec<RemoteEntry>, ProviderError> {
        let entries = self.listing.list_at(&dir.id, &dir.path).await?;
        // Same pick as path resolution: the first folder of a given name
        let mut seen = HashSet::new();
        for folder in entries.iter().filter(|e| e.is_dir) {
            if seen.insert(folder.name.as_str()) {
                self.resolver.remember(&folder.path, &folder.id);
            }
        }
        Ok(entries)
    }

    async fn link(&self, file: &RemoteEntry) -> Result<DownloadLink, ProviderError> {
        if file.is_dir {
            return Err(ProviderError::NotSupported(format!("{} is a folder", file.path)));
        }
        self.limits.link.acquire().await;
        let resp: LinkResp = self
            .api
            .call(ApiRequest::post(
                LINK_PATH,
                json!({
                    "drive_id": self.config.drive_type.as_str(),
                    "file_id": id_value(&file.id),
                    "expire_sec": LINK_EXPIRE_SECS,
                }),
            ))
            .await?;
        if resp.url.is_empty() {
            return Err(ProviderError::ParseError(format!("get download url failed for {}", file.path)));
        }
        Ok(DownloadLink {
            url: resp.url,
            expires_in: LINK_REUSE,
        })
    }

    async fn make_dir(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError> {
        let resp: IdResp = self
            .api
            .call(ApiRequest::post(
                MKDIR_PATH,
                json!({
                    "parent_id": id_value(&parent.id),
                    "name": name,
                    "type": "folder",
                    "check_name_mode": "refuse",
                }),
            ))
            .await?;
        let id = id_string(&resp.id);
        if id.is_empty() {
            return Err(ProviderError::ParseError(format!("mkdir {}: backend returned no id", name)));
        }
        let mut dir = RemoteEntry::directory(&id, name, &join_path(&parent.path, name));
        dir.parent_id = parent.id.clone();
        dir.created = Some(chrono::Utc::now());
        dir.modified = dir.created;
        self.resolver.remember(&dir.path, &dir.id);
        debug!("[123open] created folder {} (id {})", dir.path, dir.id);
        Ok(dir)
    }

    async fn move_entry(&self, src: &RemoteEntry, dst_dir: &RemoteEntry) -> Result<RemoteEntry, ProviderError> {
        let resp: IdResp = self
            .api
            .call(ApiRequest::post(
                MOVE_PATH,
                json!({
                    "fileIDs": [id_value(&src.id)],
                    "toParentFileID": id_value(&dst_dir.id),
                }),
            ))
            .await?;

        let mut moved = src.clone();
        let new_id = id_string(&resp.id);
        if !new_id.is_empty() {
            moved.id = new_id;
        }
        moved.parent_id = dst_dir.id.clone();
        moved.path = join_path(&dst_dir.path, &moved.name);
        moved.modified = Some(chrono::Utc::now());
        if moved.is_dir {
            self.resolver.forget(&src.path);
            self.resolver.remember(&moved.path, &moved.id);
        }

        self.reconcile_after("move", Some(dst_dir.id.as_str()), &dst_dir.path, &moved.name, &moved.id)
            .await;
        Ok(moved)
    }

    async fn rename(&self, src: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError> {
        self.api
            .call_unit(
                ApiRequest::new(reqwest::Method::PUT, RENAME_PATH)
                    .with_body(json!({ "fileId": id_value(&src.id), "fileName": new_name })),
            )
            .await?;

        let parent = parent_path(&src.path);
        let mut renamed = src.clone();
        renamed.name = new_name.to_string();
        renamed.path = join_path(&parent, new_name);
        if renamed.is_dir {
            self.resolver.forget(&src.path);
            self.resolver.remember(&renamed.path, &renamed.id);
        }

        self.reconcile_after("rename", Some(src.parent_id.as_str()), &parent, new_name, &src.id)
            .await;
        Ok(renamed)
    }

    async fn remove(&self, entry: &RemoteEntry) -> Result<(), ProviderError> {
        self.trash.remove(entry).await?;
        if entry.is_dir {
            self.resolver.forget(&entry.path);
        }
        Ok(())
    }

    async fn put(
        &self,
        dst_dir: &RemoteEntry,
        source: &dyn ContentSource,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, ProviderError> {
        let mut entry = self.uploads.upload(&dst_dir.id, source, on_progress, cancel).await?;
        entry.path = join_path(&dst_dir.path, &entry.name);
        if entry.parent_id.is_empty() {
            entry.parent_id = dst_dir.id.clone();
        }
        Ok(entry)
    }
}
