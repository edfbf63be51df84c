//! Duplicate cleanup after move and rename.
//!
//! The backend does not make move/rename atomic and can leave an older entry
//! with the same name next to the one that was just placed. Reconciliation
//! lists the folder again and trashes every same-named entry except the one
//! the operation produced.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::listing::{normalize_path, ListingEngine, PathResolver};
use super::transport::{id_value, ApiClient, ApiRequest};
use super::{ProviderError, RemoteEntry};

const TRASH_PATH: &str = "/api/v1/file/trash";

/// Remove primitive used by the reconciler
#[async_trait]
pub trait EntryRemover: Send + Sync {
    async fn remove(&self, entry: &RemoteEntry) -> Result<(), ProviderError>;
}

/// Moves entries to the backend trash
pub struct TrashRemover {
    api: ApiClient,
}

impl TrashRemover {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EntryRemover for TrashRemover {
    async fn remove(&self, entry: &RemoteEntry) -> Result<(), ProviderError> {
        self.api
            .call_unit(ApiRequest::post(TRASH_PATH, json!({ "fileIDs": [id_value(&entry.id)] })))
            .await
    }
}

#[derive(Clone)]
pub struct Reconciler {
    resolver: PathResolver,
    listing: ListingEngine,
    remover: Arc<dyn EntryRemover>,
}

impl Reconciler {
    pub fn new(resolver: PathResolver, listing: ListingEngine, remover: Arc<dyn EntryRemover>) -> Self {
        Self {
            resolver,
            listing,
            remover,
        }
    }

    /// Trash every child of the parent folder named `name` whose id is not
    /// `keep_id`. Returns how many entries were removed.
    ///
    /// `parent_id` is used as is when the caller knows it; folder names are
    /// not unique, so `parent_path` is only resolved when it is missing.
    /// Stops at the first failure; entries removed before it stay removed.
    pub async fn reconcile_duplicates(
        &self,
        parent_id: Option<&str>,
        parent_path: &str,
        name: &str,
        keep_id: &str,
    ) -> Result<usize, ProviderError> {
        let parent_path = normalize_path(parent_path);
        let parent_id = match parent_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self
                .resolver
                .resolve_folder(&parent_path)
                .await
                .map_err(|e| ProviderError::Reconciliation(format!("resolving {}: {}", parent_path, e)))?,
        };
        let children = self
            .listing
            .list_at(&parent_id, &parent_path)
            .await
            .map_err(|e| ProviderError::Reconciliation(format!("listing {}: {}", parent_path, e)))?;

        let mut removed = 0;
        for stale in children.iter().filter(|e| e.name == name && e.id != keep_id) {
            debug!("[123open] removing duplicate {} (id {}) in {}", stale.name, stale.id, parent_path);
            self.remover.remove(stale).await.map_err(|e| {
                ProviderError::Reconciliation(format!("removing duplicate {} (id {}): {}", stale.name, stale.id, e))
            })?;
            if stale.is_dir {
                self.resolver.forget(&stale.path);
            }
            removed += 1;
        }
        if removed > 0 {
            info!("[123open] removed {} duplicate(s) of {} in {}", removed, name, parent_path);
        }
        Ok(removed)
    }
}
