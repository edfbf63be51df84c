//! Storage Providers Module
//!
//! The 123 Cloud open-platform client, split by concern:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        StorageProvider (Open123Provider)     │
//! │  root, list, link, make_dir, move, rename,   │
//! │  remove, put                                 │
//! └──────────────────────────────────────────────┘
//!        │              │               │
//!        ▼              ▼               ▼
//! ┌────────────┐ ┌─────────────┐ ┌─────────────┐
//! │  listing   │ │   upload    │ │  reconcile  │
//! │ (pages,    │ │ (sessions,  │ │ (duplicate  │
//! │  resolver) │ │  chunks)    │ │  cleanup)   │
//! └────────────┘ └─────────────┘ └─────────────┘
//!        │              │               │
//!        └──────────────┼───────────────┘
//!                       ▼
//!          ApiClient (transport + token)
//! ```

pub mod http_retry;
pub mod listing;
pub mod open123;
pub mod rate_limit;
pub mod reconcile;
pub mod token;
pub mod transport;
pub mod types;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use listing::{ListingEngine, ListingOptions, ListingPage, PathResolver};
pub use open123::Open123Provider;
pub use rate_limit::RateLimiter;
pub use reconcile::{EntryRemover, Reconciler, TrashRemover};
pub use token::{Credential, SubjectCheck, TokenManager};
pub use transport::{ApiClient, ApiRequest, ReqwestTransport, Transport};
pub use types::*;
pub use upload::{ContentSource, LocalFileSource, MemorySource, ProgressFn, UploadSessionManager};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Unified storage provider trait
///
/// Operations take entries rather than paths: the backend addresses
/// everything by id, and names are not unique inside a folder.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get display name for this provider instance
    fn display_name(&self) -> String;

    /// Root folder of the mount
    fn root(&self) -> RemoteEntry;

    /// All children of a folder, in backend order
    async fn list(&self, dir: &RemoteEntry) -> Result<Vec<RemoteEntry>, ProviderError>;

    /// Direct download URL for a file
    async fn link(&self, file: &RemoteEntry) -> Result<DownloadLink, ProviderError>;

    /// Create a folder; fails if the name is taken
    async fn make_dir(&self, parent: &RemoteEntry, name: &str) -> Result<RemoteEntry, ProviderError>;

    /// Move an entry into another folder
    async fn move_entry(&self, src: &RemoteEntry, dst_dir: &RemoteEntry) -> Result<RemoteEntry, ProviderError>;

    /// Rename an entry in place
    async fn rename(&self, src: &RemoteEntry, new_name: &str) -> Result<RemoteEntry, ProviderError>;

    /// Server-side copy
    async fn copy(&self, _src: &RemoteEntry, _dst_dir: &RemoteEntry) -> Result<RemoteEntry, ProviderError> {
        Err(ProviderError::NotSupported("copy".to_string()))
    }

    /// Move an entry to the trash
    async fn remove(&self, entry: &RemoteEntry) -> Result<(), ProviderError>;

    /// Upload content into a folder
    async fn put(
        &self,
        dst_dir: &RemoteEntry,
        source: &dyn ContentSource,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, ProviderError>;
}
