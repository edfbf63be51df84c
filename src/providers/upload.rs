//! Resumable chunked uploads.
//!
//! The backend keeps the only record of upload progress. A transfer
//! negotiates a session keyed by destination, name, MD5 and size, asks the
//! backend which parts it already holds, and sends the rest in ascending
//! order. Re-running an interrupted upload with the same inputs lands on the
//! same session and skips every accepted part; nothing is checkpointed
//! locally.

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::http_retry::{is_chunk_success, retry_fixed, RetryPolicy};
use super::listing::ApiFile;
use super::transport::{id_string, id_value, ApiClient, ApiRequest};
use super::{ProviderError, RemoteEntry};

const CREATE_PATH: &str = "/upload/v1/file/create";
const LIST_PARTS_PATH: &str = "/upload/v1/file/list_upload_parts";
const UPLOAD_URL_PATH: &str = "/upload/v1/file/get_upload_url";
const COMPLETE_PATH: &str = "/upload/v1/file/complete";
const DETAIL_PATH: &str = "/api/v1/file/detail";

/// Buffer size used while hashing local files
const HASH_BUFFER: usize = 1024 * 1024;

/// Upload progress callback, receives a percentage in `[0, 100]`
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Content to upload: sized, hashable, and readable at arbitrary offsets
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Lowercase hex MD5 of the whole content
    async fn md5_hex(&self) -> Result<String, ProviderError>;

    /// Read exactly `len` bytes starting at `offset`
    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError>;
}

/// Content held in memory
pub struct MemorySource {
    name: String,
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn md5_hex(&self) -> Result<String, ProviderError> {
        Ok(hex::encode(Md5::digest(&self.data)))
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset, len))?;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .map(|slice| slice.to_vec())
            .ok_or_else(|| out_of_range(offset, len))
    }
}

fn out_of_range(offset: u64, len: usize) -> ProviderError {
    ProviderError::IoError(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("range {}+{} past end of content", offset, len),
    ))
}

/// Content read from a local file
pub struct LocalFileSource {
    path: PathBuf,
    name: String,
    size: u64,
    md5: Option<String>,
}

impl LocalFileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(ProviderError::NotFound(format!("{} is not a file", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ProviderError::NotFound(format!("{} has no file name", path.display())))?;
        Ok(Self {
            path,
            name,
            size: meta.len(),
            md5: None,
        })
    }

    /// Upload under a different remote name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Use a hash the caller already knows instead of reading the file twice
    pub fn with_md5(mut self, md5: &str) -> Self {
        self.md5 = Some(md5.to_lowercase());
        self
    }
}

#[async_trait]
impl ContentSource for LocalFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn md5_hex(&self) -> Result<String, ProviderError> {
        if let Some(ref md5) = self.md5 {
            return Ok(md5.clone());
        }
        let mut file = tokio::fs::File::open(&self.path).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; HASH_BUFFER];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut chunk = vec![0u8; len];
        file.read_exact(&mut chunk).await?;
        Ok(chunk)
    }
}

/// Backend-tracked state of one chunked transfer
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSession {
    #[serde(default, alias = "preuploadID")]
    pub preupload_id: String,
    /// Part size fixed by the backend for this session
    #[serde(default, alias = "sliceSize")]
    pub slice_size: u64,
    #[serde(default, alias = "fileID", deserialize_with = "de_id")]
    pub file_id: String,
    /// Backend already holds identical content (same MD5 and size)
    #[serde(default)]
    pub reuse: bool,
}

/// A part the backend has accepted
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkRecord {
    #[serde(alias = "partNumber")]
    pub part_number: u32,
    #[serde(default)]
    pub etag: String,
}

#[derive(Debug, Deserialize)]
struct PartList {
    #[serde(default)]
    parts: Vec<ChunkRecord>,
}

#[derive(Debug, Deserialize)]
struct UploadUrl {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompleteResp {
    #[serde(default, alias = "fileID", deserialize_with = "de_id")]
    file_id: String,
}

fn de_id<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(id_string(&value))
}

fn percent(offset: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        offset as f64 * 100.0 / total as f64
    }
}

/// Drives a single file through negotiate / resume / send / complete.
#[derive(Clone)]
pub struct UploadSessionManager {
    api: ApiClient,
    retry: RetryPolicy,
}

impl UploadSessionManager {
    pub fn new(api: ApiClient, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Upload `source` into folder `parent_id`.
    ///
    /// The returned entry has no host path; the caller places it.
    pub async fn upload(
        &self,
        parent_id: &str,
        source: &dyn ContentSource,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<RemoteEntry, ProviderError> {
        let total = source.size();
        let etag = source.md5_hex().await?;
        let session = self.negotiate(parent_id, source.name(), &etag, total).await?;

        if session.reuse {
            info!("[123open] {} already stored (reuse), skipping transfer", source.name());
            let entry = self
                .file_info(&session.file_id)
                .await
                .map_err(|e| ProviderError::Negotiation(format!("reused file {}: {}", session.file_id, e)))?;
            on_progress(100.0);
            return Ok(entry);
        }
        if session.slice_size == 0 {
            return Err(ProviderError::Negotiation("backend returned a zero slice size".to_string()));
        }

        let uploaded = self.uploaded_parts(&session.preupload_id).await?;

        let mut offset: u64 = 0;
        let mut part: u32 = 1;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let length = session.slice_size.min(total - offset);

            if uploaded.contains_key(&part) {
                debug!("[123open] part {} already uploaded, skipping", part);
            } else {
                self.send_part(&session, part, source, offset, length).await?;
            }

            offset += length;
            part += 1;
            on_progress(percent(offset, total));
        }

        let file_id = self.complete(&session).await?;
        let entry = self
            .file_info(&file_id)
            .await
            .map_err(|e| ProviderError::Completion(format!("fetching file {}: {}", file_id, e)))?;
        if total == 0 {
            on_progress(100.0);
        }
        info!("[123open] uploaded {} ({} bytes, {} parts)", source.name(), total, part - 1);
        Ok(entry)
    }

    async fn negotiate(
        &self,
        parent_id: &str,
        name: &str,
        etag: &str,
        size: u64,
    ) -> Result<UploadSession, ProviderError> {
        let body = json!({
            "parentFileID": id_value(parent_id),
            "filename": name,
            "etag": etag,
            "size": size,
            "duplicate": 1,
        });
        self.api
            .call(ApiRequest::post(CREATE_PATH, body))
            .await
            .map_err(|e| ProviderError::Negotiation(e.to_string()))
    }

    /// Parts the backend already holds for this session, by part number.
    async fn uploaded_parts(&self, preupload_id: &str) -> Result<HashMap<u32, ChunkRecord>, ProviderError> {
        let list: PartList = self
            .api
            .call(ApiRequest::post(LIST_PARTS_PATH, json!({ "preuploadID": preupload_id })))
            .await
            .map_err(|e| ProviderError::Negotiation(format!("listing uploaded parts: {}", e)))?;
        Ok(list.parts.into_iter().map(|p| (p.part_number, p)).collect())
    }

    async fn part_upload_url(&self, preupload_id: &str, part: u32) -> Result<String, ProviderError> {
        let resp: UploadUrl = self
            .api
            .call(ApiRequest::post(
                UPLOAD_URL_PATH,
                json!({ "preuploadID": preupload_id, "partNumber": part }),
            ))
            .await?;
        if resp.url.is_empty() {
            return Err(ProviderError::ParseError("backend returned an empty upload url".to_string()));
        }
        Ok(resp.url)
    }

    async fn send_part(
        &self,
        session: &UploadSession,
        part: u32,
        source: &dyn ContentSource,
        offset: u64,
        length: u64,
    ) -> Result<(), ProviderError> {
        let transfer_err = |message: String| ProviderError::Transfer { chunk: part, message };

        let url = self
            .part_upload_url(&session.preupload_id, part)
            .await
            .map_err(|e| transfer_err(format!("acquiring upload url: {}", e)))?;
        let len = usize::try_from(length).map_err(|_| transfer_err(format!("part length {} too large", length)))?;
        let chunk = source
            .read_range(offset, len)
            .await
            .map_err(|e| transfer_err(format!("reading content: {}", e)))?;

        let label = format!("part {}", part);
        retry_fixed(&self.retry, &label, |_| {
            let body = chunk.clone();
            let url = url.as_str();
            async move {
                let status = self.api.put_bytes(url, body).await?;
                if is_chunk_success(status) {
                    Ok(())
                } else {
                    Err(ProviderError::NetworkError(format!("upload failed, status: {}", status)))
                }
            }
        })
        .await
        .map_err(|e| transfer_err(format!("{} after {} attempts", e, self.retry.attempts)))?;

        debug!("[123open] part {} sent ({} bytes at {})", part, length, offset);
        Ok(())
    }

    /// Finalize the session, returning the id of the stored file.
    async fn complete(&self, session: &UploadSession) -> Result<String, ProviderError> {
        let resp: CompleteResp = self
            .api
            .call(ApiRequest::post(COMPLETE_PATH, json!({ "preuploadID": session.preupload_id })))
            .await
            .map_err(|e| ProviderError::Completion(e.to_string()))?;
        if !resp.file_id.is_empty() {
            Ok(resp.file_id)
        } else if !session.file_id.is_empty() {
            Ok(session.file_id.clone())
        } else {
            Err(ProviderError::Completion("backend reported no file id".to_string()))
        }
    }

    /// Metadata of a stored file
    pub async fn file_info(&self, file_id: &str) -> Result<RemoteEntry, ProviderError> {
        let req = ApiRequest::new(reqwest::Method::GET, DETAIL_PATH).with_query("fileID", file_id);
        let file: ApiFile = self.api.call(req).await?;
        Ok(file.into_entry(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::{api_client, api_file, MockTransport};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const SLICE: u64 = 4;

    fn manager(mock: &Arc<MockTransport>) -> UploadSessionManager {
        UploadSessionManager::new(api_client(mock), RetryPolicy::new(3, Duration::ZERO))
    }

    fn script_session(mock: &MockTransport, parts_done: &[u32], total_parts: u32) {
        mock.respond_data(
            CREATE_PATH,
            json!({"preuploadID": "pre-1", "sliceSize": SLICE, "fileID": 0, "reuse": false}),
        );
        let parts: Vec<Value> = parts_done
            .iter()
            .map(|n| json!({"partNumber": n, "etag": format!("etag-{}", n)}))
            .collect();
        mock.respond_data(LIST_PARTS_PATH, json!({ "parts": parts }));
        for n in 1..=total_parts {
            if !parts_done.contains(&n) {
                mock.respond_data(UPLOAD_URL_PATH, json!({ "url": format!("https://up/{}", n) }));
            }
        }
        mock.respond_data(COMPLETE_PATH, json!({"fileID": 77, "completed": true}));
        mock.respond_data(DETAIL_PATH, api_file(77, "data.bin", 5, false, 10));
    }

    fn progress_log() -> (Arc<Mutex<Vec<f64>>>, impl Fn(f64) + Send + Sync) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |p: f64| sink.lock().unwrap().push(p))
    }

    #[tokio::test]
    async fn test_full_upload_sends_all_parts_in_order() {
        let mock = Arc::new(MockTransport::new());
        script_session(&mock, &[], 3);
        let source = MemorySource::new("data.bin", (0u8..10).collect());
        let (log, progress) = progress_log();

        let entry = manager(&mock)
            .upload("5", &source, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entry.id, "77");
        assert_eq!(mock.put_urls(), vec!["https://up/1", "https://up/2", "https://up/3"]);
        let sizes: Vec<usize> = mock.put_log.lock().unwrap().iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(mock.put_log.lock().unwrap()[2].1, vec![8, 9]);

        let create = &mock.bodies(CREATE_PATH)[0];
        assert_eq!(create["parentFileID"], 5);
        assert_eq!(create["etag"], hex::encode(Md5::digest((0u8..10).collect::<Vec<_>>())));
        assert_eq!(create["size"], 10);
        assert_eq!(create["duplicate"], 1);

        let log = log.lock().unwrap();
        assert!(log.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*log.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_resume_skips_accepted_parts() {
        let mock = Arc::new(MockTransport::new());
        script_session(&mock, &[1, 2], 3);
        let source = MemorySource::new("data.bin", vec![7u8; 10]);
        let (log, progress) = progress_log();

        manager(&mock)
            .upload("5", &source, &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mock.put_urls(), vec!["https://up/3"]);
        assert_eq!(mock.bodies(UPLOAD_URL_PATH).len(), 1);
        assert_eq!(mock.bodies(UPLOAD_URL_PATH)[0]["partNumber"], 3);
        assert_eq!(mock.count(COMPLETE_PATH), 1);
        assert_eq!(*log.lock().unwrap(), vec![40.0, 80.0, 100.0]);
    }

    #[tokio::test]
    async fn test_resume_after_crash_does_not_resend_parts() {
        // First run dies on part 2; the backend then reports part 1 as held.
        let mock = Arc::new(MockTransport::new());
        mock.respond_data(CREATE_PATH, json!({"preuploadID": "pre-1", "sliceSize": SLICE, "reuse": false}));
        mock.respond_data(LIST_PARTS_PATH, json!({"parts": []}));
        mock.respond_data(UPLOAD_URL_PATH, json!({"url": "https://up/1"}));
        mock.fail(UPLOAD_URL_PATH, ProviderError::NetworkError("connection reset".to_string()));

        let source = MemorySource::new("data.bin", vec![1u8; 12]);
        let first = manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await;
        assert!(matches!(first, Err(ProviderError::Transfer { chunk: 2, .. })));
        assert_eq!(mock.put_urls(), vec!["https://up/1"]);

        script_session(&mock, &[1], 3);
        manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mock.put_urls(), vec!["https://up/1", "https://up/2", "https://up/3"]);
    }

    #[tokio::test]
    async fn test_reuse_transfers_nothing() {
        let mock = Arc::new(MockTransport::new());
        mock.respond_data(CREATE_PATH, json!({"preuploadID": "", "sliceSize": 0, "fileID": 31, "reuse": true}));
        mock.respond_data(DETAIL_PATH, api_file(31, "data.bin", 5, false, 10));
        let source = MemorySource::new("data.bin", vec![0u8; 10]);

        let entry = manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entry.id, "31");
        assert_eq!(mock.put_count(), 0);
        assert_eq!(mock.count(LIST_PARTS_PATH), 0);
        assert_eq!(mock.count(COMPLETE_PATH), 0);
    }

    #[tokio::test]
    async fn test_chunk_retry_recovers_on_third_attempt() {
        let mock = Arc::new(MockTransport::new());
        script_session(&mock, &[], 1);
        mock.script_put(Err(ProviderError::NetworkError("reset".to_string())));
        mock.script_put(Ok(500));
        mock.script_put(Ok(200));
        let source = MemorySource::new("data.bin", vec![3u8; 4]);

        manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mock.put_count(), 3);
        assert_eq!(mock.count(COMPLETE_PATH), 1);
    }

    #[tokio::test]
    async fn test_chunk_retry_exhausted_aborts_without_completion() {
        let mock = Arc::new(MockTransport::new());
        script_session(&mock, &[], 1);
        for _ in 0..3 {
            mock.script_put(Ok(503));
        }
        let source = MemorySource::new("data.bin", vec![3u8; 4]);

        let err = manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transfer { chunk: 1, .. }));
        assert!(err.to_string().contains("503"));
        assert_eq!(mock.put_count(), 3);
        assert_eq!(mock.count(COMPLETE_PATH), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let mock = Arc::new(MockTransport::new());
        script_session(&mock, &[], 3);
        let source = MemorySource::new("data.bin", vec![9u8; 10]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let progress = move |p: f64| {
            if p >= 40.0 {
                trigger.cancel();
            }
        };

        let err = manager(&mock).upload("5", &source, &progress, &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert_eq!(mock.put_count(), 1);
        assert_eq!(mock.count(UPLOAD_URL_PATH), 1);
        assert_eq!(mock.count(COMPLETE_PATH), 0);
    }

    #[tokio::test]
    async fn test_phase_errors() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(CREATE_PATH, json!({"code": 5060, "message": "parent not found"}));
        let source = MemorySource::new("data.bin", vec![1u8; 4]);
        let err = manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Negotiation(_)));
        assert!(err.to_string().contains("parent not found"));

        let mock = Arc::new(MockTransport::new());
        mock.respond_data(CREATE_PATH, json!({"preuploadID": "p", "sliceSize": SLICE, "reuse": false}));
        mock.respond(LIST_PARTS_PATH, json!({"code": 1, "message": "no session"}));
        let err = manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Negotiation(_)));

        let mock = Arc::new(MockTransport::new());
        mock.respond_data(CREATE_PATH, json!({"preuploadID": "p", "sliceSize": SLICE, "reuse": false}));
        mock.respond_data(LIST_PARTS_PATH, json!({"parts": []}));
        mock.respond_data(UPLOAD_URL_PATH, json!({"url": "https://up/1"}));
        mock.respond(COMPLETE_PATH, json!({"code": 1, "message": "etag mismatch"}));
        let err = manager(&mock)
            .upload("5", &source, &|_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Completion(_)));
        assert!(err.to_string().contains("etag mismatch"));
    }

    #[tokio::test]
    async fn test_zero_byte_upload_completes() {
        let mock = Arc::new(MockTransport::new());
        script_session(&mock, &[], 0);
        let source = MemorySource::new("empty", Vec::new());
        let (log, progress) = progress_log();

        manager(&mock)
            .upload("5", &source, &progress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mock.put_count(), 0);
        assert_eq!(mock.count(COMPLETE_PATH), 1);
        assert_eq!(*log.lock().unwrap(), vec![100.0]);
    }

    #[tokio::test]
    async fn test_local_file_source_ranges_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        std::fs::write(&path, b"hello world").unwrap();

        let source = LocalFileSource::open(&path).await.unwrap();
        assert_eq!(source.name(), "video.mp4");
        assert_eq!(source.size(), 11);
        assert_eq!(source.md5_hex().await.unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(source.read_range(6, 5).await.unwrap(), b"world");
        assert!(source.read_range(8, 10).await.is_err());

        let renamed = LocalFileSource::open(&path).await.unwrap().with_name("clip.mp4").with_md5("ABC");
        assert_eq!(renamed.name(), "clip.mp4");
        assert_eq!(renamed.md5_hex().await.unwrap(), "abc");
    }
}
