//! Transport boundary to the remote cache.
//!
//! The engine needs exactly three operations — existence query, upload,
//! download — expressed by `CacheTransport`. `HttpTransport` speaks to a
//! cache server over HTTP (narinfo and payload as separate resources; the
//! server makes an entry visible only once the payload lands and verifies).
//! `MemoryTransport` is the in-process double used by tests and local runs:
//! entries appear under its lock only when complete, which is the append-only
//! visibility rule in miniature.

use std::collections::HashMap;
use std::env;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::SyncError;
use crate::narinfo::NarInfo;
use crate::store_path::StorePath;

const DEFAULT_RETRY_COUNT: usize = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// The three logical operations the sync engine needs from a remote cache.
pub trait CacheTransport: Send + Sync {
    /// Whether the cache already holds a complete, verified entry.
    fn exists(&self, path: &StorePath) -> Result<bool, SyncError>;

    /// Store a complete entry. Re-uploading an existing entry is a no-op
    /// success (content is identical by construction).
    fn upload(&self, info: &NarInfo, payload: &[u8]) -> Result<(), SyncError>;

    /// Retrieve an entry: metadata plus compressed payload.
    fn download(&self, path: &StorePath) -> Result<(NarInfo, Vec<u8>), SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// In-process cache double. Complete entries only; once visible, immutable
/// (except for signature accumulation, which converges).
#[derive(Default)]
pub struct MemoryTransport {
    entries: Mutex<HashMap<StorePath, (NarInfo, Vec<u8>)>>,
    upload_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upload calls served, for idempotence assertions.
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Flip one byte of a stored payload. Test hook for tamper scenarios.
    pub fn corrupt_payload(&self, path: &StorePath, offset: usize) {
        let mut entries = self.entries.lock().unwrap();
        if let Some((_, payload)) = entries.get_mut(path) {
            if let Some(byte) = payload.get_mut(offset) {
                *byte ^= 0xff;
            }
        }
    }

    /// Drop an entry's payload bytes short. Test hook for truncation.
    pub fn truncate_payload(&self, path: &StorePath, len: usize) {
        let mut entries = self.entries.lock().unwrap();
        if let Some((_, payload)) = entries.get_mut(path) {
            payload.truncate(len);
        }
    }
}

impl CacheTransport for MemoryTransport {
    fn exists(&self, path: &StorePath) -> Result<bool, SyncError> {
        Ok(self.entries.lock().unwrap().contains_key(path))
    }

    fn upload(&self, info: &NarInfo, payload: &[u8]) -> Result<(), SyncError> {
        self.upload_calls.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&info.store_path) {
            Some((existing, _)) => {
                // Identifiers are content-derived, so a concurrent re-push
                // carries identical bytes; only signatures can accumulate.
                for sig in &info.signatures {
                    existing.add_signature(sig.clone());
                }
            }
            None => {
                entries.insert(info.store_path.clone(), (info.clone(), payload.to_vec()));
            }
        }
        Ok(())
    }

    fn download(&self, path: &StorePath) -> Result<(NarInfo, Vec<u8>), SyncError> {
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::Transfer {
                operation: "download".to_string(),
                url: None,
                status: Some(404),
                source: format!("no cache entry for {}", path),
                retryable: false,
            })
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

fn retry_count_from_env() -> usize {
    env::var("NARSYNC_HTTP_RETRIES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_RETRY_COUNT)
}

fn retry_backoff_ms_from_env() -> u64 {
    env::var("NARSYNC_HTTP_RETRY_BACKOFF_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_BACKOFF_MS)
}

fn classify(err: &ureq::Error) -> (Option<u16>, bool) {
    match err {
        ureq::Error::Status(code, _) => (Some(*code), *code >= 500),
        // Connection/DNS/timeout failures are worth retrying.
        _ => (None, true),
    }
}

/// HTTP cache client: one ureq Agent (connection reuse), bounded retry with
/// exponential backoff on transient failures.
pub struct HttpTransport {
    agent: ureq::Agent,
    endpoint: String,
    retries: usize,
    backoff_ms: u64,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build();
        Self {
            agent,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            retries: retry_count_from_env(),
            backoff_ms: retry_backoff_ms_from_env(),
        }
    }

    fn narinfo_url(&self, path: &StorePath) -> String {
        format!("{}/narinfo/{}", self.endpoint, path.render())
    }

    fn nar_url(&self, path: &StorePath) -> String {
        format!("{}/nar/{}", self.endpoint, path.render())
    }

    /// Run a request with retry on transient failures. 4xx responses are
    /// final; 5xx and transport errors back off and retry.
    fn with_retry<T>(
        &self,
        operation: &str,
        url: &str,
        mut attempt_fn: impl FnMut() -> Result<T, ureq::Error>,
    ) -> Result<T, SyncError> {
        let mut attempt = 0;
        loop {
            match attempt_fn() {
                Ok(v) => return Ok(v),
                Err(err) => {
                    let (status, retryable) = classify(&err);
                    if retryable && attempt < self.retries {
                        let delay = self.backoff_ms * (1 << attempt);
                        std::thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::Transfer {
                        operation: operation.to_string(),
                        url: Some(url.to_string()),
                        status,
                        source: err.to_string(),
                        retryable,
                    });
                }
            }
        }
    }
}

impl CacheTransport for HttpTransport {
    fn exists(&self, path: &StorePath) -> Result<bool, SyncError> {
        let url = self.narinfo_url(path);
        // 404 is a final answer, not a failure; everything else gets the same
        // retry treatment as upload and download.
        self.with_retry("exists", &url, || match self.agent.head(&url).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(err) => Err(err),
        })
    }

    fn upload(&self, info: &NarInfo, payload: &[u8]) -> Result<(), SyncError> {
        let info_json = info.to_json()?;

        // Metadata first; the server keeps the entry invisible until the
        // payload arrives and verifies.
        let url = self.narinfo_url(&info.store_path);
        self.with_retry("upload narinfo", &url, || {
            self.agent
                .put(&url)
                .set("content-type", "application/json")
                .send_string(&info_json)
        })?;

        let url = self.nar_url(&info.store_path);
        self.with_retry("upload nar", &url, || {
            self.agent
                .put(&url)
                .set("content-type", "application/octet-stream")
                .send_bytes(payload)
        })?;
        Ok(())
    }

    fn download(&self, path: &StorePath) -> Result<(NarInfo, Vec<u8>), SyncError> {
        let url = self.narinfo_url(path);
        let response = self.with_retry("download narinfo", &url, || self.agent.get(&url).call())?;
        let info_json = response.into_string().map_err(|e| SyncError::Transfer {
            operation: "download narinfo".to_string(),
            url: Some(url.clone()),
            status: None,
            source: e.to_string(),
            retryable: true,
        })?;
        let info = NarInfo::from_json(&info_json)?;

        let url = self.nar_url(path);
        let response = self.with_retry("download nar", &url, || self.agent.get(&url).call())?;
        let mut payload = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut payload)
            .map_err(|e| SyncError::Transfer {
                operation: "download nar".to_string(),
                url: Some(url),
                status: None,
                source: e.to_string(),
                retryable: true,
            })?;
        Ok((info, payload))
    }
}
