//! The cache protocol engine: push and fetch of store path closures.
//!
//! Push: resolve closure -> skip paths the server has -> per path archive,
//! compress, sign, upload. Fetch: download, decompress, verify integrity,
//! verify signature -> materialize in dependency order. Per-path pipelines
//! run in parallel across paths on a bounded worker pool; materialization is
//! sequential in closure order so a path is never visible before its
//! dependencies. A shared cancel flag stops in-flight work at stage
//! boundaries — a path either finishes its stage or contributes nothing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::archive;
use crate::closure::compute_closure;
use crate::compress::{self, Compression};
use crate::error::SyncError;
use crate::integrity::{verify_nar, verify_path, NarHash};
use crate::narinfo::NarInfo;
use crate::signing::{SecretKey, TrustedKeys};
use crate::store::StoreBackend;
use crate::store_path::StorePath;
use crate::transport::CacheTransport;
use crate::utils::{log, tell_size};

/// Outcome of a push session.
#[derive(Debug, Default)]
pub struct PushSummary {
    /// Paths uploaded by this session, in closure order.
    pub sent: Vec<StorePath>,
    /// Closure members skipped because the server already had them.
    pub skipped: Vec<StorePath>,
    /// Whether the session was cancelled; `sent` then covers only the paths
    /// that completed their upload before the cancel landed.
    pub cancelled: bool,
}

/// Outcome of a fetch session.
#[derive(Debug, Default)]
pub struct FetchSummary {
    /// Paths materialized by this session, dependencies first.
    pub materialized: Vec<StorePath>,
    /// Closure members that were already in the local store.
    pub already_present: Vec<StorePath>,
    /// Whether the session was cancelled; `materialized` then covers only the
    /// paths made visible before the cancel landed, dependencies included.
    pub cancelled: bool,
}

/// Client for one remote cache. Holds the trust configuration for the
/// session; safe to share across threads.
pub struct SyncClient<'a> {
    backend: &'a dyn StoreBackend,
    transport: &'a dyn CacheTransport,
    trusted: TrustedKeys,
    signer: Option<SecretKey>,
    compression: Compression,
    max_jobs: usize,
    cancelled: AtomicBool,
    /// Paths known to exist on the server, so one session never re-queries
    /// or re-sends a path.
    objects_on_server: Mutex<HashSet<StorePath>>,
}

impl<'a> SyncClient<'a> {
    pub fn new(backend: &'a dyn StoreBackend, transport: &'a dyn CacheTransport) -> Self {
        Self {
            backend,
            transport,
            trusted: TrustedKeys::new(),
            signer: None,
            compression: Compression::default(),
            max_jobs: crate::utils::max_jobs_from_env(),
            cancelled: AtomicBool::new(false),
            objects_on_server: Mutex::new(HashSet::new()),
        }
    }

    /// Key used to sign pushed entries. Without one, pushes are unsigned and
    /// will only be fetchable by clients that trust some other signer of the
    /// same entries.
    pub fn with_signer(mut self, signer: SecretKey) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Keys trusted when verifying fetched entries. Empty set means every
    /// fetch fails closed.
    pub fn with_trusted_keys(mut self, trusted: TrustedKeys) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    /// Advisory cancellation: in-flight per-path work stops at the next
    /// stage boundary; nothing half-committed becomes visible. Permanent for
    /// this client — a cancelled session is over, make a new client to
    /// transfer again.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn pool(&self) -> Result<rayon::ThreadPool, SyncError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_jobs)
            .build()
            .map_err(|e| SyncError::Store {
                operation: "build worker pool".to_string(),
                detail: e.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Push the full closures of `roots` to the remote cache. Idempotent:
    /// paths already on the server are skipped without any archive,
    /// compress, sign or upload work.
    pub fn push(&self, roots: &[StorePath]) -> Result<PushSummary, SyncError> {
        log("Computing path closure...");
        let closure = compute_closure(self.backend, roots)?;
        if closure.len() > roots.len() {
            log(&format!(
                "{} given as input, but the full dependency closure contains {}.",
                tell_size(roots.len(), "path"),
                tell_size(closure.len(), "path")
            ));
        }

        let pool = self.pool()?;

        // Ask the server what it already has, in parallel.
        let known: HashSet<StorePath> = {
            let seen = self.objects_on_server.lock().unwrap();
            closure.iter().filter(|p| seen.contains(*p)).cloned().collect()
        };
        let to_query: Vec<&StorePath> = closure.iter().filter(|p| !known.contains(*p)).collect();
        let query_results: Vec<(StorePath, Result<bool, SyncError>)> = pool.install(|| {
            to_query
                .par_iter()
                .map(|p| ((*p).clone(), self.transport.exists(p)))
                .collect()
        });

        let mut on_server = known;
        for (path, result) in query_results {
            if result? {
                on_server.insert(path);
            }
        }
        {
            let mut seen = self.objects_on_server.lock().unwrap();
            seen.extend(on_server.iter().cloned());
        }

        let mut summary = PushSummary::default();
        let to_send: Vec<StorePath> = closure
            .iter()
            .filter(|p| !on_server.contains(*p))
            .cloned()
            .collect();
        summary.skipped = closure.into_iter().filter(|p| on_server.contains(p)).collect();

        if to_send.is_empty() {
            log("Nothing to push: server has the whole closure.");
            summary.cancelled = self.is_cancelled();
            return Ok(summary);
        }
        log(&format!("Pushing {}...", tell_size(to_send.len(), "store object")));

        let results: Vec<Result<Option<StorePath>, SyncError>> = pool.install(|| {
            to_send
                .par_iter()
                .map(|path| {
                    self.push_one(path).map_err(|e| {
                        self.cancel();
                        e
                    })
                })
                .collect()
        });

        for result in results {
            if let Some(path) = result? {
                self.objects_on_server.lock().unwrap().insert(path.clone());
                summary.sent.push(path);
            }
        }
        summary.cancelled = self.is_cancelled();
        if summary.cancelled {
            log("Push cancelled; remaining paths were not transferred.");
        } else {
            log(&format!("Finished pushing {}.", tell_size(summary.sent.len(), "path")));
        }
        Ok(summary)
    }

    /// One path's push pipeline: archive -> compress -> sign -> upload.
    /// Returns Ok(None) when cancellation stopped the path before upload.
    fn push_one(&self, path: &StorePath) -> Result<Option<StorePath>, SyncError> {
        if self.is_cancelled() {
            return Ok(None);
        }
        let references = self.backend.direct_references(path)?;
        let subtree = self.backend.realize(path)?;
        let nar = archive::encode(&subtree)?;

        if self.is_cancelled() {
            return Ok(None);
        }
        let nar_hash = NarHash::compute(&nar);
        let payload = compress::compress(path, &nar, self.compression)?;

        let mut info = NarInfo::new(
            path.clone(),
            nar_hash,
            nar.len() as u64,
            self.compression,
            references,
        );
        if let Some(signer) = &self.signer {
            info.sign(signer);
        }

        if self.is_cancelled() {
            return Ok(None);
        }
        self.transport.upload(&info, &payload)?;
        log(&format!("pushed {}", path));
        Ok(Some(path.clone()))
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Fetch `roots` and everything they reference into the local store.
    /// Downloads and verification run in parallel; materialization is strictly
    /// dependency-ordered. Any verification failure aborts the fetch with the
    /// failing path — dependents of a failed path are never materialized.
    pub fn fetch(&self, roots: &[StorePath]) -> Result<FetchSummary, SyncError> {
        let pool = self.pool()?;

        // Discover and verify the remote closure in waves: download a
        // frontier in parallel, then queue the references we still lack.
        let mut staged: HashMap<StorePath, (NarInfo, Vec<u8>)> = HashMap::new();
        let mut queued: HashSet<StorePath> = HashSet::new();
        let mut frontier: Vec<StorePath> = Vec::new();
        for root in roots {
            if !self.backend.contains(root) && queued.insert(root.clone()) {
                frontier.push(root.clone());
            }
        }
        if !frontier.is_empty() {
            log(&format!("Fetching {}...", tell_size(frontier.len(), "root path")));
        }

        while !frontier.is_empty() {
            let results: Vec<Result<Option<(NarInfo, Vec<u8>)>, SyncError>> = pool.install(|| {
                frontier
                    .par_iter()
                    .map(|path| {
                        self.fetch_one(path).map_err(|e| {
                            self.cancel();
                            e
                        })
                    })
                    .collect()
            });

            let mut next = Vec::new();
            for result in results {
                let Some((info, nar)) = result? else { continue };
                for reference in &info.references {
                    if !self.backend.contains(reference) && queued.insert(reference.clone()) {
                        next.push(reference.clone());
                    }
                }
                staged.insert(info.store_path.clone(), (info, nar));
            }
            frontier = next;
        }

        // A cancel during discovery leaves holes in the staged set; stop
        // here rather than materialize a closure we only partly hold.
        if self.is_cancelled() {
            log("Fetch cancelled; nothing was materialized.");
            return Ok(FetchSummary {
                cancelled: true,
                ..FetchSummary::default()
            });
        }

        // Dependency order over staged metadata plus the local store.
        let graph = StagedGraph {
            staged: &staged,
            backend: self.backend,
        };
        let order = compute_closure(&graph, roots)?;

        let mut summary = FetchSummary::default();
        for path in order {
            if self.is_cancelled() {
                log("Fetch cancelled; remaining paths were not materialized.");
                summary.cancelled = true;
                break;
            }
            if self.backend.contains(&path) {
                summary.already_present.push(path);
                continue;
            }
            let (info, nar) = staged.remove(&path).ok_or_else(|| SyncError::Store {
                operation: "materialize".to_string(),
                detail: format!("no staged entry for {}", path),
            })?;
            // Barrier: every direct dependency must already be in the store.
            for reference in &info.references {
                if *reference != path && !self.backend.contains(reference) {
                    return Err(SyncError::Store {
                        operation: "materialize".to_string(),
                        detail: format!(
                            "dependency {} of {} is not materialized",
                            reference, path
                        ),
                    });
                }
            }
            self.backend.materialize(&path, &nar, &info.references)?;
            log(&format!("materialized {}", path));
            summary.materialized.push(path);
        }
        Ok(summary)
    }

    /// One path's fetch pipeline: download -> decompress -> verify integrity
    /// -> verify signature. Returns Ok(None) when cancelled before download.
    fn fetch_one(&self, path: &StorePath) -> Result<Option<(NarInfo, Vec<u8>)>, SyncError> {
        if self.is_cancelled() {
            return Ok(None);
        }
        let (info, payload) = self.transport.download(path)?;
        if info.store_path != *path {
            return Err(SyncError::Store {
                operation: "download".to_string(),
                detail: format!(
                    "requested {} but server returned entry for {}",
                    path, info.store_path
                ),
            });
        }

        let nar = compress::decompress(path, &payload, info.compression)?;
        verify_nar(path, &info.nar_hash, &nar)?;
        verify_path(path, &nar, &info.references)?;
        self.trusted.verify(path, &info.fingerprint(), &info.signatures)?;
        Ok(Some((info, nar)))
    }
}

/// Reference graph seen during fetch: staged narinfo metadata for paths in
/// flight, the local store for paths already present.
struct StagedGraph<'a> {
    staged: &'a HashMap<StorePath, (NarInfo, Vec<u8>)>,
    backend: &'a dyn StoreBackend,
}

impl StoreBackend for StagedGraph<'_> {
    fn direct_references(&self, path: &StorePath) -> Result<Vec<StorePath>, SyncError> {
        if let Some((info, _)) = self.staged.get(path) {
            return Ok(info.references.clone());
        }
        self.backend.direct_references(path)
    }

    fn contains(&self, path: &StorePath) -> bool {
        self.staged.contains_key(path) || self.backend.contains(path)
    }

    fn realize(&self, path: &StorePath) -> Result<PathBuf, SyncError> {
        self.backend.realize(path)
    }

    fn materialize(&self, path: &StorePath, nar: &[u8], refs: &[StorePath]) -> Result<(), SyncError> {
        self.backend.materialize(path, nar, refs)
    }
}
