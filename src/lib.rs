//! Core library for narsync: binary-cache synchronization for a
//! content-addressed store. Push locally built store paths to a remote cache
//! and fetch them elsewhere instead of rebuilding, with content-hash and
//! signature verification on every path that crosses the trust boundary.
//! Used by server and CLI frontends; reusable by other tools.

pub mod archive;
pub mod closure;
pub mod compress;
pub mod config;
pub mod error;
pub mod integrity;
pub mod narinfo;
pub mod signing;
pub mod store;
pub mod store_path;
pub mod sync;
pub mod transport;
pub mod utils;

// Re-export main API for frontends
pub use closure::compute_closure;
pub use compress::Compression;
pub use config::{load_config, Config};
pub use error::SyncError;
pub use integrity::NarHash;
pub use narinfo::NarInfo;
pub use signing::{PublicKey, SecretKey, Signature, TrustedKeys};
pub use store::{LocalStore, StoreBackend};
pub use store_path::StorePath;
pub use sync::{FetchSummary, PushSummary, SyncClient};
pub use transport::{CacheTransport, HttpTransport, MemoryTransport};
pub use utils::{get_cache_dir, log, log_error};
