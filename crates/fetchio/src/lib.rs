//! # fetchio-engine
//!
//! High-throughput content fetcher for model registries: a
//! protocol-selecting HTTP client (HTTP/3 with fallback to HTTP/2 and
//! HTTP/1.1, learning per-host capability from `Alt-Svc`), a parallel,
//! range-aware, resumable, checksum-verified downloader, and a streaming
//! tree-listing parser.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchio_engine::{FetchConfig, NoProgress, RegistryClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> fetchio_engine::Result<()> {
//! let config = FetchConfig::builder().workers(8).build();
//! let client = RegistryClient::new(config)?;
//! let summary = client
//!     .download_model(
//!         "openai/whisper-large-v3",
//!         "./whisper-large-v3".as_ref(),
//!         Arc::new(NoProgress),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! println!("downloaded {} bytes", summary.bytes_downloaded);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod listing;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod sink;
pub mod target;
pub mod transport;

pub use cache::StreamCache;
pub use config::{
    CHUNK_SIZE, CHUNK_THRESHOLD, DEFAULT_BASE_URL, FetchConfig, FetchConfigBuilder, ProxyConfig,
};
pub use error::{FetchError, Result};
pub use listing::{Listing, RepoEntry};
pub use planner::{DownloadPlan, DownloadTask, plan};
pub use pool::{DownloadSummary, WorkerPool, run_plan};
pub use progress::{NoProgress, ProgressSink, ProgressUpdate};
pub use registry::RegistryClient;
pub use sink::FileSink;
pub use target::{HeaderSet, RequestTarget};
pub use transport::{ClientProfile, Protocol, ProtocolClient, ResponseEnvelope};
