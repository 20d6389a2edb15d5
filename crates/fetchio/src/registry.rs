//! Registry client: repository enumeration and whole-repository download.
//!
//! Speaks the two endpoints the engine needs (the recursive tree listing
//! and the per-file resolve URL) against `https://huggingface.co` or a
//! mirror. Everything network-level (protocol selection, ranged transfer,
//! verification) is delegated downward.

use std::path::Path;
use std::sync::Arc;

use humansize::{BINARY, format_size};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::StreamCache;
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::listing::Listing;
use crate::planner::{self, DownloadPlan};
use crate::pool::{DownloadSummary, WorkerPool};
use crate::progress::ProgressSink;
use crate::transport::{ClientProfile, ProtocolClient, ResponseEnvelope};

pub struct RegistryClient {
    config: FetchConfig,
    profile: Arc<ClientProfile>,
    client: ProtocolClient,
    cache: Option<StreamCache>,
}

impl RegistryClient {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let profile = Arc::new(ClientProfile::new(config.protocol_override));
        let client = ProtocolClient::new(&config, Arc::clone(&profile))?;
        let cache = match &config.cache_dir {
            Some(dir) => Some(StreamCache::open(dir)?),
            None => None,
        };
        Ok(Self {
            config,
            profile,
            client,
            cache,
        })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    pub fn api_url(&self, repository_id: &str) -> String {
        format!(
            "{}/api/models/{repository_id}/tree/main?recursive=true",
            self.base()
        )
    }

    pub fn file_url(&self, repository_id: &str, path: &str) -> String {
        format!("{}/{repository_id}/resolve/main/{path}", self.base())
    }

    /// Fetch and parse the recursive tree listing.
    pub async fn model_info(&self, repository_id: &str) -> Result<Listing> {
        validate_repository_id(repository_id)?;
        let url = self.api_url(repository_id);
        debug!(url = %url, "fetching tree listing");

        let envelope = self
            .client
            .get(&url)
            .await
            .map_err(|e| e.remap_registry_status(repository_id))?;

        let body = std::str::from_utf8(&envelope.body)
            .map_err(|e| FetchError::parse(format!("listing body not UTF-8: {e}")))?;
        let listing = Listing::from_body(repository_id, body);

        // A body that parsed to nothing is indistinguishable from a missing
        // repository; surface it the same way.
        if listing.entries.is_empty() {
            return Err(FetchError::NotFound {
                id: repository_id.to_owned(),
            });
        }

        info!(
            repository = repository_id,
            files = listing.entries.len(),
            total = %format_size(listing.total_bytes(), BINARY),
            protocol = %envelope.protocol,
            "tree listing fetched"
        );
        Ok(listing)
    }

    /// Mirror the entire repository into `destination`.
    pub async fn download_model(
        &self,
        repository_id: &str,
        destination: &Path,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<DownloadSummary> {
        let listing = self.model_info(repository_id).await?;
        std::fs::create_dir_all(destination)?;

        self.link_from_cache(&listing, destination);

        let plan = self.plan(&listing, destination, repository_id)?;
        let summary = self.run(plan, progress, cancel).await?;

        self.adopt_into_cache(&listing, destination);
        Ok(summary)
    }

    /// Download one file of the repository, placed under `destination` at
    /// its listing-relative path.
    pub async fn download_file(
        &self,
        repository_id: &str,
        filename: &str,
        destination: &Path,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<DownloadSummary> {
        let listing = self.model_info(repository_id).await?;
        let entry = listing
            .entries
            .iter()
            .find(|e| e.path == filename)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                id: format!("{repository_id}/{filename}"),
            })?;

        let single = Listing {
            repository_id: listing.repository_id,
            entries: vec![entry],
        };
        std::fs::create_dir_all(destination)?;
        self.link_from_cache(&single, destination);

        let plan = self.plan(&single, destination, repository_id)?;
        let summary = self.run(plan, progress, cancel).await?;

        self.adopt_into_cache(&single, destination);
        Ok(summary)
    }

    /// One plain GET through the protocol selector; the `http3-test`
    /// surface. Two consecutive calls against an H3-capable origin show
    /// the cache warm-up: first over H2/H1 with `Alt-Svc`, second over H3.
    pub async fn probe(&self, url: &str) -> Result<ResponseEnvelope> {
        self.client.get(url).await
    }

    pub fn profile(&self) -> &Arc<ClientProfile> {
        &self.profile
    }

    fn plan(
        &self,
        listing: &Listing,
        destination: &Path,
        repository_id: &str,
    ) -> Result<DownloadPlan> {
        planner::plan(&self.config, listing, destination, |path| {
            self.file_url(repository_id, path)
        })
    }

    async fn run(
        &self,
        plan: DownloadPlan,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<DownloadSummary> {
        let pool = WorkerPool::new(self.config.clone(), Arc::clone(&self.profile));
        pool.run(plan, progress, cancel).await
    }

    /// Satisfy entries from the dedup cache before planning, so the planner
    /// sees them as complete files.
    fn link_from_cache(&self, listing: &Listing, destination: &Path) {
        let Some(cache) = &self.cache else { return };
        for entry in &listing.entries {
            if entry.content_hash.is_empty() {
                continue;
            }
            let local = destination.join(&entry.path);
            let complete = std::fs::metadata(&local).is_ok_and(|m| m.len() == entry.size);
            if complete {
                continue;
            }
            match cache.materialize(&entry.content_hash, &local) {
                Ok(true) => info!(path = %entry.path, "satisfied from dedup cache"),
                Ok(false) => {}
                Err(e) => warn!(path = %entry.path, error = %e, "cache materialize failed"),
            }
        }
    }

    /// After a successful run, adopt verified files into the dedup cache.
    fn adopt_into_cache(&self, listing: &Listing, destination: &Path) {
        let Some(cache) = &self.cache else { return };
        for entry in &listing.entries {
            if entry.content_hash.is_empty() || cache.contains(&entry.content_hash) {
                continue;
            }
            let local = destination.join(&entry.path);
            if !std::fs::metadata(&local).is_ok_and(|m| m.len() == entry.size) {
                continue;
            }
            let name = format!("{}/{}", listing.repository_id, entry.path);
            // Chunked files skipped whole-file verification; trust the
            // listing hash only for files the fetcher verified.
            let known = (entry.size <= self.config.chunk_threshold)
                .then_some(entry.content_hash.as_str());
            if let Err(e) = cache.insert(&name, &local, known) {
                warn!(path = %entry.path, error = %e, "cache insert failed");
            }
        }
    }
}

fn validate_repository_id(id: &str) -> Result<()> {
    let well_formed = !id.is_empty()
        && !id.starts_with('/')
        && !id.ends_with('/')
        && id.split('/').all(|part| {
            !part.is_empty()
                && part != ".."
                && part
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        });
    if well_formed {
        Ok(())
    } else {
        Err(FetchError::invalid_url(
            id,
            "repository id must be `owner/name` with alphanumeric, `-`, `_`, `.` segments",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RegistryClient {
        let config = FetchConfig::builder().base_url(base).build();
        RegistryClient::new(config).unwrap()
    }

    #[test]
    fn url_construction_matches_registry_layout() {
        let c = client("https://huggingface.co");
        assert_eq!(
            c.api_url("openai/whisper-large-v3"),
            "https://huggingface.co/api/models/openai/whisper-large-v3/tree/main?recursive=true"
        );
        assert_eq!(
            c.file_url("openai/whisper-large-v3", "model.safetensors"),
            "https://huggingface.co/openai/whisper-large-v3/resolve/main/model.safetensors"
        );
    }

    #[test]
    fn mirror_base_substitutes_with_trailing_slash_tolerance() {
        let c = client("https://hf-mirror.com/");
        assert_eq!(
            c.api_url("org/model"),
            "https://hf-mirror.com/api/models/org/model/tree/main?recursive=true"
        );
    }

    #[test]
    fn repository_id_validation() {
        assert!(validate_repository_id("org/model").is_ok());
        assert!(validate_repository_id("single-name").is_ok());
        assert!(validate_repository_id("org/model.v2_final").is_ok());

        assert!(validate_repository_id("").is_err());
        assert!(validate_repository_id("/leading").is_err());
        assert!(validate_repository_id("trailing/").is_err());
        assert!(validate_repository_id("a//b").is_err());
        assert!(validate_repository_id("has space").is_err());
        assert!(validate_repository_id("../escape").is_err());
    }
}
