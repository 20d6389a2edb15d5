//! Per-host protocol selection.
//!
//! The selector holds the host-to-protocol capability cache and decides
//! the attempt order for each request: a forced override wins outright; a
//! cached `h3` entry is tried and evicted on connection-level failure; the
//! H2/H1 transport is the discovery path, with `Alt-Svc` advertising `h3`
//! promoting the host for the next request. Unknown origins are discovered
//! over H2 rather than speculatively handshaking QUIC; the upgrade lands
//! on the second request instead of risking a wasted round trip on the
//! first.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::target::{HeaderSet, RequestTarget};
use crate::transport::h3::H3Transport;
use crate::transport::http::HttpTransport;
use crate::transport::{BodyHandler, Protocol, ResponseEnvelope};

/// Process-local protocol knowledge, threaded through requests as an
/// explicit value. One profile is shared by all workers of a run; each
/// worker owns its own transports and connections.
#[derive(Debug, Default)]
pub struct ClientProfile {
    cache: Mutex<HashMap<String, Protocol>>,
    override_protocol: Option<Protocol>,
}

impl ClientProfile {
    pub fn new(override_protocol: Option<Protocol>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            override_protocol,
        }
    }

    pub fn override_protocol(&self) -> Option<Protocol> {
        self.override_protocol
    }

    pub fn cached(&self, host: &str) -> Option<Protocol> {
        self.cache.lock().get(host).copied()
    }

    /// Record that `host` advertised HTTP/3. Idempotent: re-learning an
    /// already-known host is a no-op write.
    pub fn learn_h3(&self, host: &str) {
        let mut cache = self.cache.lock();
        if cache.insert(host.to_owned(), Protocol::H3).is_none() {
            info!(host, "learned h3 capability from Alt-Svc");
        }
    }

    /// Drop the capability entry after a failed preferred-protocol attempt.
    pub fn evict(&self, host: &str) {
        if self.cache.lock().remove(host).is_some() {
            debug!(host, "evicted protocol cache entry");
        }
    }
}

/// Does an `Alt-Svc` value advertise HTTP/3? Looks for an `h3=` token
/// (also matching draft spellings like `h3-29=`).
pub fn alt_svc_advertises_h3(alt_svc: &str) -> bool {
    alt_svc.split(',').any(|entry| {
        let token = entry.trim();
        token
            .split_once('=')
            .is_some_and(|(proto, _)| proto == "h3" || proto.starts_with("h3-"))
    })
}

/// The protocol chosen for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    H3,
    HttpStack,
}

/// Pure decision procedure for one request, exposed for tests: given the
/// scheme, the override, and the cache entry, which transport goes first?
pub fn first_attempt(is_https: bool, override_protocol: Option<Protocol>, cached: Option<Protocol>) -> Attempt {
    if !is_https {
        // QUIC requires TLS; cleartext goes straight to the HTTP stack.
        return Attempt::HttpStack;
    }
    match override_protocol {
        Some(Protocol::H3) => Attempt::H3,
        Some(_) => Attempt::HttpStack,
        None => match cached {
            Some(Protocol::H3) => Attempt::H3,
            _ => Attempt::HttpStack,
        },
    }
}

/// A protocol-selecting client: owns one H3 transport and one H2/H1
/// transport, consults the shared profile per request, and maintains the
/// client-level header set (C2 discipline: `Range` is installed for one
/// request and removed right after).
pub struct ProtocolClient {
    profile: Arc<ClientProfile>,
    h3: H3Transport,
    http: HttpTransport,
    headers: Mutex<HeaderSet>,
    /// H3 is skipped entirely when a proxy is in play.
    h3_enabled: bool,
}

impl ProtocolClient {
    pub fn new(config: &FetchConfig, profile: Arc<ClientProfile>) -> Result<Self> {
        let mut headers = HeaderSet::new();
        if let Some(token) = &config.token {
            headers.set("Authorization", format!("Bearer {token}"));
        }
        let h3_enabled = config.proxy.is_none();
        if !h3_enabled {
            debug!("proxy configured; H3 disabled for this client");
        }
        Ok(Self {
            profile,
            h3: H3Transport::new(config.connect_timeout, config.idle_timeout)?,
            http: HttpTransport::new(config)?,
            headers: Mutex::new(headers),
            h3_enabled,
        })
    }

    pub fn profile(&self) -> &Arc<ClientProfile> {
        &self.profile
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.lock().set(name, value);
    }

    pub fn remove_header(&self, name: &str) {
        self.headers.lock().remove(name);
    }

    fn snapshot_headers(&self) -> HeaderSet {
        self.headers.lock().clone()
    }

    /// GET with the body buffered into the envelope. The full fall-through
    /// procedure runs internally, which is safe here because a buffered
    /// attempt has no side effects to unwind.
    pub async fn get(&self, url: &str) -> Result<ResponseEnvelope> {
        let target = RequestTarget::parse(url)?;
        let headers = self.snapshot_headers();

        let envelope = match self.plan_first(&target) {
            Attempt::H3 => match self.h3.request(&target, &headers, 0, None).await {
                Ok(envelope) => envelope,
                Err(e) if self.may_fall_back(&target, &e) => {
                    self.http.get_full(&target, &headers).await?
                }
                Err(e) => return Err(e),
            },
            Attempt::HttpStack => self.http.get_full(&target, &headers).await?,
        };

        self.learn_from(&target, &envelope);
        ensure_status(envelope, url, "request")
    }

    /// Ranged GET: installs `Range: bytes=<start>-<end>`, sends, and removes
    /// the header again so it cannot leak into later requests.
    pub async fn get_with_range(&self, url: &str, start: u64, end: u64) -> Result<ResponseEnvelope> {
        self.set_header("Range", format!("bytes={start}-{end}"));
        let result = self.get(url).await;
        self.remove_header("Range");
        result
    }

    /// One streaming download attempt over the preferred protocol.
    ///
    /// Unlike [`get`], no internal fall-through happens once body bytes may
    /// have reached the handler; the caller resets its context and calls
    /// again, by which time a failed preferred protocol has been evicted
    /// from the cache. Returns the envelope without status mapping; the
    /// fetcher owns 206/200 validation.
    pub async fn download_once(
        &self,
        target: &RequestTarget,
        extra_headers: &HeaderSet,
        resume_offset: u64,
        handler: BodyHandler<'_>,
    ) -> Result<ResponseEnvelope> {
        let mut headers = self.snapshot_headers();
        for (name, value) in extra_headers.iter() {
            headers.set(name, value);
        }

        match self.plan_first(target) {
            Attempt::H3 => {
                let result = self
                    .h3
                    .request(target, &headers, resume_offset, Some(handler))
                    .await;
                if let Err(e) = &result {
                    if e.triggers_fallback() && self.profile.override_protocol().is_none() {
                        self.profile.evict(target.host());
                    }
                }
                result
            }
            Attempt::HttpStack => {
                let envelope = self
                    .http
                    .download(target, &headers, resume_offset, handler)
                    .await?;
                self.learn_from(target, &envelope);
                Ok(envelope)
            }
        }
    }

    fn plan_first(&self, target: &RequestTarget) -> Attempt {
        if !self.h3_enabled {
            return Attempt::HttpStack;
        }
        first_attempt(
            target.is_https(),
            self.profile.override_protocol(),
            self.profile.cached(target.host()),
        )
    }

    /// Whether a failed H3 attempt may silently fall through to the HTTP
    /// stack; evicts the cache entry when it does.
    fn may_fall_back(&self, target: &RequestTarget, error: &FetchError) -> bool {
        if !error.triggers_fallback() || self.profile.override_protocol().is_some() {
            return false;
        }
        self.profile.evict(target.host());
        debug!(host = target.host(), error = %error, "H3 attempt failed, falling back");
        true
    }

    /// `Alt-Svc` from any response feeds the cache; the entry only ever
    /// takes effect for https requests, where H3 is reachable.
    fn learn_from(&self, target: &RequestTarget, envelope: &ResponseEnvelope) {
        if !self.h3_enabled {
            return;
        }
        if let Some(alt_svc) = &envelope.alt_svc {
            if alt_svc_advertises_h3(alt_svc) {
                self.profile.learn_h3(target.host());
            }
        }
    }
}

fn ensure_status(
    envelope: ResponseEnvelope,
    url: &str,
    operation: &'static str,
) -> Result<ResponseEnvelope> {
    if envelope.status >= 400 {
        return Err(FetchError::http_status(envelope.status, url, operation));
    }
    Ok(envelope)
}
