//! HTTP/2 and HTTP/1.1 transport over reqwest.
//!
//! One GET per call, ALPN-negotiated version, streaming body delivery, and
//! `Alt-Svc` capture so the selector can learn HTTP/3 capability.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use rustls::ClientConfig as TlsConfig;
use rustls::crypto::ring;
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, warn};

use crate::config::{FetchConfig, ProxyConfig};
use crate::error::{FetchError, Result};
use crate::target::{HeaderSet, RequestTarget};
use crate::transport::{BodyHandler, MAX_BUFFERED_BODY, Protocol, ResponseEnvelope};

/// General-purpose H2/H1 transport.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let mut tls_config = TlsConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| FetchError::protocol(format!("TLS protocol versions: {e}")))?
            .with_platform_verifier()
            .map_err(|e| FetchError::protocol(format!("platform verifier unavailable: {e}")))?
            .with_no_client_auth();
        // Preconfigured TLS bypasses reqwest's own ALPN setup.
        let force_http1 = config.protocol_override == Some(Protocol::Http1);
        tls_config.alpn_protocols = if force_http1 {
            vec![b"http/1.1".to_vec()]
        } else {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        };

        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(config.headers.clone())
            .use_preconfigured_tls(tls_config)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.idle_timeout)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(5)
            } else {
                reqwest::redirect::Policy::none()
            });

        if force_http1 {
            builder = builder.http1_only();
        }

        if let Some(proxy_config) = &config.proxy {
            builder = builder.proxy(build_proxy(proxy_config)?);
        } else if !config.use_system_proxy {
            builder = builder.no_proxy();
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// GET with the whole body buffered (bounded); small-response mode used
    /// for metadata endpoints.
    pub async fn get_full(
        &self,
        target: &RequestTarget,
        headers: &HeaderSet,
    ) -> Result<ResponseEnvelope> {
        let response = self.send(target, headers, 0).await?;
        let mut envelope = envelope_parts(&response);

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > MAX_BUFFERED_BODY {
                return Err(FetchError::protocol(format!(
                    "buffered response exceeds {MAX_BUFFERED_BODY} bytes for {}",
                    target.as_str()
                )));
            }
            body.extend_from_slice(&chunk);
        }
        envelope.body = body.freeze();
        Ok(envelope)
    }

    /// GET with streaming body delivery.
    ///
    /// `resume_offset > 0` installs `Range: bytes=<offset>-` and requires a
    /// 206 response. Bodies of non-success responses are buffered into the
    /// envelope instead of reaching the handler, so an error page can never
    /// land in a destination file.
    pub async fn download(
        &self,
        target: &RequestTarget,
        headers: &HeaderSet,
        resume_offset: u64,
        handler: BodyHandler<'_>,
    ) -> Result<ResponseEnvelope> {
        let response = self.send(target, headers, resume_offset).await?;
        let mut envelope = envelope_parts(&response);

        if resume_offset > 0 && envelope.status != 206 {
            return Err(FetchError::protocol(format!(
                "expected 206 for ranged request, got {} from {}",
                envelope.status,
                target.as_str()
            )));
        }

        if !envelope.is_success() {
            warn!(
                url = %target.as_str(),
                status = envelope.status,
                "download request returned non-success status"
            );
            let mut body = BytesMut::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if body.len() + chunk.len() > MAX_BUFFERED_BODY {
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            envelope.body = body.freeze();
            return Ok(envelope);
        }

        let mut consumed = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            handler(&chunk)?;
            consumed += chunk.len() as u64;
        }
        envelope.body_bytes_consumed = consumed;
        debug!(
            url = %target.as_str(),
            bytes = consumed,
            protocol = %envelope.protocol,
            "download stream complete"
        );
        Ok(envelope)
    }

    async fn send(
        &self,
        target: &RequestTarget,
        headers: &HeaderSet,
        resume_offset: u64,
    ) -> Result<Response> {
        let mut map = HeaderMap::new();
        for (name, value) in headers.iter() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::protocol(format!("invalid header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::protocol(format!("invalid header value: {e}")))?;
            map.insert(name, value);
        }
        if resume_offset > 0 {
            map.insert(
                reqwest::header::RANGE,
                HeaderValue::from_str(&format!("bytes={resume_offset}-"))
                    .expect("range header is always a valid value"),
            );
        }

        let response = self
            .client
            .get(target.as_str())
            .headers(map)
            .send()
            .await?;
        Ok(response)
    }
}

fn envelope_parts(response: &Response) -> ResponseEnvelope {
    let protocol = match response.version() {
        reqwest::Version::HTTP_2 => Protocol::H2,
        _ => Protocol::Http1,
    };
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(n, v)| {
            (
                n.as_str().to_owned(),
                v.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect();
    let alt_svc = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("alt-svc"))
        .map(|(_, v)| v.clone());

    ResponseEnvelope {
        status: response.status().as_u16(),
        headers,
        protocol,
        alt_svc,
        body: Bytes::new(),
        body_bytes_consumed: 0,
    }
}

/// Resolve a [`ProxyConfig`] into a reqwest proxy. The URL scheme picks
/// the kind; credentials come from the config or, failing that, from the
/// URL's userinfo. The selector separately disables H3 whenever a proxy is
/// configured, since QUIC has no path through one.
fn build_proxy(config: &ProxyConfig) -> Result<reqwest::Proxy> {
    let parsed = url::Url::parse(&config.url).map_err(|e| FetchError::ProxyConfiguration {
        reason: format!("invalid proxy URL `{}`: {e}", config.url),
    })?;
    match parsed.scheme() {
        "http" | "https" | "socks5" | "socks5h" => {}
        other => {
            return Err(FetchError::ProxyConfiguration {
                reason: format!("unsupported proxy scheme `{other}` in `{}`", config.url),
            });
        }
    }

    let mut proxy =
        reqwest::Proxy::all(parsed.as_str()).map_err(|e| FetchError::ProxyConfiguration {
            reason: format!("proxy rejected by HTTP client: {e}"),
        })?;

    let credentials = config.credentials.clone().or_else(|| {
        let user = parsed.username();
        (!user.is_empty()).then(|| {
            (
                user.to_owned(),
                parsed.password().unwrap_or_default().to_owned(),
            )
        })
    });
    if let Some((username, password)) = credentials {
        proxy = proxy.basic_auth(&username, &password);
    }
    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_scheme_drives_the_kind_and_bad_schemes_fail() {
        assert!(build_proxy(&ProxyConfig::new("http://proxy.internal:8080")).is_ok());
        assert!(build_proxy(&ProxyConfig::new("socks5://10.0.0.1:1080")).is_ok());
        assert!(build_proxy(&ProxyConfig::new("socks5h://10.0.0.1:1080")).is_ok());

        let err = build_proxy(&ProxyConfig::new("ftp://proxy:21")).unwrap_err();
        assert!(matches!(err, FetchError::ProxyConfiguration { .. }));
        // A bare host:port has no scheme to pick the kind from.
        assert!(build_proxy(&ProxyConfig::new("proxy.internal:1080")).is_err());
    }

    #[test]
    fn proxy_credentials_fall_back_to_url_userinfo() {
        // Explicit credentials and userinfo are both accepted shapes; the
        // explicit pair wins when both are present.
        assert!(
            build_proxy(
                &ProxyConfig::new("http://proxy.internal:8080").with_credentials("user", "pw")
            )
            .is_ok()
        );
        assert!(build_proxy(&ProxyConfig::new("socks5://user:pw@10.0.0.1:1080")).is_ok());
    }

    #[test]
    fn proxied_client_still_builds() {
        let config = FetchConfig::builder()
            .proxy(ProxyConfig::new("http://proxy.internal:8080"))
            .build();
        assert!(HttpTransport::new(&config).is_ok());
    }
}
