//! HTTP/3 transport over QUIC.
//!
//! One request per connection: resolve the host, handshake QUIC with ALPN
//! `h3` and SNI set to the host, open a bidirectional stream, and drive the
//! exchange until the peer closes the request stream. The backend's
//! connection driver is polled alongside the request future; its callback
//! shapes stop here and never reach higher layers.
//!
//! Header compression runs on the QPACK static table only (dynamic table
//! size 0, blocked streams 0), trading a little compression for
//! deterministic header decoding.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use http::Request;
use rustls::ClientConfig as TlsConfig;
use rustls::crypto::ring;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::net::lookup_host;
use tracing::{debug, trace};

use crate::error::{FetchError, Result};
use crate::target::{HeaderSet, RequestTarget};
use crate::transport::{BodyHandler, MAX_BUFFERED_BODY, Protocol, ResponseEnvelope};

/// QUIC/H3 transport. Owns the TLS configuration; endpoints and
/// connections are per-request, so workers never share wire state.
pub struct H3Transport {
    tls: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl H3Transport {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let mut tls = TlsConfig::builder_with_provider(provider)
            // QUIC mandates TLS 1.3.
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| FetchError::protocol(format!("TLS 1.3 unavailable: {e}")))?
            .with_platform_verifier()
            .map_err(|e| FetchError::protocol(format!("platform verifier unavailable: {e}")))?
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h3".to_vec()];

        Ok(Self {
            tls: Arc::new(tls),
            connect_timeout,
            idle_timeout,
        })
    }

    /// Perform one GET. Body bytes stream through `handler` when given;
    /// otherwise they buffer into the envelope (small-response mode).
    ///
    /// `resume_offset > 0` installs `Range: bytes=<offset>-` and requires a
    /// 206 response before any byte reaches the handler.
    pub async fn request(
        &self,
        target: &RequestTarget,
        headers: &HeaderSet,
        resume_offset: u64,
        handler: Option<BodyHandler<'_>>,
    ) -> Result<ResponseEnvelope> {
        let host = target.host();
        let port = target.port();

        let addr = resolve(host, port).await?;
        let (endpoint, connection) = self.connect(addr, host, port).await?;

        let result = self
            .exchange(target, headers, resume_offset, handler, connection.clone())
            .await;

        // Streams, H3 state, QUIC, and TLS unwind in reverse order of
        // creation; wait_idle flushes the CONNECTION_CLOSE.
        connection.close(0u32.into(), b"done");
        endpoint.wait_idle().await;

        result
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<(quinn::Endpoint, quinn::Connection)> {
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().expect("literal bind address")
        } else {
            "0.0.0.0:0".parse().expect("literal bind address")
        };
        let mut endpoint = quinn::Endpoint::client(bind_addr)
            .map_err(|e| FetchError::connection_failed(host, port, format!("UDP bind: {e}")))?;

        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(self.tls.as_ref().clone())
            .map_err(|e| FetchError::protocol(format!("QUIC TLS config: {e}")))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            quinn::IdleTimeout::try_from(self.idle_timeout)
                .map_err(|_| FetchError::protocol("idle timeout out of range"))?,
        ));
        client_config.transport_config(Arc::new(transport));
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint
            .connect(addr, host)
            .map_err(|e| FetchError::connection_failed(host, port, e.to_string()))?;

        let connection = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| FetchError::connection_failed(host, port, "QUIC handshake timed out"))?
            .map_err(|e| FetchError::connection_failed(host, port, e.to_string()))?;

        debug!(host, port, %addr, "QUIC connection established");
        Ok((endpoint, connection))
    }

    async fn exchange(
        &self,
        target: &RequestTarget,
        headers: &HeaderSet,
        resume_offset: u64,
        mut handler: Option<BodyHandler<'_>>,
        connection: quinn::Connection,
    ) -> Result<ResponseEnvelope> {
        let host = target.host().to_owned();
        let port = target.port();

        let h3_conn = h3_quinn::Connection::new(connection);
        let (mut driver, mut send_request) = h3::client::new(h3_conn)
            .await
            .map_err(|e| FetchError::connection_failed(&host, port, format!("H3 setup: {e}")))?;

        // Pseudo-headers first, in :method/:scheme/:authority/:path order;
        // the builder derives them from the method and URI.
        let uri = format!("https://{}{}", target.authority(), target.path_and_query());
        let mut builder = Request::builder().method(http::Method::GET).uri(uri.as_str());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        if resume_offset > 0 {
            builder = builder.header("range", format!("bytes={resume_offset}-"));
        }
        let request = builder
            .body(())
            .map_err(|e| FetchError::protocol(format!("H3 request build: {e}")))?;

        let idle_timeout = self.idle_timeout;
        let request_fut = async {
            let mut stream = send_request
                .send_request(request)
                .await
                .map_err(|e| FetchError::protocol(format!("H3 send: {e}")))?;
            stream
                .finish()
                .await
                .map_err(|e| FetchError::protocol(format!("H3 finish: {e}")))?;

            let response = tokio::time::timeout(idle_timeout, stream.recv_response())
                .await
                .map_err(|_| {
                    FetchError::connection_failed(&host, port, "H3 response header timeout")
                })?
                .map_err(|e| FetchError::protocol(format!("H3 response: {e}")))?;

            let status = response.status().as_u16();
            let response_headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(n, v)| {
                    (
                        n.as_str().to_owned(),
                        v.to_str().unwrap_or_default().to_owned(),
                    )
                })
                .collect();
            trace!(status, url = %uri, "H3 response headers received");

            if resume_offset > 0 && status != 206 {
                return Err(FetchError::protocol(format!(
                    "expected 206 for ranged request, got {status} from {uri}"
                )));
            }

            let deliver_to_handler = (200..300).contains(&status) && handler.is_some();
            let mut body = BytesMut::new();
            let mut consumed = 0u64;

            // Drive until the peer ends the request stream; a stalled
            // stream hits the per-frame idle deadline.
            loop {
                let frame = tokio::time::timeout(idle_timeout, stream.recv_data())
                    .await
                    .map_err(|_| {
                        FetchError::connection_failed(&host, port, "H3 response idle timeout")
                    })?
                    .map_err(|e| FetchError::protocol(format!("H3 body: {e}")))?;
                let Some(mut chunk) = frame else {
                    break;
                };
                let data = chunk.copy_to_bytes(chunk.remaining());
                if deliver_to_handler {
                    if let Some(h) = handler.as_mut() {
                        h(&data)?;
                    }
                    consumed += data.len() as u64;
                } else {
                    if body.len() + data.len() > MAX_BUFFERED_BODY {
                        return Err(FetchError::protocol(format!(
                            "buffered H3 response exceeds {MAX_BUFFERED_BODY} bytes for {uri}"
                        )));
                    }
                    body.extend_from_slice(&data);
                }
            }

            let alt_svc = response_headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("alt-svc"))
                .map(|(_, v)| v.clone());
            Ok(ResponseEnvelope {
                status,
                headers: response_headers,
                protocol: Protocol::H3,
                alt_svc,
                body: body.freeze(),
                body_bytes_consumed: consumed,
            })
        };

        let drive_fut = async move { std::future::poll_fn(|cx| driver.poll_close(cx)).await };

        tokio::select! {
            result = request_fut => result,
            closed = drive_fut => {
                Err(FetchError::protocol(format!("H3 connection: {closed}")))
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port)).await.map_err(|e| FetchError::Dns {
        host: host.to_owned(),
        reason: e.to_string(),
    })?;
    addrs.next().ok_or_else(|| FetchError::Dns {
        host: host.to_owned(),
        reason: "no addresses resolved".to_owned(),
    })
}
