//! Protocol-selecting transport stack.
//!
//! Three pieces: the QUIC/HTTP-3 transport ([`h3`]), the HTTP/2-or-1.1
//! transport ([`http`]), and the selector ([`selector`]) that picks an
//! attempt order per host, learns HTTP/3 capability from `Alt-Svc`, and
//! demotes hosts whose preferred protocol fails at the connection level.

pub mod h3;
pub mod http;
pub mod selector;

use bytes::Bytes;

use crate::error::Result;

pub use selector::{ClientProfile, ProtocolClient};

/// Application protocol a response was served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    H3,
    H2,
    Http1,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::H3 => "h3",
            Protocol::H2 => "h2",
            Protocol::Http1 => "http/1.1",
        }
    }

    /// Parse the CLI / config spelling.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "h3" => Some(Protocol::H3),
            "h2" => Some(Protocol::H2),
            "http/1.1" | "http1" => Some(Protocol::Http1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives sequential body bytes from a transport. Returning an error
/// aborts the transfer; bytes already delivered stay on disk.
pub type BodyHandler<'a> = &'a mut (dyn FnMut(&[u8]) -> Result<()> + Send);

/// Buffered-body ceiling for metadata responses. Tree listings for even
/// very large repositories sit well under this.
pub(crate) const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

/// Everything observable about one response.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub protocol: Protocol,
    pub alt_svc: Option<String>,
    /// In-memory body for small-response mode; empty when the body was
    /// consumed through a [`BodyHandler`].
    pub body: Bytes,
    /// Bytes delivered through the handler, when one was installed.
    pub body_bytes_consumed: u64,
}

impl ResponseEnvelope {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
