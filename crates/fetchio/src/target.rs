use url::Url;

use crate::error::{FetchError, Result};

/// A parsed request target: scheme, host, port, and origin-form path.
///
/// Only `http` and `https` schemes are accepted. The port defaults to 443
/// for `https` and 80 for `http`; an explicit port of 0 is rejected. IPv6
/// literals keep their brackets in `authority()` but not in `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    url: Url,
    host: String,
    port: u16,
}

impl RequestTarget {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| FetchError::invalid_url(input, e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(FetchError::invalid_url(
                    input,
                    format!("unsupported scheme `{other}`"),
                ));
            }
        }

        // `host_str` keeps IPv6 brackets; unbracket via the typed host.
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_owned(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(FetchError::invalid_url(input, "missing host")),
        };

        if url.port() == Some(0) {
            return Err(FetchError::invalid_url(input, "port 0 is not valid"));
        }
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchError::invalid_url(input, "missing port"))?;

        Ok(Self { url, host, port })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Host without IPv6 brackets, suitable for DNS resolution and SNI.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host[:port]` with brackets restored for IPv6 literals, as it appears
    /// in the `:authority` pseudo-header. The port is omitted when default.
    pub fn authority(&self) -> String {
        let bracketed = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.url.port().is_some() {
            format!("{bracketed}:{}", self.port)
        } else {
            bracketed
        }
    }

    /// Origin-form path including the query string; never empty.
    pub fn path_and_query(&self) -> String {
        let path = self.url.path();
        let path = if path.is_empty() { "/" } else { path };
        match self.url.query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

/// Ordered, case-preserving header set with last-write-wins semantics.
///
/// Lookup and removal are case-insensitive. The fetcher installs `Range`
/// through this set for chunk tasks and removes it immediately after the
/// request so it cannot leak into subsequent requests on the same client.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_per_scheme() {
        let t = RequestTarget::parse("https://example.com/a/b").unwrap();
        assert_eq!(t.port(), 443);
        assert_eq!(t.host(), "example.com");
        assert_eq!(t.path_and_query(), "/a/b");

        let t = RequestTarget::parse("http://example.com").unwrap();
        assert_eq!(t.port(), 80);
        assert_eq!(t.path_and_query(), "/");
    }

    #[test]
    fn explicit_port_and_query_preserved() {
        let t = RequestTarget::parse("https://example.com:8443/x?recursive=true").unwrap();
        assert_eq!(t.port(), 8443);
        assert_eq!(t.authority(), "example.com:8443");
        assert_eq!(t.path_and_query(), "/x?recursive=true");
    }

    #[test]
    fn ipv6_literal_round_trips() {
        let t = RequestTarget::parse("https://[2001:db8::1]:8443/file").unwrap();
        assert_eq!(t.host(), "2001:db8::1");
        assert_eq!(t.port(), 8443);
        assert_eq!(t.authority(), "[2001:db8::1]:8443");

        let t = RequestTarget::parse("https://[::1]/").unwrap();
        assert_eq!(t.port(), 443);
        assert_eq!(t.authority(), "[::1]");
    }

    #[test]
    fn port_zero_rejected() {
        assert!(RequestTarget::parse("https://example.com:0/").is_err());
        assert!(RequestTarget::parse("http://[::1]:0/x").is_err());
    }

    #[test]
    fn non_http_schemes_rejected() {
        assert!(RequestTarget::parse("ftp://example.com/").is_err());
        assert!(RequestTarget::parse("file:///etc/passwd").is_err());
    }

    #[test]
    fn header_set_last_write_wins_case_insensitive() {
        let mut h = HeaderSet::new();
        h.set("Range", "bytes=0-99");
        h.set("range", "bytes=100-199");
        assert_eq!(h.get("RANGE"), Some("bytes=100-199"));
        assert_eq!(h.iter().count(), 1);

        assert_eq!(h.remove("Range"), Some("bytes=100-199".to_owned()));
        assert!(h.get("range").is_none());
        assert!(h.remove("range").is_none());
    }

    #[test]
    fn header_set_preserves_insertion_order() {
        let mut h = HeaderSet::new();
        h.set("Authorization", "Bearer t");
        h.set("Accept", "*/*");
        h.set("Range", "bytes=0-1");
        let names: Vec<_> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Authorization", "Accept", "Range"]);
    }
}
