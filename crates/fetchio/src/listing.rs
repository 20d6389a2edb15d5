//! Streaming parser for the registry tree-listing response.
//!
//! The listing endpoint returns a JSON array of tree nodes. Only four keys
//! matter (`type`, `path`, `size`, and the `oid` inside `lfs`), so instead
//! of materializing the tree, a scanner walks the body once and yields
//! key/value events; a draft record is committed at each node object's
//! closing brace. The scanner is deliberately not a JSON validator: it
//! treats the body as a bag of events and relies on the registry's schema
//! for meaning. Malformed input yields a partial listing, never an error.

use std::borrow::Cow;
use std::collections::HashSet;

use serde_json::json;
use tracing::{debug, warn};

/// One file in the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoEntry {
    /// POSIX-style relative path within the repository.
    pub path: String,
    /// Declared byte count; zero is valid.
    pub size: u64,
    /// Hex SHA-256 from the LFS metadata, or empty when the remote
    /// published none (or published something that is not 64 lowercase hex).
    pub content_hash: String,
}

/// A parsed tree listing, read-only after construction.
#[derive(Debug, Clone)]
pub struct Listing {
    pub repository_id: String,
    pub entries: Vec<RepoEntry>,
}

impl Listing {
    pub fn from_body(repository_id: impl Into<String>, body: &str) -> Self {
        Self {
            repository_id: repository_id.into(),
            entries: parse_entries(body),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Canonical JSON form restricted to the fields the parser observes.
    /// Parsing this output reproduces the same entry sequence.
    pub fn to_canonical_json(&self) -> String {
        let nodes: Vec<_> = self
            .entries
            .iter()
            .map(|e| {
                if e.content_hash.is_empty() {
                    json!({ "type": "file", "path": e.path, "size": e.size })
                } else {
                    json!({
                        "type": "file",
                        "path": e.path,
                        "size": e.size,
                        "lfs": { "oid": e.content_hash },
                    })
                }
            })
            .collect();
        serde_json::to_string(&nodes).unwrap_or_else(|_| "[]".to_owned())
    }
}

/// Scanner event: a key/value pair inside some object, or an object close.
/// `depth` counts enclosing objects; a top-level tree node sits at depth 1.
#[derive(Debug, PartialEq, Eq)]
enum ScanEvent<'a> {
    Pair {
        key: &'a str,
        value: &'a str,
        is_string: bool,
        depth: usize,
    },
    ObjectEnd {
        depth: usize,
    },
}

/// Single-pass event scanner over ASCII JSON with escaped strings.
struct JsonScanner<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> JsonScanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        self.input.as_bytes()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n' | b',' | b':')) {
            self.pos += 1;
        }
    }

    /// Consume a quoted string starting at `pos` (which must point at `"`),
    /// returning the raw content span with escapes intact.
    fn scan_string(&mut self) -> &'a str {
        debug_assert_eq!(self.peek(), Some(b'"'));
        self.pos += 1;
        let start = self.pos;
        let bytes = self.bytes();
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b'\\' => self.pos += 2,
                b'"' => {
                    let end = self.pos.min(bytes.len());
                    self.pos = end + 1;
                    return &self.input[start..end];
                }
                _ => self.pos += 1,
            }
        }
        // Unterminated string: take what is there.
        self.pos = bytes.len();
        &self.input[start.min(bytes.len())..]
    }

    /// Consume a scalar (number / true / false / null).
    fn scan_scalar(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n') {
                break;
            }
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }
}

impl<'a> Iterator for JsonScanner<'a> {
    type Item = ScanEvent<'a>;

    fn next(&mut self) -> Option<ScanEvent<'a>> {
        loop {
            self.skip_ws();
            match self.peek()? {
                b'{' => {
                    self.pos += 1;
                    self.depth += 1;
                }
                b'}' => {
                    self.pos += 1;
                    let depth = self.depth;
                    self.depth = self.depth.saturating_sub(1);
                    if depth > 0 {
                        return Some(ScanEvent::ObjectEnd { depth });
                    }
                }
                b'[' | b']' => {
                    self.pos += 1;
                }
                b'"' => {
                    let text = self.scan_string();
                    self.skip_ws_only();
                    if self.peek() == Some(b':') {
                        self.pos += 1;
                        self.skip_ws_only();
                        match self.peek() {
                            Some(b'"') => {
                                let value = self.scan_string();
                                return Some(ScanEvent::Pair {
                                    key: text,
                                    value,
                                    is_string: true,
                                    depth: self.depth,
                                });
                            }
                            Some(b'{') | Some(b'[') | None => {
                                // Composite value: its contents surface as
                                // their own events on subsequent iterations.
                                continue;
                            }
                            Some(_) => {
                                let value = self.scan_scalar();
                                return Some(ScanEvent::Pair {
                                    key: text,
                                    value,
                                    is_string: false,
                                    depth: self.depth,
                                });
                            }
                        }
                    }
                    // A string that is not a key (array element): ignore.
                }
                _ => {
                    self.scan_scalar();
                }
            }
        }
    }
}

impl<'a> JsonScanner<'a> {
    fn skip_ws_only(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }
}

#[derive(Default)]
struct Draft {
    is_file: bool,
    path: String,
    size: u64,
    oid: String,
    oid_depth: usize,
}

fn parse_entries(body: &str) -> Vec<RepoEntry> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut draft = Draft::default();

    for event in JsonScanner::new(body) {
        match event {
            ScanEvent::Pair {
                key,
                value,
                is_string,
                depth,
            } => match key {
                "type" if depth == 1 && is_string => draft.is_file = value == "file",
                "path" if depth == 1 && is_string => draft.path = unescape(value).into_owned(),
                "size" if depth == 1 && !is_string => {
                    draft.size = value.parse().unwrap_or(0);
                }
                // The oid inside `lfs` (depth 2) overrides one at the node
                // level; deeper always wins.
                "oid" if is_string && depth >= draft.oid_depth => {
                    draft.oid = value.to_owned();
                    draft.oid_depth = depth;
                }
                _ => {}
            },
            ScanEvent::ObjectEnd { depth: 1 } => {
                commit(&mut draft, &mut entries, &mut seen);
            }
            ScanEvent::ObjectEnd { .. } => {}
        }
    }

    debug!(entries = entries.len(), "parsed tree listing");
    entries
}

fn commit(draft: &mut Draft, entries: &mut Vec<RepoEntry>, seen: &mut HashSet<String>) {
    let draft = std::mem::take(draft);
    if !draft.is_file || draft.path.is_empty() {
        return;
    }
    if !is_safe_relative_path(&draft.path) {
        warn!(path = %draft.path, "skipping listing entry with unsafe path");
        return;
    }
    if !seen.insert(draft.path.clone()) {
        warn!(path = %draft.path, "skipping duplicate listing entry");
        return;
    }
    let content_hash = if is_sha256_hex(&draft.oid) {
        draft.oid
    } else {
        String::new()
    };
    entries.push(RepoEntry {
        path: draft.path,
        size: draft.size,
        content_hash,
    });
}

/// 64 lowercase hex characters, the only hash form the registry publishes
/// for LFS objects. Anything else is ignored rather than failing the file.
fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Relative, no empty or `..` components, no absolute prefix.
fn is_safe_relative_path(path: &str) -> bool {
    !path.starts_with('/') && path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Resolve JSON string escapes. Borrows when the input has none.
fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains('\\') {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(ch) => out.push(ch),
                    None => out.push('\u{fffd}'),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    Cow::Owned(out)
}
