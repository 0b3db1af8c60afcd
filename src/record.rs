//! Request and response records
//!
//! `ArchivedRequest` is the canonical form of an inbound request and the key
//! used for archive lookups. `ArchivedResponse` is a captured origin response
//! together with the timing needed to replay it realistically.
//!
//! Both are values: a response that has been handed out (for example one held
//! by the archive) is shared behind an `Arc` and never mutated. Any
//! transformation produces a new value.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Record construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Timing mismatch: {chunks} body chunks but {delays} chunk delays")]
    TimingMismatch { chunks: usize, delays: usize },
}

/// Ordered header multimap with case-insensitive lookups.
///
/// Insertion order and duplicate names are preserved, which matters when a
/// response is written back exactly as it was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with a single value, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(idx) => {
                self.0[idx].1 = value;
                let mut i = 0;
                self.0.retain(|(n, _)| {
                    let keep = i <= idx || !n.eq_ignore_ascii_case(name);
                    i += 1;
                    keep
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderList
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect())
    }
}

/// Canonical inbound request.
///
/// Identity (`Eq`/`Hash`) covers method, host, path, body and scheme.
/// Headers are carried for closest-match scoring and for forwarding, but two
/// requests differing only in headers are the same archive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub headers: HeaderList,
    pub body: Option<Bytes>,
    pub is_secure: bool,
}

impl ArchivedRequest {
    pub fn new(
        method: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        headers: HeaderList,
        body: Option<Bytes>,
        is_secure: bool,
    ) -> Self {
        Self {
            method: method.into(),
            host: host.into(),
            path: path.into(),
            headers,
            // An empty body and no body are the same request on the wire
            body: body.filter(|b| !b.is_empty()),
            is_secure,
        }
    }

    pub fn get(host: impl Into<String>, path: impl Into<String>, is_secure: bool) -> Self {
        Self::new("GET", host, path, HeaderList::new(), None, is_secure)
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_secure {
            "https"
        } else {
            "http"
        }
    }

    /// Multi-line canonical form used for diffing against archived requests.
    ///
    /// Headers are sorted by lowercased name so that header order on the wire
    /// does not show up as a difference.
    pub fn formatted(&self) -> String {
        let mut out = format!("{} {}://{}{}\n", self.method, self.scheme(), self.host, self.path);

        let mut headers: Vec<(String, &str)> = self
            .headers
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v))
            .collect();
        headers.sort();
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\n", name, value));
        }

        if let Some(body) = &self.body {
            out.push('\n');
            out.push_str(&String::from_utf8_lossy(body));
            out.push('\n');
        }
        out
    }
}

impl PartialEq for ArchivedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.host == other.host
            && self.path == other.path
            && self.body == other.body
            && self.is_secure == other.is_secure
    }
}

impl Eq for ArchivedRequest {}

impl Hash for ArchivedRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.method.hash(state);
        self.host.hash(state);
        self.path.hash(state);
        self.body.hash(state);
        self.is_secure.hash(state);
    }
}

impl fmt::Display for ArchivedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}://{}{}", self.method, self.scheme(), self.host, self.path)
    }
}

/// Timing captured while fetching from the origin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseTiming {
    /// Time to response headers minus the server round-trip estimate.
    /// Signed: the estimate may exceed the measurement.
    pub header_delay_ms: i64,

    /// Arrival gap for each body chunk, aligned with `body_chunks`
    pub chunk_delays_ms: Vec<u64>,
}

/// Captured origin response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResponseParts")]
pub struct ArchivedResponse {
    pub protocol_version: u8,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: HeaderList,
    body_chunks: Vec<Bytes>,
    timing: ResponseTiming,
}

#[derive(Deserialize)]
struct ResponseParts {
    protocol_version: u8,
    status_code: u16,
    reason_phrase: String,
    headers: HeaderList,
    body_chunks: Vec<Bytes>,
    timing: ResponseTiming,
}

impl TryFrom<ResponseParts> for ArchivedResponse {
    type Error = RecordError;

    fn try_from(parts: ResponseParts) -> Result<Self, Self::Error> {
        ArchivedResponse::new(
            parts.protocol_version,
            parts.status_code,
            parts.reason_phrase,
            parts.headers,
            parts.body_chunks,
            parts.timing,
        )
    }
}

impl ArchivedResponse {
    pub fn new(
        protocol_version: u8,
        status_code: u16,
        reason_phrase: impl Into<String>,
        headers: HeaderList,
        body_chunks: Vec<Bytes>,
        timing: ResponseTiming,
    ) -> Result<Self, RecordError> {
        if body_chunks.len() != timing.chunk_delays_ms.len() {
            return Err(RecordError::TimingMismatch {
                chunks: body_chunks.len(),
                delays: timing.chunk_delays_ms.len(),
            });
        }

        Ok(Self {
            protocol_version,
            status_code,
            reason_phrase: reason_phrase.into(),
            headers,
            body_chunks,
            timing,
        })
    }

    /// Single-chunk response with zero delays
    pub fn simple(status_code: u16, reason: &str, headers: HeaderList, body: impl Into<Bytes>) -> Self {
        Self {
            protocol_version: 11,
            status_code,
            reason_phrase: reason.to_string(),
            headers,
            body_chunks: vec![body.into()],
            timing: ResponseTiming {
                header_delay_ms: 0,
                chunk_delays_ms: vec![0],
            },
        }
    }

    pub fn body_chunks(&self) -> &[Bytes] {
        &self.body_chunks
    }

    pub fn timing(&self) -> &ResponseTiming {
        &self.timing
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all("transfer-encoding")
            .any(|te| te.to_ascii_lowercase().contains("chunked"))
    }

    /// Concatenated body
    pub fn body(&self) -> Bytes {
        match self.body_chunks.as_slice() {
            [single] => single.clone(),
            chunks => {
                let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    pub fn body_len(&self) -> usize {
        self.body_chunks.iter().map(Bytes::len).sum()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    /// New response carrying `body` as its only body chunk.
    ///
    /// The first chunk delay is kept so the replayed response still starts
    /// when the original did. A `Content-Length` header, if present, is
    /// rewritten to match. `Transfer-Encoding` is dropped since the body is
    /// no longer framed as captured.
    pub fn with_body(&self, body: impl Into<Bytes>) -> Self {
        let first_delay = self.timing.chunk_delays_ms.first().copied().unwrap_or(0);
        let body = body.into();

        let mut headers = self.headers.clone();
        headers.remove("transfer-encoding");
        if headers.contains("content-length") {
            headers.set("content-length", body.len().to_string());
        }

        Self {
            protocol_version: self.protocol_version,
            status_code: self.status_code,
            reason_phrase: self.reason_phrase.clone(),
            headers,
            body_chunks: vec![body],
            timing: ResponseTiming {
                header_delay_ms: self.timing.header_delay_ms,
                chunk_delays_ms: vec![first_delay],
            },
        }
    }
}
