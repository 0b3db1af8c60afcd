//! Script injection into HTML responses
//!
//! Pages replayed from an archive are made deterministic by running a script
//! before anything else on the page. The script goes right after the opening
//! `<head>` tag (or `<html>` when there is no head).
//!
//! Injection never touches the response it is given. Archived responses are
//! shared between concurrent replays, so a modified body is always a new
//! value.

use crate::record::ArchivedResponse;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use std::borrow::Cow;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

lazy_static! {
    // Byte patterns with Unicode off so non-UTF-8 bodies still match
    static ref HEAD_RE: Regex = Regex::new(r"(?i-u)<head[^>]*>").unwrap();
    static ref HTML_RE: Regex = Regex::new(r"(?i-u)<html[^>]*>").unwrap();
}

/// Scripts shipped with the proxy, addressable by name
const BUNDLED_SCRIPTS: &[(&str, &str)] = &[(
    "deterministic.js",
    include_str!("../scripts/deterministic.js"),
)];

/// Script loading errors
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script does not exist: {0}")]
    NotFound(String),

    #[error("Failed to read script {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// Resolve script identifiers to their concatenated text.
///
/// Each identifier is tried as a file path first, then as a bundled script
/// name. Any identifier that resolves to neither is an error; callers treat
/// that as fatal at startup.
pub fn load_inject_script<S: AsRef<str>>(ids: &[S]) -> Result<String, ScriptError> {
    let mut text = String::new();

    for id in ids {
        let id = id.as_ref();
        let path = Path::new(id);

        if path.is_file() {
            let content = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
                path: id.to_string(),
                source,
            })?;
            debug!(script = %id, bytes = content.len(), "Loaded inject script from file");
            text.push_str(&content);
        } else if let Some((_, content)) = BUNDLED_SCRIPTS.iter().find(|(name, _)| *name == id) {
            debug!(script = %id, "Loaded bundled inject script");
            text.push_str(content);
        } else {
            return Err(ScriptError::NotFound(id.to_string()));
        }
    }

    if !text.is_empty() {
        info!(scripts = ids.len(), bytes = text.len(), "Inject script ready");
    }

    Ok(text)
}

/// Content codings a body can be unwrapped from before injection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// `None` for codings that cannot be undone here (br, stacked codings)
    fn of(response: &ArchivedResponse) -> Option<Self> {
        match response.header("content-encoding").map(|v| v.trim().to_ascii_lowercase()) {
            None => Some(Self::Identity),
            Some(v) if v.is_empty() || v == "identity" => Some(Self::Identity),
            Some(v) if v == "gzip" || v == "x-gzip" => Some(Self::Gzip),
            Some(v) if v == "deflate" => Some(Self::Deflate),
            Some(_) => None,
        }
    }

    fn decode(self, body: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len() * 4);
        match self {
            Self::Identity => out.extend_from_slice(body),
            Self::Gzip => {
                GzDecoder::new(body).read_to_end(&mut out)?;
            }
            Self::Deflate => {
                // Servers send both zlib-wrapped and raw deflate under this name
                if ZlibDecoder::new(body).read_to_end(&mut out).is_err() {
                    out.clear();
                    DeflateDecoder::new(body).read_to_end(&mut out)?;
                }
            }
        }
        Ok(out)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Insert `script` into an HTML response.
///
/// Returns the same `Arc` when nothing needs to change: not HTML, no script,
/// script already present, or no `<head>`/`<html>` tag to anchor on. The body
/// is handled as raw bytes. A gzip or deflate body is decoded first and the
/// injected response is served without `Content-Encoding`.
pub fn inject_script(response: &Arc<ArchivedResponse>, script: Option<&str>) -> Arc<ArchivedResponse> {
    let script = match script {
        Some(s) if !s.is_empty() => s,
        _ => return Arc::clone(response),
    };

    let is_html = response
        .header("content-type")
        .map(|ct| ct.starts_with("text/html"))
        .unwrap_or(false);
    if !is_html {
        return Arc::clone(response);
    }

    let body = response.body();
    if body.is_empty() {
        return Arc::clone(response);
    }

    let coding = match ContentCoding::of(response) {
        Some(coding) => coding,
        None => {
            debug!(
                encoding = response.header("content-encoding").unwrap_or(""),
                "Unsupported content encoding, not injecting"
            );
            return Arc::clone(response);
        }
    };
    let html: Cow<[u8]> = match coding {
        ContentCoding::Identity => Cow::Borrowed(&body[..]),
        _ => match coding.decode(&body) {
            Ok(decoded) => Cow::Owned(decoded),
            Err(e) => {
                warn!(error = %e, ?coding, "Failed to decode HTML body for injection");
                return Arc::clone(response);
            }
        },
    };

    if contains(&html, script.as_bytes()) {
        return Arc::clone(response);
    }

    let anchor = HEAD_RE.find(&html).or_else(|| HTML_RE.find(&html));
    match anchor {
        Some(tag) => {
            let mut injected = Vec::with_capacity(html.len() + script.len() + 17);
            injected.extend_from_slice(&html[..tag.end()]);
            injected.extend_from_slice(b"<script>");
            injected.extend_from_slice(script.as_bytes());
            injected.extend_from_slice(b"</script>");
            injected.extend_from_slice(&html[tag.end()..]);

            let mut rewritten = response.with_body(injected);
            if coding != ContentCoding::Identity {
                rewritten.headers.remove("content-encoding");
            }
            Arc::new(rewritten)
        }
        None => {
            warn!("Failed to inject scripts.");
            debug!(content = %String::from_utf8_lossy(&html), "Response content");
            Arc::clone(response)
        }
    }
}

/// Configured script, applied to every served response
#[derive(Debug, Clone, Default)]
pub struct ScriptInjector {
    script: Option<Arc<str>>,
}

impl ScriptInjector {
    pub fn new(script: Option<String>) -> Self {
        Self {
            script: script.filter(|s| !s.is_empty()).map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.script.is_some()
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn inject(&self, response: &Arc<ArchivedResponse>) -> Arc<ArchivedResponse> {
        inject_script(response, self.script())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::HeaderList;
    use bytes::Bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn html(body: &'static str) -> Arc<ArchivedResponse> {
        html_bytes(body.as_bytes(), &[])
    }

    fn html_bytes(body: impl Into<Bytes>, extra: &[(&str, &str)]) -> Arc<ArchivedResponse> {
        let mut headers = HeaderList::new();
        headers.push("Content-Type", "text/html; charset=utf-8");
        for (name, value) in extra {
            headers.push(*name, *value);
        }
        Arc::new(ArchivedResponse::simple(200, "OK", headers, body))
    }

    #[test]
    fn test_falls_back_to_html_tag() {
        let response = html("<HTML lang=\"en\"><body>hi</body></HTML>");
        let injected = inject_script(&response, Some("X"));
        assert_eq!(
            injected.body_text(),
            "<HTML lang=\"en\"><script>X</script><body>hi</body></HTML>"
        );
    }

    #[test]
    fn test_head_with_attributes_case_insensitive() {
        let response = html("<html><HEAD profile=\"p\"><title>t</title></HEAD></html>");
        let injected = inject_script(&response, Some("X"));
        assert_eq!(
            injected.body_text(),
            "<html><HEAD profile=\"p\"><script>X</script><title>t</title></HEAD></html>"
        );
    }

    #[test]
    fn test_no_anchor_returns_original() {
        let response = html("<body>no head here</body>");
        let injected = inject_script(&response, Some("X"));
        assert!(Arc::ptr_eq(&response, &injected));
    }

    #[test]
    fn test_non_html_untouched() {
        let mut headers = HeaderList::new();
        headers.push("Content-Type", "application/json");
        let response = Arc::new(ArchivedResponse::simple(200, "OK", headers, "<head>"));
        assert!(Arc::ptr_eq(&response, &inject_script(&response, Some("X"))));
    }

    #[test]
    fn test_no_script_untouched() {
        let response = html("<html><head></head></html>");
        assert!(Arc::ptr_eq(&response, &inject_script(&response, None)));
        assert!(Arc::ptr_eq(&response, &inject_script(&response, Some(""))));
        assert!(!ScriptInjector::new(Some(String::new())).is_enabled());
    }

    #[test]
    fn test_injection_is_idempotent_and_leaves_input_alone() {
        let response = html("<html><head></head></html>");

        let once = inject_script(&response, Some("X"));
        assert_eq!(once.body_text(), "<html><head><script>X</script></head></html>");

        let twice = inject_script(&once, Some("X"));
        assert!(Arc::ptr_eq(&once, &twice));

        assert_eq!(response.body_text(), "<html><head></head></html>");
    }

    #[test]
    fn test_non_utf8_body_bytes_preserved() {
        let response = html_bytes(&b"<html><head></head><body>caf\xE9</body></html>"[..], &[]);
        let injected = inject_script(&response, Some("X"));
        assert_eq!(
            injected.body(),
            Bytes::from_static(b"<html><head><script>X</script></head><body>caf\xE9</body></html>")
        );
    }

    #[test]
    fn test_gzip_body_is_decoded_before_injection() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<html><head></head><body>zipped</body></html>").unwrap();
        let compressed = encoder.finish().unwrap();
        let length = compressed.len().to_string();
        let response = html_bytes(
            compressed,
            &[("Content-Encoding", "gzip"), ("Content-Length", length.as_str())],
        );

        let injected = inject_script(&response, Some("X"));
        let expected = "<html><head><script>X</script></head><body>zipped</body></html>";
        assert_eq!(injected.body_text(), expected);
        assert_eq!(injected.header("content-encoding"), None);
        assert_eq!(injected.header("content-length"), Some(expected.len().to_string().as_str()));
        assert_eq!(response.header("content-encoding"), Some("gzip"));

        // Served identity-encoded, so a second pass sees the script
        assert!(Arc::ptr_eq(&injected, &inject_script(&injected, Some("X"))));
    }

    #[test]
    fn test_corrupt_gzip_body_untouched() {
        let response = html_bytes(&b"<html><head></head></html>"[..], &[("Content-Encoding", "gzip")]);
        assert!(Arc::ptr_eq(&response, &inject_script(&response, Some("X"))));
    }

    #[test]
    fn test_unsupported_encoding_untouched() {
        let response = html_bytes(&b"<html><head></head></html>"[..], &[("Content-Encoding", "br")]);
        assert!(Arc::ptr_eq(&response, &inject_script(&response, Some("X"))));
    }

    #[test]
    fn test_load_bundled_script() {
        let text = load_inject_script(&["deterministic.js"]).unwrap();
        assert!(text.contains("Math.random"));
    }

    #[test]
    fn test_load_missing_script_fails() {
        let err = load_inject_script(&["deterministic.js", "no-such-script.js"]).unwrap_err();
        assert!(matches!(err, ScriptError::NotFound(ref id) if id == "no-such-script.js"));
    }

    #[test]
    fn test_load_script_from_file_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        std::fs::write(&a, "var a = 1;").unwrap();
        std::fs::write(&b, "var b = 2;").unwrap();

        let text = load_inject_script(&[a.to_str().unwrap(), b.to_str().unwrap()]).unwrap();
        assert_eq!(text, "var a = 1;var b = 2;");
    }
}
