use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{rustls, TlsConnector};
use tracing::{debug, error, warn};

use crate::archive::Archive;
use crate::chunked::{BodyFraming, ChunkError, ChunkedBodyReader};
use crate::config::Config;
use crate::dns::Resolver;
use crate::mitm::UpstreamTlsConfig;
use crate::record::{ArchivedRequest, ArchivedResponse, HeaderList, ResponseTiming};

const MAX_HEADER_SIZE: usize = 65536; // 64KB max headers
const MAX_HEADERS: usize = 128;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("DNS resolution failed for {0}")]
    DnsResolution(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Headers too large (> 64KB)")]
    HeadersTooLarge,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Body error: {0}")]
    Body(#[from] ChunkError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Transport faults worth a fresh connection. Resolution and size-limit
    /// failures would fail the same way again.
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::ConnectionTimeout
            | FetchError::ReadTimeout
            | FetchError::WriteTimeout
            | FetchError::InvalidResponse(_)
            | FetchError::Tls(_)
            | FetchError::Io(_) => true,
            FetchError::Body(e) => !matches!(e, ChunkError::BodyTooLarge { .. }),
            FetchError::DnsResolution(_)
            | FetchError::InvalidHost(_)
            | FetchError::HeadersTooLarge
            | FetchError::RetriesExhausted { .. } => false,
        }
    }
}

impl From<httparse::Error> for FetchError {
    fn from(e: httparse::Error) -> Self {
        FetchError::InvalidResponse(e.to_string())
    }
}

/// Bounded retry, attempts counted in total (not retries after the first)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Origin fetch capability used by the record path
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &ArchivedRequest) -> Result<Arc<ArchivedResponse>, FetchError>;
}

/// Fetches from real origins, capturing header latency and chunk timing
pub struct OriginFetcher {
    resolver: Arc<dyn Resolver>,
    archive: Arc<dyn Archive>,
    retry: RetryPolicy,
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    max_body_size: usize,
    tls_config: Arc<rustls::ClientConfig>,
}

struct ResponseHead {
    protocol_version: u8,
    status_code: u16,
    reason_phrase: String,
    headers: HeaderList,
}

impl OriginFetcher {
    pub fn new(resolver: Arc<dyn Resolver>, archive: Arc<dyn Archive>) -> Self {
        let body_reader = ChunkedBodyReader::default();
        Self {
            resolver,
            archive,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: body_reader.read_timeout(),
            max_body_size: body_reader.max_body_size(),
            tls_config: UpstreamTlsConfig::default().client_config(),
        }
    }

    pub fn from_config(config: &Config, resolver: Arc<dyn Resolver>, archive: Arc<dyn Archive>) -> Self {
        Self::new(resolver, archive)
            .with_retry_policy(RetryPolicy::new(config.fetch_attempts))
            .with_timeouts(
                Duration::from_secs(config.connect_timeout_seconds),
                Duration::from_secs(config.read_timeout_seconds),
                Duration::from_secs(config.write_timeout_seconds),
            )
            .with_max_body_size(config.max_response_body_size)
            .with_insecure_upstream(config.upstream_tls_insecure)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Accept any upstream certificate. Only for recording against origins
    /// with self-signed certificates.
    pub fn with_insecure_upstream(mut self, insecure: bool) -> Self {
        self.tls_config = UpstreamTlsConfig::new(insecure).client_config();
        self
    }

    pub fn with_tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = tls_config;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn fetch_with_retry(&self, request: &ArchivedRequest) -> Result<ArchivedResponse, FetchError> {
        let (hostname, port) = split_host_port(&request.host, request.is_secure)?;

        let ip = match self.resolver.resolve(&hostname).await {
            Some(ip) => ip,
            None => {
                error!(host = %hostname, request = %request, "Unable to resolve host, giving up");
                return Err(FetchError::DnsResolution(hostname));
            }
        };

        let rtt_ms = self.archive.get_server_rtt(&request.host).await;
        let addr = SocketAddr::new(ip, port);
        let max_attempts = self.retry.max_attempts;

        let mut attempt = 1;
        loop {
            debug!(addr = %addr, attempt, max_attempts, request = %request, "Fetching from origin");

            match self.try_once(addr, &hostname, request, rtt_ms).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    warn!(
                        request = %request,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Origin fetch failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) if e.is_retriable() => {
                    error!(request = %request, attempts = attempt, error = %e, "Origin fetch failed, retries exhausted");
                    return Err(FetchError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    error!(request = %request, error = %e, "Origin fetch failed");
                    return Err(e);
                }
            }
        }
    }

    /// One connection, one request
    async fn try_once(
        &self,
        addr: SocketAddr,
        hostname: &str,
        request: &ArchivedRequest,
        rtt_ms: u64,
    ) -> Result<ArchivedResponse, FetchError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FetchError::ConnectionTimeout)??;

        if request.is_secure {
            let connector = TlsConnector::from(Arc::clone(&self.tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(hostname.to_string())
                .map_err(|e| FetchError::InvalidHost(format!("{}: {}", hostname, e)))?;

            let tls_stream = timeout(self.connect_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| FetchError::ConnectionTimeout)?
                .map_err(|e| FetchError::Tls(e.to_string()))?;

            self.exchange(tls_stream, request, rtt_ms).await
        } else {
            self.exchange(stream, request, rtt_ms).await
        }
    }

    /// Send the request and read the response (generic over TLS and plain TCP).
    /// The stream is consumed by the body reader and dropped when it returns.
    async fn exchange<S>(
        &self,
        mut stream: S,
        request: &ArchivedRequest,
        rtt_ms: u64,
    ) -> Result<ArchivedResponse, FetchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request_bytes = format_http_request(request);
        let start = Instant::now();

        timeout(self.write_timeout, async {
            stream.write_all(&request_bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| FetchError::WriteTimeout)??;

        let mut reader = BufReader::new(stream);
        let head = self.read_response_head(&mut reader).await?;

        let elapsed_ms = start.elapsed().as_millis() as i64;
        let header_delay_ms = elapsed_ms - rtt_ms as i64;

        let framing = body_framing(&request.method, head.status_code, &head.headers);
        debug!(
            status = head.status_code,
            header_delay_ms,
            framing = ?framing,
            "Received response headers"
        );

        let body = ChunkedBodyReader::new(self.read_timeout, self.max_body_size)
            .read(reader, framing)
            .await?;

        ArchivedResponse::new(
            head.protocol_version,
            head.status_code,
            head.reason_phrase,
            head.headers,
            body.chunks,
            ResponseTiming {
                header_delay_ms,
                chunk_delays_ms: body.delays_ms,
            },
        )
        .map_err(|e| FetchError::InvalidResponse(e.to_string()))
    }

    /// Read the status line and headers, skipping interim 1xx responses
    async fn read_response_head<R>(&self, reader: &mut R) -> Result<ResponseHead, FetchError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let raw = self.read_header_block(reader).await?;

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut headers);

            match response.parse(&raw)? {
                httparse::Status::Complete(_) => {}
                httparse::Status::Partial => {
                    return Err(FetchError::InvalidResponse("Incomplete headers".to_string()));
                }
            }

            let status_code = response
                .code
                .ok_or_else(|| FetchError::InvalidResponse("Missing status code".to_string()))?;

            if (100..200).contains(&status_code) && status_code != 101 {
                debug!(status = status_code, "Skipping interim response");
                continue;
            }

            let protocol_version = match response.version {
                Some(0) => 10,
                _ => 11,
            };

            let header_list = response
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();

            return Ok(ResponseHead {
                protocol_version,
                status_code,
                reason_phrase: response.reason.unwrap_or("").to_string(),
                headers: header_list,
            });
        }
    }

    /// Read lines up to and including the blank line ending the header block
    async fn read_header_block<R>(&self, reader: &mut R) -> Result<BytesMut, FetchError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut header_buf = BytesMut::with_capacity(1024);
        let mut line = Vec::with_capacity(256);

        loop {
            line.clear();
            let n = timeout(self.read_timeout, reader.read_until(b'\n', &mut line))
                .await
                .map_err(|_| FetchError::ReadTimeout)??;

            if n == 0 {
                return Err(FetchError::InvalidResponse("Connection closed".to_string()));
            }

            header_buf.extend_from_slice(&line);
            if header_buf.len() > MAX_HEADER_SIZE {
                return Err(FetchError::HeadersTooLarge);
            }

            let is_blank = line == b"\r\n" || line == b"\n";
            if is_blank && header_buf.len() > n {
                return Ok(header_buf);
            }
        }
    }
}

#[async_trait]
impl Fetch for OriginFetcher {
    async fn fetch(&self, request: &ArchivedRequest) -> Result<Arc<ArchivedResponse>, FetchError> {
        let response = self.fetch_with_retry(request).await?;
        debug!(
            request = %request,
            status = response.status_code,
            chunks = response.body_chunks().len(),
            "Fetched from origin"
        );
        Ok(Arc::new(response))
    }
}

/// Split `host[:port]`, defaulting the port by scheme
fn split_host_port(host: &str, is_secure: bool) -> Result<(String, u16), FetchError> {
    let default_port = if is_secure { 443 } else { 80 };

    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| FetchError::InvalidHost(host.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| FetchError::InvalidHost(host.to_string()))?,
            None if tail.is_empty() => default_port,
            None => return Err(FetchError::InvalidHost(host.to_string())),
        };
        return Ok((addr.to_string(), port));
    }

    match host.rsplit_once(':') {
        // Bare IPv6 literal without brackets
        Some((name, _)) if name.contains(':') => Ok((host.to_string(), default_port)),
        Some((name, port)) => {
            let port = port
                .parse()
                .map_err(|_| FetchError::InvalidHost(host.to_string()))?;
            Ok((name.to_string(), port))
        }
        None if host.is_empty() => Err(FetchError::InvalidHost(host.to_string())),
        None => Ok((host.to_string(), default_port)),
    }
}

fn body_framing(method: &str, status_code: u16, headers: &HeaderList) -> BodyFraming {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return BodyFraming::Empty;
    }

    let chunked = headers
        .get_all("transfer-encoding")
        .any(|te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return BodyFraming::Chunked;
    }

    match headers.get("content-length").and_then(|cl| cl.trim().parse().ok()) {
        Some(len) => BodyFraming::ContentLength(len),
        None => BodyFraming::UntilEof,
    }
}

/// Format HTTP/1.1 request with proper header sanitization
fn format_http_request(request: &ArchivedRequest) -> Bytes {
    let mut buf = BytesMut::new();

    // Request line (origin-form)
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, request.path).as_bytes());

    // Host header (required)
    buf.extend_from_slice(format!("Host: {}\r\n", request.host).as_bytes());

    for (name, value) in request.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if is_hop_by_hop(&lower) || lower == "host" || lower == "content-length" {
            continue;
        }
        buf.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    if let Some(body) = &request.body {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }

    // One request per connection
    buf.extend_from_slice(b"Connection: close\r\n");
    buf.extend_from_slice(b"\r\n");

    if let Some(body) = &request.body {
        buf.extend_from_slice(body);
    }

    buf.freeze()
}

/// Check if header is hop-by-hop (RFC 7230 § 6.1)
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}
