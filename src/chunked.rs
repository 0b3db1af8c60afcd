//! Response body reader with per-chunk timing
//!
//! Decodes an HTTP/1.1 response body into the chunks as they arrived on the
//! wire, recording the gap before each one. The gaps are what make a replayed
//! chunked response stream the way the origin streamed it.
//!
//! The reader owns the stream it is given. Whatever the outcome, the stream
//! (and the connection under it) is dropped when reading ends.

use bytes::Bytes;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, trace};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

/// Body reading errors
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Framing broke off; `partial` holds every chunk read before that
    #[error("Incomplete body: framing error after {} chunk(s)", partial.len())]
    IncompleteBody { partial: Vec<Bytes> },

    #[error("Response body too large: {size} bytes (limit: {limit})")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("Read timeout")]
    ReadTimeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How the body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Exactly this many bytes
    ContentLength(usize),
    /// Everything until the peer closes
    UntilEof,
    /// No body at all (HEAD, 1xx, 204, 304)
    Empty,
}

/// Decoded body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyChunks {
    pub chunks: Vec<Bytes>,
    /// Milliseconds waited before each chunk, aligned with `chunks`
    pub delays_ms: Vec<u64>,
}

impl BodyChunks {
    fn single(body: Bytes) -> Self {
        Self {
            chunks: vec![body],
            delays_ms: vec![0],
        }
    }
}

/// Body reader with per-read timeout and a size cap
#[derive(Debug, Clone)]
pub struct ChunkedBodyReader {
    read_timeout: Duration,
    max_body_size: usize,
}

impl Default for ChunkedBodyReader {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT, DEFAULT_MAX_BODY_SIZE)
    }
}

impl ChunkedBodyReader {
    pub fn new(read_timeout: Duration, max_body_size: usize) -> Self {
        Self {
            read_timeout,
            max_body_size,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Read the whole body from `reader`.
    ///
    /// Delays are measured from the moment this is called, so the first
    /// chunk's delay is relative to the end of the header block. Attributing
    /// the header latency itself is the caller's job.
    pub async fn read<R>(&self, mut reader: R, framing: BodyFraming) -> Result<BodyChunks, ChunkError>
    where
        R: AsyncBufRead + Unpin,
    {
        match framing {
            BodyFraming::Chunked => self.read_chunked(&mut reader).await,
            BodyFraming::ContentLength(len) => self.read_exact_body(&mut reader, len).await,
            BodyFraming::UntilEof => self.read_until_eof(&mut reader).await,
            BodyFraming::Empty => Ok(BodyChunks::single(Bytes::new())),
        }
    }

    async fn read_chunked<R>(&self, reader: &mut R) -> Result<BodyChunks, ChunkError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut body = BodyChunks::default();
        let mut total = 0usize;
        let mut start = Instant::now();
        let mut line = Vec::with_capacity(32);

        loop {
            line.clear();
            let n = self.timed(reader.read_until(b'\n', &mut line)).await?;
            let size = match (n, parse_chunk_size(&line)) {
                (0, _) | (_, None) => {
                    debug!(line = ?String::from_utf8_lossy(&line), "Malformed chunk size line");
                    return Err(ChunkError::IncompleteBody {
                        partial: body.chunks,
                    });
                }
                (_, Some(size)) => size,
            };

            if size == 0 {
                break;
            }

            total += size;
            if total > self.max_body_size {
                return Err(ChunkError::BodyTooLarge {
                    size: total,
                    limit: self.max_body_size,
                });
            }

            body.delays_ms.push(start.elapsed().as_millis() as u64);

            let mut data = vec![0u8; size];
            match self.timed(reader.read_exact(&mut data)).await {
                Ok(_) => {}
                Err(ChunkError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(ChunkError::IncompleteBody {
                        partial: body.chunks,
                    });
                }
                Err(e) => return Err(e),
            }
            body.chunks.push(Bytes::from(data));

            // CRLF after the chunk data
            let mut crlf = [0u8; 2];
            match self.timed(reader.read_exact(&mut crlf)).await {
                Ok(_) => {}
                Err(ChunkError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(ChunkError::IncompleteBody {
                        partial: body.chunks,
                    });
                }
                Err(e) => return Err(e),
            }

            trace!(size, "Read body chunk");
            start = Instant::now();
        }

        // Trailers are not kept
        loop {
            line.clear();
            let n = self.timed(reader.read_until(b'\n', &mut line)).await?;
            if n == 0 || line == b"\r\n" || line == b"\n" {
                break;
            }
        }

        // A chunked body with no data chunks still needs a chunk to replay
        if body.chunks.is_empty() {
            return Ok(BodyChunks::single(Bytes::new()));
        }

        Ok(body)
    }

    async fn read_exact_body<R>(&self, reader: &mut R, len: usize) -> Result<BodyChunks, ChunkError>
    where
        R: AsyncBufRead + Unpin,
    {
        if len > self.max_body_size {
            return Err(ChunkError::BodyTooLarge {
                size: len,
                limit: self.max_body_size,
            });
        }

        let mut data = Vec::with_capacity(len);
        self.timed((&mut *reader).take(len as u64).read_to_end(&mut data))
            .await?;

        if data.len() < len {
            debug!(expected = len, got = data.len(), "Premature EOF in body");
            return Err(ChunkError::IncompleteBody {
                partial: vec![Bytes::from(data)],
            });
        }

        Ok(BodyChunks::single(Bytes::from(data)))
    }

    async fn read_until_eof<R>(&self, reader: &mut R) -> Result<BodyChunks, ChunkError>
    where
        R: AsyncBufRead + Unpin,
    {
        let limit = self.max_body_size as u64 + 1;
        let mut data = Vec::new();
        self.timed((&mut *reader).take(limit).read_to_end(&mut data))
            .await?;

        if data.len() > self.max_body_size {
            return Err(ChunkError::BodyTooLarge {
                size: data.len(),
                limit: self.max_body_size,
            });
        }

        Ok(BodyChunks::single(Bytes::from(data)))
    }

    async fn timed<F, T>(&self, fut: F) -> Result<T, ChunkError>
    where
        F: std::future::Future<Output = io::Result<T>>,
    {
        timeout(self.read_timeout, fut)
            .await
            .map_err(|_| ChunkError::ReadTimeout)?
            .map_err(ChunkError::Io)
    }
}

/// Read a body with default limits.
///
/// Chunked bodies come back chunk by chunk; anything else is read to EOF and
/// returned as one chunk with a zero delay.
pub async fn read_chunks<R>(reader: R, chunked: bool) -> Result<BodyChunks, ChunkError>
where
    R: AsyncBufRead + Unpin,
{
    let framing = if chunked {
        BodyFraming::Chunked
    } else {
        BodyFraming::UntilEof
    };
    ChunkedBodyReader::default().read(reader, framing).await
}

/// Parse `hex-size[;extensions]\r\n`
fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next().unwrap_or(line).trim();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}
