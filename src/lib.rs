//! webreplay - HTTP/HTTPS record-and-replay intercepting proxy
//!
//! In record mode every request is forwarded to its origin and the response,
//! including its timing, is stored in an archive keyed by request identity.
//! In replay mode the archive answers instead, so a page load can be repeated
//! deterministically without touching the network.
//!
//! ## Features
//!
//! - **Record / replay**: switchable at runtime without disturbing in-flight requests
//! - **TLS interception**: per-host leaf certificates minted from a local CA, chosen by SNI
//! - **Timing fidelity**: header and per-chunk delays captured and optionally replayed
//! - **Script injection**: deterministic JavaScript inserted into HTML responses
//! - **Closest match**: optional fuzzy fallback and request diffs for replay misses
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webreplay::archive::{Archive, MemoryArchive};
//! use webreplay::dispatch::{DispatchOptions, ModeController};
//! use webreplay::dns::SystemResolver;
//! use webreplay::http_client::OriginFetcher;
//! use webreplay::record::ArchivedRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let archive: Arc<dyn Archive> = Arc::new(MemoryArchive::new());
//!     let resolver = Arc::new(SystemResolver::new(1000, 60, 5));
//!     let fetcher = Arc::new(OriginFetcher::new(resolver, Arc::clone(&archive)));
//!
//!     let options = DispatchOptions {
//!         use_record_mode: true,
//!         ..Default::default()
//!     };
//!     let controller = ModeController::new(options, archive, fetcher, None);
//!
//!     let response = controller
//!         .dispatch(&ArchivedRequest::get("example.com", "/", false))
//!         .await?;
//!     println!("{} {}", response.status_code, response.reason_phrase);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `record` - request/response data model
//! - `chunked` - HTTP/1.1 body reader preserving chunk boundaries and timing
//! - `http_client` - origin fetcher with bounded retries
//! - `inject` - HTML script injection
//! - `archive` - in-memory archive with JSON snapshots
//! - `dispatch` - record and replay dispatchers behind a mode switch
//! - `mitm` - certificate authority and SNI-driven TLS interception
//! - `server` - HTTP/1.1 listeners serving dispatched responses

// Data model and wire handling
pub mod chunked;
pub mod record;

// Upstream
pub mod dns;
pub mod http_client;

// Storage and dispatch
pub mod archive;
pub mod cache_miss;
pub mod dispatch;
pub mod inject;

// TLS interception
pub mod mitm;
pub mod tls;

// Outer loop
pub mod config;
pub mod server;

/// Configuration types
pub use config::Config;

/// Data model
pub use record::{ArchivedRequest, ArchivedResponse, HeaderList, ResponseTiming};

/// Dispatch
pub use dispatch::{DispatchError, DispatchOptions, ModeController};

/// Storage
pub use archive::{Archive, MemoryArchive};

/// Origin fetching
pub use http_client::{Fetch, FetchError, OriginFetcher, RetryPolicy};

/// TLS interception
pub use mitm::{CertificateAuthority, CertificateIssuer, InterceptError, MitmError, TlsInterceptor};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
