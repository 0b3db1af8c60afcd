//! Record and replay dispatch
//!
//! A dispatcher turns a canonical request into the response to serve. The
//! record dispatcher fetches from the origin and archives what it gets; the
//! replay dispatcher serves from the archive only. `ModeController` holds the
//! active one and can switch between them while requests are in flight.

pub mod controller;
pub mod record;
pub mod replay;

pub use controller::{ActiveDispatcher, ModeController};
pub use record::RecordDispatcher;
pub use replay::ReplayDispatcher;

use crate::http_client::FetchError;
use thiserror::Error;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Replay found nothing to serve; `reason` names the request and may
    /// carry a diff against the nearest archived one
    #[error("Could not replay: {reason}")]
    Miss { reason: String },

    #[error("Origin fetch failed: {0}")]
    FetchFailed(#[from] FetchError),
}

/// Dispatch behaviour chosen at startup
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub use_record_mode: bool,
    pub use_closest_match: bool,
    pub diff_unknown_requests: bool,
    pub inject_script: Option<String>,
}
