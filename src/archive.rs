//! Response archive
//!
//! The archive maps request identity to the response captured for it. Record
//! mode writes to it, replay mode serves from it. `MemoryArchive` keeps
//! everything in memory and snapshots to a JSON file between runs.

use crate::record::{ArchivedRequest, ArchivedResponse};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Archive errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Archive capability shared by both dispatchers.
///
/// Implementations must tolerate concurrent callers. Two concurrent `put`s
/// for the same identity may overwrite each other but must leave the archive
/// consistent.
#[async_trait]
pub trait Archive: Send + Sync {
    async fn contains(&self, request: &ArchivedRequest) -> bool;

    async fn get(&self, request: &ArchivedRequest) -> Option<Arc<ArchivedResponse>>;

    async fn put(&self, request: ArchivedRequest, response: Arc<ArchivedResponse>);

    /// Most similar archived request for the same method, host and scheme.
    /// With `use_path_only` only the paths are compared, otherwise the whole
    /// formatted request including headers.
    async fn find_closest(
        &self,
        request: &ArchivedRequest,
        use_path_only: bool,
    ) -> Option<ArchivedRequest>;

    /// Unified diff between the closest archived request (`-`) and
    /// `request` (`+`)
    async fn diff(&self, request: &ArchivedRequest) -> Option<String>;

    /// Baseline round-trip estimate for `host`, in milliseconds
    async fn get_server_rtt(&self, host: &str) -> u64;
}

#[derive(Default)]
struct ArchiveState {
    entries: Vec<(ArchivedRequest, Arc<ArchivedResponse>)>,
    index: HashMap<ArchivedRequest, usize>,
    server_rtt: HashMap<String, u64>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveEntry {
    request: ArchivedRequest,
    response: ArchivedResponse,
}

#[derive(Serialize, Deserialize, Default)]
struct ArchiveSnapshot {
    entries: Vec<ArchiveEntry>,
    #[serde(default)]
    server_rtt: HashMap<String, u64>,
}

/// In-memory archive with JSON persistence
#[derive(Default)]
pub struct MemoryArchive {
    state: RwLock<ArchiveState>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`MemoryArchive::save`]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let snapshot: ArchiveSnapshot = serde_json::from_slice(&data)?;

        let mut state = ArchiveState {
            server_rtt: snapshot.server_rtt,
            ..Default::default()
        };
        for entry in snapshot.entries {
            insert(&mut state, entry.request, Arc::new(entry.response));
        }

        info!(
            path = %path.display(),
            entries = state.entries.len(),
            "Loaded archive"
        );

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Write every entry to `path` as JSON
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let snapshot = {
            let state = self.state.read().await;
            ArchiveSnapshot {
                entries: state
                    .entries
                    .iter()
                    .map(|(req, resp)| ArchiveEntry {
                        request: req.clone(),
                        response: ArchivedResponse::clone(resp),
                    })
                    .collect(),
                server_rtt: state.server_rtt.clone(),
            }
        };

        let data = serde_json::to_vec(&snapshot)?;
        tokio::fs::write(path, data).await?;

        info!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "Saved archive"
        );
        Ok(())
    }

    pub async fn set_server_rtt(&self, host: impl Into<String>, rtt_ms: u64) {
        self.state.write().await.server_rtt.insert(host.into(), rtt_ms);
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn requests(&self) -> Vec<ArchivedRequest> {
        let state = self.state.read().await;
        state.entries.iter().map(|(req, _)| req.clone()).collect()
    }
}

fn insert(state: &mut ArchiveState, request: ArchivedRequest, response: Arc<ArchivedResponse>) {
    match state.index.get(&request) {
        Some(&idx) => state.entries[idx] = (request, response),
        None => {
            state.index.insert(request.clone(), state.entries.len());
            state.entries.push((request, response));
        }
    }
}

fn similarity(a: &str, b: &str) -> f32 {
    TextDiff::from_chars(a, b).ratio()
}

fn closest_in(
    state: &ArchiveState,
    request: &ArchivedRequest,
    use_path_only: bool,
) -> Option<ArchivedRequest> {
    let target = if use_path_only {
        request.path.clone()
    } else {
        request.formatted()
    };

    let mut best: Option<(&ArchivedRequest, f32)> = None;
    for (candidate, _) in &state.entries {
        if candidate.method != request.method
            || candidate.host != request.host
            || candidate.is_secure != request.is_secure
        {
            continue;
        }

        let score = if use_path_only {
            similarity(&candidate.path, &target)
        } else {
            similarity(&candidate.formatted(), &target)
        };

        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }

    best.map(|(candidate, score)| {
        debug!(request = %request, closest = %candidate, score, "Closest archived request");
        candidate.clone()
    })
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn contains(&self, request: &ArchivedRequest) -> bool {
        self.state.read().await.index.contains_key(request)
    }

    async fn get(&self, request: &ArchivedRequest) -> Option<Arc<ArchivedResponse>> {
        let state = self.state.read().await;
        state
            .index
            .get(request)
            .map(|&idx| Arc::clone(&state.entries[idx].1))
    }

    async fn put(&self, request: ArchivedRequest, response: Arc<ArchivedResponse>) {
        let mut state = self.state.write().await;
        insert(&mut state, request, response);
    }

    async fn find_closest(
        &self,
        request: &ArchivedRequest,
        use_path_only: bool,
    ) -> Option<ArchivedRequest> {
        let state = self.state.read().await;
        closest_in(&state, request, use_path_only)
    }

    async fn diff(&self, request: &ArchivedRequest) -> Option<String> {
        let closest = {
            let state = self.state.read().await;
            closest_in(&state, request, true)?
        };

        let archived = closest.formatted();
        let current = request.formatted();
        let text_diff = TextDiff::from_lines(&archived, &current);
        let unified = text_diff
            .unified_diff()
            .context_radius(3)
            .header("archived", "current")
            .to_string();

        if unified.is_empty() {
            None
        } else {
            Some(unified)
        }
    }

    async fn get_server_rtt(&self, host: &str) -> u64 {
        self.state
            .read()
            .await
            .server_rtt
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}
