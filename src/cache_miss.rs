use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::record::ArchivedRequest;

/// Observer notified of every dispatched request
pub trait CacheMissObserver: Send + Sync {
    fn record(&self, request: &ArchivedRequest, is_record_mode: bool, is_cache_miss: bool);
}

/// Individual observation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheMissEntry {
    pub timestamp: String, // ISO8601 format
    pub method: String,
    pub url: String,
    pub is_record_mode: bool,
    pub is_cache_miss: bool,
}

#[derive(Debug, Serialize)]
struct CacheMissReport<'a> {
    total_requests: u64,
    cache_misses: u64,
    entries: &'a [CacheMissEntry],
}

/// In-memory log of dispatched requests with hit/miss counters
#[derive(Debug, Default)]
pub struct CacheMissLog {
    entries: Mutex<Vec<CacheMissEntry>>,
    total: AtomicU64,
    misses: AtomicU64,
}

impl CacheMissLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CacheMissEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn request_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Write every entry plus the counters to `path`
    pub async fn save_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let entries = self.entries();
        let report = CacheMissReport {
            total_requests: self.request_count(),
            cache_misses: self.miss_count(),
            entries: &entries,
        };

        let data = serde_json::to_vec_pretty(&report)?;
        tokio::fs::write(path, data).await?;

        info!(
            path = %path.display(),
            requests = report.total_requests,
            misses = report.cache_misses,
            "Saved cache miss log"
        );
        Ok(())
    }
}

impl CacheMissObserver for CacheMissLog {
    fn record(&self, request: &ArchivedRequest, is_record_mode: bool, is_cache_miss: bool) {
        let entry = CacheMissEntry {
            timestamp: Utc::now().to_rfc3339(),
            method: request.method.clone(),
            url: request.to_string(),
            is_record_mode,
            is_cache_miss,
        };

        self.total.fetch_add(1, Ordering::Relaxed);
        if is_cache_miss {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(request = %request, "Cache miss");
        }

        // Lock scope covers the push only
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_hits_and_misses() {
        let log = CacheMissLog::new();
        let req = ArchivedRequest::get("a.com", "/", true);

        log.record(&req, false, false);
        log.record(&req, false, true);
        log.record(&req, true, false);

        assert_eq!(log.request_count(), 3);
        assert_eq!(log.miss_count(), 1);

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].url, "GET https://a.com/");
        assert!(entries[1].is_cache_miss);
        assert!(entries[2].is_record_mode);
    }

    #[tokio::test]
    async fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("misses.json");

        let log = CacheMissLog::new();
        log.record(&ArchivedRequest::get("a.com", "/missing", false), false, true);
        log.save_json(&path).await.unwrap();

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["cache_misses"], 1);
        assert_eq!(saved["entries"][0]["url"], "GET http://a.com/missing");
    }
}
