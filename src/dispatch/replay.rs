use std::sync::Arc;
use tracing::{info, warn};

use super::DispatchError;
use crate::archive::Archive;
use crate::cache_miss::CacheMissObserver;
use crate::inject::ScriptInjector;
use crate::record::{ArchivedRequest, ArchivedResponse};

/// Replay mode: serve from the archive, never from the network
pub struct ReplayDispatcher {
    archive: Arc<dyn Archive>,
    injector: ScriptInjector,
    observer: Option<Arc<dyn CacheMissObserver>>,
    use_closest_match: bool,
    diff_unknown_requests: bool,
}

impl ReplayDispatcher {
    pub fn new(
        archive: Arc<dyn Archive>,
        injector: ScriptInjector,
        observer: Option<Arc<dyn CacheMissObserver>>,
        use_closest_match: bool,
        diff_unknown_requests: bool,
    ) -> Self {
        Self {
            archive,
            injector,
            observer,
            use_closest_match,
            diff_unknown_requests,
        }
    }

    pub async fn dispatch(&self, request: &ArchivedRequest) -> Result<Arc<ArchivedResponse>, DispatchError> {
        let mut response = self.archive.get(request).await;

        if response.is_none() && self.use_closest_match {
            if let Some(closest) = self.archive.find_closest(request, true).await {
                response = self.archive.get(&closest).await;
                if response.is_some() {
                    info!(
                        request = %request,
                        closest = %closest,
                        "Request not found in archive, using closest match"
                    );
                }
            }
        }

        if let Some(observer) = &self.observer {
            observer.record(request, false, response.is_none());
        }

        match response {
            Some(response) => Ok(self.injector.inject(&response)),
            None => {
                let mut reason = request.to_string();
                if self.diff_unknown_requests {
                    if let Some(diff) = self.archive.diff(request).await {
                        reason.push_str(&format!(
                            "\nNearest request diff ('-' for archived request, '+' for current request):\n{}",
                            diff
                        ));
                    }
                }
                warn!(reason = %reason, "Could not replay");
                Err(DispatchError::Miss { reason })
            }
        }
    }
}
