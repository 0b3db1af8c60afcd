use std::sync::Arc;
use tracing::debug;

use super::DispatchError;
use crate::archive::Archive;
use crate::cache_miss::CacheMissObserver;
use crate::http_client::Fetch;
use crate::inject::ScriptInjector;
use crate::record::{ArchivedRequest, ArchivedResponse};

/// Record mode: fetch from the origin once per request identity and archive
/// the result
pub struct RecordDispatcher {
    archive: Arc<dyn Archive>,
    fetcher: Arc<dyn Fetch>,
    injector: ScriptInjector,
    observer: Option<Arc<dyn CacheMissObserver>>,
}

impl RecordDispatcher {
    pub fn new(
        archive: Arc<dyn Archive>,
        fetcher: Arc<dyn Fetch>,
        injector: ScriptInjector,
        observer: Option<Arc<dyn CacheMissObserver>>,
    ) -> Self {
        Self {
            archive,
            fetcher,
            injector,
            observer,
        }
    }

    pub async fn dispatch(&self, request: &ArchivedRequest) -> Result<Arc<ArchivedResponse>, DispatchError> {
        if let Some(observer) = &self.observer {
            observer.record(request, true, false);
        }

        let response = match self.archive.get(request).await {
            Some(existing) => {
                debug!(request = %request, "Repeated request");
                existing
            }
            None => {
                let fetched = self.fetcher.fetch(request).await?;
                self.archive.put(request.clone(), Arc::clone(&fetched)).await;
                fetched
            }
        };

        let response = self.injector.inject(&response);
        debug!(request = %request, status = response.status_code, "Recorded");
        Ok(response)
    }
}
