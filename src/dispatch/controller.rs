use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

use super::{DispatchError, DispatchOptions, RecordDispatcher, ReplayDispatcher};
use crate::archive::Archive;
use crate::cache_miss::CacheMissObserver;
use crate::http_client::Fetch;
use crate::inject::ScriptInjector;
use crate::record::{ArchivedRequest, ArchivedResponse};

/// The dispatcher currently serving requests
#[derive(Clone)]
pub enum ActiveDispatcher {
    Record(Arc<RecordDispatcher>),
    Replay(Arc<ReplayDispatcher>),
}

impl ActiveDispatcher {
    pub async fn dispatch(&self, request: &ArchivedRequest) -> Result<Arc<ArchivedResponse>, DispatchError> {
        match self {
            ActiveDispatcher::Record(d) => d.dispatch(request).await,
            ActiveDispatcher::Replay(d) => d.dispatch(request).await,
        }
    }

    pub fn is_record_mode(&self) -> bool {
        matches!(self, ActiveDispatcher::Record(_))
    }
}

/// Holds one active dispatcher and swaps it atomically.
///
/// A dispatch takes a snapshot of the active dispatcher when it starts, so a
/// mode switch only affects requests that begin after it.
pub struct ModeController {
    active: ArcSwap<ActiveDispatcher>,
    record: Arc<RecordDispatcher>,
    replay: Arc<ReplayDispatcher>,
}

impl ModeController {
    pub fn new(
        options: DispatchOptions,
        archive: Arc<dyn Archive>,
        fetcher: Arc<dyn Fetch>,
        observer: Option<Arc<dyn CacheMissObserver>>,
    ) -> Self {
        let injector = ScriptInjector::new(options.inject_script);

        let record = Arc::new(RecordDispatcher::new(
            Arc::clone(&archive),
            fetcher,
            injector.clone(),
            observer.clone(),
        ));
        let replay = Arc::new(ReplayDispatcher::new(
            archive,
            injector,
            observer,
            options.use_closest_match,
            options.diff_unknown_requests,
        ));

        let active = if options.use_record_mode {
            ActiveDispatcher::Record(Arc::clone(&record))
        } else {
            ActiveDispatcher::Replay(Arc::clone(&replay))
        };

        Self {
            active: ArcSwap::from_pointee(active),
            record,
            replay,
        }
    }

    pub fn set_record_mode(&self) {
        self.active
            .store(Arc::new(ActiveDispatcher::Record(Arc::clone(&self.record))));
        info!("Switched to record mode");
    }

    pub fn set_replay_mode(&self) {
        self.active
            .store(Arc::new(ActiveDispatcher::Replay(Arc::clone(&self.replay))));
        info!("Switched to replay mode");
    }

    pub fn is_record_mode(&self) -> bool {
        self.active.load().is_record_mode()
    }

    pub async fn dispatch(&self, request: &ArchivedRequest) -> Result<Arc<ArchivedResponse>, DispatchError> {
        let active = self.active.load_full();
        active.dispatch(request).await
    }
}
