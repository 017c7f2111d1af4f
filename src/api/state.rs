use std::sync::Arc;

use crate::config::Config;
use crate::dedup::DuplicateDetector;
use crate::observability::Metrics;
use crate::progress::ProgressBroadcaster;
use crate::queue::ConversionQueue;
use crate::session::SessionTracker;
use crate::storage::StorageClient;
use crate::store::MediaStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MediaStore>,
    pub storage: Arc<StorageClient>,
    pub sessions: Arc<SessionTracker>,
    pub queue: ConversionQueue,
    pub broadcaster: ProgressBroadcaster,
    pub detector: Arc<DuplicateDetector>,
    pub metrics: Arc<Metrics>,
    pub http: reqwest::Client,
}
