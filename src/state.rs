use crate::config::settings::AppConfig;
use crate::infrastructure::queue::TaskPublisher;
use crate::infrastructure::storage::StorageService;
use crate::modules::transcoding::repository::JobStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub jobs: Arc<dyn JobStore>,
    pub storage: StorageService,
    pub publisher: Arc<dyn TaskPublisher>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        jobs: Arc<dyn JobStore>,
        storage: StorageService,
        publisher: Arc<dyn TaskPublisher>,
    ) -> Self {
        Self {
            config,
            jobs,
            storage,
            publisher,
        }
    }
}
