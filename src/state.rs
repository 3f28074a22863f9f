use std::sync::Arc;

use crate::config::Config;
use crate::procedures::ProcedureRegistry;
use crate::retry::RetryEngine;
use crate::store::OperationStore;
use crate::tracker::OperationTracker;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub store: Arc<dyn OperationStore>,
    pub config: Config,
    pub procedures: ProcedureRegistry,
    pub tracker: OperationTracker,
    pub engine: RetryEngine,
}

impl AppState {
    pub fn new(
        store: Arc<dyn OperationStore>,
        config: Config,
        procedures: ProcedureRegistry,
    ) -> SharedState {
        let tracker = OperationTracker::new(store.clone(), config.retry.clone());
        let engine = RetryEngine::new(store.clone(), config.retry.clone());
        Arc::new(AppState {
            store,
            config,
            procedures,
            tracker,
            engine,
        })
    }
}
