use crate::config::StreamConfig;
use crate::foundation::error::StreamResult;
use crate::observe::observer::{NullObserver, PipelineObserver};
use std::sync::Arc;

/// Everything a pipeline needs from its surroundings: configuration and the observer events go to.
///
/// Built once per process run and handed to every constructor. Cloning is cheap.
#[derive(Clone)]
pub struct SessionContext {
    config: Arc<StreamConfig>,
    observer: Arc<dyn PipelineObserver>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(config: StreamConfig, observer: Arc<dyn PipelineObserver>) -> StreamResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            observer,
        })
    }

    /// Context whose events go nowhere.
    pub fn headless(config: StreamConfig) -> StreamResult<Self> {
        Self::new(config, Arc::new(NullObserver))
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<dyn PipelineObserver> {
        &self.observer
    }
}
