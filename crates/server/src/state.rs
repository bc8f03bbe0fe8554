use std::sync::Arc;

use fetchcast_core::{AppContext, Config, JobRegistry};

/// Shared application state
pub struct AppState {
    context: Arc<AppContext>,
}

impl AppState {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn config(&self) -> &Config {
        self.context.config()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.context.registry()
    }
}
