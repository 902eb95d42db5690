//! Pool connector that opens MariaDB sessions.

use std::sync::Arc;

use marlin_core::{Endpoint, Result};
use marlin_pool::Connector;

use crate::config::SessionConfig;
use crate::session::Session;

/// Opens a [`Session`] to any endpoint with one shared configuration.
#[derive(Debug, Clone)]
pub struct MariaDbConnector {
    config: Arc<SessionConfig>,
}

impl MariaDbConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Connector for MariaDbConnector {
    type Session = Session;

    fn connect(&self, endpoint: &Endpoint) -> Result<Session> {
        Session::connect(endpoint, &self.config)
    }
}
