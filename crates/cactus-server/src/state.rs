//! Application state management

use cactus_core::{DeviceRegistry, Engine, Session, SessionConfig, Utility};
use std::sync::Arc;

/// Shared application state
pub struct AppState<E: Engine, R: DeviceRegistry> {
    pub session: Session<E>,
    pub utility: Utility<R>,
    pub config: Arc<SessionConfig>,
}

impl<E: Engine, R: DeviceRegistry> AppState<E, R> {
    pub fn new(session: Session<E>, utility: Utility<R>, config: SessionConfig) -> Self {
        Self {
            session,
            utility,
            config: Arc::new(config),
        }
    }
}

impl<E: Engine, R: DeviceRegistry> Clone for AppState<E, R> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            utility: self.utility.clone(),
            config: self.config.clone(),
        }
    }
}
