//! Application state

use crate::coordinator::CoordinatorHandle;

/// Shared application state
pub struct AppState {
    coordinator: CoordinatorHandle,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }
}
