pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::app_state::HubState;
use crate::store::AccountStore;

/// Shared context for the HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<HubState>,
    pub store: Arc<AccountStore>,
}
