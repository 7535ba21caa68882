//! Shared server state
//!
//! One `ServerState` is built per server by
//! [`ServerBuilder`](crate::server::ServerBuilder) and handed to every
//! connection and work item through a
//! [`ServerHandle`](crate::server::ServerHandle). Nothing here is global.

use std::sync::Arc;

use crate::codec::Codec;
use crate::config::{AuthMode, Config};
use crate::dispatch::Dispatcher;
use crate::group::GroupManager;
use crate::hooks::{Authenticator, ServerHooks};
use crate::hub::ClientHub;

/// Everything a connection needs to run
pub struct ServerState {
    pub(crate) config: Arc<Config>,
    pub(crate) hub: ClientHub,
    pub(crate) groups: GroupManager,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) hooks: Arc<dyn ServerHooks>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
}

impl ServerState {
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn hub(&self) -> &ClientHub {
        &self.hub
    }

    #[must_use]
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    #[must_use]
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    #[must_use]
    pub fn dispatcher(&self) -> &dyn Dispatcher {
        self.dispatcher.as_ref()
    }

    #[must_use]
    pub fn hooks(&self) -> &dyn ServerHooks {
        self.hooks.as_ref()
    }

    #[must_use]
    pub fn authenticator(&self) -> Option<&dyn Authenticator> {
        self.authenticator.as_deref()
    }

    /// Whether connections must authenticate before their messages count
    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.config.server.auth == AuthMode::Enabled
    }
}
