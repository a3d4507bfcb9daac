//! The per-invocation context threaded through every component.

use std::fmt;

use crate::config::{ConfigError, Credentials, FerryConfig};
use crate::migration::{GitMirror, RepositoryMirror, StateStore};
use crate::reconcile::Reconciler;
use crate::transport::TransportClient;

/// Configuration, credentials and the collaborators built from them.
///
/// One session is created per process invocation; nothing in the crate
/// reads configuration from anywhere else.
pub struct Session {
    config: FerryConfig,
    credentials: Credentials,
    client: TransportClient,
    store: StateStore,
    mirror: Box<dyn RepositoryMirror>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("store", &self.store)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Builds the production session: reqwest/curl transports, the
    /// configured state directory and the git mirror.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: FerryConfig, credentials: Credentials) -> Result<Self, ConfigError> {
        let client = TransportClient::new(&config, &credentials)?;
        Ok(Self::with_parts(
            config,
            credentials,
            client,
            Box::new(GitMirror::new()),
        ))
    }

    /// Builds a session around explicit collaborators.
    #[must_use]
    pub fn with_parts(
        config: FerryConfig,
        credentials: Credentials,
        client: TransportClient,
        mirror: Box<dyn RepositoryMirror>,
    ) -> Self {
        let store = StateStore::new(config.state.dir.clone());
        Self {
            config,
            credentials,
            client,
            store,
            mirror,
        }
    }

    /// Replaces the state store.
    #[must_use]
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &FerryConfig {
        &self.config
    }

    /// Credentials for both platforms.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The transport client.
    #[must_use]
    pub const fn client(&self) -> &TransportClient {
        &self.client
    }

    /// The state store.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// The repository mirror.
    #[must_use]
    pub fn mirror(&self) -> &dyn RepositoryMirror {
        self.mirror.as_ref()
    }

    /// A reconciler over this session's client.
    #[must_use]
    pub const fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.client)
    }
}
