//! The data-access handle
//!
//! One [`DataAccess`] is built at process start and shared by reference. It
//! owns the pool registry and the replication dispatcher (and through it the
//! token cache), so teardown order is explicit: [`DataAccess::shutdown`]
//! closes the pools, after which every call fails with `ShutDown`.

use std::sync::Arc;

use tracing::error;

use crate::collaborators::{
    InstanceDirectory, KeywordClassifier, ReplicationTopology, StatementClassifier,
};
use crate::config::FleetConfig;
use crate::error::{DataError, DataResult};
use crate::pool::{InstancePool, PoolRegistry, ShutdownReport};
use crate::postgres::PgPoolFactory;
use crate::relay::{GithubAppIssuer, RepositoryDispatchRelay};
use crate::replication::{ReplicationDispatcher, ReplicationObserver};
use crate::token::TokenCache;
use crate::types::InstanceId;

pub struct DataAccess {
    pub(crate) registry: PoolRegistry,
    pub(crate) directory: Arc<dyn InstanceDirectory>,
    pub(crate) classifier: Arc<dyn StatementClassifier>,
    pub(crate) topology: Arc<dyn ReplicationTopology>,
    pub(crate) dispatcher: ReplicationDispatcher,
}

impl DataAccess {
    /// Uses [`KeywordClassifier`] until [`with_classifier`](Self::with_classifier) replaces it
    pub fn new(
        registry: PoolRegistry,
        directory: Arc<dyn InstanceDirectory>,
        topology: Arc<dyn ReplicationTopology>,
        dispatcher: ReplicationDispatcher,
    ) -> Self {
        Self {
            registry,
            directory,
            classifier: Arc::new(KeywordClassifier),
            topology,
            dispatcher,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn StatementClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_replication_observer(mut self, observer: Arc<dyn ReplicationObserver>) -> Self {
        self.dispatcher = self.dispatcher.with_observer(observer);
        self
    }

    /// Production wiring: sqlx pools, config-driven routing, GitHub relay
    pub fn from_config(config: &FleetConfig) -> DataResult<Self> {
        let registry = PoolRegistry::new(Arc::new(PgPoolFactory), config.pool_settings());
        let issuer = GithubAppIssuer::new(config.relay.api_base.clone())?;
        let relay = RepositoryDispatchRelay::new(config.relay.api_base.clone(), config.dispatch_target())?;
        let tokens = TokenCache::new(Arc::new(issuer), config.app_identity()?);
        let dispatcher = ReplicationDispatcher::new(Arc::new(tokens), Arc::new(relay));

        Ok(Self::new(
            registry,
            Arc::new(config.directory()),
            Arc::new(config.topology()),
            dispatcher,
        ))
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Closes every pool. Later calls fail with [`DataError::ShutDown`].
    pub async fn shutdown(&self) -> ShutdownReport {
        self.registry.close_all().await
    }

    /// Connection pool of the instance a call is directed at
    pub(crate) fn origin_pool(&self, origin: &InstanceId) -> DataResult<Arc<dyn InstancePool>> {
        let url = self.directory.connection_url(origin).ok_or_else(|| {
            let err = DataError::configuration(format!(
                "no connection URL available for instance {origin}"
            ));
            error!(instance = %origin, error = %err, "cannot route statement");
            err
        })?;
        self.registry.get_or_create(&url)
    }
}
