//! Connection pool registry
//!
//! One pool per distinct connection URL, created on first use and kept for the
//! life of the process. [`PoolRegistry::close_all`] seals the registry: once it
//! has run, no pool is handed out again.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{error, info};

use crate::error::{DataError, DataResult};
use crate::types::{Param, QueryResult};

/// Default maximum connections per instance pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 3;
/// Default idle time before a pooled connection is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default wait for a free connection before acquisition fails
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Fixed configuration applied to every pool the registry creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub require_tls: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            require_tls: true,
        }
    }
}

/// A connection checked out of a pool.
///
/// Dropping the session returns the connection to its pool.
#[async_trait]
pub trait Session: Send {
    async fn query(&mut self, statement: &str, params: &[Param]) -> DataResult<QueryResult>;
}

/// A bounded pool of connections to one database
#[async_trait]
pub trait InstancePool: Send + Sync {
    /// Waits up to the connect timeout for a free connection
    async fn acquire(&self) -> DataResult<Box<dyn Session>>;

    /// Drains and closes every connection
    async fn close(&self) -> DataResult<()>;
}

/// Builds pools for connection URLs
pub trait PoolFactory: Send + Sync {
    fn create(&self, url: &str, settings: &PoolSettings) -> DataResult<Arc<dyn InstancePool>>;
}

/// Outcome of [`PoolRegistry::close_all`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failures: Vec<DataError>,
}

#[derive(Default)]
struct RegistryState {
    pools: HashMap<String, Arc<dyn InstancePool>>,
    sealed: bool,
}

/// Owns every connection pool, keyed by connection URL
pub struct PoolRegistry {
    factory: Arc<dyn PoolFactory>,
    settings: PoolSettings,
    state: RwLock<RegistryState>,
}

impl PoolRegistry {
    pub fn new(factory: Arc<dyn PoolFactory>, settings: PoolSettings) -> Self {
        Self {
            factory,
            settings,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Returns the pool for `url`, creating it on first use.
    pub fn get_or_create(&self, url: &str) -> DataResult<Arc<dyn InstancePool>> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.sealed {
                return Err(DataError::ShutDown);
            }
            if let Some(pool) = state.pools.get(url) {
                return Ok(Arc::clone(pool));
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks
        if state.sealed {
            return Err(DataError::ShutDown);
        }
        if let Some(pool) = state.pools.get(url) {
            return Ok(Arc::clone(pool));
        }

        let pool = self.factory.create(url, &self.settings)?;
        info!(
            url = %redact_url(url),
            max_connections = self.settings.max_connections,
            "created connection pool"
        );
        state.pools.insert(url.to_owned(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Number of live pools
    pub fn pool_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pools
            .len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sealed
    }

    /// Closes every pool concurrently and empties the registry.
    ///
    /// Per-pool failures are logged and reported, never returned as an error.
    pub async fn close_all(&self) -> ShutdownReport {
        let pools: Vec<(String, Arc<dyn InstancePool>)> = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.sealed = true;
            state
                .pools
                .iter()
                .map(|(url, pool)| (url.clone(), Arc::clone(pool)))
                .collect()
        };

        let outcomes = join_all(pools.iter().map(|(url, pool)| async move {
            let redacted = redact_url(url);
            match pool.close().await {
                Ok(()) => {
                    info!(url = %redacted, "closed connection pool");
                    Ok(())
                }
                Err(DataError::PoolShutdown { reason, .. }) => {
                    Err(DataError::pool_shutdown(redacted, reason))
                }
                Err(err) => Err(DataError::pool_shutdown(redacted, err.to_string())),
            }
        }))
        .await;

        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pools
            .clear();

        let mut report = ShutdownReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.closed += 1,
                Err(err) => {
                    error!(error = %err, "error closing connection pool");
                    report.failures.push(err);
                }
            }
        }

        info!(
            closed = report.closed,
            failed = report.failures.len(),
            "all connection pools closed"
        );
        report
    }
}

/// Connection URL safe for logs: password removed.
///
/// Unparseable URLs are cut to their first 20 characters.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                // Only fails for cannot-be-a-base URLs, which carry no password
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => {
            let head: String = raw.chars().take(20).collect();
            format!("{head}...")
        }
    }
}
