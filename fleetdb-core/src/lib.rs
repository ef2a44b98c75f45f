pub mod access;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod postgres;
pub mod relay;
pub mod replication;
pub mod token;
pub mod transaction;
pub mod types;

pub use access::DataAccess;
pub use collaborators::{
    InstanceDirectory, KeywordClassifier, ReplicationTopology, RoleTopology, StatementClassifier,
    StaticDirectory,
};
pub use config::{FleetConfig, PoolConfig, RelayConfig};
pub use error::{DataError, DataResult};
pub use futures::future::BoxFuture;
pub use pool::{
    redact_url, InstancePool, PoolFactory, PoolRegistry, PoolSettings, Session, ShutdownReport,
};
pub use postgres::PgPoolFactory;
pub use relay::{DispatchTarget, GithubAppIssuer, Relay, RepositoryDispatchRelay};
pub use replication::{DeliveryReport, ReplicationDispatcher, ReplicationObserver, TracingObserver};
pub use token::{AppIdentity, CredentialIssuer, IssuedCredential, TokenCache};
pub use transaction::CapturingSession;
pub use types::{AffectedRoles, InstanceId, Param, PendingWrite, QueryResult, Role, Row};
