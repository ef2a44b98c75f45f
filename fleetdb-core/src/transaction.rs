//! Transactions with commit-gated replication
//!
//! Writes issued inside a unit of work are captured as [`PendingWrite`]s and
//! only replicated once `COMMIT` has succeeded. A rolled-back transaction
//! replicates nothing.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::access::DataAccess;
use crate::collaborators::StatementClassifier;
use crate::error::{DataError, DataResult};
use crate::pool::Session;
use crate::types::{replicating, AffectedRoles, InstanceId, Param, PendingWrite, QueryResult};

/// Session wrapper that records every successful write it forwards
pub struct CapturingSession<'a> {
    inner: &'a mut dyn Session,
    classifier: &'a dyn StatementClassifier,
    captured: Vec<PendingWrite>,
    poisoned: bool,
}

impl<'a> CapturingSession<'a> {
    pub fn new(inner: &'a mut dyn Session, classifier: &'a dyn StatementClassifier) -> Self {
        Self {
            inner,
            classifier,
            captured: Vec::new(),
            poisoned: false,
        }
    }

    /// Whether any statement failed, even if the unit of work carried on.
    ///
    /// Postgres answers `COMMIT` on an aborted transaction without an error,
    /// so nothing captured before the failure was applied.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Captured writes in issuance order
    pub fn into_captured(self) -> Vec<PendingWrite> {
        self.captured
    }
}

#[async_trait]
impl Session for CapturingSession<'_> {
    async fn query(&mut self, statement: &str, params: &[Param]) -> DataResult<QueryResult> {
        let result = self
            .inner
            .query(statement, params)
            .await
            .inspect_err(|_| self.poisoned = true)?;
        if !self.classifier.is_read(statement) {
            self.captured.push(PendingWrite::new(statement, params));
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Began,
    Committed,
    RolledBack,
    Released,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Began => "began",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
            TxState::Released => "released",
        };
        f.write_str(name)
    }
}

fn transition(origin: &InstanceId, state: TxState) {
    debug!(instance = %origin, state = %state, "transaction state");
}

impl DataAccess {
    /// Runs `work` inside one transaction on `origin`.
    ///
    /// `work` receives the transaction's session; everything it issues runs
    /// on the same connection. On success the transaction commits and, when
    /// `affected_roles` is non-empty, every captured write is replicated in
    /// order to the targets resolved once for those roles. On failure the
    /// transaction rolls back and the original error is returned.
    ///
    /// ```ignore
    /// let id = access
    ///     .run_transaction(&origin, Some(&roles), |tx| {
    ///         Box::pin(async move {
    ///             tx.query("UPDATE cursos SET activo = $1", &[false.into()]).await?;
    ///             tx.query("INSERT INTO bitacora (evento) VALUES ($1)", &["cierre".into()]).await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_transaction<T, F>(
        &self,
        origin: &InstanceId,
        affected_roles: Option<&AffectedRoles>,
        work: F,
    ) -> DataResult<T>
    where
        F: for<'s> FnOnce(&'s mut dyn Session) -> BoxFuture<'s, DataResult<T>>,
    {
        let pool = self.origin_pool(origin)?;
        let mut conn = pool.acquire().await.inspect_err(|err| {
            error!(instance = %origin, error = %err, "cannot start transaction");
        })?;

        if let Err(err) = conn.query("BEGIN", &[]).await {
            error!(instance = %origin, error = %err, "error opening transaction");
            drop(conn);
            transition(origin, TxState::Released);
            return Err(err);
        }
        transition(origin, TxState::Began);

        let roles = replicating(affected_roles);
        let outcome = async {
            let (value, captured) = match roles {
                Some(_) => {
                    let mut capturing = CapturingSession::new(conn.as_mut(), &*self.classifier);
                    let handle: &mut dyn Session = &mut capturing;
                    let value = work(handle).await?;
                    if capturing.is_poisoned() {
                        warn!(
                            instance = %origin,
                            "statement failed inside transaction; captured writes will not replicate"
                        );
                        (value, Vec::new())
                    } else {
                        (value, capturing.into_captured())
                    }
                }
                None => {
                    let handle: &mut dyn Session = conn.as_mut();
                    (work(handle).await?, Vec::new())
                }
            };
            conn.query("COMMIT", &[]).await?;
            Ok::<_, DataError>((value, captured))
        }
        .await;

        match outcome {
            Ok((value, captured)) => {
                transition(origin, TxState::Committed);
                drop(conn);
                transition(origin, TxState::Released);

                if let Some(roles) = roles {
                    if !captured.is_empty() {
                        let targets = self.topology.targets(roles, origin);
                        if !targets.is_empty() {
                            debug!(
                                instance = %origin,
                                writes = captured.len(),
                                targets = targets.len(),
                                "replicating committed transaction"
                            );
                            self.dispatcher.dispatch_batch(captured, &targets);
                        }
                    }
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.query("ROLLBACK", &[]).await {
                    error!(instance = %origin, error = %rollback_err, "error during rollback");
                }
                transition(origin, TxState::RolledBack);
                drop(conn);
                transition(origin, TxState::Released);

                error!(instance = %origin, error = %err, "error in transaction");
                Err(err)
            }
        }
    }
}
