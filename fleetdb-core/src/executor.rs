//! Single-statement execution

use std::time::Instant;

use tracing::{error, info};

use crate::access::DataAccess;
use crate::error::{DataError, DataResult};
use crate::types::{replicating, statement_preview, AffectedRoles, InstanceId, Param, QueryResult};

pub(crate) fn operation_kind(is_read: bool) -> &'static str {
    if is_read {
        "read"
    } else {
        "write"
    }
}

impl DataAccess {
    /// Runs one statement on `origin`.
    ///
    /// A write with non-empty `affected_roles` is replicated to every instance
    /// the topology returns for those roles. Replication is dispatched after
    /// the origin write succeeds and is not awaited; its failures never reach
    /// the caller.
    pub async fn execute(
        &self,
        origin: &InstanceId,
        statement: &str,
        params: &[Param],
        affected_roles: Option<&AffectedRoles>,
    ) -> DataResult<QueryResult> {
        let is_read = self.classifier.is_read(statement);
        let pool = self.origin_pool(origin)?;

        let outcome = async {
            let mut session = pool.acquire().await?;
            let start = Instant::now();
            let result = session.query(statement, params).await?;
            Ok::<_, DataError>((result, start.elapsed()))
        }
        .await;

        let (result, elapsed) = outcome.inspect_err(|err| {
            error!(instance = %origin, error = %err, "error executing statement");
        })?;

        info!(
            instance = %origin,
            operation = operation_kind(is_read),
            statement = %statement_preview(statement),
            duration_ms = elapsed.as_millis() as u64,
            rows = result.row_count(),
            "statement executed"
        );

        if !is_read {
            if let Some(roles) = replicating(affected_roles) {
                let targets = self.topology.targets(roles, origin);
                if !targets.is_empty() {
                    self.dispatcher.dispatch(statement, params, &targets);
                }
            }
        }

        Ok(result)
    }
}
