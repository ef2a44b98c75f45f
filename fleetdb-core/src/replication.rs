//! Fire-and-forget replication of writes to other instances
//!
//! `dispatch*` detaches the fan-out onto the runtime and returns nothing: the
//! caller's write has already succeeded and must not wait on remote instances.
//! Outcomes are only visible through a [`ReplicationObserver`].
//!
//! Every (write, target) pair is one independent relay call. Writes bound for
//! the same target are sent one after another in the order given; different
//! targets progress concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::error::DataError;
use crate::relay::Relay;
use crate::token::TokenCache;
use crate::types::{statement_preview, InstanceId, Param, PendingWrite};

/// Sink for replication outcomes
pub trait ReplicationObserver: Send + Sync {
    fn delivered(&self, _target: &InstanceId, _write: &PendingWrite) {}

    fn failed(&self, target: &InstanceId, write: &PendingWrite, error: &DataError);

    fn completed(&self, _report: &DeliveryReport) {}
}

/// Logs every outcome through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ReplicationObserver for TracingObserver {
    fn delivered(&self, target: &InstanceId, write: &PendingWrite) {
        debug!(
            target_instance = %target,
            statement = %statement_preview(&write.statement),
            "replicated statement"
        );
    }

    fn failed(&self, target: &InstanceId, write: &PendingWrite, error: &DataError) {
        error!(
            target_instance = %target,
            statement = %statement_preview(&write.statement),
            error = %error,
            "error in asynchronous replication"
        );
    }

    fn completed(&self, report: &DeliveryReport) {
        if report.failed.is_empty() {
            info!(delivered = report.delivered, "replication finished");
        } else {
            warn!(
                delivered = report.delivered,
                failed = report.failed.len(),
                "replication finished with failures"
            );
        }
    }
}

/// Outcome of one fan-out
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: Vec<(InstanceId, DataError)>,
}

/// Sends writes to remote instances through the authenticated relay
#[derive(Clone)]
pub struct ReplicationDispatcher {
    tokens: Arc<TokenCache>,
    relay: Arc<dyn Relay>,
    observer: Arc<dyn ReplicationObserver>,
}

impl ReplicationDispatcher {
    pub fn new(tokens: Arc<TokenCache>, relay: Arc<dyn Relay>) -> Self {
        Self {
            tokens,
            relay,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReplicationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replicates one statement to every target without waiting
    pub fn dispatch(&self, statement: &str, params: &[Param], targets: &BTreeSet<InstanceId>) {
        self.dispatch_batch(vec![PendingWrite::new(statement, params)], targets);
    }

    /// Replicates `writes` in order to every target without waiting
    pub fn dispatch_batch(&self, writes: Vec<PendingWrite>, targets: &BTreeSet<InstanceId>) {
        if writes.is_empty() || targets.is_empty() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, writes = writes.len(), "no async runtime; replication dropped");
                return;
            }
        };

        let dispatcher = self.clone();
        let targets = targets.clone();
        debug!(writes = writes.len(), targets = targets.len(), "dispatching replication");
        handle.spawn(async move {
            dispatcher.deliver(&writes, &targets).await;
        });
    }

    /// Performs the fan-out and waits for every relay call.
    ///
    /// Failures are reported to the observer and in the returned report,
    /// never raised.
    pub async fn deliver(
        &self,
        writes: &[PendingWrite],
        targets: &BTreeSet<InstanceId>,
    ) -> DeliveryReport {
        let per_target = join_all(
            targets
                .iter()
                .map(|target| self.deliver_to_target(target, writes)),
        )
        .await;

        let mut report = DeliveryReport::default();
        for (delivered, failed) in per_target {
            report.delivered += delivered;
            report.failed.extend(failed);
        }
        self.observer.completed(&report);
        report
    }

    async fn deliver_to_target(
        &self,
        target: &InstanceId,
        writes: &[PendingWrite],
    ) -> (usize, Vec<(InstanceId, DataError)>) {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for write in writes {
            match self.relay_one(target, write).await {
                Ok(()) => {
                    delivered += 1;
                    self.observer.delivered(target, write);
                }
                Err(err) => {
                    self.observer.failed(target, write, &err);
                    failed.push((target.clone(), err));
                }
            }
        }

        (delivered, failed)
    }

    async fn relay_one(&self, target: &InstanceId, write: &PendingWrite) -> Result<(), DataError> {
        let outcome = async {
            let token = self.tokens.get_token().await?;
            self.relay
                .relay_statement(&token, &write.statement, &write.params, target)
                .await
        }
        .await;

        outcome.map_err(|err| match err {
                DataError::Replication { .. } => err,
                other => DataError::replication(target.clone(), other.to_string()),
            })
    }
}
