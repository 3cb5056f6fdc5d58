use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use eventing_core::SubscriptionSubjectIdentifier;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::table::{Subscriber, SubscriberSettings, SubscriptionTable};
use crate::connection::ConnectionMonitor;
use crate::error::{BackendError, PartialSyncError, SyncFailure};

/// A subscriber as it should exist after the sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Desired {
    pub id: SubscriptionSubjectIdentifier,
    pub settings: SubscriberSettings,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Delete(SubscriptionSubjectIdentifier),
    /// The entry survived a connection loss or its worker stopped, it is replaced
    /// from what the broker has now.
    Rebuild(Desired),
    Update(Desired),
    Create(Desired),
}

impl Operation {
    pub fn id(&self) -> &SubscriptionSubjectIdentifier {
        match self {
            Operation::Delete(id) => id,
            Operation::Rebuild(desired) | Operation::Update(desired) | Operation::Create(desired) => {
                &desired.id
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Delete(_) => "delete",
            Operation::Rebuild(_) => "rebuild",
            Operation::Update(_) => "update",
            Operation::Create(_) => "create",
        }
    }
}

/// Ordered operations converging one subscription, deletions first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub operations: Vec<Operation>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// Compares the desired subscribers of `namespace/name` with the table.
///
/// Identifiers in the table but not desired are deleted, desired ones missing in the
/// table are created and the ones in both are updated if their settings diverge.
/// Deletions come before everything else so a subject is released before it is
/// subscribed again.
pub fn plan(
    namespace: &str,
    name: &str,
    desired: Vec<Desired>,
    table: &SubscriptionTable,
) -> SyncPlan {
    let mut deletes = vec![];
    let mut changes = vec![];
    let mut creates = vec![];

    for id in table.keys_for(namespace, name) {
        if !desired.iter().any(|desired| desired.id == id) {
            deletes.push(Operation::Delete(id));
        }
    }

    for desired in desired {
        match table.get(&desired.id) {
            None => creates.push(Operation::Create(desired)),
            Some(current) if current.stale || current.worker.is_finished() => {
                changes.push(Operation::Rebuild(desired))
            }
            Some(current) if current.settings != desired.settings => {
                changes.push(Operation::Update(desired))
            }
            Some(_) => debug!(id = %desired.id, "subscriber up to date"),
        }
    }

    let mut operations = deletes;
    operations.append(&mut changes);
    operations.append(&mut creates);
    SyncPlan { operations }
}

/// Broker side of a sync, implemented per backend.
///
/// Every method is one atomic step from the table's point of view: the table is only
/// changed after the method returned successfully.
#[async_trait]
pub trait SubscriberDriver: Send + Sync {
    /// Creates or adopts the broker resources for `desired` and starts consuming.
    async fn create(&self, desired: &Desired) -> Result<Subscriber, BackendError>;

    async fn update(
        &self,
        desired: &Desired,
        current: &Subscriber,
    ) -> Result<Subscriber, BackendError>;

    /// Removing something which does not exist returns `BackendError::NotFound`.
    async fn remove(&self, id: &SubscriptionSubjectIdentifier) -> Result<(), BackendError>;
}

/// Counts of applied operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub rebuilt: usize,
    pub deleted: usize,
}

impl SyncReport {
    pub fn applied(&self) -> usize {
        self.created + self.updated + self.rebuilt + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.applied() == 0
    }
}

/// Bounds a single broker call.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(BackendError::from),
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

/// Applies a plan best-effort.
///
/// A failing operation does not stop the pass and nothing is rolled back, the table
/// reflects exactly the operations which succeeded. Cancellation is checked before
/// each operation. Results obtained on a connection which was lost meanwhile are
/// discarded.
pub async fn apply<D>(
    plan: SyncPlan,
    driver: &D,
    table: &SubscriptionTable,
    monitor: &ConnectionMonitor,
    cancel: &CancellationToken,
) -> Result<SyncReport, BackendError>
where
    D: SubscriberDriver + ?Sized,
{
    let mut report = SyncReport::default();
    if plan.is_empty() {
        return Ok(report);
    }
    if !monitor.is_connected() {
        return Err(BackendError::unavailable("not connected to the broker"));
    }

    let mut failures = vec![];
    for operation in plan.operations {
        if cancel.is_cancelled() {
            info!(applied = report.applied(), "synchronization cancelled");
            return Err(BackendError::Cancelled {
                applied: report.applied(),
            });
        }

        let id = operation.id().clone();
        let name = operation.name();
        match apply_operation(operation, driver, table, monitor, &mut report).await {
            Ok(()) => debug!(%id, operation = name, "applied"),
            Err(error) => {
                warn!(%id, operation = name, "failed: {error}");
                failures.push(SyncFailure {
                    id,
                    operation: name,
                    error,
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(PartialSyncError {
            failures,
            succeeded: report.applied(),
        }
        .into())
    }
}

async fn apply_operation<D>(
    operation: Operation,
    driver: &D,
    table: &SubscriptionTable,
    monitor: &ConnectionMonitor,
    report: &mut SyncReport,
) -> Result<(), BackendError>
where
    D: SubscriberDriver + ?Sized,
{
    if !monitor.is_connected() {
        return Err(BackendError::unavailable("connection lost during synchronization"));
    }
    let generation = monitor.generation();

    let (desired, subscriber, counter) = match operation {
        Operation::Delete(id) => {
            match driver.remove(&id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => debug!(%id, "already gone"),
                Err(err) => return Err(err),
            }
            table.remove(&id);
            report.deleted += 1;
            return Ok(());
        }
        Operation::Create(desired) => {
            let subscriber = driver.create(&desired).await?;
            (desired, subscriber, &mut report.created)
        }
        Operation::Rebuild(desired) => {
            // The old worker holds handles of the lost connection.
            table.remove(&desired.id);
            let subscriber = driver.create(&desired).await?;
            (desired, subscriber, &mut report.rebuilt)
        }
        Operation::Update(desired) => {
            let current = table
                .get(&desired.id)
                .ok_or_else(|| BackendError::NotFound {
                    what: format!("subscriber {}", desired.id),
                })?;
            let subscriber = driver.update(&desired, &current).await?;
            (desired, subscriber, &mut report.updated)
        }
    };

    if monitor.generation() != generation || !monitor.is_connected() {
        return Err(BackendError::unavailable(
            "connection replaced while the operation was in flight",
        ));
    }
    *counter += 1;
    table.insert(
        desired.id,
        Subscriber {
            generation,
            stale: false,
            ..subscriber
        },
    );
    Ok(())
}
