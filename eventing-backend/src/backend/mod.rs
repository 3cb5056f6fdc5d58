pub mod jetstream;
pub mod nats_core;
pub mod table;
pub mod worker;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use eventing_config::configuration::DefaultSubscriptionConfig;
use eventing_core::{EventTypeCleaner, Subscription, SubscriptionSubjectIdentifier};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{ConnectionHandler, ConnectionMonitor, ConnectionState};
use crate::dispatcher::{SinkRegistry, SinkTarget};
use crate::error::BackendError;
use crate::sync::{self, Desired, Operation, SubscriberDriver, SyncPlan, SyncReport};
use table::{SubscriberSettings, SubscriptionTable};

/// Operations every eventing backend offers to the subscription controller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Connects to the broker. Failing to connect is returned, retrying is up to the
    /// caller.
    ///
    /// # Arguments
    ///
    /// * `handler` - Told once about every later connection loss and every restore.
    async fn initialize(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), BackendError>;

    /// Converges the broker resources of one subscription with its declared types.
    ///
    /// # Arguments
    ///
    /// * `subscription` - The subscription whose subscribers should exist.
    /// * `cancel` - Checked between broker operations, already applied ones stay applied.
    ///
    /// # Returns
    ///
    /// The operations applied. A [`BackendError::PartialSync`] lists the identifiers which
    /// could not be converged while the others were.
    async fn sync_subscription(
        &self,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, BackendError>;

    /// Removes everything derived from the subscription, succeeds if nothing exists.
    async fn delete_subscription(&self, subscription: &Subscription) -> Result<(), BackendError>;

    /// Broker subjects for logical subjects, without touching the broker.
    ///
    /// # Arguments
    ///
    /// * `logical_subjects` - `<source>.<event type>` subjects as derived from subscriptions.
    fn backend_subjects(&self, logical_subjects: &[String]) -> Vec<String>;

    /// Removes subscribers of subscriptions which are not in `subscriptions` anymore.
    ///
    /// # Returns
    ///
    /// The number of subscribers removed.
    async fn delete_orphans(&self, subscriptions: &[Subscription]) -> Result<usize, BackendError>;

    fn connection_state(&self) -> ConnectionState;

    fn table(&self) -> &SubscriptionTable;
}

/// State every backend instance owns, independent of the broker flavour.
#[derive(Clone)]
pub(crate) struct BackendState {
    pub table: SubscriptionTable,
    pub sinks: SinkRegistry,
    pub monitor: ConnectionMonitor,
    pub cleaner: EventTypeCleaner,
    pub defaults: DefaultSubscriptionConfig,
    /// Put in front of logical subjects by the backend, if any.
    pub subject_prefix: Option<String>,
}

impl BackendState {
    pub fn new(
        cleaner: EventTypeCleaner,
        defaults: DefaultSubscriptionConfig,
        subject_prefix: Option<String>,
    ) -> Self {
        Self {
            table: SubscriptionTable::new(),
            sinks: SinkRegistry::default(),
            monitor: ConnectionMonitor::new(),
            cleaner,
            defaults,
            subject_prefix,
        }
    }

    pub fn backend_subjects(&self, logical_subjects: &[String]) -> Vec<String> {
        match &self.subject_prefix {
            Some(prefix) => logical_subjects
                .iter()
                .map(|subject| format!("{prefix}.{subject}"))
                .collect(),
            None => logical_subjects.to_vec(),
        }
    }

    /// One desired subscriber per unique backend subject of the subscription.
    pub fn desired(&self, subscription: &Subscription) -> Result<Vec<Desired>, BackendError> {
        let logical = subscription.logical_subjects(&self.cleaner)?;
        let max_in_flight = subscription.max_in_flight(self.defaults.max_in_flight);
        let ack_wait = subscription.ack_wait(self.defaults.ack_wait());

        let mut seen = HashSet::new();
        Ok(self
            .backend_subjects(&logical)
            .into_iter()
            .filter(|subject| seen.insert(subject.clone()))
            .map(|subject| Desired {
                id: SubscriptionSubjectIdentifier::new(
                    subscription.namespace(),
                    subscription.name(),
                    &subject,
                ),
                settings: SubscriberSettings {
                    subject,
                    max_in_flight,
                    ack_wait,
                },
            })
            .collect())
    }

    pub async fn sync_with(
        &self,
        subscription: &Subscription,
        driver: &dyn SubscriberDriver,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, BackendError> {
        let desired = self.desired(subscription)?;
        self.sinks.set(
            subscription.key_prefix(),
            SinkTarget::new(subscription, self.subject_prefix.as_deref()),
        );

        let plan = sync::plan(
            subscription.namespace(),
            subscription.name(),
            desired,
            &self.table,
        );
        if plan.is_empty() {
            debug!(subscription = %subscription.key_prefix(), "nothing to synchronize");
            return Ok(SyncReport::default());
        }

        info!(
            subscription = %subscription.key_prefix(),
            operations = plan.len(),
            "synchronizing subscription"
        );
        sync::apply(plan, driver, &self.table, &self.monitor, cancel).await
    }

    /// Deletes what the table knows about the subscription and what its types would
    /// derive, the latter covers consumers created before a restart.
    pub async fn delete_with(
        &self,
        subscription: &Subscription,
        driver: &dyn SubscriberDriver,
    ) -> Result<(), BackendError> {
        let mut ids = self
            .table
            .keys_for(subscription.namespace(), subscription.name());
        match self.desired(subscription) {
            Ok(desired) => {
                for desired in desired {
                    if !ids.contains(&desired.id) {
                        ids.push(desired.id);
                    }
                }
            }
            Err(err) => debug!(
                subscription = %subscription.key_prefix(),
                "only deleting known subscribers: {err}"
            ),
        }

        let plan = SyncPlan {
            operations: ids.into_iter().map(Operation::Delete).collect(),
        };
        sync::apply(
            plan,
            driver,
            &self.table,
            &self.monitor,
            &CancellationToken::new(),
        )
        .await?;
        self.sinks.remove(&subscription.key_prefix());
        info!(subscription = %subscription.key_prefix(), "subscription deleted");
        Ok(())
    }

    pub async fn delete_orphans_with(
        &self,
        subscriptions: &[Subscription],
        driver: &dyn SubscriberDriver,
    ) -> Result<usize, BackendError> {
        let known: HashSet<String> = subscriptions.iter().map(Subscription::key_prefix).collect();
        let orphans: Vec<_> = self
            .table
            .keys()
            .into_iter()
            .filter(|id| !known.contains(&id.namespaced_name()))
            .collect();
        self.sinks.retain(|key| known.contains(key));
        if orphans.is_empty() {
            return Ok(0);
        }

        info!(count = orphans.len(), "deleting orphaned subscribers");
        let plan = SyncPlan {
            operations: orphans.into_iter().map(Operation::Delete).collect(),
        };
        let report = sync::apply(
            plan,
            driver,
            &self.table,
            &self.monitor,
            &CancellationToken::new(),
        )
        .await?;
        Ok(report.deleted)
    }
}

/// Marks every subscriber stale when the connection is lost, before the owner hears of
/// it. Nothing is deleted until a resync decides what is still wanted.
pub(crate) struct MarkStale {
    pub table: SubscriptionTable,
    pub downstream: Arc<dyn ConnectionHandler>,
}

#[async_trait]
impl ConnectionHandler for MarkStale {
    async fn on_connection_lost(&self) {
        let marked = self.table.mark_all_stale();
        info!(marked, "subscribers marked stale");
        self.downstream.on_connection_lost().await;
    }

    async fn on_connection_restored(&self) {
        self.downstream.on_connection_restored().await;
    }
}
