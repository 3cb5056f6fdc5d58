use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use eventing_core::Subscription;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::connection::ConnectionHandler;
use crate::error::BackendError;

/// Lists every subscription currently declared.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn subscriptions(&self) -> Result<Vec<Subscription>>;
}

/// Subscriptions declared in the configuration file.
#[derive(Clone, Debug, Default)]
pub struct StaticSubscriptions(pub Vec<Subscription>);

#[async_trait]
impl SubscriptionSource for StaticSubscriptions {
    async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.0.clone())
    }
}

/// Outcome of one full resync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub synced: usize,
    pub failed: usize,
    pub orphans_deleted: usize,
}

/// Schedules full resyncs after a reconnect.
///
/// Requests go through a channel with room for a single pending request. Requests
/// arriving while one is already pending are merged into it, so a flapping connection
/// leads to one resync per quiet period instead of one per event.
#[derive(Clone)]
pub struct ResyncTrigger {
    requests_tx: loole::Sender<()>,
    requests_rx: loole::Receiver<()>,
    completed: Arc<AtomicUsize>,
}

impl Default for ResyncTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResyncTrigger {
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = loole::bounded(1);
        Self {
            requests_tx,
            requests_rx,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns false if the request was merged into a pending one.
    pub fn request(&self) -> bool {
        match self.requests_tx.try_send(()) {
            Ok(()) => true,
            Err(_) => {
                debug!("resync already pending");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.requests_rx.len()
    }

    /// Number of full resyncs run by [`ResyncTrigger::run`].
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Syncs every subscription of the source and deletes subscribers of the ones
    /// which disappeared.
    ///
    /// Failures of single subscriptions are logged and counted, the controller retries
    /// them with its own backoff.
    pub async fn resync_all(
        backend: &dyn Backend,
        source: &dyn SubscriptionSource,
        cancel: &CancellationToken,
    ) -> Result<ResyncSummary, BackendError> {
        let subscriptions = source
            .subscriptions()
            .await
            .map_err(BackendError::Transport)?;
        let mut summary = ResyncSummary::default();

        for subscription in &subscriptions {
            match backend.sync_subscription(subscription, cancel).await {
                Ok(report) => {
                    debug!(subscription = %subscription.key_prefix(), ?report, "synced");
                    summary.synced += 1;
                }
                Err(err @ BackendError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(subscription = %subscription.key_prefix(), "sync failed: {err}");
                    summary.failed += 1;
                }
            }
        }

        summary.orphans_deleted = backend.delete_orphans(&subscriptions).await?;
        info!(
            synced = summary.synced,
            failed = summary.failed,
            orphans_deleted = summary.orphans_deleted,
            "full resync finished"
        );
        Ok(summary)
    }

    /// Runs a full resync for every request until cancelled.
    pub async fn run(
        &self,
        backend: Arc<dyn Backend>,
        source: Arc<dyn SubscriptionSource>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.requests_rx.recv_async() => {
                    if request.is_err() {
                        break;
                    }
                }
            }

            match Self::resync_all(backend.as_ref(), source.as_ref(), &cancel).await {
                Ok(_) => {}
                Err(BackendError::Cancelled { .. }) => break,
                Err(err) => error!("full resync failed: {err}"),
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        debug!("resync trigger stopped");
    }
}

#[async_trait]
impl ConnectionHandler for ResyncTrigger {
    async fn on_connection_lost(&self) {
        info!("waiting for the broker connection to come back");
    }

    async fn on_connection_restored(&self) {
        if self.request() {
            info!("full resync requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResyncTrigger;

    #[test]
    fn requests_are_coalesced() {
        let trigger = ResyncTrigger::new();
        assert!(trigger.request());
        assert!(!trigger.request());
        assert!(!trigger.clone().request());
        assert_eq!(trigger.pending(), 1);
    }
}
