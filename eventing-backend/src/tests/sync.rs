use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use eventing_core::SubscriptionSubjectIdentifier;
use tokio_util::sync::CancellationToken;

use crate::backend::table::{Subscriber, SubscriberSettings, SubscriptionTable};
use crate::backend::worker::DispatchWorker;
use crate::connection::ConnectionMonitor;
use crate::error::BackendError;
use crate::nats::client::types::ConnectionEvent;
use crate::sync::{Desired, Operation, SubscriberDriver, SyncPlan, apply};

fn desired(subject: &str) -> Desired {
    Desired {
        id: SubscriptionSubjectIdentifier::new("default", "orders", subject),
        settings: SubscriberSettings {
            subject: subject.to_string(),
            max_in_flight: 10,
            ack_wait: Duration::from_secs(30),
        },
    }
}

fn connected() -> ConnectionMonitor {
    let monitor = ConnectionMonitor::new();
    monitor.mark_connected();
    monitor
}

enum Behaviour {
    Succeed,
    FailOn(String),
    CancelAfter(usize, CancellationToken),
    ReconnectDuringCreate(ConnectionMonitor),
    Missing,
}

struct StubDriver {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl StubDriver {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
        }
    }

    fn call(&self, id: &SubscriptionSubjectIdentifier) -> Result<(), BackendError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behaviour {
            Behaviour::FailOn(subject) if id.subject() == subject => {
                Err(BackendError::Transport(anyhow::anyhow!("broker rejected {subject}")))
            }
            Behaviour::CancelAfter(count, cancel) if calls >= *count => {
                cancel.cancel();
                Ok(())
            }
            Behaviour::ReconnectDuringCreate(monitor) => {
                monitor.observe(&ConnectionEvent::Disconnected);
                monitor.observe(&ConnectionEvent::Connected);
                Ok(())
            }
            Behaviour::Missing => Err(BackendError::NotFound {
                what: id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn subscriber(desired: &Desired) -> Subscriber {
        Subscriber {
            settings: desired.settings.clone(),
            generation: 0,
            stale: false,
            worker: Arc::new(DispatchWorker::idle()),
        }
    }
}

#[async_trait]
impl SubscriberDriver for StubDriver {
    async fn create(&self, desired: &Desired) -> Result<Subscriber, BackendError> {
        self.call(&desired.id)?;
        Ok(Self::subscriber(desired))
    }

    async fn update(
        &self,
        desired: &Desired,
        _current: &Subscriber,
    ) -> Result<Subscriber, BackendError> {
        self.call(&desired.id)?;
        Ok(Self::subscriber(desired))
    }

    async fn remove(&self, id: &SubscriptionSubjectIdentifier) -> Result<(), BackendError> {
        self.call(id)
    }
}

fn creates(subjects: &[&str]) -> SyncPlan {
    SyncPlan {
        operations: subjects
            .iter()
            .map(|subject| Operation::Create(desired(subject)))
            .collect(),
    }
}

#[tokio::test]
async fn test_failures_are_aggregated_without_rollback() -> Result<()> {
    let table = SubscriptionTable::new();
    let driver = StubDriver::new(Behaviour::FailOn("kyma.b".into()));

    let result = apply(
        creates(&["kyma.a", "kyma.b", "kyma.c"]),
        &driver,
        &table,
        &connected(),
        &CancellationToken::new(),
    )
    .await;

    let error = match result {
        Err(BackendError::PartialSync(error)) => error,
        other => bail!("partial sync error expected, got {other:?}"),
    };
    assert_eq!(error.succeeded, 2);
    assert_eq!(error.failures.len(), 1);
    assert_eq!(error.failures[0].operation, "create");
    assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    assert!(table.contains(&desired("kyma.a").id));
    assert!(table.contains(&desired("kyma.c").id));
    assert!(!table.contains(&desired("kyma.b").id));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_stops_between_operations() -> Result<()> {
    let table = SubscriptionTable::new();
    let cancel = CancellationToken::new();
    let driver = StubDriver::new(Behaviour::CancelAfter(2, cancel.clone()));

    let result = apply(
        creates(&["kyma.a", "kyma.b", "kyma.c", "kyma.d"]),
        &driver,
        &table,
        &connected(),
        &cancel,
    )
    .await;

    assert!(matches!(result, Err(BackendError::Cancelled { applied: 2 })));
    assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(table.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_results_of_a_replaced_connection_are_discarded() -> Result<()> {
    let table = SubscriptionTable::new();
    let monitor = connected();
    let driver = StubDriver::new(Behaviour::ReconnectDuringCreate(monitor.clone()));

    let result = apply(
        creates(&["kyma.a"]),
        &driver,
        &table,
        &monitor,
        &CancellationToken::new(),
    )
    .await;

    let error = match result {
        Err(BackendError::PartialSync(error)) => error,
        other => bail!("partial sync error expected, got {other:?}"),
    };
    assert!(matches!(error.failures[0].error, BackendError::Unavailable { .. }));
    assert_eq!(error.succeeded, 0);
    assert!(error.to_string().starts_with("1 of 1 operations failed"));
    assert!(table.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_deleting_missing_subscribers_succeeds() -> Result<()> {
    let table = SubscriptionTable::new();
    let gone = desired("kyma.a");
    table.insert(gone.id.clone(), StubDriver::subscriber(&gone));
    let driver = StubDriver::new(Behaviour::Missing);

    let report = apply(
        SyncPlan {
            operations: vec![Operation::Delete(gone.id.clone())],
        },
        &driver,
        &table,
        &connected(),
        &CancellationToken::new(),
    )
    .await?;

    assert_eq!(report.deleted, 1);
    assert!(table.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_disconnected_sync_fails_fast() -> Result<()> {
    let table = SubscriptionTable::new();
    let driver = StubDriver::new(Behaviour::Succeed);

    let result = apply(
        creates(&["kyma.a"]),
        &driver,
        &table,
        &ConnectionMonitor::new(),
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(BackendError::Unavailable { .. })));
    assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    Ok(())
}
