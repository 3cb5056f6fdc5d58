use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use eventing_config::configuration::Config;
use eventing_core::{EventTypeCleaner, Subscription, SubscriptionSubjectIdentifier};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

use super::table::{Subscriber, SubscriptionTable};
use super::worker::{DispatchContext, DispatchWorker};
use super::{Backend, BackendState, MarkStale};
use crate::connection::{ConnectionHandler, ConnectionState};
use crate::dispatcher::EventDispatcher;
use crate::error::BackendError;
use crate::nats::client::types::{NatsClient, NatsConnector};
use crate::sync::{Desired, SubscriberDriver, SyncReport, bounded};

/// Backend on top of core NATS.
///
/// Subjects are used as they are and every identifier is a queue subscription whose
/// group is the namespaced subject name, so replicas of this process share the load.
/// Nothing outlives the connection: dropping a subscriber unsubscribes and there is
/// no redelivery.
pub struct NatsCore<N: NatsConnector> {
    inner: Arc<NatsCoreInner<N>>,
}

struct NatsCoreInner<N: NatsConnector> {
    connector: N,
    config: Config,
    client: OnceLock<N::Client>,
    state: BackendState,
    dispatch: DispatchContext,
    connection_task: Mutex<Option<AbortOnDropHandle<()>>>,
}

impl<N: NatsConnector> NatsCore<N> {
    /// Creates a backend which connects only on [`Backend::initialize`], see
    /// [`JetStream::new`](super::jetstream::JetStream::new) for the arguments.
    pub fn new(connector: N, config: Config, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        let state = BackendState::new(
            EventTypeCleaner::new(config.event_type_prefix.clone()),
            config.default_subscription.clone(),
            None,
        );
        let dispatch = DispatchContext {
            sinks: state.sinks.clone(),
            dispatcher,
            nak_delay: None,
        };
        Self {
            inner: Arc::new(NatsCoreInner {
                connector,
                config,
                client: OnceLock::new(),
                state,
                dispatch,
                connection_task: Mutex::new(None),
            }),
        }
    }
}

impl<N: NatsConnector> NatsCoreInner<N> {
    fn client(&self) -> Result<&N::Client, BackendError> {
        self.client
            .get()
            .ok_or_else(|| BackendError::unavailable("backend is not initialized"))
    }
}

#[async_trait]
impl<N: NatsConnector> SubscriberDriver for NatsCoreInner<N> {
    async fn create(&self, desired: &Desired) -> Result<Subscriber, BackendError> {
        let client = self.client()?;
        let queue_group = desired.id.namespaced_subject_name();
        let messages = bounded(
            self.config.nats.request_timeout(),
            client.queue_subscribe(&desired.settings.subject, &queue_group),
        )
        .await?;
        info!(subject = %desired.settings.subject, %queue_group, "subscribed");

        let worker = DispatchWorker::spawn(
            &desired.id,
            messages,
            self.dispatch.clone(),
            desired.settings.max_in_flight,
        );
        Ok(Subscriber {
            settings: desired.settings.clone(),
            generation: 0,
            stale: false,
            worker: Arc::new(worker),
        })
    }

    async fn update(
        &self,
        desired: &Desired,
        current: &Subscriber,
    ) -> Result<Subscriber, BackendError> {
        // Only the dispatch concurrency lives on this side, core NATS has no ack wait.
        current
            .worker
            .set_max_in_flight(desired.settings.max_in_flight);
        Ok(Subscriber {
            settings: desired.settings.clone(),
            ..current.clone()
        })
    }

    async fn remove(&self, id: &SubscriptionSubjectIdentifier) -> Result<(), BackendError> {
        // The subscription ends when the table drops the worker.
        if self.state.table.contains(id) {
            info!(%id, "unsubscribing");
            Ok(())
        } else {
            Err(BackendError::NotFound {
                what: format!("subscription {id}"),
            })
        }
    }
}

#[async_trait]
impl<N: NatsConnector> Backend for NatsCore<N> {
    async fn initialize(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), BackendError> {
        let inner = &self.inner;
        if inner.client.get().is_some() {
            warn!("nats backend is already initialized");
            return Ok(());
        }
        let client = inner
            .connector
            .connect(&inner.config.nats)
            .await
            .map_err(|err| BackendError::unavailable(format!("{err:#}")))?;
        let events = client.connection_events();
        if inner.client.set(client).is_err() {
            warn!("nats backend was initialized concurrently");
            return Ok(());
        }
        inner.state.monitor.mark_connected();

        let stale = MarkStale {
            table: inner.state.table.clone(),
            downstream: handler,
        };
        let task = inner.state.monitor.spawn(events, Arc::new(stale));
        if let Ok(mut connection_task) = inner.connection_task.lock() {
            *connection_task = Some(task);
        }
        info!(endpoint = %inner.config.nats.endpoint, "nats backend initialized");
        Ok(())
    }

    async fn sync_subscription(
        &self,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, BackendError> {
        self.inner.client()?;
        self.inner
            .state
            .sync_with(subscription, self.inner.as_ref(), cancel)
            .await
    }

    async fn delete_subscription(&self, subscription: &Subscription) -> Result<(), BackendError> {
        self.inner.client()?;
        self.inner
            .state
            .delete_with(subscription, self.inner.as_ref())
            .await
    }

    fn backend_subjects(&self, logical_subjects: &[String]) -> Vec<String> {
        self.inner.state.backend_subjects(logical_subjects)
    }

    async fn delete_orphans(&self, subscriptions: &[Subscription]) -> Result<usize, BackendError> {
        self.inner
            .state
            .delete_orphans_with(subscriptions, self.inner.as_ref())
            .await
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state.monitor.state()
    }

    fn table(&self) -> &SubscriptionTable {
        &self.inner.state.table
    }
}
