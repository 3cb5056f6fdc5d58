use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use eventing_config::configuration::Config;
use eventing_core::{EventTypeCleaner, Subscription, SubscriptionSubjectIdentifier};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::table::{Subscriber, SubscriptionTable};
use super::worker::{DispatchContext, DispatchWorker};
use super::{Backend, BackendState, MarkStale};
use crate::connection::{ConnectionHandler, ConnectionState};
use crate::dispatcher::EventDispatcher;
use crate::error::BackendError;
use crate::nats::client::types::{
    ConsumerChange, ConsumerSpec, DeleteOutcome, NatsClient, NatsConnector, StreamSpec,
    StreamStatus,
};
use crate::sync::{Desired, SubscriberDriver, SyncReport, bounded};

/// Backend on top of NATS JetStream.
///
/// All subscriptions consume from a single stream capturing `<subject_prefix>.>`. Every
/// identifier maps to a durable push consumer named after its digest, so consumers and
/// their delivery progress survive restarts and are adopted instead of recreated.
pub struct JetStream<N: NatsConnector> {
    inner: Arc<JetStreamInner<N>>,
}

struct JetStreamInner<N: NatsConnector> {
    connector: N,
    config: Config,
    client: OnceLock<N::Client>,
    state: BackendState,
    dispatch: DispatchContext,
    connection_task: Mutex<Option<AbortOnDropHandle<()>>>,
}

impl<N: NatsConnector> JetStream<N> {
    /// Creates a backend which connects only on [`Backend::initialize`].
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens the broker connection, the fake server in tests.
    /// * `config` - Connection, stream and default delivery settings.
    /// * `dispatcher` - Delivers received events to subscription sinks.
    pub fn new(connector: N, config: Config, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        let state = BackendState::new(
            EventTypeCleaner::new(config.event_type_prefix.clone()),
            config.default_subscription.clone(),
            Some(config.jetstream.subject_prefix.clone()),
        );
        let dispatch = DispatchContext {
            sinks: state.sinks.clone(),
            dispatcher,
            nak_delay: Some(config.default_subscription.nak_delay()),
        };
        Self {
            inner: Arc::new(JetStreamInner {
                connector,
                config,
                client: OnceLock::new(),
                state,
                dispatch,
                connection_task: Mutex::new(None),
            }),
        }
    }

    /// Deletes consumers on the stream which no subscription derives and no client is
    /// bound to, typically left behind by subscriptions deleted while this process was
    /// not running.
    ///
    /// # Arguments
    ///
    /// * `subscriptions` - Every subscription currently known to the controller.
    ///
    /// # Returns
    ///
    /// The number of consumers deleted.
    pub async fn delete_invalid_consumers(
        &self,
        subscriptions: &[Subscription],
    ) -> Result<usize, BackendError> {
        let inner = &self.inner;
        let client = inner.client()?;
        let stream = &inner.config.jetstream.stream_name;
        let timeout = inner.config.nats.request_timeout();

        let mut valid = HashSet::new();
        for subscription in subscriptions {
            match inner.state.desired(subscription) {
                Ok(desired) => valid.extend(
                    desired
                        .into_iter()
                        .map(|desired| desired.id.consumer_name().to_string()),
                ),
                Err(err) => warn!(
                    subscription = %subscription.key_prefix(),
                    "subscription ignored while looking for invalid consumers: {err}"
                ),
            }
        }

        let mut deleted = 0;
        let mut last_error = None;
        for consumer in bounded(timeout, client.consumers(stream)).await? {
            if consumer.push_bound || valid.contains(&consumer.name) {
                continue;
            }
            match bounded(timeout, client.delete_consumer(stream, &consumer.name)).await {
                Ok(DeleteOutcome::Deleted) => {
                    info!(consumer = %consumer.name, "invalid consumer deleted");
                    deleted += 1;
                }
                Ok(DeleteOutcome::NotFound) => {}
                Err(err) => {
                    warn!(consumer = %consumer.name, "deleting invalid consumer failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(deleted),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.inner.config.jetstream.stream_name
    }
}

impl<N: NatsConnector> JetStreamInner<N> {
    fn client(&self) -> Result<&N::Client, BackendError> {
        self.client
            .get()
            .ok_or_else(|| BackendError::unavailable("backend is not initialized"))
    }

    fn request_timeout(&self) -> Duration {
        self.config.nats.request_timeout()
    }

    fn stream_spec(&self) -> StreamSpec {
        let jetstream = &self.config.jetstream;
        StreamSpec {
            name: jetstream.stream_name.clone(),
            subjects: vec![format!("{}.>", jetstream.subject_prefix)],
            storage: jetstream.storage_type,
            replicas: jetstream.replicas,
            retention: jetstream.retention_policy,
            discard: jetstream.discard_policy,
            max_messages: jetstream.max_messages,
            max_bytes: jetstream.max_bytes,
            max_messages_per_subject: jetstream.max_messages_per_subject,
        }
    }

    fn consumer_spec(&self, desired: &Desired) -> ConsumerSpec {
        let defaults = &self.config.default_subscription;
        ConsumerSpec {
            durable_name: desired.id.consumer_name().to_string(),
            description: desired.id.namespaced_subject_name(),
            filter_subject: desired.settings.subject.clone(),
            deliver_policy: self.config.jetstream.consumer_deliver_policy,
            max_ack_pending: i64::from(desired.settings.max_in_flight),
            ack_wait: desired.settings.ack_wait,
            max_deliver: defaults.max_deliver,
            idle_heartbeat: defaults.idle_heartbeat(),
            flow_control: true,
        }
    }

    async fn ensure_stream(&self, client: &N::Client) -> Result<(), BackendError> {
        let spec = self.stream_spec();
        let status = bounded(self.request_timeout(), client.ensure_stream(&spec)).await?;
        match status {
            StreamStatus::Created => info!(stream = %spec.name, "stream created"),
            StreamStatus::Updated => info!(stream = %spec.name, "stream updated"),
            StreamStatus::Unchanged => debug!(stream = %spec.name, "stream up to date"),
        }
        Ok(())
    }

    async fn add_consumer(&self, client: &N::Client, spec: &ConsumerSpec) -> Result<(), BackendError> {
        let stream = &self.config.jetstream.stream_name;
        bounded(self.request_timeout(), client.add_consumer(stream, spec)).await?;
        info!(consumer = %spec.durable_name, subject = %spec.filter_subject, "consumer created");
        Ok(())
    }
}

#[async_trait]
impl<N: NatsConnector> SubscriberDriver for JetStreamInner<N> {
    async fn create(&self, desired: &Desired) -> Result<Subscriber, BackendError> {
        let client = self.client()?;
        let stream = &self.config.jetstream.stream_name;
        let timeout = self.request_timeout();
        let spec = self.consumer_spec(desired);

        match bounded(timeout, client.consumer(stream, &spec.durable_name)).await? {
            None => self.add_consumer(client, &spec).await?,
            Some(current) => match current.change_to(&spec) {
                ConsumerChange::Unchanged => {
                    debug!(consumer = %spec.durable_name, "adopting existing consumer")
                }
                ConsumerChange::Update => {
                    bounded(timeout, client.update_consumer(stream, &spec)).await?;
                    info!(consumer = %spec.durable_name, "consumer updated");
                }
                ConsumerChange::Recreate => {
                    bounded(timeout, client.delete_consumer(stream, &spec.durable_name)).await?;
                    self.add_consumer(client, &spec).await?;
                }
            },
        }

        let messages = bounded(timeout, client.bind_consumer(stream, &spec.durable_name)).await?;
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
        let client = self.client()?;
        let spec = self.consumer_spec(desired);
        bounded(
            self.request_timeout(),
            client.update_consumer(&self.config.jetstream.stream_name, &spec),
        )
        .await?;
        current
            .worker
            .set_max_in_flight(desired.settings.max_in_flight);
        info!(
            consumer = %spec.durable_name,
            max_in_flight = desired.settings.max_in_flight,
            ack_wait = ?desired.settings.ack_wait,
            "consumer updated"
        );
        Ok(Subscriber {
            settings: desired.settings.clone(),
            ..current.clone()
        })
    }

    async fn remove(&self, id: &SubscriptionSubjectIdentifier) -> Result<(), BackendError> {
        let client = self.client()?;
        let outcome = bounded(
            self.request_timeout(),
            client.delete_consumer(&self.config.jetstream.stream_name, id.consumer_name()),
        )
        .await?;
        match outcome {
            DeleteOutcome::Deleted => {
                info!(%id, "consumer deleted");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(BackendError::NotFound {
                what: format!("consumer {}", id.consumer_name()),
            }),
        }
    }
}

/// Re-checks the stream after a reconnect before the owner resyncs, the server may
/// have been replaced with an empty one.
struct StreamKeeper<N: NatsConnector> {
    inner: Weak<JetStreamInner<N>>,
    stale: MarkStale,
}

#[async_trait]
impl<N: NatsConnector> ConnectionHandler for StreamKeeper<N> {
    async fn on_connection_lost(&self) {
        self.stale.on_connection_lost().await;
    }

    async fn on_connection_restored(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let ensured = match inner.client() {
                Ok(client) => inner.ensure_stream(client).await,
                Err(err) => Err(err),
            };
            if let Err(err) = ensured {
                error!("ensuring stream after reconnect failed: {err}");
            }
        }
        self.stale.on_connection_restored().await;
    }
}

#[async_trait]
impl<N: NatsConnector> Backend for JetStream<N> {
    async fn initialize(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), BackendError> {
        let inner = &self.inner;
        if inner.client.get().is_some() {
            warn!("jetstream backend is already initialized");
            return Ok(());
        }
        inner
            .config
            .validate()
            .map_err(|err| BackendError::Config(format!("{err:#}")))?;

        let client = inner
            .connector
            .connect(&inner.config.nats)
            .await
            .map_err(|err| BackendError::unavailable(format!("{err:#}")))?;
        inner.ensure_stream(&client).await?;
        let events = client.connection_events();
        if inner.client.set(client).is_err() {
            warn!("jetstream backend was initialized concurrently");
            return Ok(());
        }
        inner.state.monitor.mark_connected();

        let keeper = StreamKeeper {
            inner: Arc::downgrade(inner),
            stale: MarkStale {
                table: inner.state.table.clone(),
                downstream: handler,
            },
        };
        let task = inner.state.monitor.spawn(events, Arc::new(keeper));
        if let Ok(mut connection_task) = inner.connection_task.lock() {
            *connection_task = Some(task);
        }
        info!(
            endpoint = %inner.config.nats.endpoint,
            stream = %inner.config.jetstream.stream_name,
            "jetstream backend initialized"
        );
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
