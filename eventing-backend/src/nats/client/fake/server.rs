use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use eventing_config::configuration::NatsConfig;
use eventing_core::Subject;
use loole::{Receiver, Sender};
use tracing::{debug, info};

use super::client::FakeNatsClient;
use crate::nats::client::types::{
    Acknowledge, ConnectionEvent, ConsumerSpec, ConsumerSummary, DeleteOutcome, Delivery,
    NatsConnector, StreamSpec, StreamStatus,
};

type ClientId = String;
type ConsumerKey = (String, String);

/// Live subscription of a client, either bound to a durable consumer or a core
/// queue subscription.
#[derive(Clone, Debug)]
pub struct FakeSubscription {
    subscription_id: u64,
    client_id: ClientId,
    filter_subject: Subject,
    consumer: Option<ConsumerKey>,
    queue_group: Option<String>,
    messages_tx: Sender<Result<Delivery>>,
}

impl FakeSubscription {
    pub fn id(&self) -> u64 {
        self.subscription_id
    }

    fn match_subject(&self, subject: &Subject) -> bool {
        self.filter_subject.is_matching(subject)
    }
}

/// Counts of broker operations observed by the fake server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FakeServerStats {
    pub streams_created: usize,
    pub streams_updated: usize,
    pub consumers_added: usize,
    pub consumers_updated: usize,
    pub consumers_deleted: usize,
    pub consumers_bound: usize,
    pub queue_subscriptions: usize,
    pub acks: usize,
    pub naks: usize,
}

impl FakeServerStats {
    /// Operations which change broker state.
    pub fn mutations(&self) -> usize {
        self.streams_created
            + self.streams_updated
            + self.consumers_added
            + self.consumers_updated
            + self.consumers_deleted
    }
}

#[derive(Default)]
struct Counters {
    streams_created: AtomicUsize,
    streams_updated: AtomicUsize,
    consumers_added: AtomicUsize,
    consumers_updated: AtomicUsize,
    consumers_deleted: AtomicUsize,
    consumers_bound: AtomicUsize,
    queue_subscriptions: AtomicUsize,
    acks: AtomicUsize,
    naks: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::AcqRel);
}

/// In-memory stand-in for a NATS server with JetStream enabled.
///
/// Keeps streams and durable push consumers, routes published messages to live
/// subscriptions by subject and counts every broker operation so tests can assert on
/// the exact work a sync pass did. Connection loss is simulated with
/// [`FakeNatsServer::disconnect`] and [`FakeNatsServer::reconnect`]; while disconnected
/// every client operation fails and all live subscriptions are closed.
///
/// Operations touching a subject registered with [`FakeNatsServer::fail_subject`] fail,
/// [`FakeNatsServer::set_latency`] delays every client operation.
pub struct FakeNatsServer {
    streams: DashMap<String, StreamSpec>,
    consumers: DashMap<ConsumerKey, ConsumerSpec>,
    subscriptions: DashMap<u64, FakeSubscription>,
    clients: DashMap<ClientId, Sender<ConnectionEvent>>,
    failing_subjects: DashSet<String>,
    subscription_ids: AtomicU64,
    connected: AtomicBool,
    refuse_connections: AtomicBool,
    connection_attempts: AtomicUsize,
    latency_ms: AtomicU64,
    counters: Counters,
}

impl FakeNatsServer {
    pub fn new() -> Arc<FakeNatsServer> {
        Arc::new(FakeNatsServer {
            streams: DashMap::new(),
            consumers: DashMap::new(),
            subscriptions: DashMap::new(),
            clients: DashMap::new(),
            failing_subjects: DashSet::new(),
            subscription_ids: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            refuse_connections: AtomicBool::new(false),
            connection_attempts: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> FakeServerStats {
        let c = &self.counters;
        FakeServerStats {
            streams_created: c.streams_created.load(Ordering::Acquire),
            streams_updated: c.streams_updated.load(Ordering::Acquire),
            consumers_added: c.consumers_added.load(Ordering::Acquire),
            consumers_updated: c.consumers_updated.load(Ordering::Acquire),
            consumers_deleted: c.consumers_deleted.load(Ordering::Acquire),
            consumers_bound: c.consumers_bound.load(Ordering::Acquire),
            queue_subscriptions: c.queue_subscriptions.load(Ordering::Acquire),
            acks: c.acks.load(Ordering::Acquire),
            naks: c.naks.load(Ordering::Acquire),
        }
    }

    pub fn connection_attempts(&self) -> usize {
        self.connection_attempts.load(Ordering::Acquire)
    }

    /// Simulates a server restart or network partition.
    pub fn disconnect(&self) {
        info!("simulating disconnect of all clients");
        self.connected.store(false, Ordering::SeqCst);
        self.broadcast(ConnectionEvent::Disconnected);
        // Dropping the senders ends every subscription stream.
        self.subscriptions.clear();
    }

    pub fn reconnect(&self) {
        info!("simulating reconnect of all clients");
        self.connected.store(true, Ordering::SeqCst);
        self.broadcast(ConnectionEvent::Connected);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_subject(&self, subject: impl Into<String>) {
        self.failing_subjects.insert(subject.into());
    }

    pub fn clear_failures(&self) {
        self.failing_subjects.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stream(&self, name: &str) -> Option<StreamSpec> {
        self.streams.get(name).map(|stream| stream.clone())
    }

    /// Drops a stream with all its consumers, as a server losing its storage would.
    pub fn delete_stream(&self, name: &str) {
        self.streams.remove(name);
        self.consumers.retain(|(stream, _), _| stream != name);
    }

    pub fn consumer_spec(&self, stream: &str, name: &str) -> Option<ConsumerSpec> {
        self.consumers
            .get(&(stream.to_string(), name.to_string()))
            .map(|consumer| consumer.clone())
    }

    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .consumers
            .iter()
            .filter(|entry| entry.key().0 == stream)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// Adds a consumer behind the back of any client, as an operator or an older
    /// deployment would.
    pub fn insert_consumer(&self, stream: &str, spec: ConsumerSpec) {
        self.consumers
            .insert((stream.to_string(), spec.durable_name.clone()), spec);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Publishes a message, returns the number of subscriptions it was delivered to.
    ///
    /// Every matching consumer and core subscription receives the message; within a
    /// queue group only one member does.
    pub fn publish(
        self: &Arc<Self>,
        subject: &str,
        payload: impl Into<Bytes>,
        headers: Option<HeaderMap>,
    ) -> Result<usize> {
        if !self.is_connected() {
            bail!("FakeNatsServer: publish while disconnected");
        }
        let parsed = Subject::from_str(subject)?;
        let payload = payload.into();
        let mut served_groups = std::collections::HashSet::new();
        let mut delivered = 0;

        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if !subscription.match_subject(&parsed) {
                continue;
            }
            if let Some(group) = &subscription.queue_group {
                if !served_groups.insert(group.clone()) {
                    continue;
                }
            }
            let acker: Option<Arc<dyn Acknowledge>> = subscription
                .consumer
                .as_ref()
                .map(|_| Arc::new(FakeAcker(self.clone())) as Arc<dyn Acknowledge>);
            let delivery = Delivery::new(subject.to_string(), payload.clone(), headers.clone(), acker);
            subscription
                .messages_tx
                .send(Ok(delivery))
                .context(format!(
                    "FakeNatsServer: send message to subscription {}",
                    subscription.subscription_id
                ))?;
            delivered += 1;
        }
        debug!(%subject, delivered, "published message");
        Ok(delivered)
    }

    pub async fn wait_for_subscriptions(&self, count: usize, duration: Duration) -> Result<()> {
        tokio::time::timeout(duration, async {
            while self.subscriptions.len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .context(format!("{count} subscriptions expected"))
    }
}

// Operations used by `FakeNatsClient`.
impl FakeNatsServer {
    pub(super) fn register_client(&self, client_id: &str) -> Receiver<ConnectionEvent> {
        let (events_tx, events_rx) = loole::unbounded();
        self.clients.insert(client_id.to_string(), events_tx);
        events_rx
    }

    pub(super) fn unregister_client(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    fn broadcast(&self, event: ConnectionEvent) {
        self.clients.retain(|client_id, events_tx| {
            let delivered = events_tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(%client_id, "client gone, dropping it");
            }
            delivered
        });
    }

    async fn round_trip(&self, subject: Option<&str>) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_connected() {
            bail!("FakeNatsServer: connection closed");
        }
        if let Some(subject) = subject {
            if self.failing_subjects.contains(subject) {
                info!(%subject, "simulating broker failure");
                bail!("FakeNatsServer: simulated failure for subject {subject}");
            }
        }
        Ok(())
    }

    pub(super) async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamStatus> {
        self.round_trip(None).await?;
        let status = match self.streams.get(&spec.name) {
            Some(existing) if *existing == *spec => StreamStatus::Unchanged,
            Some(_) => StreamStatus::Updated,
            None => StreamStatus::Created,
        };
        match status {
            StreamStatus::Created => bump(&self.counters.streams_created),
            StreamStatus::Updated => bump(&self.counters.streams_updated),
            StreamStatus::Unchanged => return Ok(status),
        }
        self.streams.insert(spec.name.clone(), spec.clone());
        Ok(status)
    }

    fn require_stream(&self, stream: &str) -> Result<()> {
        if !self.streams.contains_key(stream) {
            bail!("FakeNatsServer: stream not found: {stream}");
        }
        Ok(())
    }

    pub(super) async fn consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerSpec>> {
        self.round_trip(None).await?;
        self.require_stream(stream)?;
        Ok(self.consumer_spec(stream, name))
    }

    pub(super) async fn add_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        self.round_trip(Some(&spec.filter_subject)).await?;
        self.require_stream(stream)?;
        let key = (stream.to_string(), spec.durable_name.clone());
        if let Some(existing) = self.consumers.get(&key) {
            if *existing != *spec {
                bail!("FakeNatsServer: consumer already exists: {}", spec.durable_name);
            }
        }
        bump(&self.counters.consumers_added);
        self.consumers.insert(key, spec.clone());
        Ok(())
    }

    pub(super) async fn update_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        self.round_trip(Some(&spec.filter_subject)).await?;
        let key = (stream.to_string(), spec.durable_name.clone());
        let mut existing = self
            .consumers
            .get_mut(&key)
            .ok_or_else(|| anyhow!("FakeNatsServer: consumer not found: {}", spec.durable_name))?;
        if existing.filter_subject != spec.filter_subject
            || existing.deliver_policy != spec.deliver_policy
        {
            bail!(
                "FakeNatsServer: immutable settings of consumer {} changed",
                spec.durable_name
            );
        }
        bump(&self.counters.consumers_updated);
        *existing = spec.clone();
        Ok(())
    }

    pub(super) async fn delete_consumer(&self, stream: &str, name: &str) -> Result<DeleteOutcome> {
        let filter = self
            .consumer_spec(stream, name)
            .map(|spec| spec.filter_subject);
        self.round_trip(filter.as_deref()).await?;
        match self.consumers.remove(&(stream.to_string(), name.to_string())) {
            Some(_) => {
                bump(&self.counters.consumers_deleted);
                self.subscriptions.retain(|_, subscription| {
                    subscription.consumer.as_ref()
                        != Some(&(stream.to_string(), name.to_string()))
                });
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    pub(super) async fn consumers(&self, stream: &str) -> Result<Vec<ConsumerSummary>> {
        self.round_trip(None).await?;
        self.require_stream(stream)?;
        Ok(self
            .consumer_names(stream)
            .into_iter()
            .map(|name| {
                let key = (stream.to_string(), name.clone());
                let push_bound = self
                    .subscriptions
                    .iter()
                    .any(|entry| entry.value().consumer.as_ref() == Some(&key));
                ConsumerSummary { name, push_bound }
            })
            .collect())
    }

    pub(super) async fn bind_consumer(
        &self,
        client_id: &str,
        stream: &str,
        name: &str,
    ) -> Result<(FakeSubscription, Receiver<Result<Delivery>>)> {
        let spec = self
            .consumer_spec(stream, name)
            .ok_or_else(|| anyhow!("FakeNatsServer: consumer not found: {name}"))?;
        self.round_trip(Some(&spec.filter_subject)).await?;
        bump(&self.counters.consumers_bound);
        self.add_subscription(
            client_id,
            &spec.filter_subject,
            Some((stream.to_string(), name.to_string())),
            None,
        )
    }

    pub(super) async fn queue_subscribe(
        &self,
        client_id: &str,
        subject: &str,
        queue_group: &str,
    ) -> Result<(FakeSubscription, Receiver<Result<Delivery>>)> {
        self.round_trip(Some(subject)).await?;
        bump(&self.counters.queue_subscriptions);
        self.add_subscription(client_id, subject, None, Some(queue_group.to_string()))
    }

    fn add_subscription(
        &self,
        client_id: &str,
        filter_subject: &str,
        consumer: Option<ConsumerKey>,
        queue_group: Option<String>,
    ) -> Result<(FakeSubscription, Receiver<Result<Delivery>>)> {
        let subscription_id = self.subscription_ids.fetch_add(1, Ordering::AcqRel);
        let (messages_tx, messages_rx) = loole::unbounded();
        let subscription = FakeSubscription {
            subscription_id,
            client_id: client_id.to_string(),
            filter_subject: Subject::from_str(filter_subject)?,
            consumer,
            queue_group,
            messages_tx,
        };
        info!(%client_id, subscription_id, %filter_subject, "add subscription to FakeNatsServer");
        self.subscriptions
            .insert(subscription_id, subscription.clone());
        Ok((subscription, messages_rx))
    }

    pub(super) fn remove_subscription(&self, subscription: &FakeSubscription) {
        debug!(
            client_id = %subscription.client_id,
            subscription_id = subscription.subscription_id,
            "drop subscription from FakeNatsServer"
        );
        self.subscriptions.remove(&subscription.subscription_id);
    }
}

struct FakeAcker(Arc<FakeNatsServer>);

#[async_trait]
impl Acknowledge for FakeAcker {
    async fn ack(&self) -> Result<()> {
        bump(&self.0.counters.acks);
        Ok(())
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<()> {
        bump(&self.0.counters.naks);
        Ok(())
    }
}

#[async_trait]
impl NatsConnector for Arc<FakeNatsServer> {
    type Client = FakeNatsClient;

    async fn connect(&self, config: &NatsConfig) -> Result<FakeNatsClient> {
        self.connection_attempts.fetch_add(1, Ordering::AcqRel);
        if self.refuse_connections.load(Ordering::SeqCst) || !self.is_connected() {
            info!(endpoint = %config.endpoint, "simulating connection failure");
            bail!("FakeNatsServer: connection refused");
        }
        Ok(FakeNatsClient::new(self.clone(), config))
    }
}
