use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use eventing_config::configuration::{
    ConsumerDeliverPolicy, DiscardPolicy, NatsConfig, RetentionPolicy, StorageType,
};
use futures::Stream;

/// Connection changes reported by the client library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// The client gave up reconnecting.
    Closed,
}

/// Desired shape of the JetStream stream every subscription consumes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
    pub replicas: usize,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    pub max_messages: i64,
    pub max_bytes: i64,
    pub max_messages_per_subject: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Created,
    Updated,
    Unchanged,
}

/// Durable push consumer settings which are compared against the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub description: String,
    pub filter_subject: String,
    pub deliver_policy: ConsumerDeliverPolicy,
    pub max_ack_pending: i64,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub idle_heartbeat: Duration,
    pub flow_control: bool,
}

/// What it takes to turn an existing consumer into the desired one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerChange {
    Unchanged,
    /// The server accepts the new settings on the live consumer.
    Update,
    /// Filter subject and deliver policy are immutable on the server.
    Recreate,
}

impl ConsumerSpec {
    pub fn change_to(&self, desired: &ConsumerSpec) -> ConsumerChange {
        if self == desired {
            ConsumerChange::Unchanged
        } else if self.filter_subject != desired.filter_subject
            || self.deliver_policy != desired.deliver_policy
            || self.durable_name != desired.durable_name
        {
            ConsumerChange::Recreate
        } else {
            ConsumerChange::Update
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub name: String,
    /// A client is currently subscribed to the consumer's deliver subject.
    pub push_bound: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nak(&self, delay: Option<Duration>) -> Result<()>;
}

/// A message received from a consumer or a core subscription.
///
/// Messages of core subscriptions carry no acknowledgement handle, acking them is a no-op.
#[derive(Clone)]
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
    acker: Option<Arc<dyn Acknowledge>>,
}

impl Delivery {
    pub fn new(
        subject: String,
        payload: Bytes,
        headers: Option<HeaderMap>,
        acker: Option<Arc<dyn Acknowledge>>,
    ) -> Self {
        Self {
            subject,
            payload,
            headers,
            acker,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str())
    }

    /// Every header value as a name/value pair, multi-valued headers repeat the name.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![];
        if let Some(headers) = &self.headers {
            for (k, vs) in headers.iter() {
                for v in vs.iter() {
                    pairs.push((k.to_string(), v.to_string()));
                }
            }
        }
        pairs
    }

    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.nak(delay).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload", &self.payload)
            .field("headers", &self.headers)
            .field("ackable", &self.acker.is_some())
            .finish()
    }
}

/// Stream of messages delivered to one subscriber.
///
/// Dropping the stream unsubscribes.
pub trait NatsMessageStream: Stream<Item = Result<Delivery>> + Send + 'static {}

/// Operations the backends need from a NATS connection.
///
/// Implemented by `NatsClientImpl` on top of `async_nats` and by `FakeNatsClient` for
/// tests. All methods are single round-trips to the broker, callers bound them with a
/// timeout.
#[async_trait]
pub trait NatsClient: Send + Sync + 'static {
    type Messages: NatsMessageStream;

    /// Connection changes, starting after the initial connect.
    fn connection_events(&self) -> loole::Receiver<ConnectionEvent>;

    /// Creates the stream if missing, updates it if its settings diverge.
    ///
    /// # Arguments
    ///
    /// * `spec` - Name, subjects and limits the stream should have.
    ///
    /// # Returns
    ///
    /// Whether the stream was created, updated or already matched.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamStatus>;

    /// Looks up a consumer on a stream.
    ///
    /// # Arguments
    ///
    /// * `stream` - The name of the stream the consumer belongs to.
    /// * `name` - The durable name of the consumer.
    ///
    /// # Returns
    ///
    /// The consumer's configuration, or `None` if the broker doesn't know it.
    async fn consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerSpec>>;

    /// Creates a push consumer delivering to a fresh inbox subject.
    async fn add_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()>;

    /// Changes the mutable settings of an existing consumer, see [`ConsumerSpec::change_to`].
    async fn update_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()>;

    /// Deletes a consumer.
    ///
    /// # Returns
    ///
    /// [`DeleteOutcome::NotFound`] instead of an error if the consumer did not exist.
    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<DeleteOutcome>;

    /// Lists every consumer of a stream and whether a subscriber is bound to it.
    async fn consumers(&self, stream: &str) -> Result<Vec<ConsumerSummary>>;

    /// Subscribes to the deliver subject of an existing push consumer.
    async fn bind_consumer(&self, stream: &str, name: &str) -> Result<Self::Messages>;

    /// Subscribes to a core NATS subject as a member of a queue group.
    ///
    /// # Arguments
    ///
    /// * `subject` - The subject to receive messages from.
    /// * `queue_group` - Members of the same group share the messages of the subject.
    ///
    /// # Returns
    ///
    /// A stream of deliveries which unsubscribes when dropped. Core deliveries can't be
    /// acknowledged.
    async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<Self::Messages>;
}

/// Establishes connections, the seam through which tests inject the fake server.
#[async_trait]
pub trait NatsConnector: Send + Sync + 'static {
    type Client: NatsClient;

    async fn connect(&self, config: &NatsConfig) -> Result<Self::Client>;
}
