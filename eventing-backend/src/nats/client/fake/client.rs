use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use eventing_config::configuration::NatsConfig;
use futures::Stream;
use pin_project::{pin_project, pinned_drop};
use rand::random;
use tracing::info;

use super::server::{FakeNatsServer, FakeSubscription};
use crate::nats::client::types::{
    ConnectionEvent, ConsumerSpec, ConsumerSummary, DeleteOutcome, Delivery, NatsClient,
    NatsMessageStream, StreamSpec, StreamStatus,
};

/// Client side of [`FakeNatsServer`].
///
/// Every client gets its own connection event channel; the server broadcasts
/// simulated disconnects and reconnects to all registered clients.
pub struct FakeNatsClient {
    client_id: String,
    server: Arc<FakeNatsServer>,
    events_rx: loole::Receiver<ConnectionEvent>,
}

impl FakeNatsClient {
    pub fn new(server: Arc<FakeNatsServer>, config: &NatsConfig) -> Self {
        let client_id = format!("eventing-{}", random::<u64>());
        info!("creating client {client_id} for {}", config.endpoint);
        let events_rx = server.register_client(&client_id);
        FakeNatsClient {
            client_id,
            server,
            events_rx,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Drop for FakeNatsClient {
    fn drop(&mut self) {
        self.server.unregister_client(&self.client_id);
    }
}

#[async_trait]
impl NatsClient for FakeNatsClient {
    type Messages = FakeNatsMessages;

    fn connection_events(&self) -> loole::Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamStatus> {
        self.server.ensure_stream(spec).await
    }

    async fn consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerSpec>> {
        self.server.consumer(stream, name).await
    }

    async fn add_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        self.server.add_consumer(stream, spec).await
    }

    async fn update_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        self.server.update_consumer(stream, spec).await
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<DeleteOutcome> {
        self.server.delete_consumer(stream, name).await
    }

    async fn consumers(&self, stream: &str) -> Result<Vec<ConsumerSummary>> {
        self.server.consumers(stream).await
    }

    async fn bind_consumer(&self, stream: &str, name: &str) -> Result<FakeNatsMessages> {
        let (subscription, messages_rx) = self
            .server
            .bind_consumer(&self.client_id, stream, name)
            .await
            .context("FakeNatsClient: bind consumer")?;
        Ok(FakeNatsMessages::new(
            self.server.clone(),
            subscription,
            messages_rx,
        ))
    }

    async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<FakeNatsMessages> {
        let (subscription, messages_rx) = self
            .server
            .queue_subscribe(&self.client_id, subject, queue_group)
            .await
            .context("FakeNatsClient: queue subscribe")?;
        Ok(FakeNatsMessages::new(
            self.server.clone(),
            subscription,
            messages_rx,
        ))
    }
}

type BoxedDeliveries = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send + 'static>>;

#[pin_project(PinnedDrop)]
pub struct FakeNatsMessages {
    #[pin]
    messages: BoxedDeliveries,
    server: Arc<FakeNatsServer>,
    subscription: FakeSubscription,
}

impl FakeNatsMessages {
    fn new(
        server: Arc<FakeNatsServer>,
        subscription: FakeSubscription,
        messages_rx: loole::Receiver<Result<Delivery>>,
    ) -> Self {
        FakeNatsMessages {
            messages: Box::pin(messages_rx.stream()),
            server,
            subscription,
        }
    }
}

impl NatsMessageStream for FakeNatsMessages {}

impl Stream for FakeNatsMessages {
    type Item = Result<Delivery>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().messages.poll_next(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for FakeNatsMessages {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.server.remove_subscription(this.subscription);
    }
}
