use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow, bail};
use async_nats::jetstream::Context as JetstreamContext;
use async_nats::jetstream::consumer::push::{Config as PushConfig, Messages, MessagesError};
use async_nats::jetstream::consumer::{
    AckPolicy, Config as ConsumerConfig, DeliverPolicy, PushConsumer,
};
use async_nats::jetstream::message::{AckKind, Acker};
use async_nats::jetstream::stream::{
    Config as StreamConfig, DiscardPolicy as NatsDiscardPolicy,
    RetentionPolicy as NatsRetentionPolicy, StorageType as NatsStorageType, Stream as NatsStream,
};
use async_nats::jetstream::{self, ErrorCode};
use async_nats::{Client, ConnectOptions, Event, Subscriber};
use async_trait::async_trait;
use eventing_config::configuration::{
    ConsumerDeliverPolicy, DiscardPolicy, NatsConfig, NatsCredentials, RetentionPolicy,
    StorageType,
};
use futures::{Stream, TryStreamExt};
use pin_project::pin_project;
use tracing::{debug, info, warn};

use super::types::{
    Acknowledge, ConnectionEvent, ConsumerSpec, ConsumerSummary, DeleteOutcome, Delivery,
    NatsClient, NatsConnector, NatsMessageStream, StreamSpec, StreamStatus,
};

/// Connects to a NATS server with `async_nats`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NatsConnectorImpl;

#[async_trait]
impl NatsConnector for NatsConnectorImpl {
    type Client = NatsClientImpl;

    async fn connect(&self, config: &NatsConfig) -> Result<NatsClientImpl> {
        NatsClientImpl::new(config).await
    }
}

/// Implementation of the `NatsClient` trait on top of `async_nats`.
///
/// The client reconnects on its own, connection changes are forwarded as
/// [`ConnectionEvent`]s. Consumers are durable and push-based with explicit
/// acknowledgements, so their progress survives restarts of this process.
pub struct NatsClientImpl {
    client: Client,
    jetstream: JetstreamContext,
    events_rx: loole::Receiver<ConnectionEvent>,
}

impl NatsClientImpl {
    pub async fn new(config: &NatsConfig) -> Result<Self> {
        let (events_tx, events_rx) = loole::unbounded();
        let reconnect_wait = config.reconnect_wait();

        let options = connect_options(config.credentials.clone())?
            .connection_timeout(config.connection_timeout())
            .request_timeout(Some(config.request_timeout()))
            .max_reconnects(config.max_reconnects)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback(move |event| {
                let events_tx = events_tx.clone();
                async move {
                    let event = match event {
                        Event::Connected => ConnectionEvent::Connected,
                        Event::Disconnected => ConnectionEvent::Disconnected,
                        Event::Closed => ConnectionEvent::Closed,
                        other => {
                            debug!("nats client event: {other}");
                            return;
                        }
                    };
                    if events_tx.send(event).is_err() {
                        debug!("no receiver for nats connection events");
                    }
                }
            });

        let client = async_nats::connect_with_options(config.endpoint.clone(), options)
            .await
            .context(format!("connecting to NATS server {}", config.endpoint))?;
        info!(endpoint = %config.endpoint, "connected to NATS server");

        let jetstream = jetstream::new(client.clone());
        Ok(NatsClientImpl {
            client,
            jetstream,
            events_rx,
        })
    }

    async fn stream(&self, name: &str) -> Result<NatsStream> {
        self.jetstream
            .get_stream(name)
            .await
            .context(format!("get '{name}' stream from nats server"))
    }
}

#[async_trait]
impl NatsClient for NatsClientImpl {
    type Messages = NatsMessages;

    fn connection_events(&self) -> loole::Receiver<ConnectionEvent> {
        self.events_rx.clone()
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<StreamStatus> {
        let config = to_stream_config(spec);
        match self.jetstream.get_stream(&spec.name).await {
            Ok(mut stream) => {
                let info = stream
                    .info()
                    .await
                    .context(format!("get info of '{}' stream", spec.name))?;
                if to_stream_spec(&info.config) == *spec {
                    return Ok(StreamStatus::Unchanged);
                }
                self.jetstream
                    .update_stream(config)
                    .await
                    .context(format!("update '{}' stream", spec.name))?;
                Ok(StreamStatus::Updated)
            }
            Err(err) if has_error_code(&err, ErrorCode::STREAM_NOT_FOUND) => {
                self.jetstream
                    .create_stream(config)
                    .await
                    .context(format!("create '{}' stream", spec.name))?;
                Ok(StreamStatus::Created)
            }
            Err(err) => Err(err).context(format!("get '{}' stream from nats server", spec.name)),
        }
    }

    async fn consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerSpec>> {
        let stream = self.stream(stream).await?;
        match stream.consumer_info(name).await {
            Ok(info) => Ok(Some(to_consumer_spec(&info.config))),
            Err(err) if has_error_code(&err, ErrorCode::CONSUMER_NOT_FOUND) => Ok(None),
            Err(err) => Err(err).context(format!("get info of consumer {name}")),
        }
    }

    async fn add_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        let stream = self.stream(stream).await?;
        // Every consumer delivers to its own inbox, a shared deliver subject would make
        // consumers receive each other's messages.
        let config = to_push_config(spec, self.client.new_inbox());
        stream
            .create_consumer(config)
            .await
            .context(format!("create consumer {}", spec.durable_name))?;
        Ok(())
    }

    async fn update_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        let stream = self.stream(stream).await?;
        let info = stream
            .consumer_info(&spec.durable_name)
            .await
            .context(format!("get info of consumer {}", spec.durable_name))?;
        let deliver_subject = info
            .config
            .deliver_subject
            .clone()
            .ok_or_else(|| anyhow!("consumer {} is not push-based", spec.durable_name))?;
        stream
            .update_consumer(to_push_config(spec, deliver_subject))
            .await
            .context(format!("update consumer {}", spec.durable_name))?;
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<DeleteOutcome> {
        let stream = self.stream(stream).await?;
        match stream.delete_consumer(name).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) if has_error_code(&err, ErrorCode::CONSUMER_NOT_FOUND) => {
                Ok(DeleteOutcome::NotFound)
            }
            Err(err) => Err(err).context(format!("delete consumer {name}")),
        }
    }

    async fn consumers(&self, stream: &str) -> Result<Vec<ConsumerSummary>> {
        let stream = self.stream(stream).await?;
        let infos: Vec<_> = stream
            .consumers()
            .try_collect()
            .await
            .context("list consumers")?;
        Ok(infos
            .into_iter()
            .map(|info| ConsumerSummary {
                name: info.name,
                push_bound: info.push_bound,
            })
            .collect())
    }

    async fn bind_consumer(&self, stream: &str, name: &str) -> Result<NatsMessages> {
        let consumer: PushConsumer = self
            .stream(stream)
            .await?
            .get_consumer(name)
            .await
            .map_err(anyhow::Error::from_boxed)
            .context(format!("get push consumer {name}"))?;
        let messages = consumer
            .messages()
            .await
            .context(format!("subscribe to consumer {name}"))?;
        Ok(NatsMessages::JetStream { messages })
    }

    async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<NatsMessages> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .context(format!("queue subscribe to {subject}"))?;
        Ok(NatsMessages::Core { subscriber })
    }
}

#[pin_project(project = NatsMessagesProj)]
pub enum NatsMessages {
    JetStream {
        #[pin]
        messages: Messages,
    },
    Core {
        #[pin]
        subscriber: Subscriber,
    },
}

impl NatsMessageStream for NatsMessages {}

impl Stream for NatsMessages {
    type Item = Result<Delivery>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.project() {
            NatsMessagesProj::JetStream { messages } => messages
                .poll_next(cx)
                .map(|next| next.map(from_jetstream_message)),
            NatsMessagesProj::Core { subscriber } => {
                subscriber.poll_next(cx).map(|next| {
                    next.map(|message| {
                        Ok(Delivery::new(
                            message.subject.to_string(),
                            message.payload,
                            message.headers,
                            None,
                        ))
                    })
                })
            }
        }
    }
}

fn from_jetstream_message(
    message: Result<jetstream::Message, MessagesError>,
) -> Result<Delivery> {
    let message = message.context("receive message from consumer")?;
    // The acker is kept for the dispatch outcome, the rest of the jetstream context is
    // not needed.
    let (message, acker) = message.split();
    Ok(Delivery::new(
        message.subject.to_string(),
        message.payload,
        message.headers,
        Some(Arc::new(JetStreamAcker(acker))),
    ))
}

struct JetStreamAcker(Acker);

#[async_trait]
impl Acknowledge for JetStreamAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|err| anyhow!("ack message: {err}"))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.0
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|err| anyhow!("nak message: {err}"))
    }
}

fn connect_options(config: Option<NatsCredentials>) -> Result<ConnectOptions> {
    let Some(credentials) = config else {
        return Ok(ConnectOptions::default());
    };

    let options = match (
        credentials.nkey,
        credentials.token,
        credentials.username,
        credentials.password,
    ) {
        (Some(nkey), None, None, None) => ConnectOptions::with_nkey(nkey),
        (None, Some(token), None, None) => ConnectOptions::with_token(token),
        (None, None, Some(username), Some(password)) => {
            ConnectOptions::with_user_and_password(username, password)
        }
        _ => bail!("ambigious nats credentials configuration"),
    };

    Ok(options)
}

/// Looks for a JetStream API error with the given code in the error chain.
fn has_error_code<E>(err: &E, code: ErrorCode) -> bool
where
    E: StdError + 'static,
{
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = current {
        if let Some(jetstream_err) = err.downcast_ref::<jetstream::Error>() {
            return jetstream_err.error_code() == code;
        }
        current = err.source();
    }

    // Some error kinds only keep the server's description.
    let message = err.to_string();
    match code {
        ErrorCode::STREAM_NOT_FOUND => message.contains("stream not found"),
        ErrorCode::CONSUMER_NOT_FOUND => message.contains("consumer not found"),
        _ => false,
    }
}

fn to_stream_config(spec: &StreamSpec) -> StreamConfig {
    StreamConfig {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        storage: match spec.storage {
            StorageType::File => NatsStorageType::File,
            StorageType::Memory => NatsStorageType::Memory,
        },
        num_replicas: spec.replicas,
        retention: match spec.retention {
            RetentionPolicy::Limits => NatsRetentionPolicy::Limits,
            RetentionPolicy::Interest => NatsRetentionPolicy::Interest,
        },
        discard: match spec.discard {
            DiscardPolicy::New => NatsDiscardPolicy::New,
            DiscardPolicy::Old => NatsDiscardPolicy::Old,
        },
        max_messages: spec.max_messages,
        max_bytes: spec.max_bytes,
        max_messages_per_subject: spec.max_messages_per_subject,
        ..Default::default()
    }
}

fn to_stream_spec(config: &StreamConfig) -> StreamSpec {
    StreamSpec {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            NatsStorageType::Memory => StorageType::Memory,
            NatsStorageType::File => StorageType::File,
        },
        replicas: config.num_replicas,
        retention: match config.retention {
            NatsRetentionPolicy::Interest => RetentionPolicy::Interest,
            // Work queues are never created here, reporting them as limits makes the
            // comparison fail and the stream gets updated.
            _ => RetentionPolicy::Limits,
        },
        discard: match config.discard {
            NatsDiscardPolicy::Old => DiscardPolicy::Old,
            NatsDiscardPolicy::New => DiscardPolicy::New,
        },
        max_messages: config.max_messages,
        max_bytes: config.max_bytes,
        max_messages_per_subject: config.max_messages_per_subject,
    }
}

fn to_push_config(spec: &ConsumerSpec, deliver_subject: String) -> PushConfig {
    PushConfig {
        deliver_subject,
        durable_name: Some(spec.durable_name.clone()),
        description: Some(spec.description.clone()),
        filter_subject: spec.filter_subject.clone(),
        deliver_policy: match spec.deliver_policy {
            ConsumerDeliverPolicy::All => DeliverPolicy::All,
            ConsumerDeliverPolicy::Last => DeliverPolicy::Last,
            ConsumerDeliverPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
            ConsumerDeliverPolicy::New => DeliverPolicy::New,
        },
        ack_policy: AckPolicy::Explicit,
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        max_ack_pending: spec.max_ack_pending,
        idle_heartbeat: spec.idle_heartbeat,
        flow_control: spec.flow_control,
        ..Default::default()
    }
}

fn to_consumer_spec(config: &ConsumerConfig) -> ConsumerSpec {
    let deliver_policy = match config.deliver_policy {
        DeliverPolicy::Last => ConsumerDeliverPolicy::Last,
        DeliverPolicy::LastPerSubject => ConsumerDeliverPolicy::LastPerSubject,
        DeliverPolicy::New => ConsumerDeliverPolicy::New,
        DeliverPolicy::All => ConsumerDeliverPolicy::All,
        ref other => {
            warn!(policy = ?other, "consumer uses a deliver policy which is never configured here");
            ConsumerDeliverPolicy::All
        }
    };

    ConsumerSpec {
        durable_name: config.durable_name.clone().unwrap_or_default(),
        description: config.description.clone().unwrap_or_default(),
        filter_subject: config.filter_subject.clone(),
        deliver_policy,
        max_ack_pending: config.max_ack_pending,
        ack_wait: config.ack_wait,
        max_deliver: config.max_deliver,
        idle_heartbeat: config.idle_heartbeat,
        flow_control: config.flow_control,
    }
}
