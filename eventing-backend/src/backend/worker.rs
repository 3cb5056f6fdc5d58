use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use eventing_core::SubscriptionSubjectIdentifier;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, trace, warn, warn_span};

use crate::dispatcher::{EventDispatcher, ORIGINAL_TYPE_HEADER, OutgoingEvent, SinkRegistry};
use crate::nats::client::types::{Delivery, NatsMessageStream};

/// Shared by all workers of a backend.
#[derive(Clone)]
pub struct DispatchContext {
    pub sinks: SinkRegistry,
    pub dispatcher: Arc<dyn EventDispatcher>,
    /// Redelivery delay requested from the broker when a sink rejects an event.
    pub nak_delay: Option<Duration>,
}

/// Consumes the messages of one subscriber and hands them to the subscription sink,
/// with at most `max_in_flight` deliveries running at a time.
///
/// Dropping the worker stops consumption and unsubscribes.
pub struct DispatchWorker {
    max_in_flight: Arc<AtomicU32>,
    handle: Option<AbortOnDropHandle<()>>,
}

impl DispatchWorker {
    pub fn spawn<M: NatsMessageStream>(
        id: &SubscriptionSubjectIdentifier,
        messages: M,
        context: DispatchContext,
        max_in_flight: u32,
    ) -> Self {
        let limit = Arc::new(AtomicU32::new(max_in_flight.max(1)));
        let span = warn_span!("dispatch", consumer = %id.consumer_name(), subject = %id.subject());
        let handle = tokio::spawn(
            run(id.namespaced_name(), messages, context, limit.clone()).instrument(span),
        );
        Self {
            max_in_flight: limit,
            handle: Some(AbortOnDropHandle::new(handle)),
        }
    }

    #[cfg(test)]
    pub fn idle() -> Self {
        Self {
            max_in_flight: Arc::new(AtomicU32::new(1)),
            handle: None,
        }
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Takes effect for the next message, deliveries already running are not cancelled.
    pub fn set_max_in_flight(&self, max_in_flight: u32) {
        self.max_in_flight
            .store(max_in_flight.max(1), Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
    }
}

async fn run<M: NatsMessageStream>(
    sink_key: String,
    messages: M,
    context: DispatchContext,
    limit: Arc<AtomicU32>,
) {
    let mut messages = Box::pin(messages);
    let mut in_flight = JoinSet::new();

    loop {
        while in_flight.len() >= limit.load(Ordering::SeqCst) as usize {
            if in_flight.join_next().await.is_none() {
                break;
            }
        }

        tokio::select! {
            next = messages.next() => match next {
                Some(Ok(delivery)) => {
                    let context = context.clone();
                    let sink_key = sink_key.clone();
                    in_flight.spawn(
                        async move { dispatch(&context, &sink_key, delivery).await }.in_current_span(),
                    );
                }
                Some(Err(err)) => warn!("receiving message failed: {err:#}"),
                None => break,
            },
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
    debug!("message stream ended");
}

async fn dispatch(context: &DispatchContext, sink_key: &str, delivery: Delivery) {
    let Some(target) = context.sinks.get(sink_key) else {
        warn!(subject = %delivery.subject, "no sink registered, message is redelivered later");
        if let Err(err) = delivery.nak(context.nak_delay).await {
            error!("nak failed: {err:#}");
        }
        return;
    };

    let event = OutgoingEvent {
        event_type: target.event_type(&delivery.subject, delivery.header(ORIGINAL_TYPE_HEADER)),
        subject: delivery.subject.clone(),
        payload: delivery.payload.clone(),
        headers: delivery.header_pairs(),
    };

    let outcome = match context.dispatcher.dispatch(&target.url, &event).await {
        Ok(()) => {
            trace!(subject = %event.subject, sink = %target.url, "event delivered");
            delivery.ack().await
        }
        Err(err) => {
            warn!(subject = %event.subject, sink = %target.url, "dispatch failed: {err:#}");
            delivery.nak(context.nak_delay).await
        }
    };
    if let Err(err) = outcome {
        error!(subject = %event.subject, "acknowledgement failed: {err:#}");
    }
}
