use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use eventing_core::{Subscription, clean_source};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{trace, warn};
use url::Url;

/// Header carrying the event type as published, before cleaning.
pub const ORIGINAL_TYPE_HEADER: &str = "originaltype";

const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";
const CE_TYPE_HEADER: &str = "ce-type";

/// An event taken from the broker on its way to a subscription sink.
#[derive(Clone, Debug)]
pub struct OutgoingEvent {
    /// The event type the subscriber declared, restored from the broker subject.
    pub event_type: String,
    pub subject: String,
    pub payload: Bytes,
    pub headers: Vec<(String, String)>,
}

/// Delivers events to subscription sinks.
#[async_trait]
pub trait EventDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, sink: &Url, event: &OutgoingEvent) -> Result<()>;
}

/// Posts events to sinks as CloudEvents over HTTP.
///
/// JSON object payloads are sent in structured mode with their `type` set to the
/// restored event type. Anything else is sent in binary mode with a `ce-type` header.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventDispatcher for HttpDispatcher {
    async fn dispatch(&self, sink: &Url, event: &OutgoingEvent) -> Result<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in &event.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(%name, "skipping header which is not valid in HTTP"),
            }
        }

        let request = match serde_json::from_slice::<Value>(&event.payload) {
            Ok(Value::Object(mut object)) => {
                object.insert("type".into(), Value::String(event.event_type.clone()));
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(CLOUDEVENTS_JSON));
                self.client
                    .post(sink.clone())
                    .headers(headers)
                    .body(serde_json::to_vec(&object)?)
            }
            _ => {
                headers.insert(
                    CE_TYPE_HEADER,
                    HeaderValue::from_str(&event.event_type)
                        .context("event type is not a valid header value")?,
                );
                self.client
                    .post(sink.clone())
                    .headers(headers)
                    .body(event.payload.clone())
            }
        };

        let response = request
            .send()
            .await
            .context(format!("send event to {sink}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("sink {sink} responded with {status}: {body}");
        }
        trace!(%sink, %status, event_type = %event.event_type, "event dispatched");
        Ok(())
    }
}

/// Where the events of one subscription go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkTarget {
    pub url: Url,
    /// Stripped from the broker subject to restore the declared event type.
    pub subject_prefix: String,
}

impl SinkTarget {
    pub fn new(subscription: &Subscription, backend_prefix: Option<&str>) -> Self {
        let source = clean_source(&subscription.spec.source);
        let subject_prefix = match (backend_prefix, source.is_empty()) {
            (Some(prefix), false) => format!("{prefix}.{source}."),
            (Some(prefix), true) => format!("{prefix}."),
            (None, false) => format!("{source}."),
            (None, true) => String::new(),
        };
        Self {
            url: subscription.spec.sink.clone(),
            subject_prefix,
        }
    }

    /// Event type of a message, preferring the type recorded at publish time.
    pub fn event_type(&self, subject: &str, original_type: Option<&str>) -> String {
        match original_type {
            Some(original) if !original.is_empty() => original.to_string(),
            _ => subject
                .strip_prefix(&self.subject_prefix)
                .unwrap_or(subject)
                .to_string(),
        }
    }
}

/// Sinks by `<namespace>/<name>`.
///
/// A sink change of a subscription only replaces its entry here, running consumers
/// pick the new target up with their next message.
#[derive(Clone, Debug, Default)]
pub struct SinkRegistry {
    sinks: Arc<DashMap<String, SinkTarget>>,
}

impl SinkRegistry {
    pub fn set(&self, key: String, target: SinkTarget) {
        self.sinks.insert(key, target);
    }

    pub fn get(&self, key: &str) -> Option<SinkTarget> {
        self.sinks.get(key).map(|target| target.clone())
    }

    pub fn remove(&self, key: &str) {
        self.sinks.remove(key);
    }

    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.sinks.retain(|key, _| keep(key));
    }
}
