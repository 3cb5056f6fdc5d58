use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cleaner::{EventTypeCleaner, clean_source};
use crate::error::ValidationError;
use crate::identifier::namespaced_name;

/// Identity of a Kubernetes object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// How the event types of a subscription are matched against published events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeMatching {
    /// Types are cleaned and scoped by the cleaned event source.
    #[default]
    Standard,
    /// Types are used verbatim.
    Exact,
}

/// Delivery tuning of a subscription, unset values fall back to configured defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    #[serde(default)]
    pub source: String,
    pub types: Vec<String>,
    #[serde(default)]
    pub type_matching: TypeMatching,
    pub sink: Url,
    #[serde(default)]
    pub config: DeliveryConfig,
}

/// A consumer's declared interest in a set of event types, delivered to a sink.
///
/// Subscriptions are owned by the Kubernetes API, the backend only reads them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub metadata: ObjectMeta,
    pub spec: SubscriptionSpec,
}

/// Event type as declared in the subscription next to its cleaned form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanEventType {
    pub original: String,
    pub clean: String,
}

impl Subscription {
    pub fn new(namespace: &str, name: &str, source: &str, types: &[&str], sink: Url) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: namespace.to_string(),
                name: name.to_string(),
                resource_version: None,
            },
            spec: SubscriptionSpec {
                source: source.to_string(),
                types: types.iter().map(|value| value.to_string()).collect(),
                type_matching: TypeMatching::default(),
                sink,
                config: DeliveryConfig::default(),
            },
        }
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// `<namespace>/<name>`, used as key for everything owned by this subscription.
    pub fn key_prefix(&self) -> String {
        namespaced_name(self.namespace(), self.name())
    }

    /// Declared event types without duplicates, in declaration order.
    pub fn unique_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.spec
            .types
            .iter()
            .map(String::as_str)
            .filter(|event_type| seen.insert(*event_type))
            .collect()
    }

    pub fn clean_event_types(
        &self,
        cleaner: &EventTypeCleaner,
    ) -> Result<Vec<CleanEventType>, ValidationError> {
        self.unique_types()
            .into_iter()
            .map(|event_type| {
                let clean = match self.spec.type_matching {
                    TypeMatching::Exact => event_type.to_string(),
                    TypeMatching::Standard => cleaner.clean(event_type)?,
                };
                Ok(CleanEventType {
                    original: event_type.to_string(),
                    clean,
                })
            })
            .collect()
    }

    /// Subjects this subscription is interested in, before any backend specific prefixing.
    ///
    /// With standard type matching the cleaned source is put in front of each cleaned type.
    pub fn logical_subjects(
        &self,
        cleaner: &EventTypeCleaner,
    ) -> Result<Vec<String>, ValidationError> {
        let clean_types = self.clean_event_types(cleaner)?;
        match self.spec.type_matching {
            TypeMatching::Exact => Ok(clean_types.into_iter().map(|t| t.clean).collect()),
            TypeMatching::Standard => {
                let source = clean_source(&self.spec.source);
                if source.is_empty() {
                    return Err(ValidationError::MissingSource {
                        namespace: self.namespace().to_string(),
                        name: self.name().to_string(),
                    });
                }
                Ok(clean_types
                    .into_iter()
                    .map(|t| format!("{source}.{}", t.clean))
                    .collect())
            }
        }
    }

    pub fn max_in_flight(&self, default: u32) -> u32 {
        self.spec.config.max_in_flight.unwrap_or(default)
    }

    pub fn ack_wait(&self, default: Duration) -> Duration {
        self.spec
            .config
            .ack_wait_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}
