use std::fmt;

use sha2::{Digest, Sha256};

/// Separator between namespace, name and subject in namespaced names.
pub const SEPARATOR: &str = "/";

/// Number of digest bytes kept for consumer names, giving 32 hex characters.
const CONSUMER_NAME_BYTES: usize = 16;

/// Identifies one backend subscriber of a subscription.
///
/// A subscription filtering on N event types owns N identifiers, one per backend subject.
/// The identifier is a pure function of namespace, name and subject, which makes
/// re-running a sync with unchanged inputs a no-op.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionSubjectIdentifier {
    consumer_name: String,
    namespace: String,
    name: String,
    subject: String,
}

impl SubscriptionSubjectIdentifier {
    pub fn new(namespace: &str, name: &str, subject: &str) -> Self {
        Self {
            consumer_name: compute_consumer_name(namespace, name, subject),
            namespace: namespace.to_string(),
            name: name.to_string(),
            subject: subject.to_string(),
        }
    }

    /// Name of the durable JetStream consumer.
    ///
    /// JetStream recommends names of 32 characters, the name is therefore derived from a
    /// digest of namespace, name and subject.
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// `<namespace>/<name>/<subject>`
    pub fn namespaced_subject_name(&self) -> String {
        [
            self.namespace.as_str(),
            self.name.as_str(),
            self.subject.as_str(),
        ]
        .join(SEPARATOR)
    }

    /// `<namespace>/<name>`
    pub fn namespaced_name(&self) -> String {
        namespaced_name(&self.namespace, &self.name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns true if this identifier was derived from the given subscription.
    pub fn belongs_to(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl fmt::Display for SubscriptionSubjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.namespaced_subject_name(), self.consumer_name)
    }
}

pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{namespace}{SEPARATOR}{name}")
}

/// Every part is length-prefixed so separators inside a part can't shift it into the
/// next one.
fn compute_consumer_name(namespace: &str, name: &str, subject: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [namespace, name, subject] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..CONSUMER_NAME_BYTES])
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::SubscriptionSubjectIdentifier;

    #[test]
    fn identical_inputs_give_identical_identifiers() {
        let a = SubscriptionSubjectIdentifier::new("default", "orders", "kyma.app.order.created.v1");
        let b = SubscriptionSubjectIdentifier::new("default", "orders", "kyma.app.order.created.v1");
        assert_eq!(a, b);
        assert_eq!(a.consumer_name(), b.consumer_name());
        assert_eq!(a.consumer_name().len(), 32);
    }

    #[test]
    fn differing_inputs_give_differing_identifiers() {
        let identifiers = [
            SubscriptionSubjectIdentifier::new("default", "orders", "kyma.a.b.c.v1"),
            SubscriptionSubjectIdentifier::new("other", "orders", "kyma.a.b.c.v1"),
            SubscriptionSubjectIdentifier::new("default", "invoices", "kyma.a.b.c.v1"),
            SubscriptionSubjectIdentifier::new("default", "orders", "kyma.a.b.c.v2"),
            // Separators must not make different triples collide.
            SubscriptionSubjectIdentifier::new("default", "orders/kyma", "a.b.c.v1"),
        ];

        let unique: HashSet<_> = identifiers.iter().collect();
        assert_eq!(unique.len(), identifiers.len());

        let consumer_names: HashSet<_> = identifiers.iter().map(|id| id.consumer_name()).collect();
        assert_eq!(consumer_names.len(), identifiers.len());
    }

    #[test]
    fn separators_inside_parts_do_not_collide() {
        let first = SubscriptionSubjectIdentifier::new("a/b", "c", "kyma.a.b.c.v1");
        let second = SubscriptionSubjectIdentifier::new("a", "b/c", "kyma.a.b.c.v1");
        assert_eq!(first.namespaced_subject_name(), second.namespaced_subject_name());
        assert_ne!(first.consumer_name(), second.consumer_name());
    }

    #[test]
    fn namespaced_names() {
        let id = SubscriptionSubjectIdentifier::new("default", "orders", "kyma.a.b.c.v1");
        assert_eq!(id.namespaced_name(), "default/orders");
        assert_eq!(id.namespaced_subject_name(), "default/orders/kyma.a.b.c.v1");
        assert!(id.belongs_to("default", "orders"));
        assert!(!id.belongs_to("default", "invoices"));
    }
}
