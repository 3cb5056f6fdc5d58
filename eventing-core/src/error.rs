use thiserror::Error;

/// Raised when an event type or a subscription cannot be represented.
///
/// Validation errors are never retried, they are surfaced to whoever attempted the
/// construction.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event type segment \"{segment}\" is missing")]
    MissingSegment { segment: &'static str },

    #[error("event type segment \"{segment}\" must not contain '.': {value}")]
    SeparatorInSegment { segment: &'static str, value: String },

    #[error("event type prefix \"{prefix}\" must consist of exactly three segments")]
    InvalidPrefix { prefix: String },

    #[error("event type \"{event_type}\" does not start with prefix \"{prefix}\"")]
    PrefixMismatch { prefix: String, event_type: String },

    #[error("event type \"{event_type}\" needs an application name, two event name segments and a version")]
    IncompleteEventType { event_type: String },

    #[error("can't have empty nats subject string")]
    EmptySubject,

    #[error("subscription {namespace}/{name} uses standard type matching but declares no source")]
    MissingSource { namespace: String, name: String },
}
