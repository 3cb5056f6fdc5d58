pub mod cleaner;
pub mod error;
pub mod event_type;
pub mod identifier;
pub mod subject;
pub mod subscription;

pub use cleaner::{EventTypeCleaner, clean_segment, clean_source};
pub use error::ValidationError;
pub use event_type::{EventType, Segment};
pub use identifier::SubscriptionSubjectIdentifier;
pub use subject::Subject;
pub use subscription::{
    CleanEventType, DeliveryConfig, ObjectMeta, Subscription, SubscriptionSpec, TypeMatching,
};
