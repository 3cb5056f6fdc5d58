pub mod backend;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod nats;
pub mod resync;
pub mod sync;
pub mod tracing;
pub mod utils;

pub use backend::Backend;
pub use backend::jetstream::JetStream;
pub use backend::nats_core::NatsCore;
pub use connection::{ConnectionHandler, ConnectionState};
pub use error::{BackendError, PartialSyncError};
pub use resync::{ResyncTrigger, StaticSubscriptions, SubscriptionSource};
pub use sync::SyncReport;

#[cfg(test)]
mod tests;
