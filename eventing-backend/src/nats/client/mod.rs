pub mod fake;
pub mod nats;
pub mod types;
