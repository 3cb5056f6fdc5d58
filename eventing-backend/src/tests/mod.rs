mod nats_core;
mod resync;
mod sync;
mod utils;
