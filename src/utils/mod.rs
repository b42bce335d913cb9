pub mod idempotency;
pub mod time;

pub use idempotency::order_intent_key;
pub use time::*;
