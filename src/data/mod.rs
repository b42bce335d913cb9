pub mod backend;
pub mod jsonl;
pub mod ohlc;
pub mod sqlite;
pub mod tick_ring;
pub mod tick_store;

pub use backend::TickBackend;
pub use jsonl::JsonlBackend;
pub use ohlc::{OhlcCache, TIMEFRAMES};
pub use sqlite::SqliteBackend;
pub use tick_ring::TickRing;
pub use tick_store::{TickStore, TickStoreStats};
