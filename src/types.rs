/// Core type definitions for the trading engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized quote delivered by an LP adapter. This is the only
/// ingress contract the core accepts; adapter wire formats (FIX,
/// vendor JSON) are converted upstream.
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub ts: DateTime<Utc>,
    pub lp_tag: String,
}

/// A single bid/ask tick. Immutable after creation. Spread is stored
/// explicitly so consumers never re-derive it and sub-cent rounding
/// survives the round trip through the day files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub broker_id: u32,
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "lp")]
    pub lp_tag: String,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// Instrument category, inferred on auto-registration and overridable
/// by admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolCategory {
    Forex,
    Metal,
    Index,
    Crypto,
    Stock,
    Commodity,
    Other,
}

impl SymbolCategory {
    pub fn as_str(&self) -> &str {
        match self {
            SymbolCategory::Forex => "forex",
            SymbolCategory::Metal => "metal",
            SymbolCategory::Index => "index",
            SymbolCategory::Crypto => "crypto",
            SymbolCategory::Stock => "stock",
            SymbolCategory::Commodity => "commodity",
            SymbolCategory::Other => "other",
        }
    }
}

/// Per-symbol trading specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub category: SymbolCategory,
    pub description: String,
    pub contract_size: f64,
    pub pip_size: f64,
    pub pip_value: f64,
    pub min_volume: f64,
    pub volume_step: f64,
    pub max_volume: f64,
    pub margin_percent: f64,
    pub commission_per_lot: f64,
    /// Account-currency cash per lot applied at each rollover night
    pub swap_long: f64,
    pub swap_short: f64,
    pub disabled: bool,
}

/// Account group with risk thresholds that override the global config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: String,
    pub margin_call_pct: f64,
    pub stop_out_pct: f64,
    pub default_leverage: u32,
    pub commission_per_lot: f64,
}

/// OHLC bar over a fixed timeframe. `bar_start` is aligned:
/// bar_start % timeframe_secs == 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcBar {
    pub symbol: String,
    pub timeframe_secs: u32,
    pub bar_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Tick count within the bar
    pub volume: u64,
}

/// Client account. Balance is always the sum of ledger entries;
/// equity adds unrealized P/L of open positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub username: String,
    pub currency: String,
    pub balance: f64,
    pub credit: f64,
    pub group_id: String,
    pub leverage: u32,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// +1 for BUY, -1 for SELL; multiplies price deltas into signed P/L
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Manual,
    Sl,
    Tp,
    Trail,
    StopOut,
    MarginCall,
}

impl CloseReason {
    pub fn as_str(&self) -> &str {
        match self {
            CloseReason::Manual => "MANUAL",
            CloseReason::Sl => "SL",
            CloseReason::Tp => "TP",
            CloseReason::Trail => "TRAIL",
            CloseReason::StopOut => "STOP_OUT",
            CloseReason::MarginCall => "MARGIN_CALL",
        }
    }
}

/// Open or closed position owned by the B-book engine. Immutable after
/// state == Closed except for the final close fields set in the same
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    /// Lots, a multiple of the symbol's volume_step
    pub volume: f64,
    pub open_price: f64,
    pub open_time: DateTime<Utc>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub trailing_distance: Option<f64>,
    pub trailing_high_water: Option<f64>,
    pub swap_accum: f64,
    pub commission: f64,
    pub state: PositionState,
    pub close_price: Option<f64>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Triggered,
    Filled,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillPolicy {
    Fok,
    Ioc,
    Return,
}

/// Pending-order expiration policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Expiration {
    Gtc,
    Day,
    Date(DateTime<Utc>),
}

/// Pending order. Triggered orders become Positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub account_id: u64,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub stop_price: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub expiration: Expiration,
    pub fill_policy: FillPolicy,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKind {
    Deposit,
    Withdrawal,
    Adjustment,
    TradePnl,
    Commission,
    Swap,
    Bonus,
}

impl LedgerKind {
    pub fn as_str(&self) -> &str {
        match self {
            LedgerKind::Deposit => "DEPOSIT",
            LedgerKind::Withdrawal => "WITHDRAWAL",
            LedgerKind::Adjustment => "ADJUSTMENT",
            LedgerKind::TradePnl => "TRADE_PNL",
            LedgerKind::Commission => "COMMISSION",
            LedgerKind::Swap => "SWAP",
            LedgerKind::Bonus => "BONUS",
        }
    }
}

/// Append-only journal entry. The balance of an account at time t is
/// the sum of its entries with timestamp <= t.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub account_id: u64,
    pub kind: LedgerKind,
    pub amount: f64,
    pub ref_position_id: Option<u64>,
    pub ref_order_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThrottleMode {
    Full,
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickBackendKind {
    Jsonl,
    Sqlite,
}

/// One entry of the ordered auto-categorization pattern list. Matching
/// is substring-based; the first matching entry wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryPattern {
    pub pattern: String,
    pub category: SymbolCategory,
}

/// Engine configuration, loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    // Identity & layout
    #[serde(default = "defaults::broker_id")]
    pub broker_id: u32,
    #[serde(default = "defaults::data_root")]
    pub data_root: String,
    #[serde(default = "defaults::ws_bind")]
    pub ws_bind: String,

    // Tick store
    #[serde(default = "defaults::ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "defaults::write_queue_capacity")]
    pub write_queue_capacity: usize,
    #[serde(default = "defaults::write_batch_max")]
    pub write_batch_max: usize,
    #[serde(default = "defaults::write_batch_interval_ms")]
    pub write_batch_interval_ms: u64,
    #[serde(default = "defaults::tick_backend")]
    pub tick_backend: TickBackendKind,

    // Retention
    #[serde(default = "defaults::retention_days")]
    pub retention_days: u32,
    #[serde(default = "defaults::retention_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,
    #[serde(default = "defaults::compression_enabled")]
    pub compression_enabled: bool,

    // OHLC
    #[serde(default = "defaults::ohlc_history_bars")]
    pub ohlc_history_bars: usize,
    #[serde(default = "defaults::ohlc_idle_days")]
    pub ohlc_idle_days: u32,

    // Broadcast hub
    #[serde(default = "defaults::outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "defaults::throttle_mode")]
    pub throttle_mode: ThrottleMode,
    #[serde(default = "defaults::throttle_drop_rate")]
    pub throttle_drop_rate: f64,
    #[serde(default = "defaults::ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "defaults::pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "defaults::session_read_deadline_secs")]
    pub session_read_deadline_secs: u64,

    // B-book
    #[serde(default = "defaults::stale_quote_threshold_secs")]
    pub stale_quote_threshold_secs: u64,
    #[serde(default = "defaults::margin_call_pct")]
    pub margin_call_pct: f64,
    #[serde(default = "defaults::stop_out_pct")]
    pub stop_out_pct: f64,
    #[serde(default = "defaults::order_deadline_secs")]
    pub order_deadline_secs: u64,
    #[serde(default = "defaults::order_rate_limit_per_min")]
    pub order_rate_limit_per_min: u32,

    // Swap rollover
    #[serde(default = "defaults::swap_rollover_time")]
    pub swap_rollover_time: String,
    #[serde(default = "defaults::swap_rollover_tz")]
    pub swap_rollover_tz: String,
    #[serde(default = "defaults::triple_swap_weekday")]
    pub triple_swap_weekday: String,

    // Quote ingestion
    #[serde(default = "defaults::quote_clock_skew_secs")]
    pub quote_clock_skew_secs: u64,
    #[serde(default = "defaults::ingest_queue_capacity")]
    pub ingest_queue_capacity: usize,

    // Simulated LP feed (local runs only)
    #[serde(default)]
    pub sim_feed: bool,
    #[serde(default = "defaults::sim_symbols")]
    pub sim_symbols: Vec<String>,

    // Auto-categorization pattern list; the built-in list applies when empty
    #[serde(default)]
    pub category_patterns: Vec<CategoryPattern>,

    // Logging
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    // Shutdown
    #[serde(default = "defaults::drain_deadline_secs")]
    pub drain_deadline_secs: u64,
}

mod defaults {
    use super::{ThrottleMode, TickBackendKind};

    pub fn broker_id() -> u32 { 1 }
    pub fn data_root() -> String { "data".to_string() }
    pub fn ws_bind() -> String { "0.0.0.0:9301".to_string() }
    pub fn ring_capacity() -> usize { 10_000 }
    pub fn write_queue_capacity() -> usize { 4096 }
    pub fn write_batch_max() -> usize { 256 }
    pub fn write_batch_interval_ms() -> u64 { 200 }
    pub fn tick_backend() -> TickBackendKind { TickBackendKind::Jsonl }
    pub fn retention_days() -> u32 { 180 }
    pub fn retention_sweep_interval_secs() -> u64 { 86_400 }
    pub fn compression_enabled() -> bool { true }
    pub fn ohlc_history_bars() -> usize { 5000 }
    pub fn ohlc_idle_days() -> u32 { 7 }
    pub fn outbound_queue_capacity() -> usize { 1024 }
    pub fn throttle_mode() -> ThrottleMode { ThrottleMode::Full }
    pub fn throttle_drop_rate() -> f64 { 0.0 }
    pub fn ping_interval_secs() -> u64 { 30 }
    pub fn pong_timeout_secs() -> u64 { 10 }
    pub fn session_read_deadline_secs() -> u64 { 60 }
    pub fn stale_quote_threshold_secs() -> u64 { 5 }
    pub fn margin_call_pct() -> f64 { 100.0 }
    pub fn stop_out_pct() -> f64 { 50.0 }
    pub fn order_deadline_secs() -> u64 { 5 }
    pub fn order_rate_limit_per_min() -> u32 { 60 }
    pub fn swap_rollover_time() -> String { "17:00".to_string() }
    pub fn swap_rollover_tz() -> String { "America/New_York".to_string() }
    pub fn triple_swap_weekday() -> String { "Wed".to_string() }
    pub fn quote_clock_skew_secs() -> u64 { 3600 }
    pub fn ingest_queue_capacity() -> usize { 8192 }
    pub fn sim_symbols() -> Vec<String> {
        vec!["EURUSD".to_string(), "USDJPY".to_string(), "BTCUSD".to_string()]
    }
    pub fn log_level() -> String { "info".to_string() }
    pub fn drain_deadline_secs() -> u64 { 30 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.ring_capacity, 10_000);
        assert_eq!(config.retention_days, 180);
        assert_eq!(config.outbound_queue_capacity, 1024);
        assert_eq!(config.throttle_mode, ThrottleMode::Full);
        assert_eq!(config.tick_backend, TickBackendKind::Jsonl);
        assert_eq!(config.stop_out_pct, 50.0);
    }

    #[test]
    fn test_tick_serde_field_names() {
        let tick = Tick {
            broker_id: 1,
            symbol: "EURUSD".to_string(),
            bid: 1.0850,
            ask: 1.0852,
            spread: 0.0002,
            timestamp: Utc::now(),
            lp_tag: "lp1".to_string(),
        };
        let json = serde_json::to_string(&tick).unwrap();
        assert!(json.contains("\"lp\":\"lp1\""));
        assert!(!json.contains("lp_tag"));
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }
}
