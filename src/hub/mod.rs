/// Broadcast hub: fan-out of ticks and position events to client
/// sessions
pub mod messages;
pub mod server;
pub mod session;
pub mod throttle;

pub use messages::{PositionOp, WsMessage};
pub use session::{ClientSession, SessionRole};
pub use throttle::{policy_from_config, ThrottlePolicy};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::SymbolRegistry;
use crate::types::{EngineConfig, Position, Tick};

pub struct BroadcastHub {
    sessions: RwLock<HashMap<Uuid, Arc<ClientSession>>>,
    registry: Arc<SymbolRegistry>,
    throttle: Box<dyn ThrottlePolicy>,
    queue_capacity: usize,
    ping_interval: Duration,
    pong_timeout: Duration,

    ticks_broadcast: AtomicU64,
    ticks_suppressed: AtomicU64,
}

impl BroadcastHub {
    pub fn new(registry: Arc<SymbolRegistry>, config: &EngineConfig) -> Self {
        BroadcastHub {
            sessions: RwLock::new(HashMap::new()),
            registry,
            throttle: policy_from_config(config.throttle_mode, config.throttle_drop_rate),
            queue_capacity: config.outbound_queue_capacity,
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs),
            ticks_broadcast: AtomicU64::new(0),
            ticks_suppressed: AtomicU64::new(0),
        }
    }

    pub async fn attach(&self) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(self.queue_capacity));
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, Arc::clone(&session));
        info!(session_id = %session.id, total = sessions.len(), "Session attached");
        session
    }

    pub async fn detach(&self, id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(&id) {
            session.close();
            info!(session_id = %id, total = sessions.len(), "Session detached");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Fan a tick out to every subscribed session. A disabled symbol
    /// is suppressed entirely; a full session queue coalesces, never
    /// back-pressures; enqueue order per (session, symbol) follows
    /// accept order.
    pub async fn broadcast_tick(&self, tick: &Tick) {
        if let Some(spec) = self.registry.get(&tick.symbol) {
            if spec.disabled {
                self.ticks_suppressed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.ticks_broadcast.fetch_add(1, Ordering::Relaxed);

        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if !session.is_subscribed(&tick.symbol).await {
                continue;
            }
            if self.throttle.should_drop(tick, session) {
                continue;
            }
            session
                .enqueue(WsMessage::Tick {
                    symbol: tick.symbol.clone(),
                    bid: tick.bid,
                    ask: tick.ask,
                    ts: tick.timestamp,
                })
                .await;
        }
    }

    /// Position events go to sessions authenticated as the owning
    /// account, and to admins.
    pub async fn broadcast_position(&self, account_id: u64, op: PositionOp, position: &Position) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if !session.sees_account(account_id).await {
                continue;
            }
            session
                .enqueue(WsMessage::Position {
                    op,
                    position: position.clone(),
                })
                .await;
        }
    }

    /// Periodic heartbeat: ping every session, then reap the ones
    /// that have been silent for a full ping cycle plus the pong
    /// timeout.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let silence_limit = self.ping_interval + self.pong_timeout;

        loop {
            interval.tick().await;
            let now = Utc::now();

            let stale: Vec<Uuid> = {
                let sessions = self.sessions.read().await;
                let mut stale = Vec::new();
                for (id, session) in sessions.iter() {
                    let last = session.last_activity().await;
                    if (now - last).to_std().unwrap_or_default() > silence_limit {
                        stale.push(*id);
                        continue;
                    }
                    session.enqueue(WsMessage::Ping).await;
                }
                stale
            };

            for id in stale {
                warn!(session_id = %id, "Session missed heartbeat, closing");
                self.detach(id).await;
            }
        }
    }

    pub fn ticks_broadcast(&self) -> u64 {
        self.ticks_broadcast.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (id, session) in sessions.drain() {
            session.close();
            debug!(session_id = %id, "Session closed on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::autogen;
    use crate::types::{SymbolCategory, ThrottleMode};

    fn config() -> EngineConfig {
        toml::from_str("").unwrap()
    }

    fn tick(symbol: &str, bid: f64) -> Tick {
        Tick {
            broker_id: 1,
            symbol: symbol.to_string(),
            bid,
            ask: bid + 0.0002,
            spread: 0.0002,
            timestamp: Utc::now(),
            lp_tag: "lp1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscription_filter() {
        let registry = Arc::new(SymbolRegistry::new(vec![]));
        registry.autogenerate("EURUSD").unwrap();
        let hub = BroadcastHub::new(registry, &config());

        let session = hub.attach().await;
        session.subscribe(vec!["EURUSD".to_string()]).await;

        hub.broadcast_tick(&tick("EURUSD", 1.0850)).await;
        hub.broadcast_tick(&tick("USDJPY", 155.00)).await;

        let batch = session.drain_queue().await;
        assert_eq!(batch.len(), 1);
        assert!(matches!(&batch[0], WsMessage::Tick { symbol, .. } if symbol == "EURUSD"));
    }

    #[tokio::test]
    async fn test_disabled_symbol_suppressed() {
        let registry = Arc::new(SymbolRegistry::new(vec![]));
        registry.autogenerate("EURUSD").unwrap();
        registry.set_disabled("EURUSD", true).unwrap();
        let hub = BroadcastHub::new(Arc::clone(&registry), &config());

        let session = hub.attach().await;
        session.subscribe(vec!["EURUSD".to_string()]).await;

        hub.broadcast_tick(&tick("EURUSD", 1.0850)).await;
        assert!(session.drain_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_per_symbol_ordering() {
        let registry = Arc::new(SymbolRegistry::new(vec![]));
        registry.autogenerate("EURUSD").unwrap();
        let hub = BroadcastHub::new(registry, &config());

        let session = hub.attach().await;
        session.subscribe(vec!["EURUSD".to_string()]).await;

        for i in 0..5 {
            hub.broadcast_tick(&tick("EURUSD", 1.08 + i as f64 * 0.0001)).await;
        }

        let batch = session.drain_queue().await;
        let bids: Vec<f64> = batch
            .iter()
            .filter_map(|m| match m {
                WsMessage::Tick { bid, .. } => Some(*bid),
                _ => None,
            })
            .collect();
        assert_eq!(bids.len(), 5);
        assert!(bids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_position_routing() {
        let registry = Arc::new(SymbolRegistry::new(vec![]));
        let hub = BroadcastHub::new(registry, &config());

        let owner = hub.attach().await;
        owner.login(Some(42), SessionRole::Trader).await;
        let admin = hub.attach().await;
        admin.login(None, SessionRole::Admin).await;
        let stranger = hub.attach().await;
        stranger.login(Some(7), SessionRole::Trader).await;

        let spec = autogen::spec_defaults("EURUSD", SymbolCategory::Forex);
        let position = Position {
            id: 1,
            account_id: 42,
            symbol: spec.symbol.clone(),
            side: crate::types::Side::Buy,
            volume: 0.10,
            open_price: 1.0850,
            open_time: Utc::now(),
            sl: None,
            tp: None,
            trailing_distance: None,
            trailing_high_water: None,
            swap_accum: 0.0,
            commission: 0.0,
            state: crate::types::PositionState::Open,
            close_price: None,
            close_time: None,
            close_reason: None,
        };

        hub.broadcast_position(42, PositionOp::Open, &position).await;

        assert_eq!(owner.drain_queue().await.len(), 1);
        assert_eq!(admin.drain_queue().await.len(), 1);
        assert!(stranger.drain_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_throttled_mode_drops_some() {
        let registry = Arc::new(SymbolRegistry::new(vec![]));
        registry.autogenerate("EURUSD").unwrap();
        let mut cfg = config();
        cfg.throttle_mode = ThrottleMode::Throttled;
        cfg.throttle_drop_rate = 1.0;
        let hub = BroadcastHub::new(registry, &cfg);

        let session = hub.attach().await;
        session.subscribe(vec!["EURUSD".to_string()]).await;

        for _ in 0..10 {
            hub.broadcast_tick(&tick("EURUSD", 1.0850)).await;
        }
        // Drop rate 1.0 suppresses every tick at the session edge
        assert!(session.drain_queue().await.is_empty());
    }
}
