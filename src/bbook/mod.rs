/// B-book engine: account, position and order state, filled against
/// the internalized quote stream
pub mod accounts;
pub mod engine;
pub mod margin;
pub mod rate_limit;
pub mod swap;

pub use accounts::{AccountBook, AccountManager};
pub use engine::{BBookEngine, MarketOrderRequest, PendingOrderRequest};
pub use margin::LatestQuote;
pub use swap::{run_swap_scheduler, SwapSchedule};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::engine::{BBookEngine, MarketOrderRequest, PendingOrderRequest};
    use crate::error::EngineError;
    use crate::hub::BroadcastHub;
    use crate::ledger::Ledger;
    use crate::registry::{autogen, SymbolRegistry};
    use crate::types::{
        CloseReason, EngineConfig, Expiration, FillPolicy, OrderType, PositionState, Side,
        SymbolCategory,
    };

    struct Harness {
        engine: Arc<BBookEngine>,
        _dir: tempfile::TempDir,
    }

    async fn harness(config_overrides: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config: EngineConfig = toml::from_str(config_overrides).unwrap();

        let registry = Arc::new(SymbolRegistry::new(vec![]));
        registry.autogenerate("EURUSD").unwrap();

        let ledger =
            Arc::new(Ledger::open(dir.path().join("ledger/ledger.log")).await.unwrap());
        let hub = Arc::new(BroadcastHub::new(Arc::clone(&registry), &config));
        let engine = Arc::new(BBookEngine::new(registry, ledger, hub, &config));

        Harness { engine, _dir: dir }
    }

    async fn funded_account(h: &Harness, amount: f64) -> u64 {
        let account = h
            .engine
            .create_account("demo".to_string(), "USD".to_string(), "default".to_string(), 100)
            .await;
        h.engine.deposit(account.id, amount).await.unwrap();
        account.id
    }

    fn market(account_id: u64, side: Side, volume: f64) -> MarketOrderRequest {
        MarketOrderRequest {
            account_id,
            symbol: "EURUSD".to_string(),
            side,
            volume,
            sl: None,
            tp: None,
            trailing_distance: None,
            fill_policy: FillPolicy::Ioc,
            nonce: String::new(),
        }
    }

    #[tokio::test]
    async fn test_market_fill_at_ask_and_commission() {
        let h = harness("").await;
        // Commission via symbol spec override
        let mut spec = autogen::spec_defaults("EURUSD", SymbolCategory::Forex);
        spec.commission_per_lot = 7.0;
        h.engine_registry().register(spec).unwrap();
        funded_account(&h, 10_000.0).await;

        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;
        let position = h.engine.place_market_order(market(1, Side::Buy, 0.10)).await.unwrap();

        assert_eq!(position.open_price, 1.08520);
        assert_eq!(position.state, PositionState::Open);
        assert!((position.commission - 0.70).abs() < 1e-9);

        let (account, equity, used) = h.engine.account_snapshot(1).await.unwrap();
        assert!((account.balance - 9_999.30).abs() < 1e-9);
        // Mark-to-market carries the spread as an immediate loss
        assert!(equity < account.balance);
        assert!(used > 0.0);
    }

    #[tokio::test]
    async fn test_sell_fills_at_bid() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;

        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;
        let position = h.engine.place_market_order(market(1, Side::Sell, 0.10)).await.unwrap();
        assert_eq!(position.open_price, 1.08500);
    }

    #[tokio::test]
    async fn test_order_validation_errors() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        // Unknown symbol
        let mut req = market(1, Side::Buy, 0.10);
        req.symbol = "GBPUSD".to_string();
        assert!(matches!(
            h.engine.place_market_order(req).await,
            Err(EngineError::UnknownSymbol(_))
        ));

        // Volume not on the step grid
        let req = market(1, Side::Buy, 0.013);
        assert!(matches!(
            h.engine.place_market_order(req).await,
            Err(EngineError::InvalidVolume(_))
        ));

        // Volume above max
        let req = market(1, Side::Buy, 500.0);
        assert!(matches!(
            h.engine.place_market_order(req).await,
            Err(EngineError::InvalidVolume(_))
        ));

        // SL on the wrong side for a BUY
        let mut req = market(1, Side::Buy, 0.10);
        req.sl = Some(1.20000);
        assert!(matches!(
            h.engine.place_market_order(req).await,
            Err(EngineError::InvalidSlTp(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_quote_rejected() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;

        // No quote at all
        assert!(matches!(
            h.engine.place_market_order(market(1, Side::Buy, 0.10)).await,
            Err(EngineError::StaleQuote { .. })
        ));

        // Old quote
        h.engine
            .on_tick("EURUSD", 1.08500, 1.08520, Utc::now() - chrono::Duration::seconds(30))
            .await;
        assert!(matches!(
            h.engine.place_market_order(market(1, Side::Buy, 0.10)).await,
            Err(EngineError::StaleQuote { age_ms, .. }) if age_ms > 5000
        ));
    }

    #[tokio::test]
    async fn test_insufficient_margin_and_fok() {
        let h = harness("").await;
        funded_account(&h, 10.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        // 1 lot needs ~10.85 margin at 1% / leverage 100
        assert!(matches!(
            h.engine.place_market_order(market(1, Side::Buy, 10.0)).await,
            Err(EngineError::InsufficientMargin { .. })
        ));

        let mut req = market(1, Side::Buy, 10.0);
        req.fill_policy = FillPolicy::Fok;
        assert!(matches!(
            h.engine.place_market_order(req).await,
            Err(EngineError::FokRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_account_and_symbol() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        h.engine.accounts.set_disabled(1, true).await.unwrap();
        assert!(matches!(
            h.engine.place_market_order(market(1, Side::Buy, 0.10)).await,
            Err(EngineError::AccountDisabled(1))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_nonce_returns_original_fill() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        let mut req = market(1, Side::Buy, 0.10);
        req.nonce = "client-retry-1".to_string();
        let first = h.engine.place_market_order(req.clone()).await.unwrap();
        let second = h.engine.place_market_order(req).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.engine.open_positions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sl_trigger_on_buy() {
        // Scenario: BUY 0.10 EURUSD @ ask 1.10000 with sl 1.09800.
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;

        h.engine.on_tick("EURUSD", 1.09998, 1.10000, Utc::now()).await;
        let mut req = market(1, Side::Buy, 0.10);
        req.sl = Some(1.09800);
        let position = h.engine.place_market_order(req).await.unwrap();
        assert_eq!(position.open_price, 1.10000);

        h.engine.on_tick("EURUSD", 1.09950, 1.09952, Utc::now()).await;
        h.engine.on_tick("EURUSD", 1.09850, 1.09852, Utc::now()).await;
        let still_open = h.engine.get_position(1, position.id).await.unwrap();
        assert_eq!(still_open.state, PositionState::Open);

        h.engine.on_tick("EURUSD", 1.09790, 1.09792, Utc::now()).await;
        let closed = h.engine.get_position(1, position.id).await.unwrap();
        assert_eq!(closed.state, PositionState::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Sl));
        assert_eq!(closed.close_price, Some(1.09790));

        // pnl = (1.09790 - 1.10000) * 0.10 * 100000 = -21.00 USD
        let (account, _, _) = h.engine.account_snapshot(1).await.unwrap();
        assert!((account.balance - 9_979.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_trailing_stop_on_buy() {
        // Scenario: BUY 1.0 @ 1.10000, trailing 0.00050; high water
        // reaches 1.10090, trigger at bid 1.10040.
        let h = harness("").await;
        funded_account(&h, 100_000.0).await;

        h.engine.on_tick("EURUSD", 1.09998, 1.10000, Utc::now()).await;
        let mut req = market(1, Side::Buy, 1.0);
        req.trailing_distance = Some(0.00050);
        let position = h.engine.place_market_order(req).await.unwrap();

        for bid in [1.10020, 1.10080, 1.10090, 1.10060] {
            h.engine.on_tick("EURUSD", bid, bid + 0.00002, Utc::now()).await;
            let p = h.engine.get_position(1, position.id).await.unwrap();
            assert_eq!(p.state, PositionState::Open, "still open at bid {}", bid);
        }

        h.engine.on_tick("EURUSD", 1.10040, 1.10042, Utc::now()).await;
        let closed = h.engine.get_position(1, position.id).await.unwrap();
        assert_eq!(closed.state, PositionState::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Trail));
        assert_eq!(closed.close_price, Some(1.10040));

        // pnl = (1.10040 - 1.10000) * 1.0 * 100000 = +40 USD
        let (account, _, _) = h.engine.account_snapshot(1).await.unwrap();
        assert!((account.balance - 100_040.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_tp_trigger_on_sell() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;

        h.engine.on_tick("EURUSD", 1.10000, 1.10002, Utc::now()).await;
        let mut req = market(1, Side::Sell, 0.10);
        req.tp = Some(1.09900);
        let position = h.engine.place_market_order(req).await.unwrap();
        assert_eq!(position.open_price, 1.10000);

        // SELL takes profit when ask falls to tp
        h.engine.on_tick("EURUSD", 1.09898, 1.09900, Utc::now()).await;
        let closed = h.engine.get_position(1, position.id).await.unwrap();
        assert_eq!(closed.state, PositionState::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Tp));
        assert_eq!(closed.close_price, Some(1.09900));
    }

    #[tokio::test]
    async fn test_manual_close_is_idempotent() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;

        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;
        let position = h.engine.place_market_order(market(1, Side::Buy, 0.10)).await.unwrap();

        let first = h.engine.close_position(1, position.id).await.unwrap();
        assert_eq!(first.state, PositionState::Closed);
        assert_eq!(first.close_reason, Some(CloseReason::Manual));

        // Second close is a no-op returning the settled position
        let second = h.engine.close_position(1, position.id).await.unwrap();
        assert_eq!(second.close_time, first.close_time);
        assert_eq!(second.close_reason, Some(CloseReason::Manual));
    }

    #[tokio::test]
    async fn test_limit_order_triggers_and_fills() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        h.engine
            .place_pending_order(PendingOrderRequest {
                account_id: 1,
                symbol: "EURUSD".to_string(),
                order_type: OrderType::Limit,
                side: Side::Buy,
                volume: 0.10,
                price: 1.08000,
                stop_price: None,
                sl: None,
                tp: None,
                expiration: Expiration::Gtc,
                fill_policy: FillPolicy::Ioc,
            })
            .await
            .unwrap();

        // Above the limit: nothing happens
        h.engine.on_tick("EURUSD", 1.08200, 1.08220, Utc::now()).await;
        assert_eq!(h.engine.pending_orders(1).await.unwrap().len(), 1);

        // Ask crosses the limit: order converts to a position
        h.engine.on_tick("EURUSD", 1.07970, 1.07990, Utc::now()).await;
        assert!(h.engine.pending_orders(1).await.unwrap().is_empty());
        let positions = h.engine.open_positions(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].open_price, 1.07990);
    }

    #[tokio::test]
    async fn test_stop_order_triggers() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        h.engine
            .place_pending_order(PendingOrderRequest {
                account_id: 1,
                symbol: "EURUSD".to_string(),
                order_type: OrderType::Stop,
                side: Side::Buy,
                volume: 0.10,
                price: 1.09000,
                stop_price: None,
                sl: None,
                tp: None,
                expiration: Expiration::Gtc,
                fill_policy: FillPolicy::Ioc,
            })
            .await
            .unwrap();

        h.engine.on_tick("EURUSD", 1.08990, 1.09010, Utc::now()).await;
        let positions = h.engine.open_positions(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].open_price, 1.09010);
    }

    #[tokio::test]
    async fn test_order_expiration() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        h.engine
            .place_pending_order(PendingOrderRequest {
                account_id: 1,
                symbol: "EURUSD".to_string(),
                order_type: OrderType::Limit,
                side: Side::Buy,
                volume: 0.10,
                price: 1.08000,
                stop_price: None,
                sl: None,
                tp: None,
                expiration: Expiration::Date(Utc::now() + chrono::Duration::seconds(1)),
                fill_policy: FillPolicy::Ioc,
            })
            .await
            .unwrap();

        h.engine.sweep_expired(Utc::now()).await;
        assert_eq!(h.engine.pending_orders(1).await.unwrap().len(), 1);

        h.engine.sweep_expired(Utc::now() + chrono::Duration::seconds(2)).await;
        assert!(h.engine.pending_orders(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_order() {
        let h = harness("").await;
        funded_account(&h, 10_000.0).await;
        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;

        let order = h
            .engine
            .place_pending_order(PendingOrderRequest {
                account_id: 1,
                symbol: "EURUSD".to_string(),
                order_type: OrderType::Limit,
                side: Side::Buy,
                volume: 0.10,
                price: 1.08000,
                stop_price: None,
                sl: None,
                tp: None,
                expiration: Expiration::Gtc,
                fill_policy: FillPolicy::Ioc,
            })
            .await
            .unwrap();

        h.engine.cancel_order(1, order.id).await.unwrap();
        assert!(h.engine.pending_orders(1).await.unwrap().is_empty());
        assert!(matches!(
            h.engine.cancel_order(1, order.id).await,
            Err(EngineError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_out_cascade_closes_worst_first() {
        // Three 1-lot positions on separate symbols with 20% margin:
        // used = 3 * 200. Losses: A -800, B -150, C +50. At stop-out
        // 50% the engine sheds A, then B, and keeps C.
        let h = harness("margin_call_pct = 80.0\nstop_out_pct = 50.0").await;

        let registry_spec = |symbol: &str| {
            let mut spec = autogen::spec_defaults(symbol, SymbolCategory::Forex);
            spec.margin_percent = 20.0;
            spec
        };
        for symbol in ["AAAUSD", "BBBUSD", "CCCUSD"] {
            h.engine_registry().register(registry_spec(symbol)).unwrap();
        }
        funded_account(&h, 1_000.0).await;

        let now = Utc::now();
        for symbol in ["AAAUSD", "BBBUSD", "CCCUSD"] {
            h.engine.on_tick(symbol, 1.0, 1.0, now).await;
            let mut req = market(1, Side::Buy, 1.0);
            req.symbol = symbol.to_string();
            h.engine.place_market_order(req).await.unwrap();
        }
        let positions = h.engine.open_positions(1).await.unwrap();
        assert_eq!(positions.len(), 3);
        let (pa, pb, pc) = (positions[0].id, positions[1].id, positions[2].id);

        // B down 150, C up 50: margin level stays healthy
        h.engine.on_tick("BBBUSD", 0.99850, 0.99850, now).await;
        h.engine.on_tick("CCCUSD", 1.00050, 1.00050, now).await;
        assert_eq!(h.engine.open_positions(1).await.unwrap().len(), 3);

        // A down 800: equity 100 against 600 used -> cascade
        h.engine.on_tick("AAAUSD", 0.99200, 0.99200, now).await;

        let a = h.engine.get_position(1, pa).await.unwrap();
        let b = h.engine.get_position(1, pb).await.unwrap();
        let c = h.engine.get_position(1, pc).await.unwrap();
        assert_eq!(a.state, PositionState::Closed);
        assert_eq!(a.close_reason, Some(CloseReason::StopOut));
        assert_eq!(b.state, PositionState::Closed);
        assert_eq!(b.close_reason, Some(CloseReason::StopOut));
        assert_eq!(c.state, PositionState::Open);

        // balance = 1000 - 800 - 150 = 50; equity = 50 + 50 unrealized
        let (account, equity, used) = h.engine.account_snapshot(1).await.unwrap();
        assert!((account.balance - 50.0).abs() < 1e-6);
        assert!((equity - 100.0).abs() < 1e-6);
        assert!((used - 200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_swap_applied_per_open_position() {
        let h = harness("").await;
        let mut spec = autogen::spec_defaults("EURUSD", SymbolCategory::Forex);
        spec.swap_long = -2.5;
        spec.swap_short = 0.5;
        h.engine_registry().register(spec).unwrap();
        funded_account(&h, 10_000.0).await;

        h.engine.on_tick("EURUSD", 1.08500, 1.08520, Utc::now()).await;
        let position = h.engine.place_market_order(market(1, Side::Buy, 2.0)).await.unwrap();

        let applied = h.engine.apply_swap(false).await.unwrap();
        assert_eq!(applied, 1);

        let p = h.engine.get_position(1, position.id).await.unwrap();
        assert!((p.swap_accum - (-5.0)).abs() < 1e-9);
        let (account, _, _) = h.engine.account_snapshot(1).await.unwrap();
        assert!((account.balance - 9_995.0).abs() < 1e-9);

        // Triple day applies three nights at once
        let applied = h.engine.apply_swap(true).await.unwrap();
        assert_eq!(applied, 1);
        let p = h.engine.get_position(1, position.id).await.unwrap();
        assert!((p.swap_accum - (-20.0)).abs() < 1e-9);
    }

    impl Harness {
        fn engine_registry(&self) -> Arc<SymbolRegistry> {
            self.engine.registry_handle()
        }
    }
}
