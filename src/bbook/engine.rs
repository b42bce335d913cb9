/// B-book engine: fills client orders against the latest internalized
/// quote and manages the resulting positions
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::accounts::{AccountBook, AccountManager};
use super::margin::{
    close_side_price, open_side_price, raw_pnl, required_margin, to_account_currency, LatestQuote,
};
use super::rate_limit::OrderRateLimiter;
use crate::error::{EngineError, Result};
use crate::hub::{BroadcastHub, PositionOp};
use crate::ledger::{Ledger, LedgerDraft};
use crate::registry::{sanitize_symbol, SymbolRegistry};
use crate::types::{
    Account, CloseReason, EngineConfig, Expiration, FillPolicy, LedgerKind, Order, OrderState,
    OrderType, Position, PositionState, Side, SymbolSpec,
};
use crate::utils::order_intent_key;

#[derive(Debug, Clone)]
pub struct MarketOrderRequest {
    pub account_id: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub trailing_distance: Option<f64>,
    pub fill_policy: FillPolicy,
    /// Client idempotency nonce; empty disables deduplication
    pub nonce: String,
}

#[derive(Debug, Clone)]
pub struct PendingOrderRequest {
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
}

/// A close whose ledger write must be retried. The close itself is
/// authoritative the moment the position enters Closing.
struct PendingClose {
    account_id: u64,
    position_id: u64,
    drafts: Vec<LedgerDraft>,
}

pub struct BBookEngine {
    registry: Arc<SymbolRegistry>,
    ledger: Arc<Ledger>,
    hub: Arc<BroadcastHub>,
    pub accounts: AccountManager,

    /// symbol -> accounts holding open positions or pending orders
    symbol_index: RwLock<HashMap<String, BTreeSet<u64>>>,
    quotes: RwLock<HashMap<String, LatestQuote>>,

    next_position_id: AtomicU64,
    next_order_id: AtomicU64,
    intents: Mutex<HashMap<String, u64>>,
    rate_limiter: OrderRateLimiter,
    pending_closes: Mutex<Vec<PendingClose>>,

    stale_threshold_ms: i64,
    margin_call_pct: f64,
    stop_out_pct: f64,
    order_deadline: Duration,
}

impl BBookEngine {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        ledger: Arc<Ledger>,
        hub: Arc<BroadcastHub>,
        config: &EngineConfig,
    ) -> Self {
        BBookEngine {
            registry,
            ledger,
            hub,
            accounts: AccountManager::new(),
            symbol_index: RwLock::new(HashMap::new()),
            quotes: RwLock::new(HashMap::new()),
            next_position_id: AtomicU64::new(1),
            next_order_id: AtomicU64::new(1),
            intents: Mutex::new(HashMap::new()),
            rate_limiter: OrderRateLimiter::new(config.order_rate_limit_per_min),
            pending_closes: Mutex::new(Vec::new()),
            stale_threshold_ms: (config.stale_quote_threshold_secs * 1000) as i64,
            margin_call_pct: config.margin_call_pct,
            stop_out_pct: config.stop_out_pct,
            order_deadline: Duration::from_secs(config.order_deadline_secs),
        }
    }

    pub async fn create_account(
        &self,
        username: String,
        currency: String,
        group_id: String,
        leverage: u32,
    ) -> Account {
        let handle = self.accounts.create(username, currency, group_id, leverage).await;
        let mut book = handle.lock().await;
        book.account.balance = self.ledger.balance(handle.id).await;
        book.account.clone()
    }

    pub async fn deposit(&self, account_id: u64, amount: f64) -> Result<()> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(EngineError::InvalidPrice(format!("deposit amount {}", amount)));
        }
        let handle = self.accounts.get(account_id).await?;
        let mut book = handle.lock().await;
        self.ledger
            .append(vec![LedgerDraft::new(account_id, LedgerKind::Deposit, amount)])
            .await?;
        book.account.balance += amount;
        info!(account_id, amount, "Deposit journaled");
        Ok(())
    }

    pub async fn withdraw(&self, account_id: u64, amount: f64) -> Result<()> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(EngineError::InvalidPrice(format!("withdrawal amount {}", amount)));
        }
        let handle = self.accounts.get(account_id).await?;
        let mut book = handle.lock().await;

        let quotes = self.quotes.read().await.clone();
        let (equity, used) = self.equity_and_margin(&book, &quotes);
        let free = equity - used;
        if free < amount {
            return Err(EngineError::InsufficientMargin { required: amount, free });
        }

        self.ledger
            .append(vec![LedgerDraft::new(account_id, LedgerKind::Withdrawal, -amount)])
            .await?;
        book.account.balance -= amount;
        info!(account_id, amount, "Withdrawal journaled");
        Ok(())
    }

    /// Market order: validate, fill at the current internal quote,
    /// journal, broadcast. The whole request runs under the order
    /// deadline.
    pub async fn place_market_order(&self, req: MarketOrderRequest) -> Result<Position> {
        match tokio::time::timeout(self.order_deadline, self.execute_market_order(req)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout("order deadline exceeded".to_string())),
        }
    }

    async fn execute_market_order(&self, req: MarketOrderRequest) -> Result<Position> {
        if !self.rate_limiter.try_acquire(req.account_id).await {
            return Err(EngineError::RateLimited(format!("account {}", req.account_id)));
        }

        let intent_key = if req.nonce.is_empty() {
            None
        } else {
            Some(order_intent_key(
                req.account_id,
                &req.symbol,
                req.side.as_str(),
                req.volume,
                &req.nonce,
            ))
        };
        if let Some(key) = &intent_key {
            let intents = self.intents.lock().await;
            if let Some(position_id) = intents.get(key) {
                debug!(account_id = req.account_id, position_id, "Duplicate order intent");
                if let Some(existing) = self.get_position(req.account_id, *position_id).await {
                    return Ok(existing);
                }
            }
        }

        let symbol = sanitize_symbol(&req.symbol)?;
        let spec = self
            .registry
            .get(&symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
        if spec.disabled {
            return Err(EngineError::SymbolDisabled(symbol.clone()));
        }
        validate_volume(req.volume, &spec)?;

        let quote = self.fresh_quote(&symbol).await?;
        let open_price = open_side_price(req.side, &quote);
        validate_sl_tp(req.side, open_price, req.sl, req.tp, req.trailing_distance)?;

        let handle = self.accounts.get(req.account_id).await?;
        let mut book = handle.lock().await;
        if book.account.disabled {
            return Err(EngineError::AccountDisabled(req.account_id));
        }

        let quotes = self.quotes.read().await.clone();
        let (equity, used) = self.equity_and_margin(&book, &quotes);
        let free = equity - used;
        let required = required_margin(req.volume, &spec, open_price, book.account.leverage);
        if free < required {
            // FOK/IOC/RETURN all degenerate to full-or-nothing against
            // the internal book
            return match req.fill_policy {
                FillPolicy::Fok => Err(EngineError::FokRejected(format!(
                    "insufficient margin: required {:.2}, free {:.2}",
                    required, free
                ))),
                _ => Err(EngineError::InsufficientMargin { required, free }),
            };
        }

        let commission_per_lot = self
            .registry
            .get_group(&book.account.group_id)
            .map(|g| g.commission_per_lot)
            .unwrap_or(spec.commission_per_lot);
        let commission = req.volume * commission_per_lot;

        let position_id = self.next_position_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let position = Position {
            id: position_id,
            account_id: req.account_id,
            symbol: symbol.clone(),
            side: req.side,
            volume: req.volume,
            open_price,
            open_time: now,
            sl: req.sl,
            tp: req.tp,
            trailing_distance: req.trailing_distance,
            trailing_high_water: req
                .trailing_distance
                .map(|_| close_side_price(req.side, &quote)),
            swap_accum: 0.0,
            commission,
            state: PositionState::Open,
            close_price: None,
            close_time: None,
            close_reason: None,
        };

        if commission != 0.0 {
            self.append_with_retry(vec![LedgerDraft::new(
                req.account_id,
                LedgerKind::Commission,
                -commission,
            )
            .with_position(position_id)
            .with_note(format!("open {} {} {}", req.side.as_str(), req.volume, symbol))])
            .await?;
            book.account.balance -= commission;
        }

        book.positions.insert(position_id, position.clone());
        // Index while still holding the book so the next tick for this
        // symbol cannot miss the new position's SL/TP evaluation.
        self.index_account(&symbol, req.account_id).await;
        drop(book);

        if let Some(key) = intent_key {
            self.intents.lock().await.insert(key, position_id);
        }
        self.hub.broadcast_position(req.account_id, PositionOp::Open, &position).await;

        info!(
            account_id = req.account_id,
            position_id,
            symbol = %symbol,
            side = req.side.as_str(),
            volume = req.volume,
            open_price,
            "Position opened"
        );
        Ok(position)
    }

    /// Park a LIMIT/STOP/STOP_LIMIT order; margin is checked at
    /// trigger time, not at placement.
    pub async fn place_pending_order(&self, req: PendingOrderRequest) -> Result<Order> {
        match tokio::time::timeout(self.order_deadline, self.execute_pending_order(req)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout("order deadline exceeded".to_string())),
        }
    }

    async fn execute_pending_order(&self, req: PendingOrderRequest) -> Result<Order> {
        if !self.rate_limiter.try_acquire(req.account_id).await {
            return Err(EngineError::RateLimited(format!("account {}", req.account_id)));
        }

        let symbol = sanitize_symbol(&req.symbol)?;
        let spec = self
            .registry
            .get(&symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
        if spec.disabled {
            return Err(EngineError::SymbolDisabled(symbol.clone()));
        }
        validate_volume(req.volume, &spec)?;
        if !(req.price.is_finite() && req.price > 0.0) {
            return Err(EngineError::InvalidPrice(format!("order price {}", req.price)));
        }
        if req.order_type == OrderType::StopLimit && req.stop_price.is_none() {
            return Err(EngineError::InvalidPrice(
                "STOP_LIMIT requires a stop_price".to_string(),
            ));
        }
        validate_sl_tp(req.side, req.price, req.sl, req.tp, None)?;

        let handle = self.accounts.get(req.account_id).await?;
        let mut book = handle.lock().await;
        if book.account.disabled {
            return Err(EngineError::AccountDisabled(req.account_id));
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let order = Order {
            id: order_id,
            account_id: req.account_id,
            symbol: symbol.clone(),
            order_type: req.order_type,
            side: req.side,
            volume: req.volume,
            price: req.price,
            stop_price: req.stop_price,
            sl: req.sl,
            tp: req.tp,
            expiration: req.expiration,
            fill_policy: req.fill_policy,
            state: OrderState::Pending,
            created_at: Utc::now(),
        };
        book.orders.insert(order_id, order.clone());
        self.index_account(&symbol, req.account_id).await;
        drop(book);

        info!(
            account_id = req.account_id,
            order_id,
            symbol = %symbol,
            order_type = req.order_type.as_str(),
            price = req.price,
            "Pending order placed"
        );
        Ok(order)
    }

    pub async fn cancel_order(&self, account_id: u64, order_id: u64) -> Result<Order> {
        let handle = self.accounts.get(account_id).await?;
        let mut book = handle.lock().await;

        let order = book
            .orders
            .get_mut(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        if order.state != OrderState::Pending {
            return Err(EngineError::OrderNotFound(order_id));
        }
        order.state = OrderState::Canceled;
        let canceled = order.clone();
        book.orders.remove(&order_id);
        info!(account_id, order_id, "Order canceled");
        Ok(canceled)
    }

    /// Manual close at the current quote. Idempotent: a position that
    /// already left Open is returned as-is.
    pub async fn close_position(&self, account_id: u64, position_id: u64) -> Result<Position> {
        let handle = self.accounts.get(account_id).await?;
        let mut book = handle.lock().await;

        let position = book
            .positions
            .get(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if position.state != PositionState::Open {
            return Ok(position.clone());
        }

        let symbol = position.symbol.clone();
        let side = position.side;
        let quote = self.fresh_quote(&symbol).await?;
        let close_price = close_side_price(side, &quote);

        let quotes = self.quotes.read().await.clone();
        let closed = self
            .do_close(&mut book, position_id, close_price, CloseReason::Manual, Utc::now(), &quotes)
            .await?;
        drop(book);
        self.unindex_if_done(&symbol, account_id).await;
        Ok(closed)
    }

    /// Tick-driven evaluation: pending order triggers, SL/TP/trailing,
    /// mark-to-market and stop-out. Runs synchronously with respect to
    /// other ticks of the same symbol (the ingest worker serializes),
    /// and locks accounts one at a time in ascending-id order.
    pub async fn on_tick(&self, symbol: &str, bid: f64, ask: f64, ts: DateTime<Utc>) {
        {
            let mut quotes = self.quotes.write().await;
            quotes.insert(
                symbol.to_string(),
                LatestQuote { bid, ask, ts_ms: ts.timestamp_millis() },
            );
        }

        let ids: Vec<u64> = {
            let index = self.symbol_index.read().await;
            match index.get(symbol) {
                Some(ids) => ids.iter().copied().collect(),
                None => return,
            }
        };

        let quotes = self.quotes.read().await.clone();
        for handle in self.accounts.get_sorted(ids).await {
            let mut book = handle.lock().await;
            self.evaluate_pending_orders(&mut book, symbol, bid, ask, ts, &quotes).await;
            self.evaluate_position_triggers(&mut book, symbol, bid, ask, ts, &quotes).await;
            self.margin_watch(&mut book, ts, &quotes).await;
            drop(book);
            self.unindex_if_done(symbol, handle.id).await;
        }
    }

    async fn evaluate_pending_orders(
        &self,
        book: &mut AccountBook,
        symbol: &str,
        bid: f64,
        ask: f64,
        ts: DateTime<Utc>,
        quotes: &HashMap<String, LatestQuote>,
    ) {
        let order_ids: Vec<u64> = book
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.state == OrderState::Pending)
            .map(|o| o.id)
            .collect();

        for order_id in order_ids {
            let Some(order) = book.orders.get_mut(&order_id) else { continue };

            if order_expired(order, ts) {
                order.state = OrderState::Expired;
                info!(order_id, symbol, "Pending order expired");
                book.orders.remove(&order_id);
                continue;
            }

            // A triggered stop-limit becomes a limit at its stop_price
            // and may fill on this same tick.
            if order.order_type == OrderType::StopLimit {
                let stop_hit = match order.side {
                    Side::Buy => ask >= order.price,
                    Side::Sell => bid <= order.price,
                };
                if stop_hit {
                    order.order_type = OrderType::Limit;
                    if let Some(stop_price) = order.stop_price {
                        order.price = stop_price;
                    }
                    debug!(order_id, price = order.price, "Stop-limit armed as limit");
                }
            }

            let fill_price = match (order.order_type, order.side) {
                (OrderType::Limit, Side::Buy) if ask <= order.price => Some(ask),
                (OrderType::Limit, Side::Sell) if bid >= order.price => Some(bid),
                (OrderType::Stop, Side::Buy) if ask >= order.price => Some(ask),
                (OrderType::Stop, Side::Sell) if bid <= order.price => Some(bid),
                _ => None,
            };
            let Some(fill_price) = fill_price else { continue };

            order.state = OrderState::Triggered;
            let Some(order) = book.orders.remove(&order_id) else { continue };
            self.fill_triggered_order(book, order, fill_price, quotes).await;
        }
    }

    async fn fill_triggered_order(
        &self,
        book: &mut AccountBook,
        order: Order,
        fill_price: f64,
        quotes: &HashMap<String, LatestQuote>,
    ) {
        let Some(spec) = self.registry.get(&order.symbol) else {
            warn!(order_id = order.id, symbol = %order.symbol, "Spec vanished, canceling order");
            return;
        };

        let (equity, used) = self.equity_and_margin(book, quotes);
        let required = required_margin(order.volume, &spec, fill_price, book.account.leverage);
        if equity - used < required {
            warn!(
                order_id = order.id,
                account_id = order.account_id,
                required,
                free = equity - used,
                "Triggered order canceled: insufficient margin"
            );
            return;
        }

        let commission_per_lot = self
            .registry
            .get_group(&book.account.group_id)
            .map(|g| g.commission_per_lot)
            .unwrap_or(spec.commission_per_lot);
        let commission = order.volume * commission_per_lot;

        let position_id = self.next_position_id.fetch_add(1, Ordering::Relaxed);
        let position = Position {
            id: position_id,
            account_id: order.account_id,
            symbol: order.symbol.clone(),
            side: order.side,
            volume: order.volume,
            open_price: fill_price,
            open_time: Utc::now(),
            sl: order.sl,
            tp: order.tp,
            trailing_distance: None,
            trailing_high_water: None,
            swap_accum: 0.0,
            commission,
            state: PositionState::Open,
            close_price: None,
            close_time: None,
            close_reason: None,
        };

        if commission != 0.0 {
            if let Err(e) = self
                .append_with_retry(vec![LedgerDraft::new(
                    order.account_id,
                    LedgerKind::Commission,
                    -commission,
                )
                .with_position(position_id)
                .with_order(order.id)])
                .await
            {
                warn!(order_id = order.id, error = %e, "Commission journaling failed");
            } else {
                book.account.balance -= commission;
            }
        }

        book.positions.insert(position_id, position.clone());
        self.hub
            .broadcast_position(order.account_id, PositionOp::Open, &position)
            .await;
        info!(
            account_id = order.account_id,
            order_id = order.id,
            position_id,
            fill_price,
            "Pending order filled"
        );
    }

    async fn evaluate_position_triggers(
        &self,
        book: &mut AccountBook,
        symbol: &str,
        bid: f64,
        ask: f64,
        ts: DateTime<Utc>,
        quotes: &HashMap<String, LatestQuote>,
    ) {
        let mut to_close: Vec<(u64, f64, CloseReason)> = Vec::new();

        for position in book.positions.values_mut() {
            if position.symbol != symbol || position.state != PositionState::Open {
                continue;
            }

            match position.side {
                Side::Buy => {
                    if let Some(sl) = position.sl {
                        if bid <= sl {
                            to_close.push((position.id, bid, CloseReason::Sl));
                            continue;
                        }
                    }
                    if let Some(tp) = position.tp {
                        if bid >= tp {
                            to_close.push((position.id, bid, CloseReason::Tp));
                            continue;
                        }
                    }
                    if let Some(distance) = position.trailing_distance {
                        let high_water =
                            position.trailing_high_water.map_or(bid, |hw| hw.max(bid));
                        position.trailing_high_water = Some(high_water);
                        if bid <= high_water - distance {
                            to_close.push((position.id, bid, CloseReason::Trail));
                        }
                    }
                }
                Side::Sell => {
                    if let Some(sl) = position.sl {
                        if ask >= sl {
                            to_close.push((position.id, ask, CloseReason::Sl));
                            continue;
                        }
                    }
                    if let Some(tp) = position.tp {
                        if ask <= tp {
                            to_close.push((position.id, ask, CloseReason::Tp));
                            continue;
                        }
                    }
                    if let Some(distance) = position.trailing_distance {
                        let low_water =
                            position.trailing_high_water.map_or(ask, |hw| hw.min(ask));
                        position.trailing_high_water = Some(low_water);
                        if ask >= low_water + distance {
                            to_close.push((position.id, ask, CloseReason::Trail));
                        }
                    }
                }
            }
        }

        for (position_id, close_price, reason) in to_close {
            if let Err(e) = self.do_close(book, position_id, close_price, reason, ts, quotes).await {
                warn!(position_id, error = %e, "Trigger close failed");
            }
        }
    }

    /// Mark-to-market and the margin-call / stop-out ladder. Stop-out
    /// closes positions worst-loss-first until the margin level climbs
    /// back over the threshold.
    async fn margin_watch(
        &self,
        book: &mut AccountBook,
        ts: DateTime<Utc>,
        quotes: &HashMap<String, LatestQuote>,
    ) {
        let (margin_call_pct, stop_out_pct) = self
            .registry
            .get_group(&book.account.group_id)
            .map(|g| (g.margin_call_pct, g.stop_out_pct))
            .unwrap_or((self.margin_call_pct, self.stop_out_pct));

        loop {
            let (equity, used) = self.equity_and_margin(book, quotes);
            if used <= 0.0 {
                if book.margin_called {
                    book.margin_called = false;
                }
                return;
            }
            let margin_level = equity / used * 100.0;

            if margin_level >= margin_call_pct {
                if book.margin_called {
                    book.margin_called = false;
                    info!(account_id = book.account.id, margin_level, "Margin call cleared");
                }
                return;
            }

            if !book.margin_called {
                book.margin_called = true;
                warn!(
                    account_id = book.account.id,
                    margin_level, threshold = margin_call_pct, "MARGIN CALL"
                );
            }

            if margin_level >= stop_out_pct {
                return;
            }

            // Stop-out: close the worst loser first
            let victim = book
                .positions
                .values()
                .filter(|p| p.state == PositionState::Open)
                .filter_map(|p| {
                    let quote = quotes.get(&p.symbol)?;
                    let spec = self.registry.get(&p.symbol)?;
                    let price = close_side_price(p.side, quote);
                    let pnl = to_account_currency(
                        raw_pnl(p, price, &spec),
                        &p.symbol,
                        &book.account,
                        quotes,
                    );
                    Some((p.id, price, pnl))
                })
                .min_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

            let Some((position_id, price, pnl)) = victim else {
                return;
            };
            warn!(
                account_id = book.account.id,
                position_id, margin_level, unrealized = pnl, "STOP OUT"
            );
            if self
                .do_close(book, position_id, price, CloseReason::StopOut, ts, quotes)
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// Close pipeline: Open -> Closing -> Closed. The first transition
    /// wins; a position already past Open is returned unchanged. A
    /// failed ledger write leaves the position Closing and queues the
    /// entries for retry; the close itself stands.
    async fn do_close(
        &self,
        book: &mut AccountBook,
        position_id: u64,
        close_price: f64,
        reason: CloseReason,
        ts: DateTime<Utc>,
        quotes: &HashMap<String, LatestQuote>,
    ) -> Result<Position> {
        let account = book.account.clone();
        let position = book
            .positions
            .get_mut(&position_id)
            .ok_or(EngineError::PositionNotFound(position_id))?;
        if position.state != PositionState::Open {
            return Ok(position.clone());
        }

        position.state = PositionState::Closing;
        position.close_price = Some(close_price);
        position.close_time = Some(ts);
        position.close_reason = Some(reason);

        let pnl = match self.registry.get(&position.symbol) {
            Some(spec) => to_account_currency(
                raw_pnl(position, close_price, &spec),
                &position.symbol,
                &account,
                quotes,
            ),
            None => 0.0,
        };

        let drafts = vec![LedgerDraft::new(position.account_id, LedgerKind::TradePnl, pnl)
            .with_position(position_id)
            .with_note(format!(
                "close {} {} @ {} ({})",
                position.side.as_str(),
                position.symbol,
                close_price,
                reason.as_str()
            ))];

        match self.ledger.append(drafts.clone()).await {
            Ok(_) => {
                position.state = PositionState::Closed;
                book.account.balance += pnl;
            }
            Err(e) => {
                warn!(
                    position_id,
                    error = %e,
                    code = e.error_code(),
                    "Ledger write failed, close queued for retry"
                );
                let mut pending = self.pending_closes.lock().await;
                pending.push(PendingClose {
                    account_id: account.id,
                    position_id,
                    drafts,
                });
            }
        }

        let closed = position.clone();
        info!(
            account_id = account.id,
            position_id,
            close_price,
            pnl,
            reason = reason.as_str(),
            "Position closed"
        );
        self.hub.broadcast_position(account.id, PositionOp::Close, &closed).await;
        Ok(closed)
    }

    /// Re-attempt ledger writes for closes that failed; called by the
    /// maintenance scheduler.
    pub async fn retry_pending_closes(&self) {
        let pending: Vec<PendingClose> = {
            let mut queue = self.pending_closes.lock().await;
            queue.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }

        for item in pending {
            match self.ledger.append(item.drafts.clone()).await {
                Ok(entries) => {
                    if let Ok(handle) = self.accounts.get(item.account_id).await {
                        let mut book = handle.lock().await;
                        let delta: f64 = entries.iter().map(|e| e.amount).sum();
                        book.account.balance += delta;
                        if let Some(position) = book.positions.get_mut(&item.position_id) {
                            position.state = PositionState::Closed;
                        }
                    }
                    info!(position_id = item.position_id, "Deferred close journaled");
                }
                Err(e) => {
                    warn!(position_id = item.position_id, error = %e, "Close retry failed");
                    self.pending_closes.lock().await.push(item);
                }
            }
        }
    }

    /// Once-per-second expiration sweep over every account
    pub async fn sweep_expired(&self, now: DateTime<Utc>) {
        for handle in self.accounts.all().await {
            let mut book = handle.lock().await;
            let expired: Vec<u64> = book
                .orders
                .values()
                .filter(|o| o.state == OrderState::Pending && order_expired(o, now))
                .map(|o| o.id)
                .collect();
            for order_id in expired {
                if let Some(mut order) = book.orders.remove(&order_id) {
                    order.state = OrderState::Expired;
                    info!(account_id = handle.id, order_id, "Order expired");
                }
            }
        }
    }

    /// One SWAP ledger entry per open position per rollover boundary
    pub async fn apply_swap(&self, triple: bool) -> Result<usize> {
        let multiplier = if triple { 3.0 } else { 1.0 };
        let mut applied = 0usize;

        for handle in self.accounts.all().await {
            let mut book = handle.lock().await;
            let mut drafts = Vec::new();
            let mut amounts: Vec<(u64, f64)> = Vec::new();

            for position in book.positions.values() {
                if position.state != PositionState::Open {
                    continue;
                }
                let Some(spec) = self.registry.get(&position.symbol) else { continue };
                let rate = match position.side {
                    Side::Buy => spec.swap_long,
                    Side::Sell => spec.swap_short,
                };
                let amount = rate * position.volume * multiplier;
                drafts.push(
                    LedgerDraft::new(position.account_id, LedgerKind::Swap, amount)
                        .with_position(position.id)
                        .with_note(if triple { "triple swap" } else { "swap" }.to_string()),
                );
                amounts.push((position.id, amount));
            }

            if drafts.is_empty() {
                continue;
            }
            self.ledger.append(drafts).await?;
            for (position_id, amount) in amounts {
                if let Some(position) = book.positions.get_mut(&position_id) {
                    position.swap_accum += amount;
                }
                book.account.balance += amount;
                applied += 1;
            }
        }

        if applied > 0 {
            info!(positions = applied, triple, "Swap applied");
        }
        Ok(applied)
    }

    pub fn registry_handle(&self) -> Arc<SymbolRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn get_position(&self, account_id: u64, position_id: u64) -> Option<Position> {
        let handle = self.accounts.get(account_id).await.ok()?;
        let book = handle.lock().await;
        book.positions.get(&position_id).cloned()
    }

    pub async fn open_positions(&self, account_id: u64) -> Result<Vec<Position>> {
        let handle = self.accounts.get(account_id).await?;
        let book = handle.lock().await;
        let mut positions: Vec<Position> = book
            .positions
            .values()
            .filter(|p| p.state == PositionState::Open)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.id);
        Ok(positions)
    }

    pub async fn pending_orders(&self, account_id: u64) -> Result<Vec<Order>> {
        let handle = self.accounts.get(account_id).await?;
        let book = handle.lock().await;
        let mut orders: Vec<Order> = book.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    pub async fn account_snapshot(&self, account_id: u64) -> Result<(Account, f64, f64)> {
        let handle = self.accounts.get(account_id).await?;
        let book = handle.lock().await;
        let quotes = self.quotes.read().await.clone();
        let (equity, used) = self.equity_and_margin(&book, &quotes);
        Ok((book.account.clone(), equity, used))
    }

    fn equity_and_margin(
        &self,
        book: &AccountBook,
        quotes: &HashMap<String, LatestQuote>,
    ) -> (f64, f64) {
        let mut equity = book.account.balance;
        let mut used = 0.0;

        for position in book.positions.values() {
            if position.state == PositionState::Closed {
                continue;
            }
            let Some(spec) = self.registry.get(&position.symbol) else { continue };
            used += required_margin(
                position.volume,
                &spec,
                position.open_price,
                book.account.leverage,
            );
            if let Some(quote) = quotes.get(&position.symbol) {
                let price = close_side_price(position.side, quote);
                equity += to_account_currency(
                    raw_pnl(position, price, &spec),
                    &position.symbol,
                    &book.account,
                    quotes,
                );
            }
        }

        (equity, used)
    }

    async fn fresh_quote(&self, symbol: &str) -> Result<LatestQuote> {
        let quotes = self.quotes.read().await;
        let quote = quotes.get(symbol).copied().ok_or_else(|| EngineError::StaleQuote {
            symbol: symbol.to_string(),
            age_ms: -1,
        })?;
        let age_ms = Utc::now().timestamp_millis() - quote.ts_ms;
        if age_ms > self.stale_threshold_ms {
            return Err(EngineError::StaleQuote { symbol: symbol.to_string(), age_ms });
        }
        Ok(quote)
    }

    async fn index_account(&self, symbol: &str, account_id: u64) {
        let mut index = self.symbol_index.write().await;
        index.entry(symbol.to_string()).or_default().insert(account_id);
    }

    /// Drop the account from a symbol's index once it holds neither
    /// open positions nor pending orders there.
    async fn unindex_if_done(&self, symbol: &str, account_id: u64) {
        let still_active = match self.accounts.get(account_id).await {
            Ok(handle) => {
                let book = handle.lock().await;
                book.positions
                    .values()
                    .any(|p| p.symbol == symbol && p.state != PositionState::Closed)
                    || book.orders.values().any(|o| o.symbol == symbol)
            }
            Err(_) => false,
        };
        if !still_active {
            let mut index = self.symbol_index.write().await;
            if let Some(ids) = index.get_mut(symbol) {
                ids.remove(&account_id);
                if ids.is_empty() {
                    index.remove(symbol);
                }
            }
        }
    }

    async fn append_with_retry(&self, drafts: Vec<LedgerDraft>) -> Result<()> {
        match self.ledger.append(drafts.clone()).await {
            Ok(_) => Ok(()),
            Err(first) if first.is_transient() => match self.ledger.append(drafts).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "Ledger retry failed");
                    Err(EngineError::Unavailable("ledger write failed".to_string()))
                }
            },
            Err(e) => Err(e),
        }
    }
}

fn validate_volume(volume: f64, spec: &SymbolSpec) -> Result<()> {
    if !volume.is_finite() || volume <= 0.0 {
        return Err(EngineError::InvalidVolume(format!("{}", volume)));
    }
    if volume < spec.min_volume || volume > spec.max_volume {
        return Err(EngineError::InvalidVolume(format!(
            "{} outside [{}, {}]",
            volume, spec.min_volume, spec.max_volume
        )));
    }
    let steps = volume / spec.volume_step;
    if (steps - steps.round()).abs() > 1e-9 {
        return Err(EngineError::InvalidVolume(format!(
            "{} is not a multiple of step {}",
            volume, spec.volume_step
        )));
    }
    Ok(())
}

/// Direction rules: BUY wants sl < price < tp, SELL wants tp < price < sl
fn validate_sl_tp(
    side: Side,
    price: f64,
    sl: Option<f64>,
    tp: Option<f64>,
    trailing_distance: Option<f64>,
) -> Result<()> {
    if let Some(distance) = trailing_distance {
        if !(distance.is_finite() && distance > 0.0) {
            return Err(EngineError::InvalidSlTp(format!("trailing distance {}", distance)));
        }
    }
    match side {
        Side::Buy => {
            if let Some(sl) = sl {
                if sl >= price {
                    return Err(EngineError::InvalidSlTp(format!("BUY sl {} >= price {}", sl, price)));
                }
            }
            if let Some(tp) = tp {
                if tp <= price {
                    return Err(EngineError::InvalidSlTp(format!("BUY tp {} <= price {}", tp, price)));
                }
            }
        }
        Side::Sell => {
            if let Some(sl) = sl {
                if sl <= price {
                    return Err(EngineError::InvalidSlTp(format!("SELL sl {} <= price {}", sl, price)));
                }
            }
            if let Some(tp) = tp {
                if tp >= price {
                    return Err(EngineError::InvalidSlTp(format!("SELL tp {} >= price {}", tp, price)));
                }
            }
        }
    }
    Ok(())
}

fn order_expired(order: &Order, now: DateTime<Utc>) -> bool {
    match order.expiration {
        Expiration::Gtc => false,
        Expiration::Day => now.date_naive() > order.created_at.date_naive(),
        Expiration::Date(expires_at) => now >= expires_at,
    }
}
