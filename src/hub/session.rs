/// Client session state and the bounded coalescing outbound queue
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use super::messages::WsMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Trader,
    Admin,
}

struct QueueItem {
    seq: u64,
    msg: WsMessage,
    dead: bool,
}

/// Bounded outbound queue. While there is room, messages queue in
/// order. When full, an incoming tick first replaces every queued
/// tick of its own symbol (retaining only the newest per symbol);
/// failing that, the oldest queued tick of any symbol is evicted.
/// Non-tick messages are never coalesced and are only dropped when
/// the queue holds no ticks at all. Slow clients therefore never
/// back-pressure the hub.
pub struct CoalescingQueue {
    items: VecDeque<QueueItem>,
    /// symbol -> seqs of queued (live) ticks for that symbol
    tick_seqs: HashMap<String, Vec<u64>>,
    next_seq: u64,
    live: usize,
    capacity: usize,
    dropped: u64,
}

impl CoalescingQueue {
    pub fn new(capacity: usize) -> Self {
        CoalescingQueue {
            items: VecDeque::with_capacity(capacity),
            tick_seqs: HashMap::new(),
            next_seq: 0,
            live: 0,
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, msg: WsMessage) {
        if self.live < self.capacity {
            self.push_item(msg);
            return;
        }

        if let Some(symbol) = msg.tick_symbol() {
            if let Some(seqs) = self.tick_seqs.remove(symbol) {
                for seq in seqs {
                    self.kill(seq);
                }
                self.push_item(msg);
                return;
            }
        }

        // Evict the oldest queued tick of any symbol; if none exist,
        // fall back to the oldest message outright.
        let victim = self
            .items
            .iter()
            .find(|i| !i.dead && i.msg.tick_symbol().is_some())
            .or_else(|| self.items.iter().find(|i| !i.dead))
            .map(|i| i.seq);
        if let Some(seq) = victim {
            self.unindex_tick(seq);
            self.kill(seq);
        }
        self.push_item(msg);
    }

    pub fn pop(&mut self) -> Option<WsMessage> {
        while let Some(item) = self.items.pop_front() {
            if item.dead {
                continue;
            }
            if let Some(symbol) = item.msg.tick_symbol() {
                if let Some(seqs) = self.tick_seqs.get_mut(symbol) {
                    seqs.retain(|s| *s != item.seq);
                    if seqs.is_empty() {
                        self.tick_seqs.remove(symbol);
                    }
                }
            }
            self.live -= 1;
            return Some(item.msg);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn push_item(&mut self, msg: WsMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(symbol) = msg.tick_symbol() {
            self.tick_seqs.entry(symbol.to_string()).or_default().push(seq);
        }
        self.items.push_back(QueueItem { seq, msg, dead: false });
        self.live += 1;
    }

    /// Items are never removed from the middle, so a seq maps straight
    /// to its offset from the front.
    fn kill(&mut self, seq: u64) {
        let front_seq = match self.items.front() {
            Some(front) => front.seq,
            None => return,
        };
        let Some(index) = seq.checked_sub(front_seq).map(|i| i as usize) else {
            return;
        };
        if let Some(item) = self.items.get_mut(index) {
            if !item.dead {
                item.dead = true;
                self.live -= 1;
                self.dropped += 1;
            }
        }
        while matches!(self.items.front(), Some(item) if item.dead) {
            self.items.pop_front();
        }
    }

    fn unindex_tick(&mut self, seq: u64) {
        let symbol = match self
            .items
            .iter()
            .find(|i| i.seq == seq)
            .and_then(|i| i.msg.tick_symbol())
        {
            Some(s) => s.to_string(),
            None => return,
        };
        if let Some(seqs) = self.tick_seqs.get_mut(&symbol) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.tick_seqs.remove(&symbol);
            }
        }
    }
}

struct SessionAuth {
    account_id: Option<u64>,
    role: SessionRole,
}

/// One attached client. The outbound queue is drained by the session's
/// writer task; `Notify` wakes it on new messages.
pub struct ClientSession {
    pub id: Uuid,
    auth: RwLock<SessionAuth>,
    subscriptions: RwLock<HashSet<String>>,
    subscribe_all: AtomicBool,
    queue: Mutex<CoalescingQueue>,
    notify: Notify,
    last_activity: RwLock<DateTime<Utc>>,
    closed: AtomicBool,
}

impl ClientSession {
    pub fn new(queue_capacity: usize) -> Self {
        ClientSession {
            id: Uuid::new_v4(),
            auth: RwLock::new(SessionAuth {
                account_id: None,
                role: SessionRole::Trader,
            }),
            subscriptions: RwLock::new(HashSet::new()),
            subscribe_all: AtomicBool::new(false),
            queue: Mutex::new(CoalescingQueue::new(queue_capacity)),
            notify: Notify::new(),
            last_activity: RwLock::new(Utc::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn login(&self, account_id: Option<u64>, role: SessionRole) {
        let mut auth = self.auth.write().await;
        auth.account_id = account_id;
        auth.role = role;
        self.touch().await;
    }

    pub async fn role(&self) -> SessionRole {
        self.auth.read().await.role
    }

    pub async fn account_id(&self) -> Option<u64> {
        self.auth.read().await.account_id
    }

    /// Subscribe to symbols; "*" subscribes admins to everything
    pub async fn subscribe(&self, symbols: Vec<String>) {
        let is_admin = self.role().await == SessionRole::Admin;
        let mut subscriptions = self.subscriptions.write().await;
        for symbol in symbols {
            if symbol == "*" {
                if is_admin {
                    self.subscribe_all.store(true, Ordering::Relaxed);
                }
                continue;
            }
            subscriptions.insert(symbol.to_ascii_uppercase());
        }
    }

    pub async fn unsubscribe(&self, symbols: Vec<String>) {
        let mut subscriptions = self.subscriptions.write().await;
        for symbol in symbols {
            if symbol == "*" {
                self.subscribe_all.store(false, Ordering::Relaxed);
                continue;
            }
            subscriptions.remove(&symbol.to_ascii_uppercase());
        }
    }

    pub async fn is_subscribed(&self, symbol: &str) -> bool {
        if self.subscribe_all.load(Ordering::Relaxed) {
            return true;
        }
        self.subscriptions.read().await.contains(symbol)
    }

    pub async fn sees_account(&self, account_id: u64) -> bool {
        let auth = self.auth.read().await;
        auth.role == SessionRole::Admin || auth.account_id == Some(account_id)
    }

    pub async fn enqueue(&self, msg: WsMessage) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut queue = self.queue.lock().await;
            queue.push(msg);
        }
        self.notify.notify_one();
    }

    /// Drain every queued message; used by the writer task and tests
    pub async fn drain_queue(&self) -> Vec<WsMessage> {
        let mut queue = self.queue.lock().await;
        let mut out = Vec::with_capacity(queue.len());
        while let Some(msg) = queue.pop() {
            out.push(msg);
        }
        out
    }

    /// Block until messages are available (or the session closes),
    /// then drain them. Returns None once closed and empty.
    pub async fn next_batch(&self) -> Option<Vec<WsMessage>> {
        loop {
            let batch = self.drain_queue().await;
            if !batch.is_empty() {
                return Some(batch);
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub async fn touch(&self) {
        let mut last = self.last_activity.write().await;
        *last = Utc::now();
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_msg(symbol: &str, bid: f64) -> WsMessage {
        WsMessage::Tick {
            symbol: symbol.to_string(),
            bid,
            ask: bid + 0.0002,
            ts: Utc::now(),
        }
    }

    fn position_msg() -> WsMessage {
        WsMessage::Position {
            op: super::super::messages::PositionOp::Update,
            position: crate::types::Position {
                id: 1,
                account_id: 1,
                symbol: "EURUSD".to_string(),
                side: crate::types::Side::Buy,
                volume: 0.1,
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
            },
        }
    }

    #[test]
    fn test_fifo_below_capacity() {
        let mut queue = CoalescingQueue::new(4);
        queue.push(tick_msg("EURUSD", 1.0));
        queue.push(tick_msg("EURUSD", 2.0));

        // No coalescing while there is room
        assert_eq!(queue.len(), 2);
        assert!(matches!(queue.pop(), Some(WsMessage::Tick { bid, .. }) if bid == 1.0));
        assert!(matches!(queue.pop(), Some(WsMessage::Tick { bid, .. }) if bid == 2.0));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_overflow_coalesces_same_symbol_ticks() {
        // Backlog: [tick EURUSD v1, position P, tick EURUSD v2,
        // tick USDJPY v1]; capacity 4; new tick EURUSD v3 arrives.
        let mut queue = CoalescingQueue::new(4);
        queue.push(tick_msg("EURUSD", 1.0));
        queue.push(position_msg());
        queue.push(tick_msg("EURUSD", 2.0));
        queue.push(tick_msg("USDJPY", 155.0));

        queue.push(tick_msg("EURUSD", 3.0));

        // Expect [position P, tick USDJPY v1, tick EURUSD v3]
        assert_eq!(queue.len(), 3);
        assert!(matches!(queue.pop(), Some(WsMessage::Position { .. })));
        assert!(matches!(queue.pop(), Some(WsMessage::Tick { symbol, .. }) if symbol == "USDJPY"));
        assert!(matches!(queue.pop(), Some(WsMessage::Tick { symbol, bid, .. }) if symbol == "EURUSD" && bid == 3.0));
        assert!(queue.pop().is_none());
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn test_overflow_evicts_oldest_foreign_tick() {
        let mut queue = CoalescingQueue::new(3);
        queue.push(tick_msg("USDJPY", 155.0));
        queue.push(position_msg());
        queue.push(tick_msg("GBPUSD", 1.27));

        // Full; EURUSD has nothing queued, so the oldest tick goes
        queue.push(tick_msg("EURUSD", 1.0850));

        assert_eq!(queue.len(), 3);
        assert!(matches!(queue.pop(), Some(WsMessage::Position { .. })));
        assert!(matches!(queue.pop(), Some(WsMessage::Tick { symbol, .. }) if symbol == "GBPUSD"));
        assert!(matches!(queue.pop(), Some(WsMessage::Tick { symbol, .. }) if symbol == "EURUSD"));
    }

    #[test]
    fn test_non_tick_messages_never_coalesced() {
        let mut queue = CoalescingQueue::new(2);
        queue.push(position_msg());
        queue.push(tick_msg("EURUSD", 1.0));

        queue.push(position_msg());

        // The tick was sacrificed, both position updates survive
        assert_eq!(queue.len(), 2);
        assert!(matches!(queue.pop(), Some(WsMessage::Position { .. })));
        assert!(matches!(queue.pop(), Some(WsMessage::Position { .. })));
    }

    #[tokio::test]
    async fn test_session_close_wakes_writer() {
        let session = ClientSession::new(8);
        session.close();
        assert!(session.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_admin_subscribe_all() {
        let session = ClientSession::new(8);
        session.login(None, SessionRole::Admin).await;
        session.subscribe(vec!["*".to_string()]).await;
        assert!(session.is_subscribed("ANYTHING").await);

        let trader = ClientSession::new(8);
        trader.subscribe(vec!["*".to_string()]).await;
        assert!(!trader.is_subscribed("ANYTHING").await);
    }
}
