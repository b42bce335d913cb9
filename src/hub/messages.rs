/// Client-facing WebSocket envelopes
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionOp {
    Open,
    Update,
    Close,
}

/// Wire messages. Outbound: tick, position, ping. Inbound: login,
/// subscribe, unsubscribe, pong.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    Tick {
        symbol: String,
        bid: f64,
        ask: f64,
        ts: DateTime<Utc>,
    },
    Position {
        op: PositionOp,
        position: Position,
    },
    Ping,
    Pong,
    Login {
        account_id: Option<u64>,
        #[serde(default)]
        role: Option<String>,
    },
    Subscribe {
        symbols: Vec<String>,
    },
    Unsubscribe {
        symbols: Vec<String>,
    },
}

impl WsMessage {
    /// Ticks are the only messages the slow-consumer path may coalesce
    pub fn tick_symbol(&self) -> Option<&str> {
        match self {
            WsMessage::Tick { symbol, .. } => Some(symbol),
            _ => None,
        }
    }
}
