/// Idempotency key generation for order requests
use sha2::{Digest, Sha256};

/// Deterministic key over an order intent. A client retrying the same
/// request produces the same key and receives the original result
/// instead of a second fill.
pub fn order_intent_key(account_id: u64, symbol: &str, side: &str, volume: f64, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.to_le_bytes());
    hasher.update(symbol.as_bytes());
    hasher.update(side.as_bytes());
    hasher.update(volume.to_le_bytes());
    hasher.update(nonce.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_intent_key() {
        let k1 = order_intent_key(1, "EURUSD", "BUY", 0.10, "n1");
        let k2 = order_intent_key(1, "EURUSD", "BUY", 0.10, "n1");
        let k3 = order_intent_key(1, "EURUSD", "SELL", 0.10, "n1");

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }
}
