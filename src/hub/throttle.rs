/// Pluggable broadcast throttling
use rand::Rng;

use super::session::ClientSession;
use crate::types::{Tick, ThrottleMode};

/// Drop predicate evaluated per (tick, session) before enqueue
pub trait ThrottlePolicy: Send + Sync {
    fn should_drop(&self, tick: &Tick, session: &ClientSession) -> bool;
}

/// FULL mode: every tick goes out
pub struct FullDelivery;

impl ThrottlePolicy for FullDelivery {
    fn should_drop(&self, _tick: &Tick, _session: &ClientSession) -> bool {
        false
    }
}

/// THROTTLED mode: pseudorandom drop at a fixed rate for bandwidth
/// smoothing. Stateless, so slow and fast sessions see the same
/// expected rate.
pub struct RandomDrop {
    rate: f64,
}

impl RandomDrop {
    pub fn new(rate: f64) -> Self {
        RandomDrop { rate: rate.clamp(0.0, 1.0) }
    }
}

impl ThrottlePolicy for RandomDrop {
    fn should_drop(&self, _tick: &Tick, _session: &ClientSession) -> bool {
        rand::thread_rng().gen::<f64>() < self.rate
    }
}

pub fn policy_from_config(mode: ThrottleMode, rate: f64) -> Box<dyn ThrottlePolicy> {
    match mode {
        ThrottleMode::Full => Box::new(FullDelivery),
        ThrottleMode::Throttled => Box::new(RandomDrop::new(rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tick() -> Tick {
        Tick {
            broker_id: 1,
            symbol: "EURUSD".to_string(),
            bid: 1.0850,
            ask: 1.0852,
            spread: 0.0002,
            timestamp: Utc::now(),
            lp_tag: "lp1".to_string(),
        }
    }

    #[test]
    fn test_full_never_drops() {
        let session = ClientSession::new(8);
        let policy = FullDelivery;
        for _ in 0..100 {
            assert!(!policy.should_drop(&tick(), &session));
        }
    }

    #[test]
    fn test_random_drop_extremes() {
        let session = ClientSession::new(8);

        let never = RandomDrop::new(0.0);
        assert!((0..100).all(|_| !never.should_drop(&tick(), &session)));

        let always = RandomDrop::new(1.0);
        assert!((0..100).all(|_| always.should_drop(&tick(), &session)));
    }
}
