//! Global throttle admitting at most one snapshot refresh per
//! `init_interval` globally, and at most one per market per
//! `init_time_window`.
//!
//! Exists so that a startup burst or a global WebSocket disconnect -- where
//! every tracked market wants to re-anchor at once -- does not turn into a
//! REST request storm against the exchange.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDecision {
    Init,
    Drop,
}

struct InitGateState {
    last_global: Option<Instant>,
    last_per_market: HashMap<String, Instant>,
}

/// Guards snapshot-refresh admission. One instance is shared across every
/// market on a `DepthCacheManager`.
pub struct InitGate {
    init_interval: Duration,
    init_time_window: Duration,
    state: Mutex<InitGateState>,
}

impl InitGate {
    pub fn new(init_interval: Duration, init_time_window: Duration) -> Self {
        Self {
            init_interval,
            init_time_window,
            state: Mutex::new(InitGateState {
                last_global: None,
                last_per_market: HashMap::new(),
            }),
        }
    }

    /// `TryAcquire` from spec.md §4.3. Updates internal timestamps on
    /// `Init`; leaves them unchanged on `Drop`.
    pub fn try_acquire(&self, market: &str) -> InitDecision {
        self.try_acquire_at(market, Instant::now())
    }

    fn try_acquire_at(&self, market: &str, now: Instant) -> InitDecision {
        let mut state = self.state.lock().expect("init gate lock poisoned");

        if let Some(last) = state.last_per_market.get(market) {
            if now.duration_since(*last) < self.init_time_window {
                return InitDecision::Drop;
            }
        }

        if let Some(last_global) = state.last_global {
            if now.duration_since(last_global) < self.init_interval {
                return InitDecision::Drop;
            }
        }

        state.last_global = Some(now);
        state.last_per_market.insert(market.to_string(), now);
        InitDecision::Init
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_is_always_admitted() {
        let gate = InitGate::new(Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(gate.try_acquire("btcusdt"), InitDecision::Init);
    }

    #[test]
    fn second_market_within_init_interval_is_dropped() {
        let gate = InitGate::new(Duration::from_millis(500), Duration::from_secs(5));
        let t0 = Instant::now();
        assert_eq!(gate.try_acquire_at("btcusdt", t0), InitDecision::Init);
        assert_eq!(gate.try_acquire_at("ethusdt", t0), InitDecision::Drop);

        let t_after = t0 + Duration::from_millis(600);
        assert_eq!(gate.try_acquire_at("ethusdt", t_after), InitDecision::Init);
    }

    #[test]
    fn same_market_cannot_reacquire_within_time_window() {
        let gate = InitGate::new(Duration::from_millis(0), Duration::from_secs(5));
        let t0 = Instant::now();
        assert_eq!(gate.try_acquire_at("btcusdt", t0), InitDecision::Init);

        let t_soon = t0 + Duration::from_secs(1);
        assert_eq!(gate.try_acquire_at("btcusdt", t_soon), InitDecision::Drop);

        let t_after_window = t0 + Duration::from_secs(5) + Duration::from_millis(1);
        assert_eq!(
            gate.try_acquire_at("btcusdt", t_after_window),
            InitDecision::Init
        );
    }
}
