//! Per-market state: two book sides plus the synchronization bookkeeping the
//! dispatcher drives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::book_side::BookSide;

/// Where a stream carrying this market currently stands, surfaced for
/// diagnostics (`get_list_of_depth_caches`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connected,
    Running,
    Disconnected,
    Stopped,
}

/// `last_update_id` is `Option<u64>`, but needs to be read/written from
/// multiple tasks without a full mutex round-trip on the hot path. `0` is
/// reserved to mean "unset" (`None`) since a real Binance `lastUpdateId` is
/// always positive.
struct UpdateId(AtomicU64);

impl UpdateId {
    fn unset() -> Self {
        Self(AtomicU64::new(0))
    }

    fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn set(&self, id: u64) {
        debug_assert!(id != 0, "0 is reserved to mean unset");
        self.0.store(id, Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Per-market replica state. Mutated exclusively by the dispatcher (state
/// transitions, book writes) and the snapshot task (anchor write);
/// everything else reads through the `DepthCacheManager`'s public API.
pub struct DepthCache {
    pub market: String,
    pub asks: BookSide,
    pub bids: BookSide,

    last_update_id: UpdateId,
    last_refresh_time: Mutex<Option<Instant>>,
    last_update_time: Mutex<Option<Instant>>,

    is_synchronized: AtomicBool,
    refresh_request: AtomicBool,
    stop_request: AtomicBool,

    pub refresh_interval: Option<Duration>,
    stream_status: Mutex<StreamStatus>,
}

impl DepthCache {
    pub fn new(market: String, refresh_interval: Option<Duration>) -> Self {
        Self {
            market,
            asks: BookSide::new(),
            bids: BookSide::new(),
            last_update_id: UpdateId::unset(),
            last_refresh_time: Mutex::new(None),
            last_update_time: Mutex::new(None),
            is_synchronized: AtomicBool::new(false),
            // A freshly created cache starts in the same state a gap or
            // disconnect resets it to: unsynchronized with a refresh already
            // pending, so the first inbound event triggers the initial
            // snapshot fetch via the refresh gate.
            refresh_request: AtomicBool::new(true),
            stop_request: AtomicBool::new(false),
            refresh_interval,
            stream_status: Mutex::new(StreamStatus::Connected),
        }
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id.get()
    }

    pub fn set_last_update_id(&self, id: u64) {
        self.last_update_id.set(id);
    }

    pub fn clear_last_update_id(&self) {
        self.last_update_id.clear();
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized.load(Ordering::Acquire)
    }

    pub fn set_synchronized(&self, value: bool) {
        self.is_synchronized.store(value, Ordering::Release);
    }

    pub fn refresh_requested(&self) -> bool {
        self.refresh_request.load(Ordering::Acquire)
    }

    pub fn request_refresh(&self) {
        self.refresh_request.store(true, Ordering::Release);
    }

    pub fn clear_refresh_request(&self) {
        self.refresh_request.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_request.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop_request.store(true, Ordering::Release);
    }

    pub fn last_refresh_time(&self) -> Option<Instant> {
        *self
            .last_refresh_time
            .lock()
            .expect("last_refresh_time lock poisoned")
    }

    pub fn set_last_refresh_time(&self, when: Instant) {
        *self
            .last_refresh_time
            .lock()
            .expect("last_refresh_time lock poisoned") = Some(when);
    }

    pub fn last_update_time(&self) -> Option<Instant> {
        *self
            .last_update_time
            .lock()
            .expect("last_update_time lock poisoned")
    }

    pub fn set_last_update_time(&self, when: Instant) {
        *self
            .last_update_time
            .lock()
            .expect("last_update_time lock poisoned") = Some(when);
    }

    pub fn stream_status(&self) -> StreamStatus {
        *self.stream_status.lock().expect("stream_status lock poisoned")
    }

    pub fn set_stream_status(&self, status: StreamStatus) {
        *self.stream_status.lock().expect("stream_status lock poisoned") = status;
    }

    /// Reset all synchronization state (but not `stop_request`) ahead of a
    /// fresh snapshot. Used on continuity failure, disconnect, and
    /// refresh-gate admission.
    pub fn desynchronize(&self) {
        self.set_synchronized(false);
        self.clear_last_update_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cache_starts_unsynchronized_with_no_anchor() {
        let cache = DepthCache::new("btcusdt".to_string(), None);
        assert!(!cache.is_synchronized());
        assert_eq!(cache.last_update_id(), None);
    }

    #[test]
    fn new_cache_starts_with_a_refresh_already_pending() {
        // Same state a gap or disconnect resets to, so the very first
        // inbound event for a freshly created market triggers its initial
        // snapshot fetch via the refresh gate.
        let cache = DepthCache::new("btcusdt".to_string(), None);
        assert!(cache.refresh_requested());
    }

    #[test]
    fn set_and_clear_last_update_id_roundtrip() {
        let cache = DepthCache::new("btcusdt".to_string(), None);
        cache.set_last_update_id(101);
        assert_eq!(cache.last_update_id(), Some(101));
        cache.clear_last_update_id();
        assert_eq!(cache.last_update_id(), None);
    }

    #[test]
    fn desynchronize_clears_sync_flag_and_anchor() {
        let cache = DepthCache::new("btcusdt".to_string(), None);
        cache.set_last_update_id(101);
        cache.set_synchronized(true);

        cache.desynchronize();
        assert!(!cache.is_synchronized());
        assert_eq!(cache.last_update_id(), None);
    }

    #[test]
    fn refresh_request_flag_roundtrip() {
        let cache = DepthCache::new("btcusdt".to_string(), None);
        cache.clear_refresh_request();
        assert!(!cache.refresh_requested());
        cache.request_refresh();
        assert!(cache.refresh_requested());
        cache.clear_refresh_request();
        assert!(!cache.refresh_requested());
    }

    #[test]
    fn stop_request_is_a_one_way_latch() {
        let cache = DepthCache::new("btcusdt".to_string(), None);
        assert!(!cache.is_stopped());
        cache.request_stop();
        assert!(cache.is_stopped());
    }
}
