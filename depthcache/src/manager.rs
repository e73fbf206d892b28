//! Public API (spec.md §4.7): `DepthCacheManager` owns the market registry,
//! the Init Gate, the snapshot/stream collaborators, and one dispatcher loop
//! per stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DepthCacheConfig;
use crate::depth_cache::{DepthCache, StreamStatus};
use crate::dispatcher::{CacheLookup, Dispatcher, MapLookup};
use crate::error::{DepthCacheError, Result};
use crate::init_gate::InitGate;
use crate::snapshot::SnapshotSource;
use crate::stream::{StreamMultiplexer, StreamSignal};

/// Owns every tracked market's `DepthCache`, the shared `InitGate`, and the
/// injected REST/WebSocket collaborators. Construct with
/// [`DepthCacheManager::new`], passing concrete `SnapshotSource`/
/// `StreamMultiplexer` implementations (or fakes, for tests).
pub struct DepthCacheManager {
    config: DepthCacheConfig,
    lookup: Arc<MapLookup>,
    init_gate: Arc<InitGate>,
    snapshot_source: Arc<dyn SnapshotSource>,
    multiplexer: Arc<dyn StreamMultiplexer>,
    dispatcher: Arc<Dispatcher<MapLookup>>,
    cancellation: CancellationToken,
    /// Markets -> the stream id their dispatcher loop was spawned on
    /// (diagnostics / idempotent `create_depthcache`).
    assigned_streams: RwLock<HashMap<String, u64>>,
    /// One dispatch loop task per stream id, so a second market landing on
    /// an already-running stream doesn't spawn a duplicate loop.
    running_streams: RwLock<HashMap<u64, tokio::task::JoinHandle<()>>>,
}

impl DepthCacheManager {
    pub fn new(
        config: DepthCacheConfig,
        snapshot_source: Arc<dyn SnapshotSource>,
        multiplexer: Arc<dyn StreamMultiplexer>,
    ) -> Arc<Self> {
        let lookup = Arc::new(MapLookup {
            caches: RwLock::new(HashMap::new()),
        });
        let init_gate = Arc::new(InitGate::new(config.init_interval, config.init_time_window));
        let dispatcher = Arc::new(Dispatcher::new(
            config.exchange,
            config.used_weight_ceiling,
            config.high_performance,
            Arc::clone(&init_gate),
            Arc::clone(&snapshot_source),
            Arc::clone(&lookup),
        ));

        let manager = Arc::new(Self {
            config,
            lookup,
            init_gate,
            snapshot_source,
            multiplexer,
            dispatcher,
            cancellation: CancellationToken::new(),
            assigned_streams: RwLock::new(HashMap::new()),
            running_streams: RwLock::new(HashMap::new()),
        });

        manager.spawn_signal_loop();
        manager
    }

    /// Forward connection-level signals (`Connect`/`Stop`/
    /// `FirstReceivedData`) from the multiplexer to the dispatcher for the
    /// lifetime of the manager. `Disconnect` is deliberately NOT handled
    /// here: it is routed exclusively through the owning stream's dispatch
    /// loop (`ensure_dispatch_loop` below), which also drains that stream's
    /// queued events per spec.md §4.5 -- something only the loop holding the
    /// receiver can do. Handling it here too would apply the
    /// desynchronize/refresh-request transitions twice (harmless, since
    /// they're idempotent, but the drain would still never happen).
    fn spawn_signal_loop(self: &Arc<Self>) {
        let mut signals = self.multiplexer.signals();
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancellation = self.cancellation.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    signal = signals.recv() => {
                        match signal {
                            Ok(StreamSignal::Stop) | Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            Ok(StreamSignal::Disconnect { .. }) => {}
                            Ok(signal) => dispatcher.handle_signal(signal),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("signal channel lagged by {n}");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn the dispatch loop for `stream_id`, once. A second, third, ...
    /// market landing on the same stream just registers in
    /// `assigned_streams`; the loop already drains events for every market
    /// the multiplexer has routed onto that stream.
    ///
    /// Also subscribes to connection signals so it can react to a
    /// `Disconnect` naming its own `stream_id`: applies the dispatcher's
    /// flag transitions and then drains every event still queued on its
    /// receiver (spec.md §4.5 -- a stale event surviving a disconnect would
    /// otherwise be replayed against a book that's about to be reset).
    fn ensure_dispatch_loop(self: &Arc<Self>, stream_id: u64) {
        let mut running = self.running_streams.write().expect("running_streams lock poisoned");
        if running.contains_key(&stream_id) {
            return;
        }

        let Some(mut receiver) = self.multiplexer.take_stream_receiver(stream_id) else {
            // Another caller already took it (race on create_depthcache for
            // two markets assigned to the same fresh stream); benign.
            return;
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let cancellation = self.cancellation.clone();
        let mut signals = self.multiplexer.signals();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    event = receiver.recv() => {
                        match event {
                            Some(envelope) => dispatcher.handle_event(envelope).await,
                            None => break,
                        }
                    }
                    signal = signals.recv() => {
                        match signal {
                            Ok(StreamSignal::Disconnect { stream, markets }) if stream == stream_id => {
                                dispatcher.handle_signal(StreamSignal::Disconnect { stream, markets });
                                let mut drained = 0u64;
                                while receiver.try_recv().is_ok() {
                                    drained += 1;
                                }
                                if drained > 0 {
                                    debug!("drained {drained} queued events for stream {stream_id} after disconnect");
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("stream {stream_id} signal channel lagged by {n}");
                            }
                        }
                    }
                }
            }
            debug!("dispatch loop for stream {stream_id} exited");
        });

        running.insert(stream_id, handle);
    }

    fn canonical(market: &str) -> String {
        market.to_lowercase()
    }

    /// Idempotent per market: creates a `DepthCache`, assigns it to a
    /// stream, and starts (or reuses) that stream's dispatch loop.
    pub fn create_depthcache(self: &Arc<Self>, markets: &[&str], refresh_interval: Option<Duration>) {
        for market in markets {
            let market = Self::canonical(market);

            {
                let mut caches = self.lookup.caches.write().expect("cache registry lock poisoned");
                if caches.contains_key(&market) {
                    continue;
                }
                let refresh_interval = refresh_interval.or(self.config.default_refresh_interval);
                caches.insert(market.clone(), Arc::new(DepthCache::new(market.clone(), refresh_interval)));
            }

            let stream_id = self.multiplexer.assign(&market);
            self.assigned_streams
                .write()
                .expect("assigned_streams lock poisoned")
                .insert(market.clone(), stream_id);
            self.ensure_dispatch_loop(stream_id);

            info!("depth cache created for '{market}' on stream {stream_id}");
        }
    }

    /// Marks `stop_request`, unsubscribes from the stream, and removes the
    /// cache from the registry. Further reads fail with `NotFound`.
    pub fn stop_depthcache(&self, markets: &[&str]) -> Result<()> {
        for market in markets {
            let market = Self::canonical(market);
            let cache = {
                let mut caches = self.lookup.caches.write().expect("cache registry lock poisoned");
                caches.remove(&market)
            };
            let Some(cache) = cache else {
                return Err(DepthCacheError::NotFound { market });
            };
            cache.request_stop();
            cache.set_stream_status(StreamStatus::Stopped);
            self.multiplexer.unsubscribe(&market);
            self.assigned_streams
                .write()
                .expect("assigned_streams lock poisoned")
                .remove(&market);
        }
        Ok(())
    }

    fn get_cache(&self, market: &str) -> Result<Arc<DepthCache>> {
        let market = Self::canonical(market);
        let caches = self.lookup.caches.read().expect("cache registry lock poisoned");
        let cache = caches.get(&market).ok_or_else(|| DepthCacheError::NotFound { market: market.clone() })?;
        if cache.is_stopped() {
            return Err(DepthCacheError::AlreadyStopped { market });
        }
        if !cache.is_synchronized() {
            return Err(DepthCacheError::OutOfSync { market });
        }
        Ok(Arc::clone(cache))
    }

    pub fn get_asks(&self, market: &str, limit_count: Option<usize>, threshold_volume: Option<f64>) -> Result<Vec<(String, f64)>> {
        let cache = self.get_cache(market)?;
        Ok(cache.asks.view(false, limit_count, threshold_volume))
    }

    pub fn get_bids(&self, market: &str, limit_count: Option<usize>, threshold_volume: Option<f64>) -> Result<Vec<(String, f64)>> {
        let cache = self.get_cache(market)?;
        Ok(cache.bids.view(true, limit_count, threshold_volume))
    }

    pub fn is_depth_cache_synchronized(&self, market: &str) -> bool {
        let market = Self::canonical(market);
        self.lookup
            .caches
            .read()
            .expect("cache registry lock poisoned")
            .get(&market)
            .map(|c| c.is_synchronized())
            .unwrap_or(false)
    }

    pub fn get_list_of_depth_caches(&self) -> Vec<String> {
        self.lookup
            .caches
            .read()
            .expect("cache registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Diagnostics (spec.md §3 `stream_status`): `None` if the market has no
    /// cache (never created, or already removed by `stop_depthcache`).
    pub fn get_stream_status(&self, market: &str) -> Option<StreamStatus> {
        let market = Self::canonical(market);
        self.lookup
            .caches
            .read()
            .expect("cache registry lock poisoned")
            .get(&market)
            .map(|c| c.stream_status())
    }

    /// External forced re-anchor (spec.md §4.7).
    pub fn set_refresh_request(&self, markets: &[&str]) {
        let caches = self.lookup.caches.read().expect("cache registry lock poisoned");
        for market in markets {
            let market = Self::canonical(market);
            if let Some(cache) = caches.get(&market) {
                cache.request_refresh();
            }
        }
    }

    /// Manager-wide shutdown: cancels every dispatch/signal loop, stops the
    /// multiplexer, and marks every remaining cache stopped.
    pub fn stop_manager(&self) {
        self.cancellation.cancel();
        self.multiplexer.stop();
        let caches = self.lookup.caches.read().expect("cache registry lock poisoned");
        for cache in caches.values() {
            cache.request_stop();
            cache.set_stream_status(StreamStatus::Stopped);
        }
    }

    pub fn init_gate(&self) -> &Arc<InitGate> {
        &self.init_gate
    }
}

impl CacheLookup for DepthCacheManager {
    fn get(&self, market: &str) -> Option<Arc<DepthCache>> {
        self.lookup.get(market)
    }
}
