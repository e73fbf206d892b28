//! Local order-book replicas ("depth caches") for a centralized exchange,
//! kept synchronized by stitching a REST snapshot onto a multiplexed
//! WebSocket diff stream, with gap detection and throttled re-init.
//!
//! See [`DepthCacheManager`] for the public entry point.

pub mod book_side;
pub mod cluster;
pub mod config;
pub mod depth_cache;
pub mod dispatcher;
pub mod error;
pub mod init_gate;
pub mod manager;
pub mod snapshot;
pub mod stream;
pub mod types;

pub use cluster::ClusterClient;
pub use config::{DepthCacheConfig, ExchangeFlavor};
pub use depth_cache::{DepthCache, StreamStatus};
pub use error::{DepthCacheError, Result};
pub use init_gate::{InitDecision, InitGate};
pub use manager::DepthCacheManager;
pub use snapshot::{BinanceRestClient, SnapshotSource};
pub use stream::{BinanceStreamMultiplexer, StreamMultiplexer, StreamSignal};
pub use types::{CombinedStreamEnvelope, DiffPayload, OrderBookSnapshot, RawDiffEvent};
