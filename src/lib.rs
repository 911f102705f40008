//! Market-data streaming core: depth (order book) and private fill-event
//! replicas for Binance USD-M, Bybit linear v5, OKX, Hyperliquid, Lighter,
//! and Aster.

pub mod adapter;
pub mod depth;
pub mod error;
pub mod fills;
pub mod manager;
pub mod registry;
pub mod stats;
pub mod symbols;
pub mod traits;
pub mod types;

pub use error::AdapterError;
pub use manager::{HealthReport, HealthStatus, StreamManager};
pub use registry::SUPPORTED_VENUES;
pub use stats::AdapterStatsSnapshot;
pub use traits::{DepthSource, FillCallback, FillSource, OrderBookCallback};
pub use types::{FillEvent, FillSide, OrderBook, Side};
