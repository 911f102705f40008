use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::stats::AdapterStatsSnapshot;
use crate::types::{FillEvent, OrderBook};

pub type OrderBookCallback = Arc<dyn Fn(OrderBook) + Send + Sync>;
pub type FillCallback = Arc<dyn Fn(FillEvent) + Send + Sync>;

/// A venue's public order-book replica feed. One implementation per venue
/// in `crate::depth`.
#[async_trait]
pub trait DepthSource: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    async fn stop(&self);
    fn subscribe(&self, symbol: &str, callback: OrderBookCallback);
    fn get_latest_orderbook(&self, symbol: &str) -> Option<OrderBook>;
    fn get_stats(&self) -> AdapterStatsSnapshot;
}

/// A venue's authenticated private fill-event feed. One implementation per
/// venue in `crate::fills`. The fill callback is supplied once at
/// construction (matching the Python original's
/// `__init__(self, exchange_code, on_fill_callback)`), not registered later.
#[async_trait]
pub trait FillSource: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    async fn stop(&self);
    fn get_stats(&self) -> AdapterStatsSnapshot;
}
