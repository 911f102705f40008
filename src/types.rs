use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// `f64` wrapper giving price levels a total order so they can key a
/// [`BTreeMap`]. Order book prices are never NaN in practice (they come
/// straight off the wire as decimal strings), so `total_cmp` is safe here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderedPrice(pub f64);

impl Eq for OrderedPrice {}

impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A single (venue, symbol) order book replica.
///
/// `bids` iterates ascending by price (lowest first); callers that want
/// best-bid-first should use `.bids.iter().next_back()` or [`OrderBook::best_bid`].
/// Same convention for `asks` (best ask is the lowest price, so it's the
/// first entry).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: BTreeMap<OrderedPrice, f64>,
    pub asks: BTreeMap<OrderedPrice, f64>,
    pub last_update_id: u64,
    pub timestamp: f64,
    pub initialized: bool,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            timestamp: now_secs(),
            initialized: false,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|p| p.0)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|p| p.0)
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    pub fn spread_pct(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid == 0.0 {
            return None;
        }
        Some(self.spread()? / mid)
    }

    /// Sums base quantity and quote value across the top `n` levels on one side.
    pub fn depth_to(&self, n: usize, side: Side) -> (f64, f64) {
        let iter: Box<dyn Iterator<Item = (&OrderedPrice, &f64)>> = match side {
            Side::Bid => Box::new(self.bids.iter().rev()),
            Side::Ask => Box::new(self.asks.iter()),
        };
        iter.take(n).fold((0.0, 0.0), |(qty, val), (price, size)| {
            (qty + size, val + price.0 * size)
        })
    }

    pub fn is_stale(&self, now: f64, max_age_secs: f64) -> bool {
        (now - self.timestamp) > max_age_secs
    }

    /// Stamps the book with the current wall-clock time, used whenever a
    /// venue message updates the book in place rather than replacing it.
    pub fn touch(&mut self) {
        self.timestamp = now_secs();
    }

    /// True if any bid price is >= any ask price — an invariant violation
    /// that should never be published to consumers.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Applies one price/size level. A size of exactly 0.0 deletes the level
    /// (the universal semantics across every venue's delta feed).
    pub fn apply_level(&mut self, side: Side, price: f64, size: f64) {
        let key = OrderedPrice(price);
        let book = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if size == 0.0 {
            book.remove(&key);
        } else {
            book.insert(key, size);
        }
    }

    /// Truncates both sides to at most `n` levels, keeping the best prices.
    pub fn truncate(&mut self, n: usize) {
        while self.bids.len() > n {
            let worst = *self.bids.keys().next().unwrap();
            self.bids.remove(&worst);
        }
        while self.asks.len() > n {
            let worst = *self.asks.keys().next_back().unwrap();
            self.asks.remove(&worst);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillSide {
    Buy,
    Sell,
}

impl FillSide {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(FillSide::Buy),
            "SELL" => Some(FillSide::Sell),
            _ => None,
        }
    }
}

/// A single private-channel fill, normalized across venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub exchange_code: String,
    pub symbol: String,
    pub order_id: String,
    pub side: FillSide,
    pub filled_quantity: f64,
    pub filled_price: f64,
    pub trade_id: String,
    pub timestamp: f64,
    pub commission: f64,
    pub commission_asset: String,
}

impl FillEvent {
    pub fn filled_value_usd(&self) -> f64 {
        self.filled_quantity * self.filled_price
    }

    pub fn position_change(&self) -> f64 {
        match self.side {
            FillSide::Buy => self.filled_quantity,
            FillSide::Sell => -self.filled_quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

/// Tracks the running fill state of a single order, recomputing a
/// volume-weighted average price as fills arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub exchange_code: String,
    pub symbol: String,
    pub order_id: String,
    pub side: FillSide,
    pub order_type: String,
    pub original_quantity: f64,
    pub filled_quantity: f64,
    pub average_price: f64,
    pub status: OrderState,
    pub create_time: f64,
    pub update_time: f64,
    pub commission: f64,
    pub commission_asset: String,
}

impl OrderStatus {
    pub fn remaining_quantity(&self) -> f64 {
        self.original_quantity - self.filled_quantity
    }

    pub fn fill_percentage(&self) -> f64 {
        if self.original_quantity == 0.0 {
            return 0.0;
        }
        (self.filled_quantity / self.original_quantity) * 100.0
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderState::New | OrderState::PartiallyFilled)
    }

    pub fn filled_value_usd(&self) -> f64 {
        self.filled_quantity * self.average_price
    }

    /// Adds a fill, recomputing the VWAP over all fills seen so far.
    /// Clamps `filled_quantity` to `original_quantity` on overfill so the
    /// invariant `filled_quantity <= original_quantity` always holds.
    pub fn add_fill(&mut self, fill_quantity: f64, fill_price: f64, now: f64) {
        if self.filled_quantity == 0.0 {
            self.average_price = fill_price;
            self.filled_quantity = fill_quantity;
        } else {
            let total_value = self.filled_quantity * self.average_price + fill_quantity * fill_price;
            self.filled_quantity += fill_quantity;
            self.average_price = total_value / self.filled_quantity;
        }

        if self.filled_quantity >= self.original_quantity {
            self.filled_quantity = self.original_quantity;
            self.status = OrderState::Filled;
        } else {
            self.status = OrderState::PartiallyFilled;
        }

        self.update_time = now;
    }
}

/// Records a hedge leg executed in response to an originating fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeEvent {
    pub original_fill: FillEvent,
    pub hedge_symbol: String,
    pub hedge_exchange: String,
    pub hedge_side: FillSide,
    pub hedge_quantity: f64,
    pub hedge_order_id: String,
    pub hedge_price: f64,
    pub hedge_timestamp: f64,
    pub latency_ms: f64,
}

impl HedgeEvent {
    pub fn new(
        original_fill: FillEvent,
        hedge_symbol: String,
        hedge_exchange: String,
        hedge_side: FillSide,
        hedge_quantity: f64,
        hedge_order_id: String,
        hedge_price: f64,
        hedge_timestamp: f64,
    ) -> Self {
        let latency_ms = (hedge_timestamp - original_fill.timestamp) * 1000.0;
        Self {
            original_fill,
            hedge_symbol,
            hedge_exchange: hedge_exchange.to_lowercase(),
            hedge_side,
            hedge_quantity,
            hedge_order_id,
            hedge_price,
            hedge_timestamp,
            latency_ms,
        }
    }

    pub fn hedge_value_usd(&self) -> f64 {
        self.hedge_quantity * self.hedge_price
    }

    pub fn is_effective_hedge(&self) -> bool {
        self.original_fill.side != self.hedge_side
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        let mut b = OrderBook::new("BTCUSDT");
        b.apply_level(Side::Bid, 100.0, 1.0);
        b.apply_level(Side::Bid, 99.0, 2.0);
        b.apply_level(Side::Ask, 101.0, 1.5);
        b.apply_level(Side::Ask, 102.0, 3.0);
        b.initialized = true;
        b
    }

    #[test]
    fn best_bid_ask_and_mid() {
        let b = book();
        assert_eq!(b.best_bid(), Some(100.0));
        assert_eq!(b.best_ask(), Some(101.0));
        assert_eq!(b.mid_price(), Some(100.5));
    }

    #[test]
    fn zero_size_deletes_level() {
        let mut b = book();
        b.apply_level(Side::Bid, 100.0, 0.0);
        assert_eq!(b.best_bid(), Some(99.0));
    }

    #[test]
    fn not_crossed_by_default() {
        assert!(!book().is_crossed());
    }

    #[test]
    fn crossed_book_detected() {
        let mut b = book();
        b.apply_level(Side::Bid, 200.0, 1.0);
        assert!(b.is_crossed());
    }

    #[test]
    fn depth_to_sums_top_n() {
        let b = book();
        let (qty, val) = b.depth_to(1, Side::Bid);
        assert_eq!(qty, 1.0);
        assert_eq!(val, 100.0);
        let (qty2, _) = b.depth_to(10, Side::Bid);
        assert_eq!(qty2, 3.0);
    }

    #[test]
    fn truncate_keeps_best_prices() {
        let mut b = book();
        b.truncate(1);
        assert_eq!(b.bids.len(), 1);
        assert_eq!(b.asks.len(), 1);
        assert_eq!(b.best_bid(), Some(100.0));
        assert_eq!(b.best_ask(), Some(101.0));
    }

    fn fresh_order() -> OrderStatus {
        OrderStatus {
            exchange_code: "binance".into(),
            symbol: "BTCUSDT".into(),
            order_id: "1".into(),
            side: FillSide::Buy,
            order_type: "LIMIT".into(),
            original_quantity: 10.0,
            filled_quantity: 0.0,
            average_price: 0.0,
            status: OrderState::New,
            create_time: 0.0,
            update_time: 0.0,
            commission: 0.0,
            commission_asset: String::new(),
        }
    }

    #[test]
    fn add_fill_computes_vwap() {
        let mut o = fresh_order();
        o.add_fill(4.0, 100.0, 1.0);
        assert_eq!(o.average_price, 100.0);
        assert_eq!(o.status, OrderState::PartiallyFilled);

        o.add_fill(6.0, 110.0, 2.0);
        // (4*100 + 6*110) / 10 = 106
        assert!((o.average_price - 106.0).abs() < 1e-9);
        assert_eq!(o.status, OrderState::Filled);
        assert_eq!(o.filled_quantity, 10.0);
    }

    #[test]
    fn add_fill_clamps_on_overfill() {
        let mut o = fresh_order();
        o.add_fill(12.0, 100.0, 1.0);
        assert_eq!(o.filled_quantity, 10.0);
        assert_eq!(o.status, OrderState::Filled);
    }

    #[test]
    fn hedge_event_latency_and_direction() {
        let fill = FillEvent {
            exchange_code: "binance".into(),
            symbol: "BTCUSDT".into(),
            order_id: "1".into(),
            side: FillSide::Buy,
            filled_quantity: 1.0,
            filled_price: 100.0,
            trade_id: "t1".into(),
            timestamp: 1000.0,
            commission: 0.0,
            commission_asset: "USDT".into(),
        };
        let hedge = HedgeEvent::new(
            fill,
            "BTCUSDT".into(),
            "BYBIT".into(),
            FillSide::Sell,
            1.0,
            "h1".into(),
            100.5,
            1000.05,
        );
        assert_eq!(hedge.hedge_exchange, "bybit");
        assert!((hedge.latency_ms - 50.0).abs() < 1e-6);
        assert!(hedge.is_effective_hedge());
    }
}
