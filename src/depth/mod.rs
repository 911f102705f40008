pub mod aster;
pub mod binance;
pub mod bybit;
pub mod hyperliquid;
pub mod lighter;
pub mod okx;

use crate::types::{OrderBook, Side};

/// Merges a vector of `[price, qty]` levels into an existing book side.
/// Shared by every venue whose delta feed ships sparse level updates
/// (Bybit, OKX, Lighter, Aster) rather than a full replacement snapshot.
pub(crate) fn merge_levels(book: &mut OrderBook, side: Side, levels: &[(f64, f64)]) {
    for &(price, size) in levels {
        book.apply_level(side, price, size);
    }
}
