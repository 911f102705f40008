//! Venue code -> adapter constructor table, mirroring the role of the
//! original `StreamFactory`: look up a venue, construct its [`DepthSource`],
//! subscribe the caller's callback, and hand back a ready-to-start adapter.

use std::sync::Arc;

use log::{error, info};

use crate::depth::aster::AsterDepthAdapter;
use crate::depth::binance::BinanceDepthAdapter;
use crate::depth::bybit::BybitDepthAdapter;
use crate::depth::hyperliquid::HyperliquidDepthAdapter;
use crate::depth::lighter::LighterDepthAdapter;
use crate::depth::okx::OkxDepthAdapter;
use crate::error::AdapterError;
use crate::traits::{DepthSource, OrderBookCallback};

/// The six venues this crate knows how to stream from. Unknown venue codes
/// are rejected by [`create_orderbook_stream`] rather than panicking.
pub const SUPPORTED_VENUES: &[&str] = &["binance", "bybit", "okx", "hyperliquid", "lighter", "aster"];

fn build_adapter(venue: &str) -> Option<Arc<dyn DepthSource>> {
    match venue {
        "binance" => Some(Arc::new(BinanceDepthAdapter::new())),
        "bybit" => Some(Arc::new(BybitDepthAdapter::new())),
        "okx" => Some(Arc::new(OkxDepthAdapter::new())),
        "hyperliquid" => Some(Arc::new(HyperliquidDepthAdapter::new())),
        "lighter" => Some(Arc::new(LighterDepthAdapter::new())),
        "aster" => Some(Arc::new(AsterDepthAdapter::new())),
        _ => None,
    }
}

/// Builds the depth adapter for `venue` and subscribes `callback` to
/// `symbol` on it. Does not call `start()` — the caller decides when to go
/// live, typically via [`start_streams`].
pub fn create_orderbook_stream(
    venue: &str,
    symbol: &str,
    callback: OrderBookCallback,
) -> Result<Arc<dyn DepthSource>, AdapterError> {
    let venue = venue.to_lowercase();
    let adapter = build_adapter(&venue)
        .ok_or_else(|| AdapterError::Protocol(format!("unsupported venue: {venue}")))?;
    adapter.subscribe(symbol, callback);
    Ok(adapter)
}

/// Builds two depth adapters for the same symbol on two different venues —
/// the shape every cross-venue hedge pair needs. Each side fails
/// independently; a venue lookup failure on one side does not prevent the
/// other from being constructed.
pub fn create_symbol_streams(
    venue_a: &str,
    venue_b: &str,
    symbol: &str,
    callback_a: OrderBookCallback,
    callback_b: OrderBookCallback,
) -> (Option<Arc<dyn DepthSource>>, Option<Arc<dyn DepthSource>>) {
    let a = create_orderbook_stream(venue_a, symbol, callback_a)
        .map_err(|e| error!("❌ failed to create {venue_a} stream for {symbol}: {e}"))
        .ok();
    let b = create_orderbook_stream(venue_b, symbol, callback_b)
        .map_err(|e| error!("❌ failed to create {venue_b} stream for {symbol}: {e}"))
        .ok();
    (a, b)
}

/// Starts every adapter concurrently, logging (not failing) on individual
/// start errors so one bad venue doesn't block the rest.
pub async fn start_streams(streams: &[Arc<dyn DepthSource>]) {
    let futures = streams.iter().map(|s| s.start());
    let results = futures_util::future::join_all(futures).await;
    for result in results {
        if let Err(e) = result {
            error!("❌ failed to start stream: {e}");
        }
    }
    info!("🔄 {} stream(s) started", streams.len());
}

/// Stops every adapter concurrently. Stopping is infallible by contract
/// (see [`DepthSource::stop`]), so this never partially fails.
pub async fn stop_streams(streams: &[Arc<dyn DepthSource>]) {
    let futures = streams.iter().map(|s| s.stop());
    futures_util::future::join_all(futures).await;
    info!("⏹️ {} stream(s) stopped", streams.len());
}

pub fn validate_venue_support(venue: &str) -> bool {
    SUPPORTED_VENUES.contains(&venue.to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn noop_callback() -> OrderBookCallback {
        Arc::new(|_book| {})
    }

    #[test]
    fn unsupported_venue_is_rejected() {
        let err = create_orderbook_stream("deribit", "BTCUSDT", noop_callback()).unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }

    #[test]
    fn all_supported_venues_build_successfully() {
        for venue in SUPPORTED_VENUES {
            assert!(create_orderbook_stream(venue, "BTCUSDT", noop_callback()).is_ok());
        }
    }

    #[test]
    fn venue_lookup_is_case_insensitive() {
        assert!(create_orderbook_stream("BINANCE", "BTCUSDT", noop_callback()).is_ok());
    }

    #[test]
    fn cross_venue_pair_builds_both_sides() {
        let (a, b) = create_symbol_streams("binance", "okx", "BTCUSDT", noop_callback(), noop_callback());
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[test]
    fn cross_venue_pair_one_bad_venue_still_builds_the_other() {
        let (a, b) = create_symbol_streams("binance", "deribit", "BTCUSDT", noop_callback(), noop_callback());
        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[test]
    fn subscribing_registers_the_callback() {
        let seen = Arc::new(Mutex::new(false));
        let seen_clone = seen.clone();
        let callback: OrderBookCallback = Arc::new(move |_book| {
            *seen_clone.lock().unwrap() = true;
        });
        let adapter = create_orderbook_stream("binance", "BTCUSDT", callback).unwrap();
        // The adapter doesn't publish until a real update arrives; this just
        // confirms subscribe() didn't panic and the adapter is usable.
        assert!(adapter.get_latest_orderbook("BTCUSDT").is_none());
    }
}
