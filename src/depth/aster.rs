use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::adapter::{Backoff, ReconnectSupervisor};
use crate::error::AdapterError;
use crate::stats::AdapterStatsSnapshot;
use crate::symbols::aster as sym;
use crate::traits::{DepthSource, OrderBookCallback};
use crate::types::{OrderBook, Side};

// Aster mirrors Binance USD-M's combined-stream depth wire format directly
// (no dedicated orderbook_stream.py in the source material to ground on;
// the exchange is Binance-API-compatible, so this adapter follows
// `depth::binance` with the REST snapshot / gap-check step dropped since
// Aster's public depth stream ships full snapshots per update instead of
// an incremental diff feed).
const WS_BASE: &str = "wss://fstream.asterdex.com/stream";
const TOP_N: usize = 50;

fn parse_levels(value: &serde_json::Value) -> Option<Vec<(f64, f64)>> {
    let arr = value.as_array()?;
    arr.iter()
        .map(|level| {
            let level = level.as_array()?;
            let price: f64 = level.first()?.as_str()?.parse().ok()?;
            let qty: f64 = level.get(1)?.as_str()?.parse().ok()?;
            Some((price, qty))
        })
        .collect()
}

fn apply_snapshot(book: &mut OrderBook, data: &serde_json::Value) -> Option<()> {
    let bids = parse_levels(data.get("b")?)?;
    let asks = parse_levels(data.get("a")?)?;

    book.bids.clear();
    book.asks.clear();
    super::merge_levels(book, Side::Bid, &bids);
    super::merge_levels(book, Side::Ask, &asks);
    if let Some(update_id) = data.get("u").and_then(|v| v.as_u64()) {
        book.last_update_id = update_id;
    }
    book.initialized = true;
    book.touch();
    book.truncate(TOP_N);
    Some(())
}

struct Shared {
    books: AsyncMutex<HashMap<String, OrderBook>>,
    callbacks: AsyncMutex<HashMap<String, Vec<OrderBookCallback>>>,
}

impl Shared {
    async fn publish(&self, canonical: &str, book: OrderBook) {
        let callbacks = self.callbacks.lock().await;
        if let Some(cbs) = callbacks.get(canonical) {
            for cb in cbs {
                cb(book.clone());
            }
        }
    }

    async fn handle_depth_update(&self, venue_symbol: &str, data: &serde_json::Value) {
        let canonical = sym::from_venue(venue_symbol);
        let mut books = self.books.lock().await;
        let book = books.entry(canonical.clone()).or_insert_with(|| OrderBook::new(&canonical));
        if apply_snapshot(book, data).is_none() {
            warn!("⚠️ Aster malformed depth payload for {canonical}");
            return;
        }
        let snapshot = book.clone();
        drop(books);
        self.publish(&canonical, snapshot).await;
    }
}

pub struct AsterDepthAdapter {
    shared: Arc<Shared>,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl AsterDepthAdapter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                books: AsyncMutex::new(HashMap::new()),
                callbacks: AsyncMutex::new(HashMap::new()),
            }),
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

impl Default for AsterDepthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSource for AsterDepthAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Aster depth adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        let running = sup.running.clone();
        drop(sup);

        let shared = self.shared.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            while running.load(Ordering::Relaxed) {
                let symbols: Vec<String> = {
                    let cbs = shared.callbacks.lock().await;
                    cbs.keys().map(|s| sym::to_venue(s)).collect()
                };
                if symbols.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                let streams: Vec<String> = symbols.iter().map(|s| format!("{}@depth@100ms", s.to_lowercase())).collect();
                let ws_url = format!("{WS_BASE}?streams={}", streams.join("/"));

                info!("Connecting to Aster depth WS: {ws_url}");
                match connect_async(Url::parse(&ws_url).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Aster WS connected");
                        backoff.reset();
                        let (mut write, mut read) = ws_stream.split();

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        if let (Some(stream), Some(data)) = (parsed.get("stream"), parsed.get("data")) {
                                            if let Some(stream_name) = stream.as_str() {
                                                let venue_symbol =
                                                    stream_name.split('@').next().unwrap_or("").to_uppercase();
                                                if !venue_symbol.is_empty() {
                                                    let shared = shared.clone();
                                                    let data = data.clone();
                                                    tokio::spawn(async move {
                                                        shared.handle_depth_update(&venue_symbol, &data).await;
                                                    });
                                                }
                                            }
                                        }
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) => {
                                    warn!("⚠️ Aster WS closed by server, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Aster WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ Aster WS connect failed: {e}");
                    }
                }

                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
            }
            info!("🛑 Aster depth adapter stopped");
        });

        Ok(())
    }

    async fn stop(&self) {
        let sup = self.supervisor.lock().await;
        sup.set_running(false);
    }

    fn subscribe(&self, symbol: &str, callback: OrderBookCallback) {
        let canonical = symbol.to_string();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.callbacks.lock().await.entry(canonical).or_default().push(callback);
        });
    }

    fn get_latest_orderbook(&self, symbol: &str) -> Option<OrderBook> {
        self.shared.books.try_lock().ok()?.get(symbol).cloned()
    }

    fn get_stats(&self) -> AdapterStatsSnapshot {
        self.supervisor
            .try_lock()
            .map(|sup| sup.stats.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_replaces_book_and_tracks_update_id() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_level(Side::Bid, 1.0, 1.0);
        let data = serde_json::json!({
            "b": [["100.0", "2.0"]],
            "a": [["101.0", "1.0"]],
            "u": 42,
        });
        apply_snapshot(&mut book, &data).unwrap();
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.last_update_id, 42);
    }
}
