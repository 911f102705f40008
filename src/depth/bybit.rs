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
use crate::symbols::bybit as sym;
use crate::traits::{DepthSource, OrderBookCallback};
use crate::types::{OrderBook, Side};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const DEPTH: u32 = 50;
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

/// `snapshot` replaces the book outright; `delta` merges sparse levels in.
fn apply_message(book: &mut OrderBook, msg_type: &str, data: &serde_json::Value) -> Option<()> {
    let bids = parse_levels(data.get("b")?)?;
    let asks = parse_levels(data.get("a")?)?;
    let update_id = data.get("u").and_then(|v| v.as_u64()).unwrap_or(book.last_update_id);

    if msg_type == "snapshot" {
        book.bids.clear();
        book.asks.clear();
    }
    super::merge_levels(book, Side::Bid, &bids);
    super::merge_levels(book, Side::Ask, &asks);
    book.last_update_id = update_id;
    book.initialized = true;
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

    async fn handle_orderbook_message(&self, parsed: &serde_json::Value) {
        let Some(topic) = parsed.get("topic").and_then(|v| v.as_str()) else { return };
        if !topic.starts_with("orderbook.") {
            return;
        }
        let Some(venue_symbol) = topic.rsplit('.').next() else { return };
        let Some(msg_type) = parsed.get("type").and_then(|v| v.as_str()) else { return };
        let Some(data) = parsed.get("data") else { return };

        let canonical = sym::from_venue(venue_symbol);
        let mut books = self.books.lock().await;

        if msg_type != "snapshot" {
            if !books.contains_key(&canonical) {
                warn!("⚠️ Bybit delta for {canonical} received before snapshot, discarding");
                return;
            }
        } else if !books.contains_key(&canonical) {
            books.insert(canonical.clone(), OrderBook::new(&canonical));
        }

        if let Some(book) = books.get_mut(&canonical) {
            if apply_message(book, msg_type, data).is_none() {
                warn!("⚠️ Bybit malformed orderbook message for {canonical}");
                return;
            }
            let snapshot = book.clone();
            drop(books);
            self.publish(&canonical, snapshot).await;
        }
    }
}

pub struct BybitDepthAdapter {
    shared: Arc<Shared>,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl BybitDepthAdapter {
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

impl Default for BybitDepthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSource for BybitDepthAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Bybit depth adapter already running");
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
                    cbs.keys().cloned().collect()
                };
                if symbols.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                info!("Connecting to Bybit depth WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Bybit WS connected");
                        backoff.reset();
                        let (mut write, mut read) = ws_stream.split();

                        let args: Vec<String> = symbols
                            .iter()
                            .map(|s| format!("orderbook.{DEPTH}.{}", sym::to_venue(s)))
                            .collect();
                        let subscribe_msg = serde_json::json!({"op": "subscribe", "args": args});
                        if write.send(Message::Text(subscribe_msg.to_string())).await.is_err() {
                            warn!("⚠️ Bybit subscribe send failed");
                            continue;
                        }

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        let shared = shared.clone();
                                        tokio::spawn(async move {
                                            shared.handle_orderbook_message(&parsed).await;
                                        });
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) => {
                                    warn!("⚠️ Bybit WS closed by server, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Bybit WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ Bybit WS connect failed: {e}");
                    }
                }

                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
            }
            info!("🛑 Bybit depth adapter stopped");
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
    fn snapshot_replaces_book_contents() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_level(Side::Bid, 50.0, 1.0);
        let data = serde_json::json!({
            "b": [["100.0", "2.0"]],
            "a": [["101.0", "1.0"]],
            "u": 5,
        });
        apply_message(&mut book, "snapshot", &data).unwrap();
        assert_eq!(book.best_bid().unwrap(), 100.0);
        assert_eq!(book.last_update_id, 5);
    }

    #[test]
    fn delta_merges_without_clearing() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_level(Side::Bid, 100.0, 1.0);
        book.apply_level(Side::Bid, 99.0, 1.0);
        let data = serde_json::json!({
            "b": [["99.0", "0.0"]],
            "a": [],
            "u": 6,
        });
        apply_message(&mut book, "delta", &data).unwrap();
        assert_eq!(book.best_bid().unwrap(), 100.0);
        assert!(book.bids.get(&crate::types::OrderedPrice(99.0)).is_none());
    }

    #[tokio::test]
    async fn delta_before_snapshot_is_discarded() {
        let shared = Shared {
            books: AsyncMutex::new(HashMap::new()),
            callbacks: AsyncMutex::new(HashMap::new()),
        };
        let msg = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "data": {"b": [["100.0", "1.0"]], "a": [], "u": 1},
        });
        shared.handle_orderbook_message(&msg).await;
        assert!(shared.books.lock().await.get("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn snapshot_after_discarded_delta_seeds_book_and_fires_callback() {
        let shared = Arc::new(Shared {
            books: AsyncMutex::new(HashMap::new()),
            callbacks: AsyncMutex::new(HashMap::new()),
        });
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_clone = seen.clone();
        let callback: OrderBookCallback = Arc::new(move |book| {
            *seen_clone.lock().unwrap() = Some(book);
        });
        shared.callbacks.lock().await.entry("BTCUSDT".to_string()).or_default().push(callback);

        let delta = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "data": {"b": [["100.0", "1.0"]], "a": [], "u": 1},
        });
        shared.handle_orderbook_message(&delta).await;
        assert!(shared.books.lock().await.get("BTCUSDT").is_none());

        let snap = serde_json::json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "snapshot",
            "data": {"b": [["100.0", "1.0"]], "a": [["101.0", "2.0"]], "u": 2},
        });
        shared.handle_orderbook_message(&snap).await;
        let book = shared.books.lock().await.get("BTCUSDT").cloned().unwrap();
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.best_ask(), Some(101.0));

        assert!(seen.lock().unwrap().is_some());
    }
}
