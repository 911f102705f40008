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
use crate::symbols::okx as sym;
use crate::traits::{DepthSource, OrderBookCallback};
use crate::types::{OrderBook, Side};

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const TOP_N: usize = 50;
/// How long a cached book may go without an update before it is treated as
/// stale (spec §4.3 reconnect/stale-cache scenario).
const STALE_AFTER_SECS: f64 = 10.0;

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

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

fn apply_message(book: &mut OrderBook, action: &str, entry: &serde_json::Value) -> Option<()> {
    let bids = parse_levels(entry.get("bids")?)?;
    let asks = parse_levels(entry.get("asks")?)?;

    if action == "snapshot" {
        book.bids.clear();
        book.asks.clear();
    }
    super::merge_levels(book, Side::Bid, &bids);
    super::merge_levels(book, Side::Ask, &asks);
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

    async fn handle_books_message(&self, parsed: &serde_json::Value) {
        let Some(arg) = parsed.get("arg") else { return };
        let Some(channel) = arg.get("channel").and_then(|v| v.as_str()) else { return };
        if channel != "books" {
            return;
        }
        let Some(inst_id) = arg.get("instId").and_then(|v| v.as_str()) else { return };
        let Some(action) = parsed.get("action").and_then(|v| v.as_str()) else { return };
        let Some(entries) = parsed.get("data").and_then(|v| v.as_array()) else { return };

        let canonical = sym::from_venue(inst_id);
        let mut books = self.books.lock().await;
        let book = books.entry(canonical.clone()).or_insert_with(|| OrderBook::new(&canonical));

        for entry in entries {
            if apply_message(book, action, entry).is_none() {
                warn!("⚠️ OKX malformed books message for {canonical}");
                return;
            }
        }
        let snapshot = book.clone();
        drop(books);
        self.publish(&canonical, snapshot).await;
    }

    /// Returns cached books whose last update is older than [`STALE_AFTER_SECS`].
    async fn stale_symbols(&self) -> Vec<String> {
        let now = now_secs();
        let books = self.books.lock().await;
        books
            .iter()
            .filter(|(_, b)| b.is_stale(now, STALE_AFTER_SECS))
            .map(|(s, _)| s.clone())
            .collect()
    }
}

pub struct OkxDepthAdapter {
    shared: Arc<Shared>,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl OkxDepthAdapter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                books: AsyncMutex::new(HashMap::new()),
                callbacks: AsyncMutex::new(HashMap::new()),
            }),
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }

    /// Symbols whose cached book hasn't been touched recently; the caller
    /// typically warns or force-reconnects rather than serving them stale.
    pub async fn stale_symbols(&self) -> Vec<String> {
        self.shared.stale_symbols().await
    }
}

impl Default for OkxDepthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSource for OkxDepthAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ OKX depth adapter already running");
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

                info!("Connecting to OKX depth WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ OKX WS connected");
                        backoff.reset();
                        let (mut write, mut read) = ws_stream.split();

                        let args: Vec<serde_json::Value> = symbols
                            .iter()
                            .map(|s| serde_json::json!({"channel": "books", "instId": sym::to_venue(s)}))
                            .collect();
                        let subscribe_msg = serde_json::json!({"op": "subscribe", "args": args});
                        if write.send(Message::Text(subscribe_msg.to_string())).await.is_err() {
                            warn!("⚠️ OKX subscribe send failed");
                            continue;
                        }

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        let shared = shared.clone();
                                        tokio::spawn(async move {
                                            shared.handle_books_message(&parsed).await;
                                        });
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) => {
                                    warn!("⚠️ OKX WS closed by server, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ OKX WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ OKX WS connect failed: {e}");
                    }
                }

                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
            }
            info!("🛑 OKX depth adapter stopped");
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
    fn snapshot_then_update_merges() {
        let mut book = OrderBook::new("BTCUSDT");
        let snap = serde_json::json!({"bids": [["100.0", "1.0"]], "asks": [["101.0", "1.0"]]});
        apply_message(&mut book, "snapshot", &snap).unwrap();
        let update = serde_json::json!({"bids": [["100.0", "0.0"]], "asks": [["101.5", "2.0"]]});
        apply_message(&mut book, "update", &update).unwrap();
        assert!(book.bids.is_empty());
        assert_eq!(book.asks.len(), 2);
    }

    #[tokio::test]
    async fn stale_book_detected_after_timeout() {
        let shared = Shared {
            books: AsyncMutex::new(HashMap::new()),
            callbacks: AsyncMutex::new(HashMap::new()),
        };
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_level(Side::Bid, 100.0, 1.0);
        book.timestamp = now_secs() - STALE_AFTER_SECS - 1.0;
        shared.books.lock().await.insert("BTCUSDT".to_string(), book);
        let stale = shared.stale_symbols().await;
        assert_eq!(stale, vec!["BTCUSDT".to_string()]);
    }
}
