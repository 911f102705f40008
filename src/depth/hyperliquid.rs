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
use crate::symbols::hyperliquid as sym;
use crate::traits::{DepthSource, OrderBookCallback};
use crate::types::{OrderBook, Side};

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const TOP_N: usize = 50;

/// Hyperliquid's `l2Book` channel ships a full replacement snapshot on
/// every update, unlike the sparse-delta venues. Levels are objects with
/// `px`/`sz` fields (plus an `n` order count we don't need).
fn parse_levels(value: &serde_json::Value) -> Option<Vec<(f64, f64)>> {
    let arr = value.as_array()?;
    arr.iter()
        .map(|level| {
            let price: f64 = level.get("px")?.as_str()?.parse().ok()?;
            let size: f64 = level.get("sz")?.as_str()?.parse().ok()?;
            Some((price, size))
        })
        .collect()
}

fn apply_snapshot(book: &mut OrderBook, data: &serde_json::Value) -> Option<()> {
    let levels = data.get("levels")?.as_array()?;
    let bids = parse_levels(levels.first()?)?;
    let asks = parse_levels(levels.get(1)?)?;

    book.bids.clear();
    book.asks.clear();
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

    async fn handle_message(&self, parsed: &serde_json::Value) {
        let Some(channel) = parsed.get("channel").and_then(|v| v.as_str()) else { return };
        if channel != "l2Book" {
            return;
        }
        let Some(data) = parsed.get("data") else { return };
        let Some(coin) = data.get("coin").and_then(|v| v.as_str()) else { return };

        let canonical = sym::from_venue(coin);
        let mut books = self.books.lock().await;
        let book = books.entry(canonical.clone()).or_insert_with(|| OrderBook::new(&canonical));
        if apply_snapshot(book, data).is_none() {
            warn!("⚠️ Hyperliquid malformed l2Book payload for {canonical}");
            return;
        }
        let snapshot = book.clone();
        drop(books);
        self.publish(&canonical, snapshot).await;
    }
}

pub struct HyperliquidDepthAdapter {
    shared: Arc<Shared>,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl HyperliquidDepthAdapter {
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

impl Default for HyperliquidDepthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSource for HyperliquidDepthAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Hyperliquid depth adapter already running");
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

                info!("Connecting to Hyperliquid depth WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Hyperliquid WS connected");
                        backoff.reset();
                        let (mut write, mut read) = ws_stream.split();

                        for symbol in &symbols {
                            let coin = sym::to_venue(symbol);
                            let sub = serde_json::json!({
                                "method": "subscribe",
                                "subscription": {"type": "l2Book", "coin": coin},
                            });
                            if write.send(Message::Text(sub.to_string())).await.is_err() {
                                warn!("⚠️ Hyperliquid subscribe send failed for {symbol}");
                            }
                        }

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        let shared = shared.clone();
                                        tokio::spawn(async move {
                                            shared.handle_message(&parsed).await;
                                        });
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) => {
                                    warn!("⚠️ Hyperliquid WS closed by server, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Hyperliquid WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ Hyperliquid WS connect failed: {e}");
                    }
                }

                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
            }
            info!("🛑 Hyperliquid depth adapter stopped");
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
    fn snapshot_replaces_full_book() {
        let mut book = OrderBook::new("BTCUSDT");
        book.apply_level(Side::Bid, 1.0, 1.0);
        let data = serde_json::json!({
            "coin": "BTC",
            "levels": [
                [{"px": "50000", "sz": "1.5", "n": 3}],
                [{"px": "50100", "sz": "2.0", "n": 5}],
            ],
            "time": 1234567890000i64,
        });
        apply_snapshot(&mut book, &data).unwrap();
        assert_eq!(book.best_bid(), Some(50000.0));
        assert_eq!(book.best_ask(), Some(50100.0));
        assert_eq!(book.bids.len(), 1);
    }

    #[tokio::test]
    async fn handle_message_ignores_other_channels() {
        let shared = Shared {
            books: AsyncMutex::new(HashMap::new()),
            callbacks: AsyncMutex::new(HashMap::new()),
        };
        let msg = serde_json::json!({"channel": "subscriptionResponse", "data": {}});
        shared.handle_message(&msg).await;
        assert!(shared.books.lock().await.is_empty());
    }
}
