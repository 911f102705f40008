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
use crate::symbols::lighter as sym;
use crate::traits::{DepthSource, OrderBookCallback};
use crate::types::{OrderBook, Side};

const REST_BASE: &str = "https://mainnet.zklighter.elliot.ai";
const WS_URL: &str = "wss://mainnet.zklighter.elliot.ai/stream";
const TOP_N: usize = 50;

fn parse_numeric_field(item: &serde_json::Value, field: &str) -> Option<f64> {
    let value = item.get(field)?;
    value.as_f64().or_else(|| value.as_str()?.parse().ok())
}

fn parse_levels(value: &serde_json::Value) -> Option<Vec<(f64, f64)>> {
    let arr = value.as_array()?;
    arr.iter()
        .map(|item| Some((parse_numeric_field(item, "price")?, parse_numeric_field(item, "size")?)))
        .collect()
}

/// Lighter's order-book websocket update carries a full replacement
/// snapshot of both sides, keyed by market id rather than symbol.
fn apply_snapshot(book: &mut OrderBook, payload: &serde_json::Value) -> Option<()> {
    let bids = parse_levels(payload.get("bids").unwrap_or(&serde_json::Value::Array(vec![])))?;
    let asks = parse_levels(payload.get("asks").unwrap_or(&serde_json::Value::Array(vec![])))?;

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
    market_id_to_symbol: AsyncMutex<HashMap<u64, String>>,
    symbol_to_market_id: AsyncMutex<HashMap<String, u64>>,
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

    async fn resolve_market_mapping(&self, client: &reqwest::Client) -> Result<(), AdapterError> {
        let url = format!("{REST_BASE}/api/v1/orderBookDetails");
        let resp = client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AdapterError::Connection(format!("lighter market list fetch failed: {e}")))?;
        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("lighter market list decode failed: {e}")))?;

        let details = data
            .get("order_book_details")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::Protocol("missing order_book_details".into()))?;

        let mut id_to_symbol = self.market_id_to_symbol.lock().await;
        let mut symbol_to_id = self.symbol_to_market_id.lock().await;
        for detail in details {
            if detail.get("status").and_then(|v| v.as_str()) != Some("active") {
                continue;
            }
            let Some(market_id) = detail.get("market_id").and_then(|v| v.as_u64()) else { continue };
            let Some(base) = detail.get("symbol").and_then(|v| v.as_str()) else { continue };
            let canonical = sym::from_venue(&format!("{base}USDT"));
            id_to_symbol.insert(market_id, canonical.clone());
            symbol_to_id.insert(canonical, market_id);
        }
        Ok(())
    }

    async fn handle_message(&self, parsed: &serde_json::Value) {
        let Some(channel) = parsed.get("channel").and_then(|v| v.as_str()) else { return };
        if !channel.starts_with("order_book/") {
            return;
        }
        let Some(market_id) = channel.rsplit('/').next().and_then(|s| s.parse::<u64>().ok()) else { return };
        let Some(payload) = parsed.get("order_book") else { return };

        let canonical = {
            let id_to_symbol = self.market_id_to_symbol.lock().await;
            match id_to_symbol.get(&market_id) {
                Some(s) => s.clone(),
                None => return,
            }
        };

        let mut books = self.books.lock().await;
        let book = books.entry(canonical.clone()).or_insert_with(|| OrderBook::new(&canonical));
        if apply_snapshot(book, payload).is_none() {
            warn!("⚠️ Lighter malformed order book payload for {canonical}");
            return;
        }
        let snapshot = book.clone();
        drop(books);
        self.publish(&canonical, snapshot).await;
    }
}

pub struct LighterDepthAdapter {
    shared: Arc<Shared>,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl LighterDepthAdapter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                books: AsyncMutex::new(HashMap::new()),
                callbacks: AsyncMutex::new(HashMap::new()),
                market_id_to_symbol: AsyncMutex::new(HashMap::new()),
                symbol_to_market_id: AsyncMutex::new(HashMap::new()),
            }),
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

impl Default for LighterDepthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSource for LighterDepthAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Lighter depth adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        let running = sup.running.clone();
        drop(sup);

        let shared = self.shared.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            while running.load(Ordering::Relaxed) {
                if shared.market_id_to_symbol.lock().await.is_empty() {
                    let client = reqwest::Client::new();
                    if let Err(e) = shared.resolve_market_mapping(&client).await {
                        error!("❌ Lighter market mapping fetch failed: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                }

                let market_ids: Vec<u64> = {
                    let cbs = shared.callbacks.lock().await;
                    let symbol_to_id = shared.symbol_to_market_id.lock().await;
                    cbs.keys().filter_map(|s| symbol_to_id.get(s).copied()).collect()
                };
                if market_ids.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                info!("Connecting to Lighter depth WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Lighter WS connected");
                        backoff.reset();
                        let (mut write, mut read) = ws_stream.split();

                        for market_id in &market_ids {
                            let sub = serde_json::json!({
                                "type": "subscribe",
                                "channel": format!("order_book/{market_id}"),
                            });
                            if write.send(Message::Text(sub.to_string())).await.is_err() {
                                warn!("⚠️ Lighter subscribe send failed for market {market_id}");
                            }
                        }

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        if parsed.get("type").and_then(|v| v.as_str()) == Some("ping") {
                                            let pong = serde_json::json!({"type": "pong"});
                                            let _ = write.send(Message::Text(pong.to_string())).await;
                                            continue;
                                        }
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
                                    warn!("⚠️ Lighter WS closed by server, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Lighter WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ Lighter WS connect failed: {e}");
                    }
                }

                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
            }
            info!("🛑 Lighter depth adapter stopped");
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
    fn snapshot_parses_string_encoded_levels() {
        let mut book = OrderBook::new("BTCUSDT");
        let payload = serde_json::json!({
            "bids": [{"price": "100.0", "size": "1.0"}],
            "asks": [{"price": "101.0", "size": "2.0"}],
        });
        apply_snapshot(&mut book, &payload).unwrap();
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.best_ask(), Some(101.0));
    }

    #[tokio::test]
    async fn handle_message_without_known_market_is_ignored() {
        let shared = Shared {
            books: AsyncMutex::new(HashMap::new()),
            callbacks: AsyncMutex::new(HashMap::new()),
            market_id_to_symbol: AsyncMutex::new(HashMap::new()),
            symbol_to_market_id: AsyncMutex::new(HashMap::new()),
        };
        let msg = serde_json::json!({
            "channel": "order_book/7",
            "order_book": {"bids": [], "asks": []},
        });
        shared.handle_message(&msg).await;
        assert!(shared.books.lock().await.is_empty());
    }
}
