use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::adapter::ReconnectSupervisor;
use crate::error::AdapterError;
use crate::stats::AdapterStatsSnapshot;
use crate::symbols::binance as sym;
use crate::traits::{DepthSource, OrderBookCallback};
use crate::types::{OrderBook, Side};

const REST_BASE: &str = "https://fapi.binance.com";
const WS_BASE: &str = "wss://fstream.binance.com/stream";
const TOP_N: usize = 50;

/// Pending delta buffered while waiting for the REST snapshot to land.
#[derive(Debug, Clone)]
struct DepthEvent {
    first_update_id: u64,
    final_update_id: u64,
    bids: Vec<(f64, f64)>,
    asks: Vec<(f64, f64)>,
}

fn parse_depth_event(symbol: &str, data: &serde_json::Value) -> Option<DepthEvent> {
    let first_update_id = data.get("U")?.as_u64()?;
    let final_update_id = data.get("u")?.as_u64()?;
    let bids = parse_levels(data.get("b")?)?;
    let asks = parse_levels(data.get("a")?)?;
    let _ = symbol;
    Some(DepthEvent { first_update_id, final_update_id, bids, asks })
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

/// Applies the first buffered delta after a fresh snapshot, enforcing
/// `U <= lastUpdateId + 1 <= u`. Returns `false` when the check fails,
/// meaning the caller must discard the snapshot and re-fetch.
fn apply_first_delta(book: &mut OrderBook, event: &DepthEvent) -> bool {
    if !(event.first_update_id <= book.last_update_id + 1 && book.last_update_id + 1 <= event.final_update_id) {
        return false;
    }
    apply_delta(book, event);
    true
}

/// Steady-state continuity check: every delta after the first must chain
/// directly onto the previous one (`U == last_update_id + 1`). A gap means a
/// frame was missed and the replica must be discarded and re-snapshotted.
fn has_sequence_gap(last_update_id: u64, event: &DepthEvent) -> bool {
    event.first_update_id != last_update_id + 1
}

fn apply_delta(book: &mut OrderBook, event: &DepthEvent) {
    super::merge_levels(book, Side::Bid, &event.bids);
    super::merge_levels(book, Side::Ask, &event.asks);
    book.last_update_id = event.final_update_id;
    book.truncate(TOP_N);
}

struct Shared {
    books: AsyncMutex<HashMap<String, OrderBook>>,
    callbacks: AsyncMutex<HashMap<String, Vec<OrderBookCallback>>>,
    pending: AsyncMutex<HashMap<String, Vec<DepthEvent>>>,
}

impl Shared {
    async fn fetch_snapshot(client: &reqwest::Client, venue_symbol: &str) -> Result<OrderBook, AdapterError> {
        let url = format!("{REST_BASE}/fapi/v1/depth?symbol={}&limit=1000", venue_symbol.to_lowercase());
        let resp = client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AdapterError::Connection(format!("binance snapshot fetch failed: {e}")))?;

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("binance snapshot decode failed: {e}")))?;

        let last_update_id = data
            .get("lastUpdateId")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| AdapterError::Protocol("missing lastUpdateId".into()))?;
        let bids = parse_levels(data.get("bids").ok_or_else(|| AdapterError::Protocol("missing bids".into()))?)
            .ok_or_else(|| AdapterError::Protocol("bad bids".into()))?;
        let asks = parse_levels(data.get("asks").ok_or_else(|| AdapterError::Protocol("missing asks".into()))?)
            .ok_or_else(|| AdapterError::Protocol("bad asks".into()))?;

        let mut book = OrderBook::new(sym::from_venue(venue_symbol));
        book.last_update_id = last_update_id;
        for (price, qty) in bids {
            book.apply_level(Side::Bid, price, qty);
        }
        for (price, qty) in asks {
            book.apply_level(Side::Ask, price, qty);
        }
        book.truncate(TOP_N);
        book.initialized = true;
        Ok(book)
    }

    async fn publish(&self, venue_symbol: &str, book: OrderBook) {
        let canonical = sym::from_venue(venue_symbol);
        let callbacks = self.callbacks.lock().await;
        if let Some(cbs) = callbacks.get(&canonical) {
            for cb in cbs {
                cb(book.clone());
            }
        }
    }

    async fn initialize_symbol(&self, venue_symbol: &str) {
        let client = reqwest::Client::new();
        match Self::fetch_snapshot(&client, venue_symbol).await {
            Ok(mut book) => {
                let canonical = sym::from_venue(venue_symbol);
                let mut pending = self.pending.lock().await;
                if let Some(buffered) = pending.remove(venue_symbol) {
                    for event in &buffered {
                        if event.final_update_id < book.last_update_id {
                            continue;
                        }
                        if !apply_first_delta(&mut book, event) {
                            warn!("🚨 Binance {canonical} snapshot/delta gap detected, re-initializing");
                            return;
                        }
                    }
                }
                drop(pending);
                self.books.lock().await.insert(canonical.clone(), book.clone());
                self.publish(venue_symbol, book).await;
                info!("✅ Binance {canonical} orderbook initialized");
            }
            Err(e) => {
                error!("❌ Binance snapshot fetch failed for {venue_symbol}: {e}");
            }
        }
    }

    /// Drops the corrupted replica and queues `event` so the next successful
    /// snapshot's `apply_first_delta` check decides whether it still applies.
    async fn discard_and_buffer_for_resync(&self, venue_symbol: &str, canonical: &str, event: DepthEvent) {
        self.books.lock().await.remove(canonical);
        self.pending.lock().await.entry(venue_symbol.to_string()).or_default().push(event);
    }

    async fn handle_depth_update(&self, venue_symbol: &str, data: &serde_json::Value) {
        let Some(event) = parse_depth_event(venue_symbol, data) else {
            warn!("⚠️ Binance malformed depth event for {venue_symbol}");
            return;
        };
        let canonical = sym::from_venue(venue_symbol);
        let mut books = self.books.lock().await;
        match books.get_mut(&canonical) {
            Some(book) if book.initialized => {
                if event.final_update_id < book.last_update_id {
                    return;
                }
                if has_sequence_gap(book.last_update_id, &event) {
                    warn!(
                        "🚨 Binance {canonical} depth sequence gap (expected U={}, got U={}), re-initializing",
                        book.last_update_id + 1,
                        event.first_update_id
                    );
                    drop(books);
                    self.discard_and_buffer_for_resync(venue_symbol, &canonical, event).await;
                    self.initialize_symbol(venue_symbol).await;
                    return;
                }
                apply_delta(book, &event);
                let snapshot = book.clone();
                drop(books);
                self.publish(venue_symbol, snapshot).await;
            }
            _ => {
                drop(books);
                self.pending
                    .lock()
                    .await
                    .entry(venue_symbol.to_string())
                    .or_default()
                    .push(event);
                self.initialize_symbol(venue_symbol).await;
            }
        }
    }
}

pub struct BinanceDepthAdapter {
    shared: Arc<Shared>,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl BinanceDepthAdapter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                books: AsyncMutex::new(HashMap::new()),
                callbacks: AsyncMutex::new(HashMap::new()),
                pending: AsyncMutex::new(HashMap::new()),
            }),
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

impl Default for BinanceDepthAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepthSource for BinanceDepthAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Binance depth adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        drop(sup);

        let shared = self.shared.clone();
        let running = {
            let sup = self.supervisor.lock().await;
            sup.running.clone()
        };

        tokio::spawn(async move {
            let mut backoff = crate::adapter::Backoff::default();
            while running.load(std::sync::atomic::Ordering::Relaxed) {
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

                info!("Connecting to Binance depth WS: {ws_url}");
                match connect_async(Url::parse(&ws_url).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Binance WS connected");
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
                                                    let adapter_shared = shared.clone();
                                                    let data = data.clone();
                                                    tokio::spawn(async move {
                                                        adapter_shared.handle_depth_update(&venue_symbol, &data).await;
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
                                    warn!("⚠️ Binance WS closed by server, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Binance WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ Binance WS connect failed: {e}");
                    }
                }

                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
            }
            info!("🛑 Binance depth adapter stopped");
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

    fn snapshot(last_update_id: u64) -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        book.last_update_id = last_update_id;
        book.apply_level(Side::Bid, 100.0, 1.0);
        book.apply_level(Side::Ask, 101.0, 1.0);
        book.initialized = true;
        book
    }

    #[test]
    fn first_delta_within_gap_applies() {
        let mut book = snapshot(1000);
        let event = DepthEvent {
            first_update_id: 999,
            final_update_id: 1005,
            bids: vec![(100.0, 2.0)],
            asks: vec![],
        };
        assert!(apply_first_delta(&mut book, &event));
        assert_eq!(book.last_update_id, 1005);
        assert_eq!(*book.bids.get(&crate::types::OrderedPrice(100.0)).unwrap(), 2.0);
    }

    #[test]
    fn first_delta_outside_gap_rejected() {
        let mut book = snapshot(1000);
        let event = DepthEvent {
            first_update_id: 1002,
            final_update_id: 1005,
            bids: vec![],
            asks: vec![],
        };
        assert!(!apply_first_delta(&mut book, &event));
        // Book must be left untouched on a rejected first delta.
        assert_eq!(book.last_update_id, 1000);
    }

    #[test]
    fn zero_qty_delta_removes_level() {
        let mut book = snapshot(1000);
        let event = DepthEvent {
            first_update_id: 1001,
            final_update_id: 1001,
            bids: vec![(100.0, 0.0)],
            asks: vec![],
        };
        apply_delta(&mut book, &event);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn cold_start_snapshot_then_two_deltas() {
        let mut book = OrderBook::new("BTCUSDT");
        book.last_update_id = 1000;
        book.apply_level(Side::Bid, 50000.0, 1.0);
        book.apply_level(Side::Ask, 50100.0, 2.0);
        book.initialized = true;
        let first = DepthEvent {
            first_update_id: 999,
            final_update_id: 1001,
            bids: vec![(50000.0, 0.5)],
            asks: vec![],
        };
        assert!(apply_first_delta(&mut book, &first));
        let second = DepthEvent {
            first_update_id: 1002,
            final_update_id: 1003,
            bids: vec![],
            asks: vec![(50100.0, 0.0)],
        };
        apply_delta(&mut book, &second);
        assert_eq!(book.best_bid(), Some(50000.0));
        assert_eq!(*book.bids.get(&crate::types::OrderedPrice(50000.0)).unwrap(), 0.5);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.last_update_id, 1003);
    }

    #[test]
    fn parse_depth_event_from_wire_json() {
        let json = serde_json::json!({
            "U": 100, "u": 105,
            "b": [["100.5", "2.0"]],
            "a": [["101.0", "1.5"]],
        });
        let event = parse_depth_event("BTCUSDT", &json).unwrap();
        assert_eq!(event.first_update_id, 100);
        assert_eq!(event.final_update_id, 105);
        assert_eq!(event.bids, vec![(100.5, 2.0)]);
    }

    #[test]
    fn contiguous_steady_state_delta_has_no_gap() {
        let event = DepthEvent { first_update_id: 1004, final_update_id: 1006, bids: vec![], asks: vec![] };
        assert!(!has_sequence_gap(1003, &event));
    }

    #[test]
    fn missed_frame_is_detected_as_a_gap() {
        let event = DepthEvent { first_update_id: 1010, final_update_id: 1012, bids: vec![], asks: vec![] };
        assert!(has_sequence_gap(1003, &event));
    }

    #[tokio::test]
    async fn steady_state_gap_discards_replica_and_buffers_event_for_resync() {
        let shared = Shared {
            books: AsyncMutex::new(HashMap::new()),
            callbacks: AsyncMutex::new(HashMap::new()),
            pending: AsyncMutex::new(HashMap::new()),
        };
        shared.books.lock().await.insert("BTCUSDT".to_string(), snapshot(1000));

        let gapped = DepthEvent { first_update_id: 1010, final_update_id: 1012, bids: vec![], asks: vec![] };
        assert!(has_sequence_gap(1000, &gapped));
        shared.discard_and_buffer_for_resync("BTCUSDT", "BTCUSDT", gapped).await;

        assert!(shared.books.lock().await.get("BTCUSDT").is_none());
        let pending = shared.pending.lock().await;
        let buffered = pending.get("BTCUSDT").unwrap();
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].first_update_id, 1010);
    }
}
