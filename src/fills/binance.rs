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
use crate::traits::{FillCallback, FillSource};
use crate::types::{FillEvent, FillSide};

const REST_BASE: &str = "https://fapi.binance.com";
const WS_BASE: &str = "wss://fstream.binance.com/ws";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

fn parse_order_trade_update(message: &serde_json::Value) -> Option<FillEvent> {
    let order = message.get("o")?;
    let status = order.get("X")?.as_str()?;
    if status != "FILLED" && status != "PARTIALLY_FILLED" {
        return None;
    }

    let mut symbol = order.get("s")?.as_str()?.to_string();
    if !symbol.ends_with("USDT") {
        symbol.push_str("USDT");
    }
    let order_id = order.get("i")?.to_string();
    let side = FillSide::from_str_loose(order.get("S")?.as_str()?)?;
    let filled_quantity: f64 = order.get("z")?.as_str()?.parse().ok()?;
    let filled_price: f64 = order.get("ap")?.as_str()?.parse().ok()?;
    if filled_quantity <= 0.0 || filled_price <= 0.0 {
        return None;
    }

    let trade_id = order.get("t").map(|v| v.to_string()).unwrap_or_default();
    let commission: f64 = order.get("n").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let commission_asset = order.get("N").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let timestamp = message.get("T").and_then(|v| v.as_f64()).unwrap_or(0.0) / 1000.0;

    Some(FillEvent {
        exchange_code: "binance".to_string(),
        symbol,
        order_id,
        side,
        filled_quantity,
        filled_price,
        trade_id,
        timestamp,
        commission,
        commission_asset,
    })
}

fn parse_message(message: &serde_json::Value) -> Option<FillEvent> {
    match message.get("e").and_then(|v| v.as_str()) {
        Some("ORDER_TRADE_UPDATE") => parse_order_trade_update(message),
        _ => None,
    }
}

struct ListenKeyClient {
    client: reqwest::Client,
    api_key: String,
}

impl ListenKeyClient {
    fn new(api_key: String) -> Self {
        Self { client: reqwest::Client::new(), api_key }
    }

    async fn create(&self) -> Result<String, AdapterError> {
        let resp = self
            .client
            .post(format!("{REST_BASE}/fapi/v1/listenKey"))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| AdapterError::Connection(format!("listenKey create failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(AdapterError::Auth(format!("listenKey create rejected: HTTP {}", resp.status())));
        }
        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Protocol(format!("listenKey decode failed: {e}")))?;
        data.get("listenKey")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AdapterError::Protocol("missing listenKey".into()))
    }

    async fn keepalive(&self, listen_key: &str) {
        let resp = self
            .client
            .put(format!("{REST_BASE}/fapi/v1/listenKey"))
            .header("X-MBX-APIKEY", &self.api_key)
            .query(&[("listenKey", listen_key)])
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => info!("✅ Binance listenKey refreshed"),
            Ok(r) => warn!("⚠️ Binance listenKey refresh failed: HTTP {}", r.status()),
            Err(e) => error!("❌ Binance listenKey refresh error: {e}"),
        }
    }

    async fn delete(&self, listen_key: &str) {
        let _ = self
            .client
            .delete(format!("{REST_BASE}/fapi/v1/listenKey"))
            .header("X-MBX-APIKEY", &self.api_key)
            .query(&[("listenKey", listen_key)])
            .send()
            .await;
    }
}

pub struct BinanceFillAdapter {
    api_key: String,
    callback: FillCallback,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl BinanceFillAdapter {
    pub fn new(api_key: impl Into<String>, callback: FillCallback) -> Self {
        Self {
            api_key: api_key.into(),
            callback,
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

#[async_trait]
impl FillSource for BinanceFillAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Binance fill adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        let running = sup.running.clone();
        let stats = sup.stats.clone();
        drop(sup);

        let listen_key_client = Arc::new(ListenKeyClient::new(self.api_key.clone()));
        let callback = self.callback.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            while running.load(Ordering::Relaxed) {
                let listen_key = match listen_key_client.create().await {
                    Ok(key) => key,
                    Err(e) => {
                        stats.mark_connection_error();
                        error!("❌ Binance listenKey acquisition failed: {e}");
                        if !e.is_retryable() {
                            break;
                        }
                        tokio::time::sleep(backoff.next_delay()).await;
                        continue;
                    }
                };

                let ws_url = format!("{WS_BASE}/{listen_key}");
                info!("Connecting to Binance user data stream");
                match connect_async(Url::parse(&ws_url).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Binance fill WS connected");
                        backoff.reset();
                        stats.mark_connected();
                        let (mut write, mut read) = ws_stream.split();
                        let mut last_keepalive = tokio::time::Instant::now();

                        loop {
                            tokio::select! {
                                msg = read.next() => {
                                    match msg {
                                        Some(Ok(Message::Text(text))) => {
                                            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                                if parsed.get("e").and_then(|v| v.as_str()) == Some("error") {
                                                    let msg = parsed.get("m").and_then(|v| v.as_str()).unwrap_or("");
                                                    error!("❌ Binance WS error event: {msg}");
                                                    if msg.to_lowercase().contains("listenkey expired") {
                                                        break;
                                                    }
                                                    continue;
                                                }
                                                if let Some(fill) = parse_message(&parsed) {
                                                    stats.mark_fill();
                                                    callback(fill);
                                                }
                                            }
                                        }
                                        Some(Ok(Message::Ping(payload))) => {
                                            let _ = write.send(Message::Pong(payload)).await;
                                        }
                                        Some(Ok(Message::Close(_))) | None => {
                                            warn!("⚠️ Binance fill WS closed, reconnecting...");
                                            break;
                                        }
                                        Some(Err(e)) => {
                                            error!("❌ Binance fill WS error: {e}");
                                            break;
                                        }
                                        _ => {}
                                    }
                                }
                                _ = tokio::time::sleep(Duration::from_secs(5)), if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL => {
                                    listen_key_client.keepalive(&listen_key).await;
                                    last_keepalive = tokio::time::Instant::now();
                                }
                            }
                            if !running.load(Ordering::Relaxed) {
                                break;
                            }
                        }
                        listen_key_client.delete(&listen_key).await;
                    }
                    Err(e) => {
                        stats.mark_connection_error();
                        error!("❌ Binance fill WS connect failed: {e}");
                    }
                }

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                stats.mark_reconnect();
                tokio::time::sleep(backoff.next_delay()).await;
            }
            info!("🛑 Binance fill adapter stopped");
        });

        Ok(())
    }

    async fn stop(&self) {
        let sup = self.supervisor.lock().await;
        sup.set_running(false);
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
    fn parses_order_trade_update_into_fill() {
        let msg = serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "T": 1700000000000i64,
            "o": {
                "s": "BTCUSDT",
                "i": 42,
                "S": "BUY",
                "X": "FILLED",
                "z": "1.0",
                "ap": "50000",
                "t": 7,
                "n": "0.05",
                "N": "USDT",
            },
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.exchange_code, "binance");
        assert_eq!(fill.symbol, "BTCUSDT");
        assert_eq!(fill.order_id, "42");
        assert_eq!(fill.side, FillSide::Buy);
        assert_eq!(fill.filled_quantity, 1.0);
        assert_eq!(fill.filled_price, 50000.0);
        assert_eq!(fill.trade_id, "7");
        assert_eq!(fill.timestamp, 1700000000.0);
        assert_eq!(fill.commission, 0.05);
        assert_eq!(fill.commission_asset, "USDT");
    }

    #[test]
    fn ignores_new_order_status() {
        let msg = serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "o": {"s": "BTCUSDT", "i": 1, "S": "BUY", "X": "NEW", "z": "0", "ap": "0"},
        });
        assert!(parse_message(&msg).is_none());
    }

    #[test]
    fn ignores_non_order_trade_events() {
        let msg = serde_json::json!({"e": "ACCOUNT_UPDATE"});
        assert!(parse_message(&msg).is_none());
    }
}
