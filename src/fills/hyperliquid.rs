use std::sync::atomic::Ordering;

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

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Hyperliquid's wire `side` is the taker code `"B"`/`"A"`, not `BUY`/`SELL`.
fn parse_side(s: &str) -> Option<FillSide> {
    match s {
        "B" => Some(FillSide::Buy),
        "A" => Some(FillSide::Sell),
        other => FillSide::from_str_loose(other),
    }
}

fn parse_single_fill(fill: &serde_json::Value) -> Option<FillEvent> {
    let coin = fill.get("coin")?.as_str()?;
    if coin.is_empty() {
        return None;
    }
    let side = parse_side(fill.get("side")?.as_str()?)?;
    let order_id = fill.get("oid")?.to_string();
    let price: f64 = fill.get("px")?.as_str()?.parse().ok()?;
    let size: f64 = fill.get("sz")?.as_str()?.parse().ok()?;
    if price <= 0.0 || size <= 0.0 {
        return None;
    }
    let time_val = fill.get("time")?.as_f64()?;
    if time_val <= 0.0 {
        return None;
    }

    Some(FillEvent {
        exchange_code: "hyperliquid".to_string(),
        symbol: format!("{coin}USDT"),
        order_id,
        side,
        filled_quantity: size,
        filled_price: price,
        trade_id: fill.get("hash").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        timestamp: time_val / 1000.0,
        commission: fill.get("fee").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
        commission_asset: fill.get("feeToken").and_then(|v| v.as_str()).unwrap_or("USDC").to_string(),
    })
}

/// `orderEvents` carries less detail than `fills` and is only consulted when
/// a fill wasn't already reported on the primary channel.
fn parse_order_event(order_event: &serde_json::Value) -> Option<FillEvent> {
    if order_event.get("status").and_then(|v| v.as_str()) != Some("filled") {
        return None;
    }
    let coin = order_event.get("coin")?.as_str()?;
    if coin.is_empty() {
        return None;
    }
    let side = parse_side(order_event.get("side")?.as_str()?)?;
    let order_id = order_event.get("oid")?.to_string();
    let price: f64 = order_event.get("px")?.as_str()?.parse().ok()?;
    let size: f64 = order_event.get("sz")?.as_str()?.parse().ok()?;
    if price <= 0.0 || size <= 0.0 {
        return None;
    }
    let time_val = order_event.get("time")?.as_f64()?;
    if time_val <= 0.0 {
        return None;
    }

    Some(FillEvent {
        exchange_code: "hyperliquid".to_string(),
        symbol: format!("{coin}USDT"),
        order_id: order_id.clone(),
        side,
        filled_quantity: size,
        filled_price: price,
        trade_id: format!("order_{order_id}"),
        timestamp: time_val / 1000.0,
        commission: order_event.get("fee").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
        commission_asset: order_event.get("feeToken").and_then(|v| v.as_str()).unwrap_or("USDC").to_string(),
    })
}

fn parse_user_events(data: &serde_json::Value) -> Option<FillEvent> {
    if let Some(fills) = data.get("fills") {
        let fills: Vec<&serde_json::Value> = match fills.as_array() {
            Some(arr) => arr.iter().collect(),
            None => vec![fills],
        };
        if let Some(fill) = fills.into_iter().find_map(parse_single_fill) {
            return Some(fill);
        }
    }
    if let Some(order_events) = data.get("orderEvents") {
        let order_events: Vec<&serde_json::Value> = match order_events.as_array() {
            Some(arr) => arr.iter().collect(),
            None => vec![order_events],
        };
        if let Some(fill) = order_events.into_iter().find_map(parse_order_event) {
            return Some(fill);
        }
    }
    None
}

fn parse_message(parsed: &serde_json::Value) -> Option<FillEvent> {
    let channel = parsed.get("channel")?.as_str()?;
    if channel != "userEvents" {
        return None;
    }
    let data = parsed.get("data")?;
    parse_user_events(data)
}

pub struct HyperliquidFillAdapter {
    address: String,
    callback: FillCallback,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl HyperliquidFillAdapter {
    pub fn new(address: impl Into<String>, callback: FillCallback) -> Self {
        Self {
            address: address.into().to_lowercase(),
            callback,
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

#[async_trait]
impl FillSource for HyperliquidFillAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Hyperliquid fill adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        let running = sup.running.clone();
        let stats = sup.stats.clone();
        drop(sup);

        let address = self.address.clone();
        let callback = self.callback.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            while running.load(Ordering::Relaxed) {
                info!("Connecting to Hyperliquid WS for {address}");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        let (mut write, mut read) = ws_stream.split();

                        let sub_msg = serde_json::json!({
                            "method": "subscribe",
                            "subscription": {"type": "userEvents", "user": address},
                        });
                        if write.send(Message::Text(sub_msg.to_string())).await.is_err() {
                            stats.mark_connection_error();
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }
                        info!("✅ Hyperliquid connected, awaiting subscription ack");
                        backoff.reset();
                        stats.mark_connected();

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        match parsed.get("channel").and_then(|v| v.as_str()) {
                                            Some("subscribed") => info!("✅ Hyperliquid user events subscribed"),
                                            Some("error") => {
                                                let msg = parsed.get("message").and_then(|v| v.as_str()).unwrap_or("unknown");
                                                error!("❌ Hyperliquid WS error: {msg}");
                                            }
                                            _ => {
                                                if let Some(fill) = parse_message(&parsed) {
                                                    stats.mark_fill();
                                                    callback(fill);
                                                }
                                            }
                                        }
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) => {
                                    warn!("⚠️ Hyperliquid fill WS closed, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Hyperliquid fill WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        stats.mark_connection_error();
                        error!("❌ Hyperliquid fill WS connect failed: {e}");
                    }
                }

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                stats.mark_reconnect();
                tokio::time::sleep(backoff.next_delay()).await;
            }
            info!("🛑 Hyperliquid fill adapter stopped");
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
    fn fills_event_parses_to_fill() {
        let msg = serde_json::json!({
            "channel": "userEvents",
            "data": {
                "fills": [{
                    "coin": "BTC",
                    "side": "B",
                    "oid": 42,
                    "px": "50000.0",
                    "sz": "0.2",
                    "hash": "0xabc",
                    "time": 1700000000000i64,
                }],
            },
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.symbol, "BTCUSDT");
        assert_eq!(fill.order_id, "42");
        assert_eq!(fill.side, FillSide::Buy);
        assert_eq!(fill.filled_quantity, 0.2);
        assert_eq!(fill.filled_price, 50000.0);
        assert_eq!(fill.trade_id, "0xabc");
    }

    #[test]
    fn ask_side_code_parses_to_sell() {
        let msg = serde_json::json!({
            "channel": "userEvents",
            "data": {
                "fills": [{
                    "coin": "BTC",
                    "side": "A",
                    "oid": 43,
                    "px": "50000.0",
                    "sz": "0.2",
                    "hash": "0xabd",
                    "time": 1700000000000i64,
                }],
            },
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.side, FillSide::Sell);
    }

    #[test]
    fn buy_sell_side_parses_successfully() {
        let msg = serde_json::json!({
            "channel": "userEvents",
            "data": {
                "fills": [{
                    "coin": "ETH",
                    "side": "BUY",
                    "oid": 7,
                    "px": "2500.0",
                    "sz": "1.0",
                    "hash": "0xdead",
                    "time": 1700000000000i64,
                }],
            },
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.symbol, "ETHUSDT");
        assert_eq!(fill.side, FillSide::Buy);
    }

    #[test]
    fn order_event_fallback_requires_filled_status() {
        let msg = serde_json::json!({
            "channel": "userEvents",
            "data": {
                "orderEvents": [{
                    "coin": "ETH", "side": "SELL", "oid": 1, "px": "2500.0",
                    "sz": "1.0", "status": "open", "time": 1700000000000i64,
                }],
            },
        });
        assert!(parse_message(&msg).is_none());
    }

    #[test]
    fn non_user_events_channel_ignored() {
        let msg = serde_json::json!({"channel": "subscribed"});
        assert!(parse_message(&msg).is_none());
    }
}
