use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::adapter::{Backoff, ReconnectSupervisor};
use crate::error::AdapterError;
use crate::fills::auth::aster_ws_signature;
use crate::stats::AdapterStatsSnapshot;
use crate::traits::{FillCallback, FillSource};
use crate::types::{FillEvent, FillSide};

const WS_URL: &str = "wss://fstream.asterdex.com/ws";
const REQUIRED_SUBSCRIPTIONS: usize = 3;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn parse_trade_data(params: &serde_json::Value) -> Option<FillEvent> {
    let symbol = params.get("symbol")?.as_str().filter(|s| !s.is_empty())?.to_string();
    let order_id = params.get("order_id")?.as_str().filter(|s| !s.is_empty())?.to_string();
    let trade_id = params.get("trade_id")?.as_str().filter(|s| !s.is_empty())?.to_string();
    let price = params.get("price")?.as_f64()?;
    let quantity = params.get("quantity")?.as_f64()?;
    let side = FillSide::from_str_loose(params.get("side")?.as_str()?)?;
    if price <= 0.0 || quantity <= 0.0 {
        return None;
    }
    let timestamp = params.get("timestamp")?.as_f64()?;
    if timestamp <= 0.0 {
        return None;
    }

    Some(FillEvent {
        exchange_code: "aster".to_string(),
        symbol,
        order_id,
        side,
        filled_quantity: quantity,
        filled_price: price,
        trade_id,
        timestamp: timestamp / 1000.0,
        commission: params.get("fee").and_then(|v| v.as_f64()).unwrap_or(0.0).abs(),
        commission_asset: params.get("fee_currency").and_then(|v| v.as_str()).unwrap_or("").to_string(),
    })
}

/// Orders-channel fallback, mirroring `lighter.rs`'s `parse_orders_data`.
fn parse_order_data(params: &serde_json::Value) -> Option<FillEvent> {
    let status = params.get("status").and_then(|v| v.as_str()).unwrap_or("");
    if status != "PARTIALLY_FILLED" && status != "FILLED" {
        return None;
    }
    if params.get("filled_quantity").and_then(|v| v.as_f64()).unwrap_or(0.0) <= 0.0 {
        return None;
    }

    let symbol = params.get("symbol")?.as_str().filter(|s| !s.is_empty())?.to_string();
    let order_id = params.get("order_id")?.as_str().filter(|s| !s.is_empty())?.to_string();
    let avg_price = params.get("average_price")?.as_f64()?;
    let filled_quantity = params.get("filled_quantity")?.as_f64()?;
    let side = FillSide::from_str_loose(params.get("side")?.as_str()?)?;
    if avg_price <= 0.0 || filled_quantity <= 0.0 {
        return None;
    }
    let created_time = params.get("created_at")?.as_f64()?;
    if created_time <= 0.0 {
        return None;
    }

    Some(FillEvent {
        exchange_code: "aster".to_string(),
        symbol,
        order_id: order_id.clone(),
        side,
        filled_quantity,
        filled_price: avg_price,
        trade_id: format!("order_{order_id}"),
        timestamp: created_time / 1000.0,
        commission: params.get("fee").and_then(|v| v.as_f64()).unwrap_or(0.0).abs(),
        commission_asset: params.get("fee_currency").and_then(|v| v.as_str()).unwrap_or("").to_string(),
    })
}

fn parse_message(parsed: &serde_json::Value) -> Option<FillEvent> {
    let method = parsed.get("method")?.as_str()?;
    let params = parsed.get("params")?;
    match method {
        "server.trade" => parse_trade_data(params),
        "server.order" => parse_order_data(params),
        _ => None,
    }
}

pub struct AsterFillAdapter {
    api_key: String,
    secret: String,
    callback: FillCallback,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl AsterFillAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, callback: FillCallback) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            callback,
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

#[async_trait]
impl FillSource for AsterFillAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Aster fill adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        let running = sup.running.clone();
        let stats = sup.stats.clone();
        drop(sup);

        let api_key = self.api_key.clone();
        let secret = self.secret.clone();
        let callback = self.callback.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            while running.load(Ordering::Relaxed) {
                info!("Connecting to Aster private WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        let (mut write, mut read) = ws_stream.split();

                        let timestamp = now_ms().to_string();
                        let signature = aster_ws_signature(&secret, &timestamp, "GET", "/ws/auth");
                        let auth_msg = serde_json::json!({
                            "id": now_ms(),
                            "method": "server.authenticate",
                            "params": {"api_key": api_key, "timestamp": timestamp, "signature": signature},
                        });
                        if write.send(Message::Text(auth_msg.to_string())).await.is_err() {
                            stats.mark_connection_error();
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }

                        let token = match wait_for_auth(&mut read).await {
                            Ok(token) => token,
                            Err(e) => {
                                error!("❌ Aster auth failed: {e}");
                                stats.mark_connection_error();
                                if !e.is_retryable() {
                                    return;
                                }
                                tokio::time::sleep(backoff.next_delay()).await;
                                continue;
                            }
                        };
                        info!("✅ Aster authenticated");

                        for (idx, channel) in ["orders", "trades", "positions"].iter().enumerate() {
                            let sub_msg = serde_json::json!({
                                "id": now_ms() + idx as i64,
                                "method": "server.subscribe",
                                "params": {"channel": channel, "token": token},
                            });
                            if write.send(Message::Text(sub_msg.to_string())).await.is_err() {
                                break;
                            }
                        }

                        if let Err(e) = wait_for_subscriptions(&mut read).await {
                            error!("❌ Aster subscription failed: {e}");
                            stats.mark_connection_error();
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }
                        info!("✅ Aster private channels subscribed");
                        backoff.reset();
                        stats.mark_connected();

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        if let Some(fill) = parse_message(&parsed) {
                                            stats.mark_fill();
                                            callback(fill);
                                        }
                                    }
                                }
                                Ok(Message::Ping(payload)) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Ok(Message::Close(_)) => {
                                    warn!("⚠️ Aster fill WS closed, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Aster fill WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        stats.mark_connection_error();
                        error!("❌ Aster fill WS connect failed: {e}");
                    }
                }

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                stats.mark_reconnect();
                tokio::time::sleep(backoff.next_delay()).await;
            }
            info!("🛑 Aster fill adapter stopped");
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

async fn wait_for_auth(
    read: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Result<String, AdapterError> {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                    if parsed.get("id").is_some() {
                        if let Some(result) = parsed.get("result") {
                            return match result.get("success").and_then(|v| v.as_bool()) {
                                Some(true) => Ok(result.get("token").and_then(|v| v.as_str()).unwrap_or("").to_string()),
                                _ => {
                                    let reason = result.get("error").and_then(|v| v.as_str()).unwrap_or("unknown");
                                    Err(AdapterError::Auth(format!("aster auth rejected: {reason}")))
                                }
                            };
                        }
                    }
                }
            }
            Ok(_) => continue,
            Err(e) => return Err(AdapterError::Connection(e.to_string())),
        }
    }
    Err(AdapterError::Connection("stream closed before auth response".into()))
}

async fn wait_for_subscriptions(
    read: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Result<(), AdapterError> {
    let mut confirmed = 0;
    while confirmed < REQUIRED_SUBSCRIPTIONS {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                    if parsed.get("method").and_then(|v| v.as_str()) == Some("server.subscription") {
                        let channel = parsed.get("params").and_then(|p| p.get("channel")).and_then(|v| v.as_str());
                        if matches!(channel, Some("orders") | Some("trades") | Some("positions")) {
                            confirmed += 1;
                        }
                    } else if let Some(err) = parsed.get("error") {
                        let reason = err.get("message").and_then(|v| v.as_str()).unwrap_or("unknown");
                        return Err(AdapterError::Protocol(format!("aster subscribe rejected: {reason}")));
                    }
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(AdapterError::Connection(e.to_string())),
            None => return Err(AdapterError::Connection("stream closed before subscription confirmation".into())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_method_parses_to_fill_event() {
        let msg = serde_json::json!({
            "method": "server.trade",
            "params": {
                "symbol": "BTCUSDT",
                "order_id": "o1",
                "trade_id": "t1",
                "price": 50000.0,
                "quantity": 0.1,
                "side": "SELL",
                "fee": -0.5,
                "fee_currency": "USDT",
                "timestamp": 1700000000000i64,
            },
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.symbol, "BTCUSDT");
        assert_eq!(fill.side, FillSide::Sell);
        assert_eq!(fill.commission, 0.5);
    }

    #[test]
    fn order_method_requires_filled_status() {
        let msg = serde_json::json!({
            "method": "server.order",
            "params": {"symbol": "BTCUSDT", "status": "NEW", "filled_quantity": 0.0},
        });
        assert!(parse_message(&msg).is_none());
    }

    #[test]
    fn position_method_ignored() {
        let msg = serde_json::json!({"method": "server.position", "params": {}});
        assert!(parse_message(&msg).is_none());
    }
}
