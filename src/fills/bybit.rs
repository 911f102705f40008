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
use crate::fills::auth::bybit_ws_signature;
use crate::stats::AdapterStatsSnapshot;
use crate::traits::{FillCallback, FillSource};
use crate::types::{FillEvent, FillSide};

const WS_URL: &str = "wss://stream.bybit.com/v5/private";

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Only `execType == "Trade"` executions are fills; everything else
/// (funding settlements, liquidation markers) is ignored.
fn parse_execution(execution: &serde_json::Value) -> Option<FillEvent> {
    if execution.get("execType").and_then(|v| v.as_str()) != Some("Trade") {
        return None;
    }
    let symbol = execution.get("symbol")?.as_str()?.to_string();
    let order_id = execution.get("orderLinkId").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
        .or_else(|| execution.get("orderId").and_then(|v| v.as_str()))?
        .to_string();
    let side = FillSide::from_str_loose(execution.get("execSide").or_else(|| execution.get("side"))?.as_str()?)?;
    let exec_price: f64 = execution.get("execPrice")?.as_str()?.parse().ok()?;
    let exec_qty: f64 = execution.get("execQty")?.as_str()?.parse().ok()?;
    if exec_price <= 0.0 || exec_qty <= 0.0 {
        return None;
    }
    let exec_time: i64 = execution.get("execTime")?.as_str()?.parse().ok()?;
    let exec_fee: f64 = execution.get("execFee").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    // The execution channel carries no fee-currency field at all; `feeRate`
    // is a rate, not a currency code. Linear USDT-margined contracts always
    // settle fees in USDT, so use that instead of the rate.
    let commission_asset = "USDT".to_string();

    Some(FillEvent {
        exchange_code: "bybit".to_string(),
        symbol,
        order_id,
        side,
        filled_quantity: exec_qty,
        filled_price: exec_price,
        trade_id: execution.get("execId").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        timestamp: exec_time as f64 / 1_000_000.0,
        commission: exec_fee.abs(),
        commission_asset,
    })
}

fn parse_message(parsed: &serde_json::Value) -> Option<FillEvent> {
    let topic = parsed.get("topic")?.as_str()?;
    if topic != "execution" {
        return None;
    }
    let data = parsed.get("data")?.as_array()?;
    data.iter().find_map(parse_execution)
}

pub struct BybitFillAdapter {
    api_key: String,
    secret: String,
    callback: FillCallback,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl BybitFillAdapter {
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
impl FillSource for BybitFillAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ Bybit fill adapter already running");
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
                info!("Connecting to Bybit private WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        let (mut write, mut read) = ws_stream.split();

                        let expires = now_ms() + 1000;
                        let signature = bybit_ws_signature(&secret, expires);
                        let auth_msg = serde_json::json!({
                            "op": "auth",
                            "args": [api_key, expires, signature],
                        });
                        if write.send(Message::Text(auth_msg.to_string())).await.is_err() {
                            stats.mark_connection_error();
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }

                        let auth_result = wait_for_auth(&mut read).await;
                        if let Err(e) = auth_result {
                            error!("❌ Bybit auth failed: {e}");
                            stats.mark_connection_error();
                            if !e.is_retryable() {
                                return;
                            }
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }
                        info!("✅ Bybit authenticated");
                        backoff.reset();
                        stats.mark_connected();

                        let sub_msg = serde_json::json!({"op": "subscribe", "args": ["execution", "order", "position"]});
                        let _ = write.send(Message::Text(sub_msg.to_string())).await;

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                                        if parsed.get("op").and_then(|v| v.as_str()) == Some("ping") {
                                            let pong = serde_json::json!({"op": "pong"});
                                            let _ = write.send(Message::Text(pong.to_string())).await;
                                            continue;
                                        }
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
                                    warn!("⚠️ Bybit fill WS closed, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ Bybit fill WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        stats.mark_connection_error();
                        error!("❌ Bybit fill WS connect failed: {e}");
                    }
                }

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                stats.mark_reconnect();
                tokio::time::sleep(backoff.next_delay()).await;
            }
            info!("🛑 Bybit fill adapter stopped");
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
) -> Result<(), AdapterError> {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                    if parsed.get("op").and_then(|v| v.as_str()) == Some("auth") {
                        return match parsed.get("success").and_then(|v| v.as_bool()) {
                            Some(true) => Ok(()),
                            _ => {
                                let reason = parsed.get("ret_msg").and_then(|v| v.as_str()).unwrap_or("unknown");
                                Err(AdapterError::Auth(format!("bybit login rejected: {reason}")))
                            }
                        };
                    }
                }
            }
            Ok(_) => continue,
            Err(e) => return Err(AdapterError::Connection(e.to_string())),
        }
    }
    Err(AdapterError::Connection("stream closed before auth response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_execution_parses_to_fill() {
        let msg = serde_json::json!({
            "topic": "execution",
            "data": [{
                "execType": "Trade",
                "symbol": "BTCUSDT",
                "orderId": "o1",
                "orderLinkId": "",
                "execPrice": "50000.0",
                "execQty": "0.1",
                "execSide": "Buy",
                "execFee": "-0.005",
                "feeRate": "0.0001",
                "execId": "e1",
                "execTime": "1700000000000000",
            }],
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.order_id, "o1");
        assert_eq!(fill.commission, 0.005);
        assert_eq!(fill.commission_asset, "USDT");
    }

    #[test]
    fn non_trade_exec_type_ignored() {
        let exec = serde_json::json!({"execType": "Funding"});
        assert!(parse_execution(&exec).is_none());
    }
}

