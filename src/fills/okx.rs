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
use crate::fills::auth::okx_ws_signature;
use crate::stats::AdapterStatsSnapshot;
use crate::symbols::okx as sym;
use crate::traits::{FillCallback, FillSource};
use crate::types::{FillEvent, FillSide};

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";

fn now_secs_str() -> String {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs().to_string()).unwrap_or_default()
}

fn parse_fill(fill: &serde_json::Value) -> Option<FillEvent> {
    let inst_id = fill.get("instId")?.as_str()?.to_string();
    let trade_id = fill.get("tradeId")?.as_str()?.to_string();
    let fill_price: f64 = fill.get("fillPx")?.as_str()?.parse().ok()?;
    let fill_size: f64 = fill.get("fillSz")?.as_str()?.parse().ok()?;
    if fill_price <= 0.0 || fill_size <= 0.0 {
        return None;
    }
    let side = FillSide::from_str_loose(fill.get("side")?.as_str()?)?;
    let currency = fill.get("ccy").and_then(|v| v.as_str()).unwrap_or("");
    let timestamp: i64 = fill.get("ts")?.as_str()?.parse().ok()?;

    Some(FillEvent {
        exchange_code: "okx".to_string(),
        symbol: sym::from_venue(&inst_id),
        order_id: trade_id.clone(),
        side,
        filled_quantity: fill_size,
        filled_price: fill_price,
        trade_id,
        timestamp: timestamp as f64 / 1000.0,
        commission: fill.get("fee").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
        commission_asset: if currency.is_empty() { "USDT".to_string() } else { currency.to_string() },
    })
}

fn parse_message(parsed: &serde_json::Value) -> Option<FillEvent> {
    let arg = parsed.get("arg")?;
    let channel = arg.get("channel")?.as_str()?;
    if channel != "fills" {
        return None;
    }
    let data = parsed.get("data")?.as_array()?;
    data.first().and_then(parse_fill)
}

pub struct OkxFillAdapter {
    api_key: String,
    secret: String,
    passphrase: String,
    callback: FillCallback,
    supervisor: AsyncMutex<ReconnectSupervisor>,
}

impl OkxFillAdapter {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        callback: FillCallback,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            callback,
            supervisor: AsyncMutex::new(ReconnectSupervisor::new()),
        }
    }
}

#[async_trait]
impl FillSource for OkxFillAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut sup = self.supervisor.lock().await;
        if sup.is_running() {
            warn!("⚠️ OKX fill adapter already running");
            return Ok(());
        }
        sup.set_running(true);
        let running = sup.running.clone();
        let stats = sup.stats.clone();
        drop(sup);

        let api_key = self.api_key.clone();
        let secret = self.secret.clone();
        let passphrase = self.passphrase.clone();
        let callback = self.callback.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::default();
            while running.load(Ordering::Relaxed) {
                info!("Connecting to OKX private WS");
                match connect_async(Url::parse(WS_URL).unwrap()).await {
                    Ok((ws_stream, _)) => {
                        let (mut write, mut read) = ws_stream.split();

                        let timestamp = now_secs_str();
                        let signature = okx_ws_signature(&secret, &timestamp);
                        let login_msg = serde_json::json!({
                            "op": "login",
                            "args": [{
                                "apiKey": api_key,
                                "passphrase": passphrase,
                                "timestamp": timestamp,
                                "sign": signature,
                            }],
                        });
                        if write.send(Message::Text(login_msg.to_string())).await.is_err() {
                            stats.mark_connection_error();
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }

                        if let Err(e) = wait_for_login(&mut read).await {
                            error!("❌ OKX login failed: {e}");
                            stats.mark_connection_error();
                            if !e.is_retryable() {
                                return;
                            }
                            tokio::time::sleep(backoff.next_delay()).await;
                            continue;
                        }
                        info!("✅ OKX authenticated");
                        backoff.reset();
                        stats.mark_connected();

                        let sub_msg = serde_json::json!({
                            "op": "subscribe",
                            "args": [
                                {"channel": "orders", "instType": "SWAP"},
                                {"channel": "fills", "instType": "SWAP"},
                                {"channel": "account"},
                            ],
                        });
                        let _ = write.send(Message::Text(sub_msg.to_string())).await;

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
                                    warn!("⚠️ OKX fill WS closed, reconnecting...");
                                    break;
                                }
                                Err(e) => {
                                    error!("❌ OKX fill WS error: {e}");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        stats.mark_connection_error();
                        error!("❌ OKX fill WS connect failed: {e}");
                    }
                }

                if !running.load(Ordering::Relaxed) {
                    break;
                }
                stats.mark_reconnect();
                tokio::time::sleep(backoff.next_delay()).await;
            }
            info!("🛑 OKX fill adapter stopped");
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

/// Interprets one parsed frame as a login outcome, or `None` if it isn't a
/// login-related event at all (the caller keeps reading in that case).
fn parse_login_response(parsed: &serde_json::Value) -> Option<Result<(), AdapterError>> {
    if parsed.get("event").and_then(|v| v.as_str()) == Some("login") {
        return Some(match parsed.get("code").and_then(|v| v.as_str()) {
            Some("0") => Ok(()),
            _ => {
                let reason = parsed.get("msg").and_then(|v| v.as_str()).unwrap_or("unknown");
                Err(AdapterError::Auth(format!("okx login rejected: {reason}")))
            }
        });
    }
    if parsed.get("event").and_then(|v| v.as_str()) == Some("error") {
        let reason = parsed.get("msg").and_then(|v| v.as_str()).unwrap_or("unknown");
        return Some(Err(AdapterError::Auth(format!("okx login rejected: {reason}"))));
    }
    None
}

async fn wait_for_login(
    read: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Result<(), AdapterError> {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                    if let Some(result) = parse_login_response(&parsed) {
                        return result;
                    }
                }
            }
            Ok(_) => continue,
            Err(e) => return Err(AdapterError::Connection(e.to_string())),
        }
    }
    Err(AdapterError::Connection("stream closed before login response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_channel_parses_to_fill_event() {
        let msg = serde_json::json!({
            "arg": {"channel": "fills", "instType": "SWAP"},
            "data": [{
                "instId": "BTC-USDT-SWAP",
                "tradeId": "t1",
                "fillPx": "50000.0",
                "fillSz": "0.1",
                "side": "buy",
                "ccy": "USDT",
                "ts": "1700000000000",
                "fee": "-0.5",
            }],
        });
        let fill = parse_message(&msg).unwrap();
        assert_eq!(fill.symbol, "BTCUSDT");
        assert_eq!(fill.side, FillSide::Buy);
        assert_eq!(fill.commission_asset, "USDT");
    }

    #[test]
    fn non_fills_channel_ignored() {
        let msg = serde_json::json!({"arg": {"channel": "account"}, "data": []});
        assert!(parse_message(&msg).is_none());
    }

    #[test]
    fn wrong_passphrase_produces_auth_error() {
        let msg = serde_json::json!({"event": "error", "msg": "passphrase invalid"});
        let err = parse_login_response(&msg).unwrap().unwrap_err();
        assert!(matches!(err, AdapterError::Auth(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn successful_login_is_ok() {
        let msg = serde_json::json!({"event": "login", "code": "0"});
        assert!(parse_login_response(&msg).unwrap().is_ok());
    }

    #[test]
    fn non_login_event_is_not_a_login_response() {
        let msg = serde_json::json!({"event": "subscribe"});
        assert!(parse_login_response(&msg).is_none());
    }
}
