//! HMAC-SHA256 signing helpers for the venues whose private channel requires
//! a pre-computed signature (Bybit, OKX, Lighter, Aster). Binance and
//! Hyperliquid don't need this: Binance authenticates via a listen-key REST
//! lifecycle and Hyperliquid's `userEvents` subscription is keyed by wallet
//! address alone.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Bybit's websocket login signature: hex HMAC-SHA256 of `"GET/realtime" + expires_ms`.
pub fn bybit_ws_signature(secret: &str, expires_ms: i64) -> String {
    let message = format!("GET/realtime{expires_ms}");
    hex_hmac(secret, &message)
}

/// OKX's websocket login signature: base64 HMAC-SHA256 of
/// `timestamp + "GET" + "/users/self/verify"`.
pub fn okx_ws_signature(secret: &str, timestamp: &str) -> String {
    let message = format!("{timestamp}GET/users/self/verify");
    base64_hmac(secret, &message)
}

/// Aster's websocket auth signature: base64-encoded hex HMAC-SHA256 of
/// `timestamp + method + path`.
pub fn aster_ws_signature(secret: &str, timestamp: &str, method: &str, path: &str) -> String {
    let message = format!("{timestamp}{method}{path}");
    let hex_sig = hex_hmac(secret, &message);
    BASE64.encode(hex_sig.as_bytes())
}

/// Lighter's websocket auth signature: hex HMAC-SHA256 of
/// `timestamp + method + path + body`.
pub fn lighter_ws_signature(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
    let message = format!("{timestamp}{method}{path}{body}");
    hex_hmac(secret, &message)
}

fn hex_hmac(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn base64_hmac(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bybit_signature_is_deterministic_hex() {
        let sig = bybit_ws_signature("secret", 1700000000000);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, bybit_ws_signature("secret", 1700000000000));
    }

    #[test]
    fn okx_signature_is_base64() {
        let sig = okx_ws_signature("secret", "1700000000");
        assert!(BASE64.decode(&sig).is_ok());
    }

    #[test]
    fn different_messages_yield_different_signatures() {
        let a = bybit_ws_signature("secret", 1);
        let b = bybit_ws_signature("secret", 2);
        assert_ne!(a, b);
    }
}
