//! Canonical symbol form is `<BASE>USDT` (e.g. `"BTCUSDT"`). Each venue
//! translates to and from its own native wire format.

pub fn to_canonical(native: &str) -> String {
    if native.ends_with("USDT") || native.ends_with("USDC") || native.ends_with("USD") {
        native.to_string()
    } else {
        format!("{native}USDT")
    }
}

pub mod binance {
    /// Binance USD-M uses the canonical form directly: `BTCUSDT`.
    pub fn to_venue(canonical: &str) -> String {
        canonical.to_string()
    }

    pub fn from_venue(native: &str) -> String {
        super::to_canonical(native)
    }
}

pub mod bybit {
    /// Bybit linear perpetuals also use `BTCUSDT` directly.
    pub fn to_venue(canonical: &str) -> String {
        canonical.to_string()
    }

    pub fn from_venue(native: &str) -> String {
        super::to_canonical(native)
    }
}

pub mod okx {
    /// `BTCUSDT` <-> `BTC-USDT-SWAP`.
    pub fn to_venue(canonical: &str) -> String {
        if let Some(base) = canonical.strip_suffix("USDT") {
            format!("{base}-USDT-SWAP")
        } else {
            canonical.to_string()
        }
    }

    pub fn from_venue(inst_id: &str) -> String {
        let parts: Vec<&str> = inst_id.split('-').collect();
        if parts.len() >= 2 {
            format!("{}{}", parts[0], parts[1])
        } else {
            inst_id.to_string()
        }
    }
}

pub mod hyperliquid {
    /// `BTCUSDT` <-> `BTC` (Hyperliquid subscribes by coin name only).
    pub fn to_venue(canonical: &str) -> String {
        canonical
            .strip_suffix("USDT")
            .or_else(|| canonical.strip_suffix("USD"))
            .unwrap_or(canonical)
            .to_string()
    }

    pub fn from_venue(coin: &str) -> String {
        format!("{coin}USDT")
    }
}

pub mod lighter {
    /// Lighter resolves `BTCUSDT` to a numeric market id via REST; the wire
    /// symbol itself is the canonical form plus `USDT` if missing.
    pub fn to_venue(canonical: &str) -> String {
        super::to_canonical(canonical)
    }

    pub fn from_venue(native: &str) -> String {
        super::to_canonical(native)
    }
}

pub mod aster {
    /// Aster mirrors Binance's USD-M convention directly.
    pub fn to_venue(canonical: &str) -> String {
        canonical.to_string()
    }

    pub fn from_venue(native: &str) -> String {
        super::to_canonical(native)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn okx_round_trip() {
        assert_eq!(okx::to_venue("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(okx::from_venue("BTC-USDT-SWAP"), "BTCUSDT");
    }

    #[test]
    fn hyperliquid_round_trip() {
        assert_eq!(hyperliquid::to_venue("BTCUSDT"), "BTC");
        assert_eq!(hyperliquid::from_venue("BTC"), "BTCUSDT");
    }

    #[test]
    fn to_canonical_appends_usdt_when_missing() {
        assert_eq!(to_canonical("BTC"), "BTCUSDT");
        assert_eq!(to_canonical("BTCUSDT"), "BTCUSDT");
    }
}
