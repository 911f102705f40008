pub mod auth;
pub mod aster;
pub mod binance;
pub mod bybit;
pub mod hyperliquid;
pub mod lighter;
pub mod okx;
