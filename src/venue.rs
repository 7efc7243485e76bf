// =============================================================================
// VenueClient — the perpetual-futures venue port (§4.6)
// =============================================================================
//
// A narrow trait so the Executor and StreamConsumer can run against an
// in-process fake in tests without touching the network (§9 design notes).
// Query methods surface `VenueError` directly — any I/O or parse failure on
// a pre-flight query must fail loudly (`Inconsistent`) so the Executor never
// opens a position under uncertainty (§4.6 failure semantics, P2). Order
// placement methods never propagate an error: venue rejections come back as
// a failed `OrderResult`, and transport failures are folded into
// `OrderResult::failed` by the concrete implementation after being
// classified for retry purposes.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VenueResult;
use crate::types::{OrderResult, Side};

/// Margin mode for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginType {
    Isolated,
    Cross,
}

impl MarginType {
    pub fn as_venue_str(self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        }
    }
}

/// Step/tick size filters for a symbol, as returned by exchangeInfo.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub tick_size: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self { step_size: 0.001, tick_size: 0.01 }
    }
}

/// A currently-open order on the venue, as surfaced by `getOpenOrders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub order_kind: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub reduce_only: bool,
}

#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn get_available_balance(&self) -> VenueResult<f64>;
    async fn get_current_position_amount(&self, symbol: &str) -> VenueResult<f64>;
    async fn get_active_position_count(&self) -> VenueResult<u32>;
    async fn has_open_entry_orders(&self, symbol: &str) -> VenueResult<bool>;
    async fn get_mark_price(&self, symbol: &str) -> VenueResult<f64>;
    async fn get_exchange_info(&self, symbol: &str) -> VenueResult<SymbolFilters>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()>;
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> VenueResult<()>;

    async fn place_limit_order(&self, symbol: &str, side: Side, quantity: f64, price: f64) -> OrderResult;
    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> OrderResult;
    async fn place_stop_loss(&self, symbol: &str, side: Side, quantity: f64, stop_price: f64) -> OrderResult;
    async fn place_take_profit(&self, symbol: &str, side: Side, quantity: f64, stop_price: f64) -> OrderResult;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()>;
    async fn cancel_all_orders(&self, symbol: &str) -> VenueResult<()>;
    async fn get_open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>>;
}

/// Retries a fallible SL/TP placement closure up to `N_RETRY` times, but
/// only when the failure is classified `Unreachable` (never on a venue
/// rejection) — §4.6. Returns the last result either way.
pub const N_RETRY: u32 = 3;

pub async fn place_with_retry<F, Fut>(mut attempt: F) -> OrderResult
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = OrderResult>,
{
    let mut last = attempt().await;
    let mut tries = 1;
    while !last.success && is_retryable(&last) && tries < N_RETRY {
        last = attempt().await;
        tries += 1;
    }
    last
}

/// An `OrderResult` produced from a transport failure carries a marker in
/// `error_message` so the retry loop (and the executor's "retries
/// exhausted" notification) can distinguish it from a venue rejection.
pub const UNREACHABLE_MARKER: &str = "[venue-unreachable]";

fn is_retryable(result: &OrderResult) -> bool {
    result
        .error_message
        .as_deref()
        .is_some_and(|m| m.starts_with(UNREACHABLE_MARKER))
}

pub fn unreachable_order_result(detail: impl std::fmt::Display) -> OrderResult {
    OrderResult::failed(format!("{UNREACHABLE_MARKER} {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_unreachable_up_to_n_retry_times() {
        let calls = AtomicU32::new(0);
        let result = place_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { unreachable_order_result("timeout") }
        })
        .await;
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), N_RETRY);
    }

    #[tokio::test]
    async fn does_not_retry_venue_rejections() {
        let calls = AtomicU32::new(0);
        let result = place_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { OrderResult::failed("insufficient margin") }
        })
        .await;
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_retrying_once_successful() {
        let calls = AtomicU32::new(0);
        let result = place_with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    unreachable_order_result("timeout")
                } else {
                    OrderResult { success: true, ..OrderResult::failed("unused") }
                }
            }
        })
        .await;
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
