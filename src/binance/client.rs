// =============================================================================
// Binance USD-M Futures REST client — signed requests, implements VenueClient
// =============================================================================
//
// SECURITY: The secret key is never logged or serialised. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance's servers (§6).
//
// Classification (§4.6, §7): a transport-level failure (connect/timeout/TLS)
// or a JSON-parse failure on the response body is `VenueError::Unreachable`
// for queries, and an `unreachable_order_result` for order placements so the
// retry helper in `venue.rs` can see it. A non-2xx HTTP response with a
// parseable venue error body is a normal `VenueRejected`/failed `OrderResult`
// — never retried.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::binance::rate_limit::RateLimitTracker;
use crate::error::{VenueError, VenueResult};
use crate::notify::Notifier;
use crate::types::{Colour, OrderResult, Side};
use crate::venue::{unreachable_order_result, MarginType, OpenOrder, SymbolFilters, VenueClient};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

/// Binance USD-M futures REST client with HMAC-SHA256 request signing.
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
    notifier: Arc<dyn Notifier>,
    /// Cleared on the next successful call; set on the first transport
    /// failure of a gap so "connection lost" fires exactly once per gap.
    connection_lost_fired: AtomicBool,
}

impl BinanceFuturesClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: base_url.into(),
            client,
            rate_limit: RateLimitTracker::new(),
            notifier,
            connection_lost_fired: AtomicBool::new(false),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Marks a successful round-trip — clears the connection-lost flag so
    /// the next gap fires a fresh notification.
    fn mark_reachable(&self) {
        self.connection_lost_fired.store(false, Ordering::SeqCst);
    }

    /// Marks a transport failure, firing the red "connection lost"
    /// notification exactly once per gap (§4.6).
    fn mark_unreachable(&self, detail: &str) {
        if self
            .connection_lost_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notifier.notify(
                "Venue connection lost",
                &format!("transport error talking to the venue: {detail}"),
                Colour::Red,
            );
        }
    }

    async fn signed_get(&self, path: &str, params: &str) -> VenueResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.request(self.client.get(&url)).await
    }

    async fn signed_post(&self, path: &str, params: &str) -> VenueResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.request(self.client.post(&url)).await
    }

    async fn signed_delete(&self, path: &str, params: &str) -> VenueResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.request(self.client.delete(&url)).await
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> VenueResult<serde_json::Value> {
        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return Err(VenueError::Unreachable(e.to_string()));
            }
        };

        self.rate_limit.update_from_headers(resp.headers());
        let status = resp.status();

        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                // A response that fails to parse is treated as an internal
                // inconsistency for queries, not a transport gap — the
                // socket round-tripped fine, the payload just didn't match.
                return Err(VenueError::Inconsistent(format!("failed to parse venue response: {e}")));
            }
        };

        self.mark_reachable();

        if !status.is_success() {
            let msg = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown venue error")
                .to_string();
            return Err(VenueError::Rejected(format!("{status}: {msg}")));
        }

        Ok(body)
    }

    async fn order_request(&self, method: reqwest::Method, params: &str) -> OrderResult {
        let qs = self.signed_query(params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        let builder = self.client.request(method, &url);

        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return unreachable_order_result(e);
            }
        };
        self.rate_limit.update_from_headers(resp.headers());
        let status = resp.status();

        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return unreachable_order_result(format!("unparseable order response: {e}")),
        };
        self.mark_reachable();

        if !status.is_success() {
            let msg = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown venue error")
                .to_string();
            return OrderResult::failed(msg);
        }

        let order_id = body.get("orderId").map(|v| v.to_string());
        let price = body.get("price").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
        let quantity = body
            .get("origQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let order_kind = body.get("type").and_then(|v| v.as_str()).map(str::to_string);
        let side = body.get("side").and_then(|v| v.as_str()).map(|s| {
            if s == "BUY" { Side::Long } else { Side::Short }
        });
        let commission = body.get("cumQuote").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());

        OrderResult {
            success: true,
            order_id,
            side,
            order_kind,
            price,
            quantity,
            commission,
            error_message: None,
        }
    }
}

#[async_trait]
impl VenueClient for BinanceFuturesClient {
    #[instrument(skip(self), name = "venue::get_available_balance")]
    async fn get_available_balance(&self) -> VenueResult<f64> {
        let body = self.signed_get("/fapi/v2/balance", "").await?;
        let arr = body.as_array().ok_or_else(|| VenueError::Inconsistent("balance response not an array".into()))?;
        for entry in arr {
            if entry.get("asset").and_then(|v| v.as_str()) == Some("USDT") {
                let balance = entry
                    .get("availableBalance")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| VenueError::Inconsistent("availableBalance missing or unparseable".into()))?;
                return Ok(balance);
            }
        }
        Err(VenueError::Inconsistent("USDT balance entry not found".into()))
    }

    #[instrument(skip(self), name = "venue::get_current_position_amount")]
    async fn get_current_position_amount(&self, symbol: &str) -> VenueResult<f64> {
        let body = self.signed_get("/fapi/v1/positionRisk", &format!("symbol={symbol}")).await?;
        let arr = body.as_array().ok_or_else(|| VenueError::Inconsistent("positionRisk response not an array".into()))?;
        let amt = arr
            .first()
            .and_then(|e| e.get("positionAmt"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| VenueError::Inconsistent("positionAmt missing or unparseable".into()))?;
        debug!(symbol, amt, "position amount");
        Ok(amt)
    }

    #[instrument(skip(self), name = "venue::get_active_position_count")]
    async fn get_active_position_count(&self) -> VenueResult<u32> {
        let body = self.signed_get("/fapi/v1/positionRisk", "").await?;
        let arr = body.as_array().ok_or_else(|| VenueError::Inconsistent("positionRisk response not an array".into()))?;
        let count = arr
            .iter()
            .filter_map(|e| e.get("positionAmt")?.as_str()?.parse::<f64>().ok())
            .filter(|amt| *amt != 0.0)
            .count() as u32;
        Ok(count)
    }

    #[instrument(skip(self), name = "venue::has_open_entry_orders")]
    async fn has_open_entry_orders(&self, symbol: &str) -> VenueResult<bool> {
        let body = self.signed_get("/fapi/v1/openOrders", &format!("symbol={symbol}")).await?;
        let arr = body.as_array().ok_or_else(|| VenueError::Inconsistent("openOrders response not an array".into()))?;
        let has_entry = arr.iter().any(|o| {
            let reduce_only = o.get("reduceOnly").and_then(|v| v.as_bool()).unwrap_or(false);
            !reduce_only
        });
        Ok(has_entry)
    }

    #[instrument(skip(self), name = "venue::get_mark_price")]
    async fn get_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return Err(VenueError::Unreachable(e.to_string()));
            }
        };
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Inconsistent(format!("failed to parse premiumIndex response: {e}")))?;
        self.mark_reachable();
        if !status.is_success() {
            return Err(VenueError::Rejected(format!("premiumIndex returned {status}")));
        }
        body.get("markPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| VenueError::Inconsistent("markPrice missing or unparseable".into()))
    }

    #[instrument(skip(self), name = "venue::get_exchange_info")]
    async fn get_exchange_info(&self, symbol: &str) -> VenueResult<SymbolFilters> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return Err(VenueError::Unreachable(e.to_string()));
            }
        };
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Inconsistent(format!("failed to parse exchangeInfo response: {e}")))?;
        self.mark_reachable();

        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| VenueError::Inconsistent("exchangeInfo missing symbols array".into()))?;
        let entry = symbols
            .iter()
            .find(|s| s.get("symbol").and_then(|v| v.as_str()) == Some(symbol))
            .ok_or_else(|| VenueError::Inconsistent(format!("symbol {symbol} not found in exchangeInfo")))?;

        let mut filters = SymbolFilters::default();
        if let Some(arr) = entry.get("filters").and_then(|v| v.as_array()) {
            for f in arr {
                match f.get("filterType").and_then(|v| v.as_str()) {
                    Some("LOT_SIZE") => {
                        if let Some(step) = f.get("stepSize").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
                            filters.step_size = step;
                        }
                    }
                    Some("PRICE_FILTER") => {
                        if let Some(tick) = f.get("tickSize").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
                            filters.tick_size = tick;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(filters)
    }

    #[instrument(skip(self), name = "venue::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        match self.signed_post("/fapi/v1/leverage", &format!("symbol={symbol}&leverage={leverage}")).await {
            Ok(_) => Ok(()),
            Err(VenueError::Rejected(msg)) if msg.contains("No need to change") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "venue::set_margin_type")]
    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType) -> VenueResult<()> {
        let params = format!("symbol={symbol}&marginType={}", margin_type.as_venue_str());
        match self.signed_post("/fapi/v1/marginType", &params).await {
            Ok(_) => Ok(()),
            Err(VenueError::Rejected(msg)) if msg.contains("No need to change") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_limit_order(&self, symbol: &str, side: Side, quantity: f64, price: f64) -> OrderResult {
        let params = format!(
            "symbol={symbol}&side={}&type=LIMIT&quantity={quantity}&price={price}&timeInForce=GTC",
            side_str(side)
        );
        self.order_request(reqwest::Method::POST, &params).await
    }

    async fn place_market_order(&self, symbol: &str, side: Side, quantity: f64) -> OrderResult {
        let params = format!("symbol={symbol}&side={}&type=MARKET&quantity={quantity}", side_str(side));
        self.order_request(reqwest::Method::POST, &params).await
    }

    async fn place_stop_loss(&self, symbol: &str, side: Side, quantity: f64, stop_price: f64) -> OrderResult {
        let params = format!(
            "symbol={symbol}&side={}&type=STOP_MARKET&quantity={quantity}&stopPrice={stop_price}&reduceOnly=true",
            side_str(side)
        );
        self.order_request(reqwest::Method::POST, &params).await
    }

    async fn place_take_profit(&self, symbol: &str, side: Side, quantity: f64, stop_price: f64) -> OrderResult {
        let params = format!(
            "symbol={symbol}&side={}&type=TAKE_PROFIT_MARKET&quantity={quantity}&stopPrice={stop_price}&reduceOnly=true",
            side_str(side)
        );
        self.order_request(reqwest::Method::POST, &params).await
    }

    #[instrument(skip(self), name = "venue::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()> {
        self.signed_delete("/fapi/v1/order", &format!("symbol={symbol}&orderId={order_id}"))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), name = "venue::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> VenueResult<()> {
        self.signed_delete("/fapi/v1/allOpenOrders", &format!("symbol={symbol}"))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), name = "venue::get_open_orders")]
    async fn get_open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        let body = self.signed_get("/fapi/v1/openOrders", &format!("symbol={symbol}")).await?;
        let arr = body.as_array().ok_or_else(|| VenueError::Inconsistent("openOrders response not an array".into()))?;

        let mut out = Vec::with_capacity(arr.len());
        for o in arr {
            let order_id = o.get("orderId").map(|v| v.to_string()).unwrap_or_default();
            let order_kind = o.get("type").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let side = if o.get("side").and_then(|v| v.as_str()) == Some("BUY") { Side::Long } else { Side::Short };
            let price = o
                .get("stopPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|p| *p != 0.0)
                .or_else(|| o.get("price").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()))
                .unwrap_or(0.0);
            let quantity = o
                .get("origQty")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let reduce_only = o.get("reduceOnly").and_then(|v| v.as_bool()).unwrap_or(false);
            out.push(OpenOrder { order_id, order_kind, side, price, quantity, reduce_only });
        }
        Ok(out)
    }
}

impl BinanceFuturesClient {
    /// Opens a new user-data stream and returns the `listenKey` to append to
    /// the WebSocket base URL. Not part of `VenueClient`: listenKey lifecycle
    /// is WS-session plumbing for `StreamConsumer`, not a trading operation.
    #[instrument(skip(self), name = "venue::create_listen_key")]
    pub async fn create_listen_key(&self) -> VenueResult<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = match self.client.post(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return Err(VenueError::Unreachable(e.to_string()));
            }
        };
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Inconsistent(format!("failed to parse listenKey response: {e}")))?;
        self.mark_reachable();
        if !status.is_success() {
            return Err(VenueError::Rejected(format!("listenKey create returned {status}")));
        }
        body.get("listenKey")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| VenueError::Inconsistent("listenKey missing from response".into()))
    }

    /// Keeps an existing user-data stream alive for another 60 minutes.
    /// Called on a 30-minute cadence (§5).
    #[instrument(skip(self), name = "venue::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> VenueResult<()> {
        let url = format!("{}/fapi/v1/listenKey?listenKey={}", self.base_url, listen_key);
        let resp = match self.client.put(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return Err(VenueError::Unreachable(e.to_string()));
            }
        };
        let status = resp.status();
        let _: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Inconsistent(format!("failed to parse listenKey keepalive response: {e}")))?;
        self.mark_reachable();
        if !status.is_success() {
            return Err(VenueError::Rejected(format!("listenKey keepalive returned {status}")));
        }
        Ok(())
    }

    /// Closes a user-data stream. Best-effort on shutdown: the caller logs
    /// and moves on regardless of the outcome.
    #[instrument(skip(self), name = "venue::delete_listen_key")]
    pub async fn delete_listen_key(&self, listen_key: &str) -> VenueResult<()> {
        let url = format!("{}/fapi/v1/listenKey?listenKey={}", self.base_url, listen_key);
        let resp = match self.client.delete(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.mark_unreachable(&e.to_string());
                return Err(VenueError::Unreachable(e.to_string()));
            }
        };
        let status = resp.status();
        self.mark_reachable();
        if !status.is_success() {
            return Err(VenueError::Rejected(format!("listenKey delete returned {status}")));
        }
        Ok(())
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

