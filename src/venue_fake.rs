// =============================================================================
// FakeVenueClient — in-process VenueClient fake for executor/stream tests
// =============================================================================
//
// Every query and order outcome is pre-programmed by the test, and every
// call is recorded so assertions can check exactly what the Executor did
// (e.g. "cancelAllOrders was called exactly once"). This replaces
// inheritance-based mock spying with an explicit fake, per §9 design notes.
// =============================================================================
#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{VenueError, VenueResult};
use crate::types::{OrderResult, Side};
use crate::venue::{unreachable_order_result, MarginType, OpenOrder, SymbolFilters, VenueClient};

#[derive(Default)]
pub struct FakeVenueClient {
    pub balance: Mutex<f64>,
    pub position_amounts: Mutex<HashMap<String, f64>>,
    pub active_position_count: Mutex<u32>,
    pub open_entry_orders: Mutex<HashMap<String, bool>>,
    pub mark_prices: Mutex<HashMap<String, f64>>,
    pub exchange_info: Mutex<HashMap<String, SymbolFilters>>,
    pub open_orders: Mutex<HashMap<String, Vec<OpenOrder>>>,

    /// Pre-programmed results returned in order for each call kind; the
    /// last element repeats once exhausted.
    pub limit_order_results: Mutex<VecDeque<OrderResult>>,
    pub market_order_results: Mutex<VecDeque<OrderResult>>,
    pub stop_loss_results: Mutex<VecDeque<OrderResult>>,
    pub take_profit_results: Mutex<VecDeque<OrderResult>>,
    pub cancel_order_results: Mutex<VecDeque<VenueResult<()>>>,
    pub cancel_all_results: Mutex<VecDeque<VenueResult<()>>>,

    pub query_failure: Mutex<Option<String>>,

    pub calls: Mutex<Vec<String>>,
}

fn pop_or_default(queue: &Mutex<VecDeque<OrderResult>>, default_success: bool) -> OrderResult {
    let mut q = queue.lock().unwrap();
    if let Some(front) = q.pop_front() {
        front
    } else if default_success {
        OrderResult {
            success: true,
            order_id: Some("order-1".to_string()),
            side: None,
            order_kind: None,
            price: None,
            quantity: None,
            commission: None,
            error_message: None,
        }
    } else {
        OrderResult::failed("no canned result configured")
    }
}

impl FakeVenueClient {
    pub fn new() -> Self {
        Self {
            balance: Mutex::new(1000.0),
            active_position_count: Mutex::new(0),
            ..Default::default()
        }
    }

    pub fn set_balance(&self, balance: f64) {
        *self.balance.lock().unwrap() = balance;
    }

    pub fn set_position(&self, symbol: &str, amount: f64) {
        self.position_amounts.lock().unwrap().insert(symbol.to_string(), amount);
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.mark_prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_open_entry_orders(&self, symbol: &str, value: bool) {
        self.open_entry_orders.lock().unwrap().insert(symbol.to_string(), value);
    }

    pub fn set_open_orders(&self, symbol: &str, orders: Vec<OpenOrder>) {
        self.open_orders.lock().unwrap().insert(symbol.to_string(), orders);
    }

    pub fn queue_limit(&self, result: OrderResult) {
        self.limit_order_results.lock().unwrap().push_back(result);
    }

    pub fn queue_stop_loss(&self, result: OrderResult) {
        self.stop_loss_results.lock().unwrap().push_back(result);
    }

    pub fn queue_take_profit(&self, result: OrderResult) {
        self.take_profit_results.lock().unwrap().push_back(result);
    }

    pub fn queue_market(&self, result: OrderResult) {
        self.market_order_results.lock().unwrap().push_back(result);
    }

    pub fn queue_cancel_order(&self, result: VenueResult<()>) {
        self.cancel_order_results.lock().unwrap().push_back(result);
    }

    pub fn queue_cancel_all(&self, result: VenueResult<()>) {
        self.cancel_all_results.lock().unwrap().push_back(result);
    }

    pub fn fail_queries_with(&self, message: impl Into<String>) {
        *self.query_failure.lock().unwrap() = Some(message.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == name).count()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    fn maybe_fail(&self) -> VenueResult<()> {
        if let Some(msg) = self.query_failure.lock().unwrap().clone() {
            return Err(VenueError::Inconsistent(msg));
        }
        Ok(())
    }
}

#[async_trait]
impl VenueClient for FakeVenueClient {
    async fn get_available_balance(&self) -> VenueResult<f64> {
        self.record("get_available_balance");
        self.maybe_fail()?;
        Ok(*self.balance.lock().unwrap())
    }

    async fn get_current_position_amount(&self, symbol: &str) -> VenueResult<f64> {
        self.record("get_current_position_amount");
        self.maybe_fail()?;
        Ok(*self.position_amounts.lock().unwrap().get(symbol).unwrap_or(&0.0))
    }

    async fn get_active_position_count(&self) -> VenueResult<u32> {
        self.record("get_active_position_count");
        self.maybe_fail()?;
        Ok(*self.active_position_count.lock().unwrap())
    }

    async fn has_open_entry_orders(&self, symbol: &str) -> VenueResult<bool> {
        self.record("has_open_entry_orders");
        self.maybe_fail()?;
        Ok(*self.open_entry_orders.lock().unwrap().get(symbol).unwrap_or(&false))
    }

    async fn get_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        self.record("get_mark_price");
        self.maybe_fail()?;
        Ok(*self.mark_prices.lock().unwrap().get(symbol).unwrap_or(&0.0))
    }

    async fn get_exchange_info(&self, symbol: &str) -> VenueResult<SymbolFilters> {
        self.record("get_exchange_info");
        self.maybe_fail()?;
        Ok(self
            .exchange_info
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or_default())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> VenueResult<()> {
        self.record("set_leverage");
        Ok(())
    }

    async fn set_margin_type(&self, _symbol: &str, _margin_type: MarginType) -> VenueResult<()> {
        self.record("set_margin_type");
        Ok(())
    }

    async fn place_limit_order(&self, _symbol: &str, _side: Side, _quantity: f64, _price: f64) -> OrderResult {
        self.record("place_limit_order");
        pop_or_default(&self.limit_order_results, true)
    }

    async fn place_market_order(&self, _symbol: &str, _side: Side, _quantity: f64) -> OrderResult {
        self.record("place_market_order");
        pop_or_default(&self.market_order_results, true)
    }

    async fn place_stop_loss(&self, _symbol: &str, _side: Side, _quantity: f64, _stop_price: f64) -> OrderResult {
        self.record("place_stop_loss");
        pop_or_default(&self.stop_loss_results, true)
    }

    async fn place_take_profit(&self, _symbol: &str, _side: Side, _quantity: f64, _stop_price: f64) -> OrderResult {
        self.record("place_take_profit");
        pop_or_default(&self.take_profit_results, true)
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> VenueResult<()> {
        self.record("cancel_order");
        let mut q = self.cancel_order_results.lock().unwrap();
        q.pop_front().unwrap_or(Ok(()))
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> VenueResult<()> {
        self.record("cancel_all_orders");
        let mut q = self.cancel_all_results.lock().unwrap();
        q.pop_front().unwrap_or(Ok(()))
    }

    async fn get_open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        self.record("get_open_orders");
        self.maybe_fail()?;
        Ok(self.open_orders.lock().unwrap().get(symbol).cloned().unwrap_or_default())
    }
}
