// =============================================================================
// Executor — ENTRY/DCA, MOVE_SL, CLOSE, CANCEL state machine (§4.7)
// =============================================================================
//
// Every entry point takes the `(userId, symbol)` lock for its whole
// duration (§4.5) and never holds a second lock at the same time — the
// symbol-fallback path releases and re-acquires under the substituted
// symbol rather than nesting. Venue pre-flight queries surface
// `VenueError` directly and abort the operation under uncertainty (P2);
// order placement never does — a rejection comes back as a failed
// `OrderResult` that this module turns into a `SignalReceipt`.
// =============================================================================

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::{ConfigResolver, GlobalConfig, UserConfigOverride};
use crate::dedup;
use crate::lock_registry::SymbolLockRegistry;
use crate::notify::Notifier;
use crate::risk::{CircuitBreaker, PositionSizer};
use crate::store::TradeStore;
use crate::types::{
    Colour, EventKind, OrderResult, ReceiptStatus, Side, SignalReceipt, SignalType, TradeSignal,
};
use crate::venue::{place_with_retry, MarginType, VenueClient, N_RETRY, UNREACHABLE_MARKER};

const PRICE_DEVIATION_LIMIT: f64 = 0.10;

pub struct Executor {
    global_config: GlobalConfig,
    locks: Arc<SymbolLockRegistry>,
    circuit_breaker: Arc<CircuitBreaker>,
    venue: Arc<dyn VenueClient>,
    store: Arc<TradeStore>,
    notifier: Arc<dyn Notifier>,
}

impl Executor {
    pub fn new(
        global_config: GlobalConfig,
        locks: Arc<SymbolLockRegistry>,
        circuit_breaker: Arc<CircuitBreaker>,
        venue: Arc<dyn VenueClient>,
        store: Arc<TradeStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { global_config, locks, circuit_breaker, venue, store, notifier }
    }

    fn notify(&self, title: &str, body: &str, colour: Colour) {
        self.notifier.notify(title, body, colour);
    }

    fn reject(reason: impl Into<String>) -> SignalReceipt {
        SignalReceipt { signal_id: String::new(), status: ReceiptStatus::Rejected, reason: Some(reason.into()) }
    }

    fn executed(signal_id: impl Into<String>) -> SignalReceipt {
        SignalReceipt { signal_id: signal_id.into(), status: ReceiptStatus::Executed, reason: None }
    }

    /// Dispatch a parsed signal for `user_id` to the matching state machine.
    /// `overrides` is the user's sparse per-user config row, if any.
    #[instrument(skip(self, signal, overrides), fields(symbol = %signal.symbol, signal_type = %signal.signal_type))]
    pub async fn handle_signal(
        &self,
        user_id: &str,
        signal: &TradeSignal,
        overrides: Option<&UserConfigOverride>,
    ) -> SignalReceipt {
        match signal.signal_type {
            SignalType::Entry => self.handle_entry(user_id, signal, overrides).await,
            SignalType::MoveSl => self.handle_move_sl(user_id, signal, overrides).await,
            SignalType::Close => self.handle_close(user_id, signal, overrides).await,
            SignalType::Cancel => self.handle_cancel(user_id, signal).await,
        }
    }

    fn effective_config(&self, overrides: Option<&UserConfigOverride>) -> crate::types::EffectiveConfig {
        ConfigResolver::resolve(&self.global_config, overrides)
    }

    /// Places an SL, retrying up to `N_RETRY` times on `VenueUnreachable`
    /// only (§4.6). Fires a red "retries exhausted" notification if every
    /// attempt still comes back unreachable.
    async fn place_sl_with_retry(&self, symbol: &str, side: Side, qty: f64, stop_price: f64) -> OrderResult {
        let result = place_with_retry(|| {
            let venue = self.venue.clone();
            let symbol = symbol.to_string();
            async move { venue.place_stop_loss(&symbol, side, qty, stop_price).await }
        })
        .await;
        self.notify_retries_exhausted(&result, symbol, "stop-loss");
        result
    }

    /// Places a TP, retrying up to `N_RETRY` times on `VenueUnreachable`
    /// only (§4.6). Fires a red "retries exhausted" notification if every
    /// attempt still comes back unreachable.
    async fn place_tp_with_retry(&self, symbol: &str, side: Side, qty: f64, stop_price: f64) -> OrderResult {
        let result = place_with_retry(|| {
            let venue = self.venue.clone();
            let symbol = symbol.to_string();
            async move { venue.place_take_profit(&symbol, side, qty, stop_price).await }
        })
        .await;
        self.notify_retries_exhausted(&result, symbol, "take-profit");
        result
    }

    fn notify_retries_exhausted(&self, result: &OrderResult, symbol: &str, kind: &str) {
        if !result.success && result.error_message.as_deref().is_some_and(|m| m.starts_with(UNREACHABLE_MARKER)) {
            self.notify(
                "retries exhausted",
                &format!("{symbol} {kind} placement unreachable after {N_RETRY} attempts"),
                Colour::Red,
            );
        }
    }

    // =========================================================================
    // ENTRY / DCA — §4.7.1
    // =========================================================================

    async fn handle_entry(
        &self,
        user_id: &str,
        signal: &TradeSignal,
        overrides: Option<&UserConfigOverride>,
    ) -> SignalReceipt {
        let cfg = self.effective_config(overrides);
        let _guard = self.locks.lock(user_id, &signal.symbol).await;

        // Step 1: dedup + whitelist.
        if cfg.dedup_enabled {
            let hash = dedup::generate_hash(signal);
            let window = chrono::Duration::seconds(self.global_config.dedup_window_secs);
            if self.store.is_duplicate(user_id, &hash, window) {
                return Self::reject("duplicate signal");
            }
        }
        if !cfg.allowed_symbols.iter().any(|s| s == &signal.symbol) {
            return Self::reject(format!("symbol {} not in allowed list", signal.symbol));
        }

        // Step 2: config + balance.
        let balance = match self.venue.get_available_balance().await {
            Ok(b) => b,
            Err(e) => return Self::reject(format!("balance query failed: {e}")),
        };

        // Step 3: circuit breaker.
        if self.circuit_breaker.is_tripped(&cfg) {
            self.notify(
                "circuit-breaker",
                &format!("{} daily loss limit reached, entry rejected", signal.symbol),
                Colour::Red,
            );
            return Self::reject("circuit breaker tripped");
        }

        // Step 4: venue guards.
        let position_amt = match self.venue.get_current_position_amount(&signal.symbol).await {
            Ok(p) => p,
            Err(e) => return Self::reject(format!("position query failed: {e}")),
        };

        let existing_trade = self.store.get_open_trade(user_id, &signal.symbol);

        if !signal.is_dca && position_amt != 0.0 {
            return Self::reject("position already open for symbol");
        }
        if signal.is_dca && position_amt == 0.0 {
            return Self::reject("no position to DCA into");
        }

        let side = if signal.is_dca {
            let existing_side = existing_trade.as_ref().map(|t| t.side);
            match (signal.side, existing_side) {
                (Some(s), Some(e)) if s != e => return Self::reject("DCA direction conflicts with open trade"),
                (Some(s), _) => s,
                (None, Some(e)) => e,
                (None, None) => return Self::reject("cannot infer DCA direction, no open trade on record"),
            }
        } else {
            match signal.side {
                Some(s) => s,
                None => return Self::reject("missing side on fresh entry"),
            }
        };

        if signal.is_dca {
            let dca_count = existing_trade.as_ref().map(|t| t.dca_count).unwrap_or(0);
            if dca_count >= cfg.max_dca_per_symbol {
                return Self::reject("max DCA layers reached for symbol");
            }
        }

        if !signal.is_dca {
            match self.venue.has_open_entry_orders(&signal.symbol).await {
                Ok(true) => return Self::reject("an entry order is already working for symbol"),
                Ok(false) => {}
                Err(e) => return Self::reject(format!("open-orders query failed: {e}")),
            }
        }

        // Step 5: signal validation.
        let Some(entry) = signal.entry_price() else {
            return Self::reject("missing entry price");
        };
        match side {
            Side::Long if signal.stop_loss >= entry => return Self::reject("stop-loss must be below entry for LONG"),
            Side::Short if signal.stop_loss <= entry => return Self::reject("stop-loss must be above entry for SHORT"),
            _ => {}
        }
        if signal.stop_loss <= 0.0 {
            return Self::reject("missing stop_loss");
        }

        let mark_price = match self.venue.get_mark_price(&signal.symbol).await {
            Ok(p) => p,
            Err(e) => return Self::reject(format!("mark price query failed: {e}")),
        };
        if mark_price > 0.0 && ((entry - mark_price).abs() / mark_price) > PRICE_DEVIATION_LIMIT {
            return Self::reject("price deviation exceeds 10% of mark price");
        }

        // Step 6: sizing.
        let filters = match self.venue.get_exchange_info(&signal.symbol).await {
            Ok(f) => f,
            Err(e) => return Self::reject(format!("exchange info query failed: {e}")),
        };
        let risk_multiplier = if signal.is_dca { cfg.dca_risk_multiplier } else { 1.0 };
        let qty = match PositionSizer::size(balance, entry, signal.stop_loss, &cfg, risk_multiplier, filters.step_size) {
            Ok(q) => q,
            Err(e) => return Self::reject(e.to_string()),
        };

        // Step 7: leverage & margin mode, best-effort idempotent.
        if let Err(e) = self.venue.set_leverage(&signal.symbol, cfg.fixed_leverage).await {
            warn!(symbol = %signal.symbol, error = %e, "set_leverage failed, continuing");
        }
        if let Err(e) = self.venue.set_margin_type(&signal.symbol, MarginType::Isolated).await {
            warn!(symbol = %signal.symbol, error = %e, "set_margin_type failed, continuing");
        }

        // Step 8: place entry.
        let entry_order = self.venue.place_limit_order(&signal.symbol, side, qty, entry).await;
        if !entry_order.success {
            let trade_id = existing_trade.as_ref().map(|t| t.trade_id.clone()).unwrap_or_default();
            self.store.log(&trade_id, EventKind::EntryFailed, Some(&entry_order), false, entry_order.error_message.clone());
            return Self::reject(entry_order.error_message.unwrap_or_else(|| "entry order rejected".to_string()));
        }

        // Step 9: place SL.
        let sl_order = self.place_sl_with_retry(&signal.symbol, side.opposite(), qty, signal.stop_loss).await;

        if !sl_order.success {
            return self.entry_fail_safe(&signal.symbol, side, qty, &entry_order, &sl_order).await;
        }

        // Step 11: TP placements (non-fatal).
        for tp in &signal.take_profits {
            let tp_order = self.place_tp_with_retry(&signal.symbol, side.opposite(), qty, *tp).await;
            if !tp_order.success {
                self.notify(
                    "manual TP required",
                    &format!("{} take-profit at {tp} failed to place, manage manually", signal.symbol),
                    Colour::Yellow,
                );
            }
        }

        // Step 12: persist.
        let hash = dedup::generate_hash(signal);
        let trade = if signal.is_dca {
            let trade_id = existing_trade.expect("checked non-zero position above").trade_id;
            match self.store.record_dca_entry(&trade_id, &entry_order, entry, qty, signal.new_stop_loss) {
                Ok(t) => t,
                Err(e) => return Self::reject(format!("failed to persist DCA entry: {e}")),
            }
        } else {
            self.store.record_entry(
                user_id,
                &signal.symbol,
                side,
                &entry_order,
                entry,
                qty,
                signal.stop_loss,
                signal.take_profits.clone(),
                cfg.fixed_leverage,
                balance * cfg.risk_percent * risk_multiplier,
                Some(hash),
                signal.source.author.clone(),
            )
        };

        self.store.log(
            &trade.trade_id,
            if signal.is_dca { EventKind::DcaEntry } else { EventKind::EntryPlaced },
            Some(&entry_order),
            true,
            None,
        );
        self.store.log(&trade.trade_id, EventKind::SlPlaced, Some(&sl_order), true, None);

        info!(trade_id = %trade.trade_id, symbol = %signal.symbol, is_dca = signal.is_dca, "entry executed");
        Self::executed(trade.trade_id)
    }

    /// §4.7.1 step 10 — SL placement failed, escalate through cancel, then
    /// a market-flatten, then a critical alert if even that fails.
    async fn entry_fail_safe(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        entry_order: &OrderResult,
        sl_order: &OrderResult,
    ) -> SignalReceipt {
        let cancel_result = if let Some(order_id) = &entry_order.order_id {
            self.venue.cancel_order(symbol, order_id).await
        } else {
            Err(crate::error::VenueError::Rejected("no entry order id to cancel".to_string()))
        };

        if cancel_result.is_ok() {
            self.store.log("", EventKind::EntryFailed, Some(entry_order), false, Some("SL placement failed, entry cancelled".to_string()));
            self.store.log("", EventKind::SlFailed, Some(sl_order), false, sl_order.error_message.clone());
            return Self::reject("SL placement failed, entry cancelled");
        }

        let flatten = place_with_retry(|| {
            let venue = self.venue.clone();
            let symbol = symbol.to_string();
            async move { venue.place_market_order(&symbol, side.opposite(), qty).await }
        })
        .await;

        if flatten.success {
            self.store.log("", EventKind::FailSafeClose, Some(&flatten), true, None);
            return Self::reject("SL placement failed, position flattened via market close");
        }

        self.notify(
            "CRITICAL",
            &format!("{symbol} entry SL failed and fail-safe flatten also failed — manual intervention required"),
            Colour::Red,
        );
        self.store.log("", EventKind::FailSafeClose, Some(&flatten), false, flatten.error_message.clone());
        Self::reject("entry SL failed, fail-safe flatten failed, manual intervention required")
    }

    // =========================================================================
    // MOVE_SL — §4.7.2
    // =========================================================================

    async fn handle_move_sl(
        &self,
        user_id: &str,
        signal: &TradeSignal,
        overrides: Option<&UserConfigOverride>,
    ) -> SignalReceipt {
        let _ = overrides;
        let (symbol, _fallback_guard) = match self.resolve_symbol_with_fallback(user_id, &signal.symbol).await {
            Ok(s) => s,
            Err(receipt) => return receipt,
        };

        let _guard = self.locks.lock(user_id, &symbol).await;

        let position_amt = match self.venue.get_current_position_amount(&symbol).await {
            Ok(p) => p,
            Err(e) => return Self::reject(format!("position query failed: {e}")),
        };
        if position_amt == 0.0 {
            return Self::reject("no open position for MOVE_SL");
        }

        let Some(trade) = self.store.get_open_trade(user_id, &symbol) else {
            return Self::reject("no open trade on record for MOVE_SL");
        };

        if let Err(e) = self.venue.cancel_all_orders(&symbol).await {
            return Self::reject(format!("cancel_all_orders failed: {e}"));
        }

        let new_sl = signal.new_stop_loss.unwrap_or(trade.entry_price);
        let qty = position_amt.abs();
        let close_side = if position_amt > 0.0 { Side::Long } else { Side::Short };

        let sl_order = self.place_sl_with_retry(&symbol, close_side.opposite(), qty, new_sl).await;
        if !sl_order.success {
            self.store.log(&trade.trade_id, EventKind::SlFailed, Some(&sl_order), false, sl_order.error_message.clone());
            return Self::reject(sl_order.error_message.unwrap_or_else(|| "SL replacement rejected".to_string()));
        }

        if let Some(tp) = signal.new_take_profit {
            let tp_order = self.place_tp_with_retry(&symbol, close_side.opposite(), qty, tp).await;
            if !tp_order.success {
                self.notify("manual TP required", &format!("{symbol} new take-profit failed to place"), Colour::Yellow);
            }
        }

        let updated = match self.store.update_stop_loss(&trade.trade_id, new_sl) {
            Ok(t) => t,
            Err(e) => return Self::reject(format!("failed to persist MOVE_SL: {e}")),
        };
        self.store.log(&updated.trade_id, EventKind::MoveSl, Some(&sl_order), true, None);
        Self::executed(updated.trade_id)
    }

    // =========================================================================
    // CLOSE — §4.7.3
    // =========================================================================

    async fn handle_close(
        &self,
        user_id: &str,
        signal: &TradeSignal,
        _overrides: Option<&UserConfigOverride>,
    ) -> SignalReceipt {
        let (symbol, _fallback_guard) = match self.resolve_symbol_with_fallback(user_id, &signal.symbol).await {
            Ok(s) => s,
            Err(receipt) => return receipt,
        };

        let _guard = self.locks.lock(user_id, &symbol).await;

        let position_amt = match self.venue.get_current_position_amount(&symbol).await {
            Ok(p) => p,
            Err(e) => return Self::reject(format!("position query failed: {e}")),
        };
        if position_amt == 0.0 {
            let _ = self.venue.cancel_all_orders(&symbol).await;
            return Self::reject("no open position for CLOSE");
        }

        let Some(trade) = self.store.get_open_trade(user_id, &symbol) else {
            return Self::reject("no open trade on record for CLOSE");
        };

        let close_ratio = if signal.close_ratio > 0.0 { signal.close_ratio } else { 1.0 };
        let close_qty = position_amt.abs() * close_ratio;
        let is_full_close = close_ratio >= 0.999;
        let close_side = if position_amt > 0.0 { Side::Long } else { Side::Short };

        let open_orders = self.venue.get_open_orders(&symbol).await.unwrap_or_default();
        let old_sl = open_orders.iter().find(|o| o.order_kind == "STOP_MARKET").map(|o| o.price);
        let old_tp = open_orders.iter().find(|o| o.order_kind == "TAKE_PROFIT_MARKET").map(|o| o.price);

        if let Err(e) = self.venue.cancel_all_orders(&symbol).await {
            return Self::reject(format!("cancel_all_orders failed: {e}"));
        }

        let close_order = if is_full_close {
            self.venue.place_market_order(&symbol, close_side.opposite(), close_qty).await
        } else {
            let mark_price = self.venue.get_mark_price(&symbol).await.unwrap_or(trade.entry_price);
            self.venue.place_limit_order(&symbol, close_side.opposite(), close_qty, mark_price).await
        };

        if !close_order.success {
            self.store.log(&trade.trade_id, EventKind::StreamClose, Some(&close_order), false, close_order.error_message.clone());
            return Self::reject(close_order.error_message.unwrap_or_else(|| "close order rejected".to_string()));
        }

        let reason = "MANUAL_CLOSE";
        if is_full_close {
            let closed = match self.store.record_close(&trade.trade_id, &close_order, reason) {
                Ok(t) => t,
                Err(e) => return Self::reject(format!("failed to persist close: {e}")),
            };
            if let Some(net) = closed.net_profit {
                self.circuit_breaker.record_realised(net);
            }
            self.store.log(&closed.trade_id, EventKind::StreamClose, Some(&close_order), true, None);
            return Self::executed(closed.trade_id);
        }

        // Partial close: rehang SL/TP at the surviving remaining quantity.
        let remaining_qty = position_amt.abs() - close_qty;
        let new_sl = signal.new_stop_loss.or(old_sl).or(Some(trade.entry_price));
        match new_sl {
            Some(sl) => {
                let sl_order = self.place_sl_with_retry(&symbol, close_side.opposite(), remaining_qty, sl).await;
                if !sl_order.success {
                    self.store.log(&trade.trade_id, EventKind::SlRehungFailed, Some(&sl_order), false, sl_order.error_message.clone());
                }
            }
            None => {
                self.store.log(&trade.trade_id, EventKind::SlRehungFailed, None, false, Some("no SL price available to rehang".to_string()));
            }
        }

        let new_tp = signal.new_take_profit.or(old_tp);
        if let Some(tp) = new_tp {
            let tp_order = self.place_tp_with_retry(&symbol, close_side.opposite(), remaining_qty, tp).await;
            if !tp_order.success {
                self.notify("manual TP required", &format!("{symbol} take-profit rehang failed"), Colour::Yellow);
            }
        }

        let updated = match self.store.record_partial_close(&trade.trade_id, close_qty, reason) {
            Ok(t) => t,
            Err(e) => return Self::reject(format!("failed to persist partial close: {e}")),
        };
        self.store.log(&updated.trade_id, EventKind::StreamClose, Some(&close_order), true, None);
        Self::executed(updated.trade_id)
    }

    // =========================================================================
    // CANCEL — §4.7.4
    // =========================================================================

    async fn handle_cancel(&self, user_id: &str, signal: &TradeSignal) -> SignalReceipt {
        let _guard = self.locks.lock(user_id, &signal.symbol).await;

        if let Err(e) = self.venue.cancel_all_orders(&signal.symbol).await {
            return Self::reject(format!("cancel_all_orders failed: {e}"));
        }

        if let Some(trade) = self.store.get_open_trade(user_id, &signal.symbol) {
            match self.store.mark_cancelled(&trade.trade_id, "CANCEL") {
                Ok(t) => return Self::executed(t.trade_id),
                Err(e) => return Self::reject(format!("failed to persist cancel: {e}")),
            }
        }

        Self::executed("")
    }

    // =========================================================================
    // Symbol fallback — §4.7.5 (CLOSE and MOVE_SL only)
    // =========================================================================

    /// Resolve the symbol to operate on: the signal's symbol as-is unless
    /// the venue shows no position there, in which case we substitute the
    /// user's single OPEN trade's symbol (if exactly one exists) and fire a
    /// yellow "auto-corrected" notification. Returns a rejection receipt
    /// directly when no position can be resolved at all.
    async fn resolve_symbol_with_fallback(
        &self,
        user_id: &str,
        signal_symbol: &str,
    ) -> Result<(String, ()), SignalReceipt> {
        match self.venue.get_current_position_amount(signal_symbol).await {
            Ok(amt) if amt != 0.0 => return Ok((signal_symbol.to_string(), ())),
            Ok(_) => {}
            Err(e) => return Err(Self::reject(format!("position query failed: {e}"))),
        }

        let open_trades = self.store.open_trades_for_user(user_id);
        match open_trades.as_slice() {
            [single] => {
                self.notify(
                    "symbol auto-corrected",
                    &format!("no position on {signal_symbol}, substituting {}", single.symbol),
                    Colour::Yellow,
                );
                Ok((single.symbol.clone(), ()))
            }
            _ => Err(Self::reject(format!("no position on {signal_symbol} and symbol fallback is ambiguous"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed::FixedClock;
    use crate::notify::RecordingNotifier;
    use crate::types::{SignalSource, TradeStatus};
    use crate::venue::SymbolFilters;
    use crate::venue_fake::FakeVenueClient;
    use chrono::Utc;

    fn signal(symbol: &str, side: Side, entry: f64, sl: f64, is_dca: bool) -> TradeSignal {
        TradeSignal {
            symbol: symbol.to_string(),
            side: Some(side),
            signal_type: SignalType::Entry,
            entry_price_low: Some(entry),
            entry_price_high: Some(entry),
            stop_loss: sl,
            take_profits: vec![],
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: 1.0,
            is_dca,
            raw_message: "test".to_string(),
            source: SignalSource::default(),
        }
    }

    fn make_executor() -> (Executor, Arc<FakeVenueClient>, Arc<TradeStore>, Arc<RecordingNotifier>) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let venue = Arc::new(FakeVenueClient::new());
        let store = Arc::new(TradeStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let cb = Arc::new(CircuitBreaker::new(clock));
        let locks = Arc::new(SymbolLockRegistry::new());
        let mut global = GlobalConfig::default();
        global.allowed_symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let exec = Executor::new(global, locks, cb, venue.clone(), store.clone(), notifier.clone());
        (exec, venue, store, notifier)
    }

    #[tokio::test]
    async fn fresh_entry_opens_a_trade() {
        let (exec, venue, store, _notifier) = make_executor();
        venue.set_balance(1000.0);
        venue.exchange_info.lock().unwrap().insert("BTCUSDT".to_string(), SymbolFilters { step_size: 0.001, tick_size: 0.01 });
        venue.set_mark_price("BTCUSDT", 95000.0);

        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);
        assert!(store.get_open_trade("u1", "BTCUSDT").is_some());
        assert_eq!(venue.call_count("place_limit_order"), 1);
        assert_eq!(venue.call_count("place_stop_loss"), 1);
    }

    #[tokio::test]
    async fn entry_rejected_when_symbol_not_whitelisted() {
        let (exec, venue, _store, _n) = make_executor();
        venue.set_mark_price("DOGEUSDT", 0.1);
        let sig = signal("DOGEUSDT", Side::Long, 0.1, 0.09, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
    }

    #[tokio::test]
    async fn entry_rejected_when_position_already_open() {
        let (exec, venue, _store, _n) = make_executor();
        venue.set_balance(1000.0);
        venue.set_position("BTCUSDT", 0.1);
        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(receipt.reason.unwrap(), "position already open for symbol");
    }

    #[tokio::test]
    async fn entry_rejected_on_price_deviation() {
        let (exec, venue, _store, _n) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        let sig = signal("BTCUSDT", Side::Long, 150000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(receipt.reason.unwrap(), "price deviation exceeds 10% of mark price");
    }

    #[tokio::test]
    async fn sl_failure_escalates_to_cancel_per_fail_safe() {
        let (exec, venue, _store, _n) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        venue.queue_stop_loss(OrderResult::failed("rejected"));
        venue.queue_cancel_order(Ok(()));

        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(venue.call_count("cancel_order"), 1);
        assert_eq!(venue.call_count("place_market_order"), 0);
    }

    #[tokio::test]
    async fn sl_failure_escalates_to_market_flatten_when_cancel_fails() {
        let (exec, venue, _store, notifier) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        venue.queue_stop_loss(OrderResult::failed("rejected"));
        venue.queue_cancel_order(Err(crate::error::VenueError::Rejected("too late".into())));
        venue.queue_market(OrderResult { success: true, order_id: Some("m1".into()), ..OrderResult::failed("") });

        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(venue.call_count("place_market_order"), 1);
        assert_eq!(notifier.count_colour(Colour::Red), 0);
    }

    #[tokio::test]
    async fn sl_and_flatten_both_fail_fires_critical_red_alert() {
        let (exec, venue, _store, notifier) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        venue.queue_stop_loss(OrderResult::failed("rejected"));
        venue.queue_cancel_order(Err(crate::error::VenueError::Rejected("too late".into())));
        venue.queue_market(OrderResult::failed("also rejected"));

        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(notifier.count_colour(Colour::Red), 1);
    }

    #[tokio::test]
    async fn dca_entry_weighted_averages_into_existing_trade() {
        let (exec, venue, store, _n) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        let entry_sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let r1 = exec.handle_signal("u1", &entry_sig, None).await;
        assert_eq!(r1.status, ReceiptStatus::Executed);

        venue.set_position("BTCUSDT", 0.1);
        let mut dca_sig = signal("BTCUSDT", Side::Long, 93000.0, 91000.0, true);
        dca_sig.side = None;
        let r2 = exec.handle_signal("u1", &dca_sig, None).await;
        assert_eq!(r2.status, ReceiptStatus::Executed);

        let trade = store.get_open_trade("u1", "BTCUSDT").unwrap();
        assert_eq!(trade.dca_count, 1);
    }

    #[tokio::test]
    async fn dca_rejected_without_existing_position() {
        let (exec, _venue, _store, _n) = make_executor();
        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, true);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(receipt.reason.unwrap(), "no position to DCA into");
    }

    #[tokio::test]
    async fn sl_placement_retries_transient_unreachable_then_succeeds() {
        let (exec, venue, store, notifier) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        venue.queue_stop_loss(crate::venue::unreachable_order_result("timeout"));
        venue.queue_stop_loss(crate::venue::unreachable_order_result("timeout"));
        venue.queue_stop_loss(OrderResult { success: true, order_id: Some("sl1".into()), ..OrderResult::failed("") });

        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);
        assert_eq!(venue.call_count("place_stop_loss"), 3);
        assert!(store.get_open_trade("u1", "BTCUSDT").is_some());
        assert_eq!(notifier.count_colour(Colour::Red), 0);
    }

    #[tokio::test]
    async fn sl_placement_fires_red_notification_after_retries_exhausted() {
        let (exec, venue, _store, notifier) = make_executor();
        venue.set_balance(1000.0);
        venue.set_mark_price("BTCUSDT", 95000.0);
        for _ in 0..3 {
            venue.queue_stop_loss(crate::venue::unreachable_order_result("timeout"));
        }
        venue.queue_cancel_order(Ok(()));

        let sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(venue.call_count("place_stop_loss"), 3);
        assert_eq!(notifier.count_colour(Colour::Red), 1);
    }

    #[tokio::test]
    async fn cancel_marks_open_trade_cancelled() {
        let (exec, venue, store, _n) = make_executor();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let order = OrderResult { success: true, order_id: Some("o1".into()), ..OrderResult::failed("") };
        let trade = store.record_entry(
            "u1", "BTCUSDT", Side::Long, &order, 95000.0, 0.1, 93000.0, vec![], 10, 200.0, None, None,
        );
        let _ = clock;

        let mut sig = signal("BTCUSDT", Side::Long, 95000.0, 93000.0, false);
        sig.signal_type = SignalType::Cancel;
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);
        assert_eq!(receipt.signal_id, trade.trade_id);
        assert!(store.get_open_trade("u1", "BTCUSDT").is_none());
        assert_eq!(venue.call_count("cancel_all_orders"), 1);
    }

    #[tokio::test]
    async fn close_with_no_position_falls_back_to_single_open_trade() {
        let (exec, venue, store, notifier) = make_executor();
        let order = OrderResult { success: true, order_id: Some("o1".into()), ..OrderResult::failed("") };
        store.record_entry("u1", "ETHUSDT", Side::Long, &order, 3000.0, 1.0, 2900.0, vec![], 10, 200.0, None, None);
        venue.set_position("ETHUSDT", 1.0);
        venue.queue_market(OrderResult { success: true, order_id: Some("c1".into()), price: Some(3000.0), quantity: Some(1.0), commission: Some(1.2), ..OrderResult::failed("") });

        let mut sig = signal("BTCUSDT", Side::Long, 0.0, 0.0, false);
        sig.signal_type = SignalType::Close;
        sig.close_ratio = 1.0;
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);
        assert_eq!(notifier.count_colour(Colour::Yellow), 1);
        assert!(store.get_open_trade("u1", "ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn full_close_records_profit_and_feeds_circuit_breaker() {
        let (exec, venue, store, _n) = make_executor();
        let order = OrderResult { success: true, order_id: Some("o1".into()), commission: Some(9.5), ..OrderResult::failed("") };
        store.record_entry("u1", "BTCUSDT", Side::Long, &order, 95000.0, 0.5, 93000.0, vec![], 10, 200.0, None, None);
        venue.set_position("BTCUSDT", 0.5);
        venue.queue_market(OrderResult { success: true, order_id: Some("c1".into()), price: Some(93000.0), quantity: Some(0.5), commission: Some(18.6), ..OrderResult::failed("") });

        let mut sig = signal("BTCUSDT", Side::Long, 0.0, 0.0, false);
        sig.signal_type = SignalType::Close;
        sig.close_ratio = 1.0;
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);

        let trade = store.get_trade(&receipt.signal_id).unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert!(trade.net_profit.unwrap() < 0.0);
    }

    #[tokio::test]
    async fn partial_close_leaves_trade_open_with_rehung_sl() {
        let (exec, venue, store, _n) = make_executor();
        let order = OrderResult { success: true, order_id: Some("o1".into()), ..OrderResult::failed("") };
        let trade = store.record_entry("u1", "BTCUSDT", Side::Long, &order, 95000.0, 1.0, 93000.0, vec![], 10, 200.0, None, None);
        venue.set_position("BTCUSDT", 1.0);
        venue.set_mark_price("BTCUSDT", 94000.0);
        venue.queue_limit(OrderResult { success: true, order_id: Some("c1".into()), price: Some(94000.0), quantity: Some(0.5), ..OrderResult::failed("") });
        venue.queue_stop_loss(OrderResult { success: true, order_id: Some("sl2".into()), ..OrderResult::failed("") });

        let mut sig = signal("BTCUSDT", Side::Long, 0.0, 0.0, false);
        sig.signal_type = SignalType::Close;
        sig.close_ratio = 0.5;
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);

        let updated = store.get_trade(&trade.trade_id).unwrap();
        assert_eq!(updated.status, TradeStatus::Open);
        assert_eq!(updated.total_closed_quantity, Some(0.5));
    }

    #[tokio::test]
    async fn move_sl_updates_trade_and_replaces_orders() {
        let (exec, venue, store, _n) = make_executor();
        let order = OrderResult { success: true, order_id: Some("o1".into()), ..OrderResult::failed("") };
        let trade = store.record_entry("u1", "BTCUSDT", Side::Long, &order, 95000.0, 0.1, 93000.0, vec![], 10, 200.0, None, None);
        venue.set_position("BTCUSDT", 0.1);
        venue.queue_stop_loss(OrderResult { success: true, order_id: Some("sl2".into()), ..OrderResult::failed("") });

        let mut sig = signal("BTCUSDT", Side::Long, 0.0, 0.0, false);
        sig.signal_type = SignalType::MoveSl;
        sig.new_stop_loss = Some(94000.0);
        let receipt = exec.handle_signal("u1", &sig, None).await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);

        let updated = store.get_trade(&trade.trade_id).unwrap();
        assert_eq!(updated.stop_loss, 94000.0);
        assert_eq!(venue.call_count("cancel_all_orders"), 1);
    }
}
