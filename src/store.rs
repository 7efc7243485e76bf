// =============================================================================
// TradeStore — persistence and profit/commission accounting (§4.9)
// =============================================================================
//
// The spec names a SQL schema (`trade`, `trade_event`, a partial unique
// index enforcing I1); this crate implements the same shape as a port with
// an in-process, `RwLock`-protected implementation standing in for a real
// database (§10.3). `InMemoryTradeStore` enforces I1 with an index map
// keyed by `(userId, symbol)` instead of a SQL constraint, and persists a
// JSON snapshot atomically (tmp + rename) on request, the same pattern as
// `GlobalConfig::save`.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::types::{EventKind, OrderResult, Side, Trade, TradeEvent, TradeStatus};

/// Venue-reported commission is preferred; absent that, the estimate
/// functions below fill in a maker/taker approximation (§4.9, design notes).
const MAKER_COMMISSION_RATE: f64 = 0.0002;
const TAKER_COMMISSION_RATE: f64 = 0.0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Full,
    Partial,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    trades: Vec<Trade>,
    events: Vec<TradeEvent>,
}

struct Inner {
    trades: HashMap<String, Trade>,
    /// (userId, symbol) -> tradeId, maintained only while that trade is OPEN
    /// — the in-process analogue of the partial unique index enforcing I1.
    open_index: HashMap<(String, String), String>,
    events: Vec<TradeEvent>,
}

pub struct TradeStore {
    clock: std::sync::Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl TradeStore {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(Inner {
                trades: HashMap::new(),
                open_index: HashMap::new(),
                events: Vec::new(),
            }),
        }
    }

    // -------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------

    pub fn get_open_trade(&self, user_id: &str, symbol: &str) -> Option<Trade> {
        let guard = self.inner.read();
        let id = guard.open_index.get(&(user_id.to_string(), symbol.to_string()))?;
        guard.trades.get(id).cloned()
    }

    pub fn get_trade(&self, trade_id: &str) -> Option<Trade> {
        self.inner.read().trades.get(trade_id).cloned()
    }

    /// Finds the open trade for `symbol` regardless of owning user.
    ///
    /// The venue's user-data stream reports fills by symbol alone, with no
    /// userId — the whole engine trades a single shared venue account on
    /// behalf of its configured users, so at most one trade is open per
    /// symbol at a time (enforced by `SymbolLockRegistry` + I1). This is the
    /// lookup `StreamConsumer` uses to map a fill back to its trade.
    pub fn find_open_trade_by_symbol(&self, symbol: &str) -> Option<Trade> {
        self.inner
            .read()
            .trades
            .values()
            .find(|t| t.symbol == symbol && t.status == TradeStatus::Open)
            .cloned()
    }

    pub fn open_trades_for_user(&self, user_id: &str) -> Vec<Trade> {
        self.inner
            .read()
            .trades
            .values()
            .filter(|t| t.user_id == user_id && t.status == TradeStatus::Open)
            .cloned()
            .collect()
    }

    pub fn all_open_trades(&self) -> Vec<Trade> {
        self.inner.read().trades.values().filter(|t| t.status == TradeStatus::Open).cloned().collect()
    }

    pub fn events_for_trade(&self, trade_id: &str) -> Vec<TradeEvent> {
        self.inner.read().events.iter().filter(|e| e.trade_id == trade_id).cloned().collect()
    }

    /// §4.2 — true iff a Trade exists for `(signalHash, userId)` created
    /// within `window` of now. Best-effort: a caller that couldn't compute
    /// a hash should never call this rather than treat `None` as "not a
    /// duplicate" silently — that contract lives in the caller.
    pub fn is_duplicate(&self, user_id: &str, signal_hash: &str, window: chrono::Duration) -> bool {
        let now = self.clock.now();
        self.inner.read().trades.values().any(|t| {
            t.user_id == user_id
                && t.signal_hash.as_deref() == Some(signal_hash)
                && now - t.created_at <= window
        })
    }

    // -------------------------------------------------------------------
    // Event log
    // -------------------------------------------------------------------

    pub fn record_event(&self, event: TradeEvent) {
        self.inner.write().events.push(event);
    }

    fn new_event(
        &self,
        trade_id: &str,
        kind: EventKind,
        order: Option<&OrderResult>,
        success: bool,
        error_message: Option<String>,
    ) -> TradeEvent {
        TradeEvent {
            trade_id: trade_id.to_string(),
            event_type: kind,
            venue_order_id: order.and_then(|o| o.order_id.clone()),
            side: order.and_then(|o| o.side),
            order_kind: order.and_then(|o| o.order_kind.clone()),
            price: order.and_then(|o| o.price),
            quantity: order.and_then(|o| o.quantity),
            success,
            error_message,
            detail: None,
            created_at: self.clock.now(),
        }
    }

    pub fn log(&self, trade_id: &str, kind: EventKind, order: Option<&OrderResult>, success: bool, error: Option<String>) {
        let event = self.new_event(trade_id, kind, order, success, error);
        self.record_event(event);
    }

    // -------------------------------------------------------------------
    // ENTRY / DCA (§4.7.1 step 12, §4.9 recordEntry/recordDcaEntry)
    // -------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn record_entry(
        &self,
        user_id: &str,
        symbol: &str,
        side: Side,
        entry_order: &OrderResult,
        entry_price: f64,
        entry_quantity: f64,
        stop_loss: f64,
        take_profits: Vec<f64>,
        leverage: u32,
        risk_amount: f64,
        signal_hash: Option<String>,
        source_author_name: Option<String>,
    ) -> Trade {
        let now = self.clock.now();
        let entry_commission = entry_order
            .commission
            .filter(|c| *c > 0.0)
            .unwrap_or(entry_price * entry_quantity * MAKER_COMMISSION_RATE);

        let trade = Trade {
            trade_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            entry_quantity,
            entry_commission,
            entry_order_id: entry_order.order_id.clone(),
            entry_time: now,
            leverage,
            risk_amount,
            stop_loss,
            take_profits,
            remaining_quantity: None,
            total_closed_quantity: None,
            dca_count: 0,
            exit_price: None,
            exit_quantity: None,
            exit_commission: None,
            exit_order_id: None,
            exit_time: None,
            exit_reason: None,
            gross_profit: None,
            commission: None,
            net_profit: None,
            status: TradeStatus::Open,
            created_at: now,
            updated_at: now,
            signal_hash,
            source_author_name,
        };

        let mut guard = self.inner.write();
        guard.open_index.insert((user_id.to_string(), symbol.to_string()), trade.trade_id.clone());
        guard.trades.insert(trade.trade_id.clone(), trade.clone());
        info!(trade_id = %trade.trade_id, user_id, symbol, %side, entry_price, entry_quantity, "trade opened");
        trade
    }

    /// §4.7.1 step 12 — weighted-average DCA entry into an existing OPEN
    /// trade. `new_stop_loss` overwrites `stopLoss` only when `Some`.
    pub fn record_dca_entry(
        &self,
        trade_id: &str,
        new_order: &OrderResult,
        new_price: f64,
        new_quantity: f64,
        new_stop_loss: Option<f64>,
    ) -> Result<Trade> {
        let mut guard = self.inner.write();
        let trade = guard.trades.get_mut(trade_id).context("trade not found for DCA")?;

        let effective_open_qty = trade.remaining_quantity.unwrap_or(trade.entry_quantity);
        let weighted_price = (trade.entry_price * effective_open_qty + new_price * new_quantity)
            / (effective_open_qty + new_quantity);

        let added_commission = new_order
            .commission
            .filter(|c| *c > 0.0)
            .unwrap_or(new_price * new_quantity * MAKER_COMMISSION_RATE);

        trade.entry_price = weighted_price;
        trade.entry_quantity = effective_open_qty + new_quantity;
        trade.remaining_quantity = None;
        trade.total_closed_quantity = None;
        trade.dca_count += 1;
        trade.entry_commission += added_commission;
        if let Some(sl) = new_stop_loss {
            trade.stop_loss = sl;
        }
        trade.updated_at = self.clock.now();

        debug!(trade_id, new_entry_price = weighted_price, dca_count = trade.dca_count, "DCA entry recorded");
        Ok(trade.clone())
    }

    // -------------------------------------------------------------------
    // MOVE_SL
    // -------------------------------------------------------------------

    pub fn update_stop_loss(&self, trade_id: &str, new_stop_loss: f64) -> Result<Trade> {
        let mut guard = self.inner.write();
        let trade = guard.trades.get_mut(trade_id).context("trade not found for MOVE_SL")?;
        trade.stop_loss = new_stop_loss;
        trade.updated_at = self.clock.now();
        Ok(trade.clone())
    }

    // -------------------------------------------------------------------
    // CLOSE / accounting (§4.9)
    // -------------------------------------------------------------------

    /// `calculateProfit` from §4.9 — pure function over the fields needed,
    /// kept free-standing so both `record_close` and
    /// `record_close_from_stream` share the same arithmetic.
    pub fn calculate_profit(
        side: Side,
        entry_price: Option<f64>,
        entry_quantity: f64,
        entry_commission: f64,
        exit_price: Option<f64>,
        order_commission: Option<f64>,
    ) -> (Option<f64>, Option<f64>, Option<f64>) {
        let (Some(entry), Some(exit)) = (entry_price, exit_price) else {
            return (None, None, None);
        };
        let direction = if side == Side::Long { 1.0 } else { -1.0 };
        let qty = entry_quantity;
        let gross_profit = (exit - entry) * qty * direction;
        let exit_commission = order_commission.filter(|c| *c > 0.0).unwrap_or(exit * qty * TAKER_COMMISSION_RATE);
        let commission = entry_commission + exit_commission;
        let net_profit = gross_profit - commission;
        (Some(gross_profit), Some(commission), Some(net_profit))
    }

    /// Full close. `reason` is e.g. "MANUAL_CLOSE", "SL_TRIGGERED".
    pub fn record_close(&self, trade_id: &str, close_order: &OrderResult, reason: &str) -> Result<Trade> {
        let mut guard = self.inner.write();
        let trade = guard.trades.get_mut(trade_id).context("trade not found for close")?;

        let exit_price = close_order.price.or(trade.exit_price);
        let (gross, commission, net) = Self::calculate_profit(
            trade.side,
            Some(trade.entry_price),
            trade.entry_quantity,
            trade.entry_commission,
            exit_price,
            close_order.commission,
        );

        trade.status = TradeStatus::Closed;
        trade.exit_price = exit_price;
        trade.exit_quantity = close_order.quantity.or(Some(trade.effective_open_qty()));
        trade.exit_commission = close_order.commission;
        trade.exit_order_id = close_order.order_id.clone();
        trade.exit_time = Some(self.clock.now());
        trade.exit_reason = Some(reason.to_string());
        trade.gross_profit = gross;
        trade.commission = commission;
        trade.net_profit = net;
        trade.updated_at = self.clock.now();

        guard.open_index.remove(&(trade.user_id.clone(), trade.symbol.clone()));
        info!(trade_id, reason, net_profit = ?net, "trade closed");
        Ok(trade.clone())
    }

    /// Partial close. Status stays OPEN; no profit fields are set (§4.7.3
    /// step 8, P4).
    pub fn record_partial_close(&self, trade_id: &str, close_qty: f64, reason: &str) -> Result<Trade> {
        let mut guard = self.inner.write();
        let trade = guard.trades.get_mut(trade_id).context("trade not found for partial close")?;

        let effective_open_qty = trade.remaining_quantity.unwrap_or(trade.entry_quantity);
        let already_closed = trade.total_closed_quantity.unwrap_or(0.0);

        trade.total_closed_quantity = Some(already_closed + close_qty);
        trade.remaining_quantity = Some((effective_open_qty - close_qty).max(0.0));
        trade.exit_reason = Some(format!("{reason}_PARTIAL"));
        trade.updated_at = self.clock.now();

        debug!(
            trade_id,
            close_qty,
            remaining = trade.remaining_quantity,
            total_closed = trade.total_closed_quantity,
            "partial close recorded"
        );
        Ok(trade.clone())
    }

    /// §4.8 — the stream-driven close/partial-close decision. Returns the
    /// updated trade and which branch was taken.
    #[allow(clippy::too_many_arguments)]
    pub fn record_close_from_stream(
        &self,
        trade_id: &str,
        exit_price: f64,
        filled_qty: f64,
        commission: Option<f64>,
        order_id: Option<String>,
        reason: &str,
    ) -> Result<(Trade, CloseKind)> {
        let effective_open_qty = {
            let guard = self.inner.read();
            let trade = guard.trades.get(trade_id).context("trade not found")?;
            trade.effective_open_qty()
        };

        if filled_qty >= 0.999 * effective_open_qty {
            let order = OrderResult {
                success: true,
                order_id,
                side: None,
                order_kind: None,
                price: Some(exit_price),
                quantity: Some(filled_qty),
                commission,
                error_message: None,
            };
            let trade = self.record_close(trade_id, &order, reason)?;
            Ok((trade, CloseKind::Full))
        } else {
            let trade = self.record_partial_close(trade_id, filled_qty, reason)?;
            Ok((trade, CloseKind::Partial))
        }
    }

    // -------------------------------------------------------------------
    // CANCEL
    // -------------------------------------------------------------------

    pub fn mark_cancelled(&self, trade_id: &str, reason: &str) -> Result<Trade> {
        let mut guard = self.inner.write();
        let trade = guard.trades.get_mut(trade_id).context("trade not found for cancel")?;
        trade.status = TradeStatus::Cancelled;
        trade.exit_reason = Some(reason.to_string());
        trade.exit_time = Some(self.clock.now());
        trade.updated_at = self.clock.now();
        guard.open_index.remove(&(trade.user_id.clone(), trade.symbol.clone()));
        info!(trade_id, reason, "trade cancelled");
        Ok(trade.clone())
    }

    /// §4.9 `cleanupStaleTrades` — a position-checker exception must never
    /// cancel a trade under uncertainty; the caller is expected to pass a
    /// closure that itself returns `Err` only for genuine I/O failures.
    pub async fn cleanup_stale_trades<F, Fut>(&self, position_checker: F) -> Vec<String>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<f64>>,
    {
        let open = self.all_open_trades();
        let mut cancelled = Vec::new();
        for trade in open {
            match position_checker(trade.symbol.clone()).await {
                Ok(amt) if amt == 0.0 => {
                    if self.mark_cancelled(&trade.trade_id, "STALE_CLEANUP").is_ok() {
                        cancelled.push(trade.trade_id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(trade_id = %trade.trade_id, error = %e, "stale-trade position check failed, skipping");
                }
            }
        }
        cancelled
    }

    // -------------------------------------------------------------------
    // Snapshot persistence
    // -------------------------------------------------------------------

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let guard = self.inner.read();
        let snapshot = Snapshot {
            trades: guard.trades.values().cloned().collect(),
            events: guard.events.clone(),
        };
        let content = serde_json::to_string_pretty(&snapshot).context("failed to serialise trade snapshot")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;
        info!(path = %path.display(), trades = snapshot.trades.len(), "trade snapshot saved (atomic)");
        Ok(())
    }

    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot from {}", path.display()))?;
        let snapshot: Snapshot =
            serde_json::from_str(&content).with_context(|| format!("failed to parse snapshot from {}", path.display()))?;

        let mut guard = self.inner.write();
        guard.events = snapshot.events;
        for trade in snapshot.trades {
            if trade.status == TradeStatus::Open {
                guard.open_index.insert((trade.user_id.clone(), trade.symbol.clone()), trade.trade_id.clone());
            }
            guard.trades.insert(trade.trade_id.clone(), trade);
        }
        info!(path = %path.display(), "trade snapshot loaded");
        Ok(())
    }
}
