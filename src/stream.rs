// =============================================================================
// StreamConsumer — venue user-data WebSocket → fill/cancel reconciliation (§4.8)
// =============================================================================
//
// Owns the listenKey lifecycle (create at startup, 30-minute keepalive,
// best-effort delete on shutdown) and the long-running read loop. Every
// `ORDER_TRADE_UPDATE` event is handled independently; any exception in a
// single event's handling is caught, logged, and turned into a yellow
// "record failed" notification rather than propagated — one bad event must
// never take down the loop.
//
// Reconnects are driven by a `ReconnectCoordinator` owned by the stream, not
// the other way around: the coordinator only ever holds a callback to invoke,
// never the socket, so there is no ownership cycle (§9).
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::binance::client::BinanceFuturesClient;
use crate::notify::Notifier;
use crate::store::TradeStore;
use crate::types::{Colour, EventKind};

/// Taker commission rate used to estimate a fill's commission when the venue
/// doesn't report it in USDT (§4.8).
const TAKER_COMMISSION_RATE: f64 = 0.0004;

const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Prefers the venue-reported commission when it's denominated in USDT;
/// otherwise estimates at the taker rate (§4.8).
fn resolve_commission(commission_asset: &str, reported: f64, avg_price: f64, filled_qty: f64) -> f64 {
    if commission_asset == "USDT" {
        reported
    } else {
        avg_price * filled_qty * TAKER_COMMISSION_RATE
    }
}

// -----------------------------------------------------------------------
// Reconnect state machine
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Tracks reconnect attempts and backoff, and coalesces pending reconnect
/// tasks so at most one is ever scheduled at a time (§4.8, P8).
pub struct ReconnectCoordinator {
    state: std::sync::Mutex<ConnState>,
    attempts: AtomicU32,
    alert_sent: AtomicBool,
    self_initiated_close: AtomicBool,
    shutting_down: AtomicBool,
    pending: AsyncMutex<Option<JoinHandle<()>>>,
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    notifier: Arc<dyn Notifier>,
}

impl ReconnectCoordinator {
    fn new(base_ms: u64, max_ms: u64, max_attempts: u32, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: std::sync::Mutex::new(ConnState::Disconnected),
            attempts: AtomicU32::new(0),
            alert_sent: AtomicBool::new(false),
            self_initiated_close: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            pending: AsyncMutex::new(None),
            base_ms,
            max_ms,
            max_attempts,
            notifier,
        }
    }

    fn on_open(&self) {
        let was_alerted = self.alert_sent.swap(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        self.self_initiated_close.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = ConnState::Connected;
        if was_alerted {
            self.notifier.notify("Venue stream recovered", "user-data stream reconnected", Colour::Green);
        }
    }

    fn on_failure(&self) {
        *self.state.lock().unwrap() = ConnState::Disconnected;
        if !self.alert_sent.swap(true, Ordering::SeqCst) {
            self.notifier.notify("Venue stream disconnected", "user-data stream connection failed", Colour::Red);
        }
    }

    /// Marks the upcoming close as self-initiated (called by `reconnect()`
    /// right before tearing down the old socket) so the subsequent
    /// `onClosed` is a no-op instead of scheduling a duplicate reconnect.
    fn mark_self_initiated_close(&self) {
        self.self_initiated_close.store(true, Ordering::SeqCst);
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn on_connecting(&self) {
        *self.state.lock().unwrap() = ConnState::Connecting;
    }

    fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// Schedules a reconnect unless the close was self-initiated or the
    /// coordinator is shutting down. Coalesces: any previously pending
    /// reconnect task is aborted before a new one is spawned.
    async fn on_closed(self: &Arc<Self>, reconnect: impl Fn() + Send + Sync + 'static) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.self_initiated_close.swap(false, Ordering::SeqCst) {
            return;
        }
        self.schedule_reconnect(reconnect).await;
    }

    async fn schedule_reconnect(self: &Arc<Self>, reconnect: impl Fn() + Send + Sync + 'static) {
        let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > self.max_attempts {
            self.notifier.notify(
                "Venue stream reconnect exhausted",
                "manual restart required after repeated reconnect failures",
                Colour::Red,
            );
            return;
        }

        let delay_ms = (self.base_ms.saturating_mul(1u64 << (attempts - 1).min(20))).min(self.max_ms);
        let delay = Duration::from_millis(delay_ms);
        let this = self.clone();

        let mut guard = self.pending.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !this.shutting_down.load(Ordering::SeqCst) {
                reconnect();
            }
        });
        *guard = Some(handle);
    }
}

// -----------------------------------------------------------------------
// StreamConsumer
// -----------------------------------------------------------------------

pub struct StreamConsumer {
    venue: Arc<BinanceFuturesClient>,
    store: Arc<TradeStore>,
    notifier: Arc<dyn Notifier>,
    ws_base_url: String,
    coordinator: Arc<ReconnectCoordinator>,
    listen_key: AsyncMutex<Option<String>>,
}

impl StreamConsumer {
    pub fn new(
        venue: Arc<BinanceFuturesClient>,
        store: Arc<TradeStore>,
        notifier: Arc<dyn Notifier>,
        ws_base_url: impl Into<String>,
        reconnect_base_ms: u64,
        reconnect_max_ms: u64,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            venue,
            store,
            coordinator: Arc::new(ReconnectCoordinator::new(
                reconnect_base_ms,
                reconnect_max_ms,
                max_reconnect_attempts,
                notifier.clone(),
            )),
            notifier,
            ws_base_url: ws_base_url.into(),
            listen_key: AsyncMutex::new(None),
        }
    }

    /// Runs the stream consumer until `shutdown` resolves. Creates the
    /// initial listenKey, then loops: connect, read until the socket closes
    /// or goes idle, wait for the coordinator's scheduled reconnect.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let key = match self.venue.create_listen_key().await {
            Ok(k) => k,
            Err(e) => {
                error!(error = %e, "failed to create listen key, stream consumer not starting");
                self.notifier.notify(
                    "Stream consumer failed to start",
                    &format!("could not create listen key: {e}"),
                    Colour::Red,
                );
                return;
            }
        };
        *self.listen_key.lock().await = Some(key);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.run_once() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            // run_once returned because the socket closed; wait for the
            // coordinator's own scheduled reconnect delay before looping
            // back around, unless shutdown fires first.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.coordinator.base_ms)) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.coordinator.begin_shutdown();
        if let Some(key) = self.listen_key.lock().await.clone() {
            if let Err(e) = self.venue.delete_listen_key(&key).await {
                warn!(error = %e, "failed to delete listen key on shutdown");
            }
        }
        info!("stream consumer shut down");
    }

    async fn run_once(self: &Arc<Self>) {
        let key = match self.listen_key.lock().await.clone() {
            Some(k) => k,
            None => return,
        };
        let url = format!("{}/{}", self.ws_base_url, key);
        info!(url = %url, "connecting to venue user-data stream");
        self.coordinator.on_connecting();

        let (ws_stream, _response) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "user-data stream connect failed");
                self.coordinator.on_failure();
                let this = self.clone();
                self.coordinator.schedule_reconnect(move || {
                    let this = this.clone();
                    tokio::spawn(async move { this.run_once().await });
                }).await;
                return;
            }
        };

        self.coordinator.on_open();
        info!("user-data stream connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            let next = tokio::time::timeout(READ_IDLE_TIMEOUT, read.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Err(e) = self.handle_event(&text).await {
                        warn!(error = %e, "failed to record stream event");
                        self.notifier.notify(
                            "Stream event record failed",
                            &format!("error handling user-data event: {e}"),
                            Colour::Yellow,
                        );
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "user-data stream read error");
                    self.coordinator.on_failure();
                    break;
                }
                Ok(None) => {
                    info!("user-data stream closed");
                    break;
                }
                Err(_) => {
                    warn!("user-data stream read idle timeout, reconnecting");
                    self.coordinator.mark_self_initiated_close();
                    break;
                }
            }
        }

        let this = self.clone();
        self.coordinator
            .on_closed(move || {
                let this = this.clone();
                tokio::spawn(async move { this.run_once().await });
            })
            .await;
    }

    /// Called on a fixed cadence (§5) to keep the listenKey alive.
    pub async fn keepalive(&self) {
        let key = match self.listen_key.lock().await.clone() {
            Some(k) => k,
            None => return,
        };
        match self.venue.keepalive_listen_key(&key).await {
            Ok(()) => debug!("listen key keepalive sent"),
            Err(e) => warn!(error = %e, "listen key keepalive failed"),
        }
    }

    async fn handle_event(&self, text: &str) -> anyhow::Result<()> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let event_type = root.get("e").and_then(|v| v.as_str()).unwrap_or_default();
        if event_type != "ORDER_TRADE_UPDATE" {
            return Ok(());
        }
        let order = root.get("o").ok_or_else(|| anyhow::anyhow!("missing order field"))?;

        let symbol = order.get("s").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let order_kind = order.get("o").and_then(|v| v.as_str()).unwrap_or_default();
        let status = order.get("X").and_then(|v| v.as_str()).unwrap_or_default();
        let order_id = order.get("i").map(|v| v.to_string());

        match status {
            "FILLED" => self.handle_filled(&symbol, order_kind, order, order_id).await,
            "CANCELED" | "EXPIRED" => self.handle_lost(&symbol, order_kind).await,
            _ => Ok(()),
        }
    }

    async fn handle_filled(
        &self,
        symbol: &str,
        order_kind: &str,
        order: &serde_json::Value,
        order_id: Option<String>,
    ) -> anyhow::Result<()> {
        if order_kind == "LIMIT" {
            return Ok(());
        }

        let reason = match order_kind {
            "STOP_MARKET" => "SL_TRIGGERED",
            "TAKE_PROFIT_MARKET" => "TP_TRIGGERED",
            _ => return Ok(()),
        };

        let avg_price: f64 = order.get("ap").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let filled_qty: f64 = order.get("z").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let commission_asset = order.get("N").and_then(|v| v.as_str()).unwrap_or_default();
        let reported_commission: f64 =
            order.get("n").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);

        let commission = resolve_commission(commission_asset, reported_commission, avg_price, filled_qty);

        let Some(trade) = self.store.find_open_trade_by_symbol(symbol) else {
            warn!(symbol = %symbol, "fill received with no matching open trade on record");
            return Ok(());
        };

        let (updated, kind) = self.store.record_close_from_stream(
            &trade.trade_id,
            avg_price,
            filled_qty,
            Some(commission),
            order_id,
            reason,
        )?;

        let colour = if reason == "SL_TRIGGERED" { Colour::Red } else { Colour::Green };
        self.notifier.notify(
            &format!("{symbol} {reason}"),
            &format!("{reason} fill at {avg_price}, qty {filled_qty}"),
            colour,
        );

        self.store.log(&updated.trade_id, EventKind::StreamClose, None, true, None);

        if kind == crate::store::CloseKind::Full {
            if let Some(net) = updated.net_profit {
                debug!(trade_id = %updated.trade_id, net, "trade closed via stream fill");
            }
        }

        Ok(())
    }

    async fn handle_lost(&self, symbol: &str, order_kind: &str) -> anyhow::Result<()> {
        let Some(trade) = self.store.find_open_trade_by_symbol(symbol) else {
            return Ok(());
        };

        match order_kind {
            "STOP_MARKET" => {
                self.store.log(&trade.trade_id, EventKind::SlLost, None, false, Some("SL order cancelled/expired".into()));
                self.notifier.notify(
                    &format!("{symbol} protection lost"),
                    "stop-loss order was cancelled or expired on the venue",
                    Colour::Red,
                );
            }
            "TAKE_PROFIT_MARKET" => {
                self.store.log(&trade.trade_id, EventKind::TpLost, None, false, Some("TP order cancelled/expired".into()));
                self.notifier.notify(
                    &format!("{symbol} take-profit lost"),
                    "take-profit order was cancelled or expired on the venue",
                    Colour::Yellow,
                );
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;

    fn coordinator() -> (Arc<ReconnectCoordinator>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        (Arc::new(ReconnectCoordinator::new(1000, 60_000, 20, notifier.clone())), notifier)
    }

    #[test]
    fn resolve_commission_prefers_usdt_reported_value() {
        assert_eq!(resolve_commission("USDT", 5.0, 100.0, 1.0), 5.0);
    }

    #[test]
    fn resolve_commission_estimates_at_taker_rate_for_other_assets() {
        let commission = resolve_commission("BNB", 0.001, 100.0, 2.0);
        assert_eq!(commission, 100.0 * 2.0 * TAKER_COMMISSION_RATE);
    }

    #[test]
    fn backoff_formula_matches_spec() {
        let delay = |attempts: u32| (1000u64.saturating_mul(1u64 << (attempts - 1).min(20))).min(60_000);
        assert_eq!(delay(1), 1000);
        assert_eq!(delay(2), 2000);
        assert_eq!(delay(3), 4000);
        assert_eq!(delay(7), 60_000);
        assert_eq!(delay(20), 60_000);
    }

    #[tokio::test]
    async fn state_transitions_through_connecting_connected_disconnected() {
        let (c, _notifier) = coordinator();
        assert_eq!(c.state(), ConnState::Disconnected);
        c.on_connecting();
        assert_eq!(c.state(), ConnState::Connecting);
        c.on_open();
        assert_eq!(c.state(), ConnState::Connected);
        c.on_failure();
        assert_eq!(c.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn on_failure_fires_red_alert_exactly_once_per_gap() {
        let (c, notifier) = coordinator();
        c.on_failure();
        c.on_failure();
        assert_eq!(notifier.count_colour(Colour::Red), 1);
    }

    #[tokio::test]
    async fn on_open_emits_recovered_only_when_previously_alerted() {
        let (c, notifier) = coordinator();
        c.on_open();
        assert_eq!(notifier.count_colour(Colour::Green), 0);

        c.on_failure();
        c.on_open();
        assert_eq!(notifier.count_colour(Colour::Green), 1);
        assert_eq!(c.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn self_initiated_close_is_a_no_op() {
        let (c, notifier) = coordinator();
        c.mark_self_initiated_close();
        c.on_closed(|| {}).await;
        assert_eq!(notifier.calls().len(), 0);
        assert_eq!(c.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconnect_scheduling_is_suppressed_during_shutdown() {
        let (c, notifier) = coordinator();
        c.begin_shutdown();
        c.on_closed(|| {}).await;
        assert_eq!(notifier.calls().len(), 0);
        assert!(c.pending.lock().await.is_none());
    }

    #[tokio::test]
    async fn schedule_reconnect_coalesces_to_one_pending_task() {
        let (c, _notifier) = coordinator();
        c.schedule_reconnect(|| {}).await;
        assert!(c.pending.lock().await.is_some());
        // A second call must abort the first pending task rather than
        // leaving two reconnect attempts racing (§4.8 P8).
        c.schedule_reconnect(|| {}).await;
        assert!(c.pending.lock().await.is_some());
    }

    #[tokio::test]
    async fn reconnect_exhausted_past_max_attempts_fires_red_alert_and_stops() {
        let (c, notifier) = coordinator();
        c.attempts.store(20, Ordering::SeqCst);
        c.schedule_reconnect(|| {}).await;
        assert_eq!(notifier.count_colour(Colour::Red), 1);
        assert!(c.pending.lock().await.is_none());
    }
}
