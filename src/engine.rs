// =============================================================================
// Engine — inbound control surface (§6)
// =============================================================================
//
// The seam the out-of-scope HTTP ingress layer calls: `submitSignal`,
// `broadcastSignal`, administrative close-outs, and read-only status/settings
// queries. Everything here is a thin dispatch onto `Executor` and `TradeStore`
// under a lock already owned by those collaborators — the Engine itself holds
// no mutable state of its own beyond the config snapshot it was built with.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::instrument;

use crate::config::{ConfigResolver, GlobalConfig, UserConfigOverride};
use crate::executor::Executor;
use crate::risk::CircuitBreaker;
use crate::store::TradeStore;
use crate::signal_parser::SignalParser;
use crate::types::{
    BroadcastSummary, ReceiptStatus, SignalReceipt, SignalSource, SignalType, Trade, TradeSignal,
};

/// The narrow shape the engine needs to route and gate a signal for one
/// user. Credential storage and account provisioning are an external
/// collaborator (§1); this struct is the opaque lookup result.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub user_id: String,
    pub auto_trade_enabled: bool,
    pub enabled: bool,
    pub has_api_key: bool,
    pub overrides: Option<UserConfigOverride>,
}

/// Port onto the out-of-scope user directory / credential store.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn all_users(&self) -> Vec<UserAccount>;
    async fn user(&self, user_id: &str) -> Option<UserAccount>;
}

/// Directory backing a single shared venue account (§4.9's `TradeStore`
/// assumes exactly this: the stream reports fills by symbol only, with no
/// per-user attribution, so only one venue credential pair is live at a
/// time). Real multi-tenant credential storage is an external collaborator
/// (§1); this stands in for it at the seam.
pub struct SingleAccountDirectory {
    account: UserAccount,
}

impl SingleAccountDirectory {
    pub fn new(user_id: impl Into<String>, overrides: Option<UserConfigOverride>) -> Self {
        Self {
            account: UserAccount {
                user_id: user_id.into(),
                auto_trade_enabled: true,
                enabled: true,
                has_api_key: true,
                overrides,
            },
        }
    }
}

#[async_trait]
impl UserDirectory for SingleAccountDirectory {
    async fn all_users(&self) -> Vec<UserAccount> {
        vec![self.account.clone()]
    }

    async fn user(&self, user_id: &str) -> Option<UserAccount> {
        (self.account.user_id == user_id).then(|| self.account.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub open_trade_count: usize,
    pub today_realised_loss: f64,
    pub circuit_breaker_tripped: bool,
}

pub struct Engine {
    executor: Arc<Executor>,
    store: Arc<TradeStore>,
    circuit_breaker: Arc<CircuitBreaker>,
    users: Arc<dyn UserDirectory>,
    global_config: GlobalConfig,
}

impl Engine {
    pub fn new(
        executor: Arc<Executor>,
        store: Arc<TradeStore>,
        circuit_breaker: Arc<CircuitBreaker>,
        users: Arc<dyn UserDirectory>,
        global_config: GlobalConfig,
    ) -> Self {
        Self { executor, store, circuit_breaker, users, global_config }
    }

    /// Parse, dedup (inside the executor) and dispatch a single user's
    /// signal. Never panics: every failure mode comes back as a
    /// `SignalReceipt`.
    #[instrument(skip(self, raw_text, source))]
    pub async fn submit_signal(
        &self,
        raw_text: &str,
        source: SignalSource,
        user_id: &str,
    ) -> SignalReceipt {
        let Some(account) = self.users.user(user_id).await else {
            return rejected("unknown user");
        };
        if !account.has_api_key {
            return rejected("no venue credentials on file for this user");
        }
        let Some(signal) = SignalParser::parse(raw_text, source) else {
            return ignored("no grammar matched");
        };
        self.executor.handle_signal(user_id, &signal, account.overrides.as_ref()).await
    }

    /// Fan a single raw signal out to every user with `autoTradeEnabled=true
    /// AND enabled=true AND hasApiKey(userId)` (§6).
    #[instrument(skip(self, raw_text, source))]
    pub async fn broadcast_signal(&self, raw_text: &str, source: SignalSource) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        let Some(signal) = SignalParser::parse(raw_text, source) else {
            return summary;
        };
        for account in self.users.all_users().await {
            if !(account.auto_trade_enabled && account.enabled) {
                continue;
            }
            summary.total_users += 1;
            if !account.has_api_key {
                summary.skipped_no_api_key += 1;
                continue;
            }
            let receipt = self
                .executor
                .handle_signal(&account.user_id, &signal, account.overrides.as_ref())
                .await;
            match receipt.status {
                ReceiptStatus::Executed => summary.success_count += 1,
                ReceiptStatus::Rejected | ReceiptStatus::Ignored => summary.fail_count += 1,
            }
        }
        summary
    }

    /// Administrative close-out: cancel every resting order on a symbol and
    /// mark the open trade (if any) cancelled. Reuses the CANCEL state
    /// machine rather than duplicating its venue call sequence.
    pub async fn cancel_all_for_symbol(&self, user_id: &str, symbol: &str) -> SignalReceipt {
        let signal = admin_signal(SignalType::Cancel, symbol, 1.0);
        self.executor.handle_signal(user_id, &signal, None).await
    }

    /// Administrative close-out: full-close every OPEN trade a user has.
    /// Each symbol is closed independently; a failure on one does not
    /// abort the rest.
    pub async fn close_all_for_user(&self, user_id: &str) -> Vec<SignalReceipt> {
        let mut receipts = Vec::new();
        for trade in self.store.open_trades_for_user(user_id) {
            let signal = close_signal_for(&trade);
            receipts.push(self.executor.handle_signal(user_id, &signal, None).await);
        }
        receipts
    }

    /// Pure read over the store and circuit breaker. No lock is taken.
    pub fn status(&self) -> EngineStatus {
        let cfg = ConfigResolver::resolve(&self.global_config, None);
        EngineStatus {
            open_trade_count: self.store.all_open_trades().len(),
            today_realised_loss: self.circuit_breaker.today_realised_loss(),
            circuit_breaker_tripped: self.circuit_breaker.is_tripped(&cfg),
        }
    }

    /// Pure read of the process-wide defaults currently in effect.
    pub fn settings(&self) -> GlobalConfig {
        self.global_config.clone()
    }
}

fn rejected(reason: impl Into<String>) -> SignalReceipt {
    SignalReceipt { signal_id: String::new(), status: ReceiptStatus::Rejected, reason: Some(reason.into()) }
}

fn ignored(reason: impl Into<String>) -> SignalReceipt {
    SignalReceipt { signal_id: String::new(), status: ReceiptStatus::Ignored, reason: Some(reason.into()) }
}

fn admin_source() -> SignalSource {
    SignalSource { platform: "admin".to_string(), channel: None, author: None, message_id: None }
}

fn admin_signal(signal_type: SignalType, symbol: &str, close_ratio: f64) -> TradeSignal {
    TradeSignal {
        symbol: symbol.to_string(),
        side: None,
        signal_type,
        entry_price_low: None,
        entry_price_high: None,
        stop_loss: 0.0,
        take_profits: vec![],
        new_stop_loss: None,
        new_take_profit: None,
        close_ratio,
        is_dca: false,
        raw_message: String::new(),
        source: admin_source(),
    }
}

fn close_signal_for(trade: &Trade) -> TradeSignal {
    TradeSignal {
        symbol: trade.symbol.clone(),
        side: Some(trade.side),
        signal_type: SignalType::Close,
        entry_price_low: None,
        entry_price_high: None,
        stop_loss: 0.0,
        take_profits: vec![],
        new_stop_loss: None,
        new_take_profit: None,
        close_ratio: 1.0,
        is_dca: false,
        raw_message: String::new(),
        source: admin_source(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed::FixedClock;
    use crate::lock_registry::SymbolLockRegistry;
    use crate::notify::RecordingNotifier;
    use crate::venue_fake::FakeVenueClient;
    use chrono::Utc;

    struct StaticDirectory(Vec<UserAccount>);

    #[async_trait]
    impl UserDirectory for StaticDirectory {
        async fn all_users(&self) -> Vec<UserAccount> {
            self.0.clone()
        }
        async fn user(&self, user_id: &str) -> Option<UserAccount> {
            self.0.iter().find(|u| u.user_id == user_id).cloned()
        }
    }

    fn make_engine(users: Vec<UserAccount>) -> (Engine, Arc<FakeVenueClient>, Arc<TradeStore>) {
        let mut cfg = GlobalConfig::default();
        cfg.allowed_symbols = vec!["BTCUSDT".to_string()];
        cfg.risk_percent = 0.2;

        let clock = Arc::new(FixedClock::new(Utc::now()));
        let venue = Arc::new(FakeVenueClient::new());
        venue.set_balance(1000.0);
        let store = Arc::new(TradeStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let locks = Arc::new(SymbolLockRegistry::new());
        let breaker = Arc::new(CircuitBreaker::new(clock));

        let executor = Arc::new(Executor::new(
            cfg.clone(),
            locks,
            breaker.clone(),
            venue.clone(),
            store.clone(),
            notifier,
        ));
        let directory = Arc::new(StaticDirectory(users));
        (Engine::new(executor, store.clone(), breaker, directory, cfg), venue, store)
    }

    #[tokio::test]
    async fn submit_signal_rejects_unknown_user() {
        let (engine, _venue, _store) = make_engine(vec![]);
        let receipt = engine
            .submit_signal("BTCUSDT 95000附近 做多 止損93000", SignalSource::default(), "ghost")
            .await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
    }

    #[tokio::test]
    async fn submit_signal_rejects_user_without_api_key() {
        let account = UserAccount {
            user_id: "u1".into(),
            auto_trade_enabled: true,
            enabled: true,
            has_api_key: false,
            overrides: None,
        };
        let (engine, _venue, _store) = make_engine(vec![account]);
        let receipt = engine
            .submit_signal("BTCUSDT 95000附近 做多 止損93000", SignalSource::default(), "u1")
            .await;
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
    }

    #[tokio::test]
    async fn submit_signal_ignores_unparseable_text() {
        let account = UserAccount {
            user_id: "u1".into(),
            auto_trade_enabled: true,
            enabled: true,
            has_api_key: true,
            overrides: None,
        };
        let (engine, _venue, _store) = make_engine(vec![account]);
        let receipt = engine.submit_signal("good morning", SignalSource::default(), "u1").await;
        assert_eq!(receipt.status, ReceiptStatus::Ignored);
    }

    #[tokio::test]
    async fn broadcast_signal_skips_disabled_and_no_api_key_users() {
        let accounts = vec![
            UserAccount { user_id: "u1".into(), auto_trade_enabled: true, enabled: true, has_api_key: true, overrides: None },
            UserAccount { user_id: "u2".into(), auto_trade_enabled: false, enabled: true, has_api_key: true, overrides: None },
            UserAccount { user_id: "u3".into(), auto_trade_enabled: true, enabled: true, has_api_key: false, overrides: None },
        ];
        let (engine, venue, _store) = make_engine(accounts);
        venue.exchange_info.lock().unwrap().insert(
            "BTCUSDT".to_string(),
            crate::venue::SymbolFilters { step_size: 0.001, tick_size: 0.01 },
        );
        venue.set_mark_price("BTCUSDT", 95000.0);

        let summary = engine
            .broadcast_signal(
                "ENTRY\n币种: BTCUSDT\n方向: 多\n入场: 95000\n止损: 93000",
                SignalSource::default(),
            )
            .await;
        // u2 never counted (autoTradeEnabled=false); u1 counted + executed; u3 counted + skipped.
        assert_eq!(summary.total_users, 2);
        assert_eq!(summary.skipped_no_api_key, 1);
        assert_eq!(summary.success_count, 1);
    }

    #[tokio::test]
    async fn close_all_for_user_closes_every_open_trade() {
        let account = UserAccount {
            user_id: "u1".into(),
            auto_trade_enabled: true,
            enabled: true,
            has_api_key: true,
            overrides: None,
        };
        let (engine, venue, store) = make_engine(vec![account]);
        venue.exchange_info.lock().unwrap().insert(
            "BTCUSDT".to_string(),
            crate::venue::SymbolFilters { step_size: 0.001, tick_size: 0.01 },
        );
        venue.set_mark_price("BTCUSDT", 95000.0);

        let receipt = engine
            .submit_signal("BTCUSDT 95000附近 做多 止損93000", SignalSource::default(), "u1")
            .await;
        assert_eq!(receipt.status, ReceiptStatus::Executed);
        assert_eq!(store.open_trades_for_user("u1").len(), 1);

        venue.set_position("BTCUSDT", 0.1);
        let close_receipts = engine.close_all_for_user("u1").await;
        assert_eq!(close_receipts.len(), 1);
        assert!(store.open_trades_for_user("u1").is_empty());
    }

    #[tokio::test]
    async fn status_reports_open_trade_count() {
        let (engine, _venue, _store) = make_engine(vec![]);
        let status = engine.status();
        assert_eq!(status.open_trade_count, 0);
        assert!(!status.circuit_breaker_tripped);
    }
}
