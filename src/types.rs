// =============================================================================
// Shared types used across the trade execution engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Position side / signal kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Entry,
    MoveSl,
    Close,
    Cancel,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Entry => write!(f, "ENTRY"),
            SignalType::MoveSl => write!(f, "MOVE_SL"),
            SignalType::Close => write!(f, "CLOSE"),
            SignalType::Cancel => write!(f, "CANCEL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TradeStatus {
    #[default]
    Open,
    Closed,
    Cancelled,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::Closed => write!(f, "CLOSED"),
            TradeStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    EntryPlaced,
    EntryFailed,
    SlPlaced,
    SlFailed,
    TpPlaced,
    TpFailed,
    DcaEntry,
    MoveSl,
    SlRehungFailed,
    StreamClose,
    SlLost,
    TpLost,
    FailSafeClose,
}

/// Colour-coded notification severity, matching the GREEN/YELLOW/RED
/// convention expected of the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Colour {
    Green,
    Yellow,
    Red,
}

// =============================================================================
// TradeSignal
// =============================================================================

/// Attribution of where a raw signal came from (platform/channel/author).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalSource {
    pub platform: String,
    pub channel: Option<String>,
    pub author: Option<String>,
    pub message_id: Option<String>,
}

/// Canonical trading intent parsed out of free-form text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub side: Option<Side>,
    pub signal_type: SignalType,
    pub entry_price_low: Option<f64>,
    pub entry_price_high: Option<f64>,
    pub stop_loss: f64,
    pub take_profits: Vec<f64>,
    pub new_stop_loss: Option<f64>,
    pub new_take_profit: Option<f64>,
    pub close_ratio: f64,
    pub is_dca: bool,
    pub raw_message: String,
    pub source: SignalSource,
}

impl TradeSignal {
    /// Midpoint of the entry range, or the single entry price when the range
    /// collapses to a point.
    pub fn entry_price(&self) -> Option<f64> {
        match (self.entry_price_low, self.entry_price_high) {
            (Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
            (Some(lo), None) => Some(lo),
            (None, Some(hi)) => Some(hi),
            (None, None) => None,
        }
    }
}

// =============================================================================
// EffectiveConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub risk_percent: f64,
    pub max_position_usdt: f64,
    pub max_daily_loss_usdt: f64,
    pub max_dca_per_symbol: u32,
    pub dca_risk_multiplier: f64,
    pub fixed_leverage: u32,
    pub allowed_symbols: Vec<String>,
    pub dedup_enabled: bool,
    pub default_symbol: Option<String>,
}

// =============================================================================
// Trade / TradeEvent
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,

    pub entry_price: f64,
    pub entry_quantity: f64,
    pub entry_commission: f64,
    pub entry_order_id: Option<String>,
    pub entry_time: DateTime<Utc>,
    pub leverage: u32,
    pub risk_amount: f64,

    pub stop_loss: f64,
    pub take_profits: Vec<f64>,

    pub remaining_quantity: Option<f64>,
    pub total_closed_quantity: Option<f64>,

    pub dca_count: u32,

    pub exit_price: Option<f64>,
    pub exit_quantity: Option<f64>,
    pub exit_commission: Option<f64>,
    pub exit_order_id: Option<String>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,

    pub gross_profit: Option<f64>,
    pub commission: Option<f64>,
    pub net_profit: Option<f64>,

    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub signal_hash: Option<String>,
    pub source_author_name: Option<String>,
}

impl Trade {
    /// `remainingQuantity ?? entryQuantity` — the quantity still exposed on
    /// the venue right now.
    pub fn effective_open_qty(&self) -> f64 {
        self.remaining_quantity.unwrap_or(self.entry_quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub event_type: EventKind,
    pub venue_order_id: Option<String>,
    pub side: Option<Side>,
    pub order_kind: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Venue call results
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub side: Option<Side>,
    pub order_kind: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub commission: Option<f64>,
    pub error_message: Option<String>,
}

impl OrderResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            side: None,
            order_kind: None,
            price: None,
            quantity: None,
            commission: None,
            error_message: Some(message.into()),
        }
    }
}

/// Outcome handed back to the caller of the inbound control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReceipt {
    pub signal_id: String,
    pub status: ReceiptStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Executed,
    Rejected,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BroadcastSummary {
    pub total_users: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub skipped_no_api_key: usize,
}
