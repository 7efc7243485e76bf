// =============================================================================
// Configuration — global defaults overlaid by per-user overrides
// =============================================================================
//
// Two layers, both serde-driven with `#[serde(default)]` on every field so
// that an older config file keeps loading after new fields are added.
// `GlobalConfig` is loaded once at startup (JSON file + environment
// overrides); `UserConfigOverride` is a sparse per-user row held by whatever
// store owns user accounts (out of scope here — see §1 of the spec) and fed
// into `ConfigResolver::resolve` alongside the global.
//
// Persistence uses the same atomic tmp + rename pattern as the teacher's
// `RuntimeConfig::save`.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_risk_percent() -> f64 {
    0.02
}

fn default_max_position_usdt() -> f64 {
    0.0
}

fn default_max_daily_loss_usdt() -> f64 {
    0.0
}

fn default_max_dca_per_symbol() -> u32 {
    3
}

fn default_dca_risk_multiplier() -> f64 {
    1.0
}

fn default_fixed_leverage() -> u32 {
    10
}

fn default_dedup_enabled() -> bool {
    true
}

fn default_dedup_window_secs() -> i64 {
    60
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    20
}

/// Process-wide defaults for every `EffectiveConfig` field plus venue
/// endpoints, dedup window, and reconnect tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,
    #[serde(default = "default_max_position_usdt")]
    pub max_position_usdt: f64,
    #[serde(default = "default_max_daily_loss_usdt")]
    pub max_daily_loss_usdt: f64,
    #[serde(default = "default_max_dca_per_symbol")]
    pub max_dca_per_symbol: u32,
    #[serde(default = "default_dca_risk_multiplier")]
    pub dca_risk_multiplier: f64,
    #[serde(default = "default_fixed_leverage")]
    pub fixed_leverage: u32,
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
    #[serde(default = "default_dedup_enabled")]
    pub dedup_enabled: bool,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: i64,
    #[serde(default)]
    pub default_symbol: Option<String>,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            risk_percent: default_risk_percent(),
            max_position_usdt: default_max_position_usdt(),
            max_daily_loss_usdt: default_max_daily_loss_usdt(),
            max_dca_per_symbol: default_max_dca_per_symbol(),
            dca_risk_multiplier: default_dca_risk_multiplier(),
            fixed_leverage: default_fixed_leverage(),
            allowed_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            dedup_enabled: default_dedup_enabled(),
            dedup_window_secs: default_dedup_window_secs(),
            default_symbol: None,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
        }
    }
}

impl GlobalConfig {
    /// Load configuration from a JSON file at `path`, falling back to
    /// environment-variable overrides for the venue endpoints.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        if let Ok(url) = std::env::var("VENUE_REST_BASE_URL") {
            config.rest_base_url = url;
        }
        if let Ok(url) = std::env::var("VENUE_WS_BASE_URL") {
            config.ws_base_url = url;
        }

        info!(path = %path.display(), symbols = ?config.allowed_symbols, "global config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise global config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "global config saved (atomic)");
        Ok(())
    }
}

/// Sparse per-user override. Every field is `Option<T>`; `None` means
/// "inherit the global value".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfigOverride {
    pub per_user_enabled: bool,
    pub risk_percent: Option<f64>,
    pub max_position_usdt: Option<f64>,
    pub max_daily_loss_usdt: Option<f64>,
    pub max_dca_per_symbol: Option<u32>,
    pub dca_risk_multiplier: Option<f64>,
    pub fixed_leverage: Option<u32>,
    /// Raw JSON text of an allowed-symbols array, as stored per-user.
    pub allowed_symbols_json: Option<String>,
    pub dedup_enabled: Option<bool>,
    pub default_symbol: Option<String>,
}

use crate::types::EffectiveConfig;

/// Merges `GlobalConfig` defaults with an optional `UserConfigOverride` into
/// an `EffectiveConfig` for a single user/signal.
pub struct ConfigResolver;

impl ConfigResolver {
    /// Resolve the effective configuration for a user. `overrides = None` is
    /// equivalent to a disabled per-user override.
    pub fn resolve(global: &GlobalConfig, overrides: Option<&UserConfigOverride>) -> EffectiveConfig {
        let Some(o) = overrides.filter(|o| o.per_user_enabled) else {
            return EffectiveConfig {
                risk_percent: global.risk_percent,
                max_position_usdt: global.max_position_usdt,
                max_daily_loss_usdt: global.max_daily_loss_usdt,
                max_dca_per_symbol: global.max_dca_per_symbol,
                dca_risk_multiplier: global.dca_risk_multiplier,
                fixed_leverage: global.fixed_leverage,
                allowed_symbols: global.allowed_symbols.clone(),
                dedup_enabled: global.dedup_enabled,
                default_symbol: global.default_symbol.clone(),
            };
        };

        let allowed_symbols = o
            .allowed_symbols_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| global.allowed_symbols.clone());

        EffectiveConfig {
            risk_percent: o.risk_percent.unwrap_or(global.risk_percent),
            max_position_usdt: o.max_position_usdt.unwrap_or(global.max_position_usdt),
            max_daily_loss_usdt: o.max_daily_loss_usdt.unwrap_or(global.max_daily_loss_usdt),
            max_dca_per_symbol: o.max_dca_per_symbol.unwrap_or(global.max_dca_per_symbol),
            dca_risk_multiplier: o.dca_risk_multiplier.unwrap_or(global.dca_risk_multiplier),
            fixed_leverage: o.fixed_leverage.unwrap_or(global.fixed_leverage),
            allowed_symbols,
            dedup_enabled: o.dedup_enabled.unwrap_or(global.dedup_enabled),
            default_symbol: o.default_symbol.clone().or_else(|| global.default_symbol.clone()),
        }
    }

    /// Validation ranges enforced on write (§4.3). Returns the first
    /// violation found, if any.
    pub fn validate(o: &UserConfigOverride) -> Result<(), String> {
        if let Some(v) = o.risk_percent {
            if !(0.01..=1.0).contains(&v) {
                return Err(format!("riskPercent {v} out of range [0.01, 1.0]"));
            }
        }
        if let Some(v) = o.fixed_leverage {
            if !(1..=125).contains(&v) {
                return Err(format!("leverage {v} out of range [1, 125]"));
            }
        }
        if let Some(v) = o.max_dca_per_symbol {
            if v > 10 {
                return Err(format!("maxDcaLayers {v} out of range [0, 10]"));
            }
        }
        if let Some(v) = o.dca_risk_multiplier {
            if !(1.0..=10.0).contains(&v) {
                return Err(format!("dcaRiskMultiplier {v} out of range [1.0, 10.0]"));
            }
        }
        if let Some(v) = o.max_position_usdt {
            if v != 0.0 && !(100.0..=1_000_000.0).contains(&v) {
                return Err(format!("maxPositionSizeUsdt {v} out of range [100, 1000000]"));
            }
        }
        if let Some(v) = o.max_daily_loss_usdt {
            if !(0.0..=1_000_000.0).contains(&v) {
                return Err(format!("dailyLossLimitUsdt {v} out of range [0, 1000000]"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalConfig {
        GlobalConfig {
            allowed_symbols: vec!["BTCUSDT".to_string()],
            ..GlobalConfig::default()
        }
    }

    #[test]
    fn disabled_override_falls_back_entirely_to_global() {
        let g = global();
        let o = UserConfigOverride {
            per_user_enabled: false,
            risk_percent: Some(0.5),
            ..Default::default()
        };
        let eff = ConfigResolver::resolve(&g, Some(&o));
        assert_eq!(eff.risk_percent, g.risk_percent);
    }

    #[test]
    fn enabled_override_prefers_non_null_fields() {
        let g = global();
        let o = UserConfigOverride {
            per_user_enabled: true,
            risk_percent: Some(0.1),
            max_dca_per_symbol: None,
            ..Default::default()
        };
        let eff = ConfigResolver::resolve(&g, Some(&o));
        assert_eq!(eff.risk_percent, 0.1);
        assert_eq!(eff.max_dca_per_symbol, g.max_dca_per_symbol);
    }

    #[test]
    fn invalid_allowed_symbols_json_falls_back_to_global() {
        let g = global();
        let o = UserConfigOverride {
            per_user_enabled: true,
            allowed_symbols_json: Some("not json".to_string()),
            ..Default::default()
        };
        let eff = ConfigResolver::resolve(&g, Some(&o));
        assert_eq!(eff.allowed_symbols, g.allowed_symbols);
    }

    #[test]
    fn empty_allowed_symbols_list_falls_back_to_global() {
        let g = global();
        let o = UserConfigOverride {
            per_user_enabled: true,
            allowed_symbols_json: Some("[]".to_string()),
            ..Default::default()
        };
        let eff = ConfigResolver::resolve(&g, Some(&o));
        assert_eq!(eff.allowed_symbols, g.allowed_symbols);
    }

    #[test]
    fn validate_rejects_out_of_range_leverage() {
        let o = UserConfigOverride {
            per_user_enabled: true,
            fixed_leverage: Some(200),
            ..Default::default()
        };
        assert!(ConfigResolver::validate(&o).is_err());
    }
}
