// =============================================================================
// Deduplicator — reject repeats of a normalised signal inside a time window
// =============================================================================

use sha2::{Digest, Sha256};

use crate::types::TradeSignal;

/// Deterministic hash of the *normalised* signal tuple (§4.2). Computing the
/// hash is best-effort: it never fails, so a signal is always recordable
/// even when the hash would be degenerate (e.g. NaN prices).
pub fn generate_hash(signal: &TradeSignal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signal.symbol.as_bytes());
    hasher.update([signal.signal_type as u8]);
    hasher.update([signal.side.map(|s| s as u8).unwrap_or(2)]);
    hasher.update(fmt_opt(signal.entry_price_low).as_bytes());
    hasher.update(fmt_opt(signal.entry_price_high).as_bytes());
    hasher.update(format!("{:.8}", signal.stop_loss).as_bytes());
    for tp in &signal.take_profits {
        hasher.update(format!("{tp:.8}").as_bytes());
    }
    hasher.update([signal.is_dca as u8]);
    hex::encode(hasher.finalize())
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{x:.8}"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, SignalSource, SignalType};

    fn base() -> TradeSignal {
        TradeSignal {
            symbol: "BTCUSDT".into(),
            side: Some(Side::Long),
            signal_type: SignalType::Entry,
            entry_price_low: Some(95000.0),
            entry_price_high: Some(95000.0),
            stop_loss: 93000.0,
            take_profits: vec![97000.0],
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: 1.0,
            is_dca: false,
            raw_message: "anything, attribution doesn't affect the hash".into(),
            source: SignalSource::default(),
        }
    }

    #[test]
    fn canonically_equal_signals_hash_identically_even_with_different_raw_text() {
        let mut a = base();
        let mut b = base();
        a.raw_message = "message A".into();
        b.raw_message = "message B — totally different wording".into();
        assert_eq!(generate_hash(&a), generate_hash(&b));
    }

    #[test]
    fn differing_stop_loss_changes_the_hash() {
        let a = base();
        let mut b = base();
        b.stop_loss = 92000.0;
        assert_ne!(generate_hash(&a), generate_hash(&b));
    }

    #[test]
    fn differing_dca_flag_changes_the_hash() {
        let a = base();
        let mut b = base();
        b.is_dca = true;
        assert_ne!(generate_hash(&a), generate_hash(&b));
    }
}
