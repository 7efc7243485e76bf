// =============================================================================
// SignalParser — free text → canonical TradeSignal, across several dialects
// =============================================================================
//
// Grammars are attempted in order (§4.1): structured ENTRY, structured
// CANCEL, structured MOVE_SL, narrative ENTRY, trigger-line ENTRY. The first
// match wins; no match yields `None`. The parser never panics — a malformed
// structured block simply falls through to the next, looser grammar.
// =============================================================================

use tracing::debug;

use crate::types::{Side, SignalSource, SignalType, TradeSignal};

const SL_UNSET_SENTINELS: &[&str] = &["未設定", "未设定", "N/A", "none", "None"];

/// Parses free-form signal text into a canonical [`TradeSignal`].
pub struct SignalParser;

impl SignalParser {
    /// Attempt every known grammar in order; `None` if nothing matches.
    pub fn parse(raw: &str, source: SignalSource) -> Option<TradeSignal> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }

        Self::parse_structured_entry(text, &source)
            .or_else(|| Self::parse_structured_cancel(text, &source))
            .or_else(|| Self::parse_structured_move_sl(text, &source))
            .or_else(|| Self::parse_narrative_entry(text, &source))
            .or_else(|| Self::parse_trigger_line(text, &source))
            .map(|mut sig| {
                sig.symbol = normalize_symbol(&sig.symbol);
                sig.raw_message = raw.to_string();
                sig
            })
    }

    // -------------------------------------------------------------------
    // 1. Structured ENTRY block
    // -------------------------------------------------------------------
    fn parse_structured_entry(text: &str, source: &SignalSource) -> Option<TradeSignal> {
        let lines: Vec<&str> = text.lines().collect();

        let symbol = find_labelled(&lines, &["幣種", "币种", "symbol", "pair", "交易對", "交易对"])?;
        let direction_line = find_any_line(&lines, &["方向", "direction", "side"])
            .or_else(|| lines.iter().find(|l| contains_direction_cue(l)).copied());
        let side = direction_line.and_then(|l| direction_from_text(l));

        let entry_label = find_labelled(&lines, &["進場", "进场", "entry", "入場", "入场"])?;
        let (entry_low, entry_high) = parse_price_range(&entry_label)?;

        let sl_raw = find_labelled(&lines, &["止損", "止损", "sl", "stop loss", "stoploss"]);
        let stop_loss = match sl_raw.as_deref() {
            None => 0.0,
            Some(v) if is_unset_sentinel(v) => 0.0,
            Some(v) => parse_f64(v)?,
        };

        let take_profits = find_all_labelled(&lines, &["止盈", "tp", "take profit"])
            .into_iter()
            .filter(|v| !is_unset_sentinel(v))
            .filter_map(|v| parse_f64(&v))
            .collect::<Vec<_>>();

        debug!(symbol, ?side, "matched structured ENTRY block");

        Some(TradeSignal {
            symbol,
            side,
            signal_type: SignalType::Entry,
            entry_price_low: Some(entry_low),
            entry_price_high: Some(entry_high),
            stop_loss,
            take_profits,
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: 1.0,
            is_dca: contains_dca_cue(text),
            raw_message: String::new(),
            source: source.clone(),
        })
    }

    // -------------------------------------------------------------------
    // 2. Structured CANCEL block
    // -------------------------------------------------------------------
    fn parse_structured_cancel(text: &str, source: &SignalSource) -> Option<TradeSignal> {
        let lines: Vec<&str> = text.lines().collect();
        if !lines.iter().any(|l| contains_cancel_cue(l)) {
            return None;
        }

        let symbol = find_labelled(&lines, &["幣種", "币种", "symbol", "pair"])
            .or_else(|| find_inline_symbol(text))?;
        let side = find_any_line(&lines, &["方向", "direction", "side"]).and_then(direction_from_text);

        debug!(symbol, "matched structured CANCEL block");

        Some(TradeSignal {
            symbol,
            side,
            signal_type: SignalType::Cancel,
            entry_price_low: None,
            entry_price_high: None,
            stop_loss: 0.0,
            take_profits: vec![],
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: 1.0,
            is_dca: false,
            raw_message: String::new(),
            source: source.clone(),
        })
    }

    // -------------------------------------------------------------------
    // 3. Structured MOVE_SL block ("position update")
    // -------------------------------------------------------------------
    fn parse_structured_move_sl(text: &str, source: &SignalSource) -> Option<TradeSignal> {
        let lines: Vec<&str> = text.lines().collect();
        if !lines.iter().any(|l| contains_move_sl_cue(l)) {
            return None;
        }

        let symbol = find_labelled(&lines, &["幣種", "币种", "symbol", "pair"])
            .or_else(|| find_inline_symbol(text))?;

        let new_stop_loss = find_labelled(&lines, &["新止損", "新止损", "止損", "止损", "sl"])
            .and_then(|v| if is_unset_sentinel(&v) { None } else { parse_f64(&v) });
        let new_take_profit = find_labelled(&lines, &["新止盈", "止盈", "tp"])
            .and_then(|v| if is_unset_sentinel(&v) { None } else { parse_f64(&v) });

        if new_stop_loss.is_none() && new_take_profit.is_none() {
            debug!(symbol, "MOVE_SL block carries neither a new SL nor a new TP — rejecting");
            return None;
        }

        debug!(symbol, ?new_stop_loss, ?new_take_profit, "matched structured MOVE_SL block");

        Some(TradeSignal {
            symbol,
            side: None,
            signal_type: SignalType::MoveSl,
            entry_price_low: None,
            entry_price_high: None,
            stop_loss: 0.0,
            take_profits: vec![],
            new_stop_loss,
            new_take_profit,
            close_ratio: 1.0,
            is_dca: false,
            raw_message: String::new(),
            source: source.clone(),
        })
    }

    // -------------------------------------------------------------------
    // 4. Narrative ENTRY — a free sentence
    // -------------------------------------------------------------------
    fn parse_narrative_entry(text: &str, source: &SignalSource) -> Option<TradeSignal> {
        let symbol = find_inline_symbol(text)?;
        let side = direction_from_text(text)?;

        let (entry_low, entry_high) = find_near_price(text).or_else(|| find_range_price(text))?;

        let stop_loss = find_inline_number_after(text, &["止損", "止损", "sl"]).unwrap_or(0.0);
        let take_profits = find_all_inline_numbers_after(text, &["止盈", "tp"]);

        debug!(symbol, ?side, "matched narrative ENTRY sentence");

        Some(TradeSignal {
            symbol,
            side: Some(side),
            signal_type: SignalType::Entry,
            entry_price_low: Some(entry_low),
            entry_price_high: Some(entry_high),
            stop_loss,
            take_profits,
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: 1.0,
            is_dca: contains_dca_cue(text),
            raw_message: String::new(),
            source: source.clone(),
        })
    }

    // -------------------------------------------------------------------
    // 5. Trigger line — "<price><direction-keyword>触发入场"
    // -------------------------------------------------------------------
    fn parse_trigger_line(text: &str, source: &SignalSource) -> Option<TradeSignal> {
        if !(text.contains("触发入场") || text.contains("觸發入場") || text.contains("triggered")) {
            return None;
        }

        let symbol = find_inline_symbol(text).unwrap_or_default();
        let price = find_first_number(text)?;
        let side = direction_from_text(text)?;

        debug!(symbol, price, ?side, "matched trigger-line ENTRY");

        Some(TradeSignal {
            symbol,
            side: Some(side),
            signal_type: SignalType::Entry,
            entry_price_low: Some(price),
            entry_price_high: Some(price),
            stop_loss: 0.0,
            take_profits: vec![],
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: 1.0,
            is_dca: false,
            raw_message: String::new(),
            source: source.clone(),
        })
    }
}

// =============================================================================
// Normalisation
// =============================================================================

fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.is_empty() || upper.ends_with("USDT") {
        upper
    } else {
        format!("{upper}USDT")
    }
}

fn is_unset_sentinel(v: &str) -> bool {
    SL_UNSET_SENTINELS.iter().any(|s| v.trim() == *s)
}

// =============================================================================
// Direction / cue detection
// =============================================================================

fn direction_from_text(text: &str) -> Option<Side> {
    let t = text.to_uppercase();
    let long_cues = ["多", "做多", "LONG", "BUY"];
    let short_cues = ["空", "做空", "SHORT", "SELL"];

    if short_cues.iter().any(|c| t.contains(&c.to_uppercase())) {
        return Some(Side::Short);
    }
    if long_cues.iter().any(|c| t.contains(&c.to_uppercase())) {
        return Some(Side::Long);
    }
    None
}

fn contains_direction_cue(text: &str) -> bool {
    direction_from_text(text).is_some()
}

fn contains_cancel_cue(text: &str) -> bool {
    ["取消", "撤銷", "撤销", "cancel"]
        .iter()
        .any(|c| text.to_lowercase().contains(&c.to_lowercase()))
}

fn contains_move_sl_cue(text: &str) -> bool {
    ["倉位更新", "仓位更新", "position update", "移動止損", "移动止损", "更新止損", "更新止损"]
        .iter()
        .any(|c| text.to_lowercase().contains(&c.to_lowercase()))
}

fn contains_dca_cue(text: &str) -> bool {
    ["加倉", "加仓", "dca", "補倉", "补仓"]
        .iter()
        .any(|c| text.to_lowercase().contains(&c.to_lowercase()))
}

// =============================================================================
// Labelled-line extraction — "label: value" / "label：value"
// =============================================================================

fn find_labelled(lines: &[&str], labels: &[&str]) -> Option<String> {
    for line in lines {
        if let Some((label, value)) = split_label_value(line) {
            if labels.iter().any(|l| label.eq_ignore_ascii_case(l)) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn find_all_labelled(lines: &[&str], labels: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for line in lines {
        if let Some((label, value)) = split_label_value(line) {
            let stripped = strip_trailing_digits(&label);
            if labels.iter().any(|l| stripped.eq_ignore_ascii_case(l)) {
                out.push(value.trim().to_string());
            }
        }
    }
    out
}

fn find_any_line<'a>(lines: &[&'a str], labels: &[&str]) -> Option<&'a str> {
    lines
        .iter()
        .find(|l| labels.iter().any(|lbl| l.to_lowercase().contains(&lbl.to_lowercase())))
        .copied()
}

fn split_label_value(line: &str) -> Option<(String, String)> {
    let sep_pos = line.find(|c| c == ':' || c == '：')?;
    let (label, value) = line.split_at(sep_pos);
    Some((label.trim().to_string(), value[1..].trim().to_string()))
}

fn strip_trailing_digits(label: &str) -> String {
    label.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

fn find_inline_symbol(text: &str) -> Option<String> {
    text.split(|c: char| c.is_whitespace() || "()[]{}，,。".contains(c))
        .find(|tok| {
            let alpha_len = tok.chars().filter(|c| c.is_ascii_alphabetic()).count();
            alpha_len >= 3
                && tok.chars().all(|c| c.is_ascii_alphanumeric())
                && tok.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        })
        .map(|s| s.to_string())
}

// =============================================================================
// Numeric extraction
// =============================================================================

fn parse_f64(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}

fn parse_price_range(text: &str) -> Option<(f64, f64)> {
    find_range_price(text).or_else(|| parse_f64(text).map(|p| (p, p)))
}

/// "A-B" range syntax.
fn find_range_price(text: &str) -> Option<(f64, f64)> {
    for sep in ['-', '~', '至'] {
        if let Some(idx) = text.find(sep) {
            let (lo_raw, hi_raw) = text.split_at(idx);
            let hi_raw = &hi_raw[sep.len_utf8()..];
            if let (Some(lo), Some(hi)) = (extract_trailing_number(lo_raw), extract_leading_number(hi_raw)) {
                return Some((lo.min(hi), lo.max(hi)));
            }
        }
    }
    None
}

/// "X附近" ⇒ low = high = X.
fn find_near_price(text: &str) -> Option<(f64, f64)> {
    for cue in ["附近", "around", "near"] {
        if let Some(idx) = text.find(cue) {
            let before = &text[..idx];
            if let Some(p) = extract_trailing_number(before) {
                return Some((p, p));
            }
        }
    }
    None
}

fn find_first_number(text: &str) -> Option<f64> {
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn extract_trailing_number(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn extract_leading_number(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn find_inline_number_after(text: &str, labels: &[&str]) -> Option<f64> {
    for label in labels {
        if let Some(idx) = text.to_lowercase().find(&label.to_lowercase()) {
            let after = &text[idx + label.len()..];
            if let Some(n) = extract_leading_number(after.trim_start_matches(|c| c == ':' || c == '：')) {
                return Some(n);
            }
        }
    }
    None
}

fn find_all_inline_numbers_after(text: &str, labels: &[&str]) -> Vec<f64> {
    for label in labels {
        if let Some(idx) = text.to_lowercase().find(&label.to_lowercase()) {
            let after = text[idx + label.len()..]
                .trim_start_matches(|c| c == ':' || c == '：')
                .to_string();
            return after
                .split(|c: char| c == '/' || c == ',' || c == '，' || c.is_whitespace())
                .filter_map(extract_leading_number)
                .collect();
        }
    }
    Vec::new()
}
