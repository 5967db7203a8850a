//! Shared helpers for money formatting and output truncation.

/// Nanodollars per USD. All budgets and costs are tracked in nanodollars
/// to keep the arithmetic in integers.
pub const NANOS_PER_USD: u64 = 1_000_000_000;

/// Convert a USD amount into nanodollars, rounding to the nearest nano.
///
/// Negative or non-finite inputs map to 0.
pub fn nanos_from_usd(usd: f64) -> u64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * NANOS_PER_USD as f64).round() as u64
}

/// Format nanodollars as a dollar amount, e.g. `$0.0034`.
pub fn fmt_usd(nanos: u64) -> String {
    format!("${:.4}", nanos as f64 / NANOS_PER_USD as f64)
}

/// Truncate `text` to at most `max` characters, char-boundary safe.
///
/// Longer inputs are cut at `max - reserve` and suffixed with a note
/// carrying the original length, mirroring what tool output truncation
/// reports back to the model.
pub fn truncate_with_note(text: &str, max: usize, reserve: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(reserve).max(1);
    let cut: String = text.chars().take(keep).collect();
    format!("{}\n... [truncated, {} chars total]", cut, total)
}

/// Truncate `text` to at most `max` characters with no suffix.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
