//! One side (asks or bids) of a single market's order book.
//!
//! Backed by a `BTreeMap` keyed on the exchange's literal price string, not
//! a parsed float: two strings that parse to the same number
//! (`"0.10"`/`"0.1"`) are distinct keys, matching exchange semantics. Sort
//! order is obtained by parsing the key to `f64` only at traversal time.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Ordered `price -> quantity` map for one side of one market, guarded by
/// its own lock so that a writer (the dispatcher or the snapshot task) and
/// a reader (`get_asks`/`get_bids`) never interleave a partial update.
#[derive(Debug)]
pub struct BookSide {
    levels: Mutex<BTreeMap<String, f64>>,
}

impl BookSide {
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Apply one `(price, qty)` update. `qty == 0.0` removes the level;
    /// otherwise the level is inserted or overwritten.
    pub fn apply(&self, price: &str, qty: f64) {
        let mut levels = self.levels.lock().expect("book side lock poisoned");
        if qty == 0.0 {
            levels.remove(price);
        } else {
            levels.insert(price.to_string(), qty);
        }
    }

    /// Apply a batch of `(price_string, qty_string)` pairs. Entries whose
    /// quantity string fails to parse are skipped rather than poisoning the
    /// whole batch.
    pub fn apply_levels(&self, pairs: &[(String, String)]) {
        let mut levels = self.levels.lock().expect("book side lock poisoned");
        for (price, qty) in pairs {
            let Ok(qty) = qty.parse::<f64>() else {
                continue;
            };
            if qty == 0.0 {
                levels.remove(price);
            } else {
                levels.insert(price.clone(), qty);
            }
        }
    }

    /// Clear all entries.
    pub fn reset(&self) {
        self.levels.lock().expect("book side lock poisoned").clear();
    }

    /// Replace all levels with a fresh snapshot (used by the snapshot task
    /// after `reset()`). Equivalent to `reset()` followed by `apply_levels`,
    /// exposed separately so the dispatcher can make the "snapshot then
    /// stitch" step explicit.
    pub fn load_snapshot(&self, pairs: &[(String, String)]) {
        self.reset();
        self.apply_levels(pairs);
    }

    /// Sorted `(price, qty) ` view: ascending when `reverse` is `false`,
    /// descending otherwise (asks call with `reverse=false`, bids with
    /// `reverse=true`). When `threshold_volume > 0.0`, levels are
    /// accumulated (`price * qty`) in sort order and the prefix stops once
    /// the running total would exceed the threshold -- except the first
    /// level, which is always included so a caller with any liquidity never
    /// sees an empty result. The prefix is then truncated to `limit_count`
    /// if given.
    pub fn view(
        &self,
        reverse: bool,
        limit_count: Option<usize>,
        threshold_volume: Option<f64>,
    ) -> Vec<(String, f64)> {
        let levels = self.levels.lock().expect("book side lock poisoned");

        let mut sorted: Vec<(&String, &f64)> = levels.iter().collect();
        sorted.sort_by(|(pa, _), (pb, _)| {
            let a: f64 = pa.parse().unwrap_or(f64::NAN);
            let b: f64 = pb.parse().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        });
        if reverse {
            sorted.reverse();
        }

        let mut out: Vec<(String, f64)> = Vec::with_capacity(sorted.len());
        let threshold = threshold_volume.filter(|v| *v > 0.0);

        if let Some(threshold) = threshold {
            let mut cumulative = 0.0;
            for (i, (price, qty)) in sorted.into_iter().enumerate() {
                let price_f: f64 = price.parse().unwrap_or(0.0);
                let level_volume = price_f * qty;
                if i > 0 && cumulative + level_volume > threshold {
                    break;
                }
                cumulative += level_volume;
                out.push((price.clone(), *qty));
            }
        } else {
            out.extend(sorted.into_iter().map(|(p, q)| (p.clone(), *q)));
        }

        if let Some(limit) = limit_count {
            out.truncate(limit);
        }

        out
    }

    pub fn len(&self) -> usize {
        self.levels.lock().expect("book side lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BookSide {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_inserts_and_removes() {
        let side = BookSide::new();
        side.apply("10.0", 1.0);
        side.apply("9.0", 2.0);
        assert_eq!(side.len(), 2);

        side.apply("10.0", 0.0);
        assert_eq!(side.len(), 1);
    }

    #[test]
    fn distinct_string_keys_for_same_numeric_value() {
        let side = BookSide::new();
        side.apply("0.10", 1.0);
        side.apply("0.1", 2.0);
        assert_eq!(side.len(), 2);
    }

    #[test]
    fn view_ascending_is_monotone() {
        let side = BookSide::new();
        side.apply("10.0", 1.0);
        side.apply("9.0", 2.0);
        side.apply("11.0", 1.0);

        let view = side.view(false, None, None);
        let prices: Vec<f64> = view.iter().map(|(p, _)| p.parse().unwrap()).collect();
        assert_eq!(prices, vec![9.0, 10.0, 11.0]);
    }

    #[test]
    fn view_descending_is_monotone() {
        let side = BookSide::new();
        side.apply("10.0", 1.0);
        side.apply("9.0", 2.0);
        side.apply("11.0", 1.0);

        let view = side.view(true, None, None);
        let prices: Vec<f64> = view.iter().map(|(p, _)| p.parse().unwrap()).collect();
        assert_eq!(prices, vec![11.0, 10.0, 9.0]);
    }

    #[test]
    fn view_never_returns_zero_quantity_entries() {
        let side = BookSide::new();
        side.apply("10.0", 1.0);
        side.apply("9.0", 0.0);
        let view = side.view(false, None, None);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn limit_count_truncates() {
        let side = BookSide::new();
        side.apply("10.0", 1.0);
        side.apply("9.0", 1.0);
        side.apply("11.0", 1.0);

        let view = side.view(false, Some(2), None);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn threshold_volume_always_includes_first_level() {
        let side = BookSide::new();
        side.apply("10.0", 100.0); // volume 1000, alone exceeds any small threshold
        let view = side.view(false, None, Some(1.0));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn threshold_volume_stops_once_exceeded() {
        let side = BookSide::new();
        side.apply("1.0", 1.0); // volume 1
        side.apply("2.0", 1.0); // volume 2
        side.apply("3.0", 1.0); // volume 3
        // cumulative after level 1 = 1, after level 2 = 3, after level 3 = 6
        let view = side.view(false, None, Some(3.0));
        let prices: Vec<f64> = view.iter().map(|(p, _)| p.parse().unwrap()).collect();
        assert_eq!(prices, vec![1.0, 2.0]);
    }

    #[test]
    fn reset_clears_all_levels() {
        let side = BookSide::new();
        side.apply("10.0", 1.0);
        side.apply("9.0", 1.0);
        side.reset();
        assert!(side.is_empty());
    }

    #[test]
    fn load_snapshot_replaces_existing_levels() {
        let side = BookSide::new();
        side.apply("1.0", 1.0);
        side.load_snapshot(&[("10.0".to_string(), "5.0".to_string())]);
        assert_eq!(side.len(), 1);
        assert_eq!(side.view(false, None, None), vec![("10.0".to_string(), 5.0)]);
    }
}
