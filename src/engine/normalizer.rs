//! Tick validation at the ingestion boundary.
//!
//! The feed adapter hands us loosely-shaped [`RawTick`]s. Anything missing a
//! price, timestamp, or instrument is rejected here, counted, and never seen
//! by the rest of the pipeline. Downstream stages can therefore assume every
//! field of [`Tick`] is present and finite.

use tracing::{debug, warn};

use crate::types::{DepthLevel, RawDepthLevel, RawTick, Tick};

/// Stateful normalizer; the counters live for the process lifetime.
#[derive(Debug, Default)]
pub struct TickNormalizer {
    accepted: u64,
    rejected: u64,
}

impl TickNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Validate one raw tick. Returns `None` for malformed input, which is
    /// dropped and counted, never raised.
    pub fn normalize(&mut self, raw: RawTick) -> Option<Tick> {
        let instrument = match raw.instrument {
            Some(ref key) if !key.is_empty() => key.clone(),
            _ => return self.reject("missing instrument"),
        };
        let price = match raw.price {
            Some(p) if p.is_finite() && p > 0.0 => p,
            _ => return self.reject("missing or non-finite price"),
        };
        let ts_ms = match raw.ts_ms {
            Some(ts) if ts > 0 => ts,
            _ => return self.reject("missing timestamp"),
        };
        // qty 0 is a valid quote-only update; missing or negative is garbage.
        let qty = match raw.qty {
            Some(q) if q >= 0 => q as u64,
            Some(_) => return self.reject("negative qty"),
            None => return self.reject("missing qty"),
        };

        let tick = Tick {
            instrument,
            price,
            qty,
            ts_ms,
            bids: clean_levels(&raw.bids),
            asks: clean_levels(&raw.asks),
        };

        self.accepted += 1;
        Some(tick)
    }

    fn reject(&mut self, reason: &str) -> Option<Tick> {
        self.rejected += 1;
        // Every thousandth rejection gets a warn so a broken feed is visible
        // without flooding the log.
        if self.rejected % 1000 == 1 {
            warn!("malformed tick dropped ({}), total dropped: {}", reason, self.rejected);
        } else {
            debug!("malformed tick dropped ({})", reason);
        }
        None
    }
}

/// Drop unusable depth levels instead of rejecting the whole tick.
fn clean_levels(raw: &[RawDepthLevel]) -> Vec<DepthLevel> {
    raw.iter()
        .filter_map(|l| match (l.price, l.qty) {
            (Some(p), Some(q)) if p.is_finite() && p > 0.0 && q > 0 => Some(DepthLevel {
                price: p,
                qty: q as u64,
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(price: Option<f64>, qty: Option<i64>, ts: Option<i64>) -> RawTick {
        RawTick {
            instrument: Some("NIFTY-FUT".to_string()),
            price,
            qty,
            ts_ms: ts,
            bids: vec![],
            asks: vec![],
        }
    }

    #[test]
    fn test_valid_tick_passes() {
        let mut n = TickNormalizer::new();
        let tick = n.normalize(raw(Some(22_100.5), Some(50), Some(1_000))).unwrap();
        assert_eq!(tick.price, 22_100.5);
        assert_eq!(tick.qty, 50);
        assert_eq!(n.accepted(), 1);
    }

    #[test]
    fn test_missing_price_dropped() {
        let mut n = TickNormalizer::new();
        assert!(n.normalize(raw(None, Some(50), Some(1_000))).is_none());
        assert!(n.normalize(raw(Some(f64::NAN), Some(50), Some(1_000))).is_none());
        assert_eq!(n.rejected(), 2);
        assert_eq!(n.accepted(), 0);
    }

    #[test]
    fn test_missing_timestamp_dropped() {
        let mut n = TickNormalizer::new();
        assert!(n.normalize(raw(Some(100.0), Some(1), None)).is_none());
    }

    #[test]
    fn test_missing_qty_dropped() {
        let mut n = TickNormalizer::new();
        assert!(n.normalize(raw(Some(100.0), None, Some(1_000))).is_none());
        assert!(n.normalize(raw(Some(100.0), Some(-5), Some(1_000))).is_none());
    }

    #[test]
    fn test_quote_only_tick_accepted() {
        let mut n = TickNormalizer::new();
        let tick = n.normalize(raw(Some(100.0), Some(0), Some(1_000))).unwrap();
        assert!(!tick.is_trade());
    }

    #[test]
    fn test_bad_depth_levels_filtered_not_fatal() {
        let mut n = TickNormalizer::new();
        let mut r = raw(Some(100.0), Some(5), Some(1_000));
        r.bids = vec![
            RawDepthLevel { price: Some(99.0), qty: Some(10) },
            RawDepthLevel { price: None, qty: Some(10) },
            RawDepthLevel { price: Some(98.0), qty: Some(0) },
        ];
        let tick = n.normalize(r).unwrap();
        assert_eq!(tick.bids.len(), 1);
        assert_eq!(tick.bids[0].price, 99.0);
    }
}
