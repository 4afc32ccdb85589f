//! Regime classification from closed bars.
//!
//! Price against an EMA band: within `trend_band_sigma` standard deviations
//! of the EMA the market is trending with value, beyond
//! `reversion_band_sigma` it is stretched enough to fade, and the land in
//! between is untradeable. Session VWAP accumulates per exchange trading day
//! (Asia/Kolkata) and anchors the directional check in TREND mode.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate};
use chrono_tz::Asia::Kolkata;
use serde::{Deserialize, Serialize};

use super::bars::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    /// Price near value: trade with the VWAP-relative direction.
    Trend,
    /// Price stretched: only contrarian candidates allowed.
    Reversion,
    /// Neither: candidates are dropped.
    Skip,
}

/// Rolling EMA/sigma band plus session VWAP, fed by closed bars only.
#[derive(Debug)]
pub struct RegimeTracker {
    ema_period: usize,
    trend_band_sigma: f64,
    reversion_band_sigma: f64,
    closes: VecDeque<f64>,
    ema: Option<f64>,
    session_date: Option<NaiveDate>,
    vwap_pv: f64,
    vwap_volume: u64,
}

impl RegimeTracker {
    pub fn new(ema_period: usize, trend_band_sigma: f64, reversion_band_sigma: f64) -> Self {
        Self {
            ema_period,
            trend_band_sigma,
            reversion_band_sigma,
            closes: VecDeque::with_capacity(ema_period + 1),
            ema: None,
            session_date: None,
            vwap_pv: 0.0,
            vwap_volume: 0,
        }
    }

    pub fn on_bar_close(&mut self, bar: &Bar) {
        self.roll_session(bar.start_ts_ms);

        let typical = (bar.high + bar.low + bar.close) / 3.0;
        self.vwap_pv += typical * bar.volume as f64;
        self.vwap_volume += bar.volume;

        self.closes.push_back(bar.close);
        while self.closes.len() > self.ema_period {
            self.closes.pop_front();
        }

        let k = 2.0 / (self.ema_period as f64 + 1.0);
        self.ema = Some(match self.ema {
            Some(prev) => bar.close * k + prev * (1.0 - k),
            None => bar.close,
        });
    }

    /// Reset VWAP accumulators when the exchange trading day changes.
    fn roll_session(&mut self, ts_ms: i64) {
        let Some(ts) = DateTime::from_timestamp_millis(ts_ms) else {
            return;
        };
        let date = ts.with_timezone(&Kolkata).date_naive();
        if self.session_date != Some(date) {
            self.session_date = Some(date);
            self.vwap_pv = 0.0;
            self.vwap_volume = 0;
        }
    }

    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    pub fn vwap(&self) -> Option<f64> {
        if self.vwap_volume == 0 {
            None
        } else {
            Some(self.vwap_pv / self.vwap_volume as f64)
        }
    }

    fn sigma(&self) -> f64 {
        if self.closes.len() < 2 {
            return 0.0;
        }
        let mean = self.closes.iter().sum::<f64>() / self.closes.len() as f64;
        let variance = self
            .closes
            .iter()
            .map(|c| (c - mean).powi(2))
            .sum::<f64>()
            / self.closes.len() as f64;
        variance.sqrt()
    }

    /// Classify `price` against the band. Skips until a full EMA window of
    /// closed bars exists; a flat band (zero sigma) is also a skip.
    pub fn classify(&self, price: f64) -> Regime {
        let Some(ema) = self.ema else {
            return Regime::Skip;
        };
        if self.closes.len() < self.ema_period {
            return Regime::Skip;
        }
        let sigma = self.sigma();
        if sigma <= f64::EPSILON {
            return Regime::Skip;
        }

        let deviation = (price - ema).abs() / sigma;
        if deviation <= self.trend_band_sigma {
            Regime::Trend
        } else if deviation >= self.reversion_band_sigma {
            Regime::Reversion
        } else {
            Regime::Skip
        }
    }
}
