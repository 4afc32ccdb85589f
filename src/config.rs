//! Engine configuration.
//!
//! One flat config struct parameterizes the whole pipeline. Strategy
//! variants are config profiles, not forked code. Invalid thresholds are
//! rejected at startup before any instrument lane spawns; nothing else in
//! the pipeline is allowed to fail on configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: f64 },
    #[error("obi_buy_threshold ({buy}) must be above obi_sell_threshold ({sell})")]
    ObiBandInverted { buy: f64, sell: f64 },
    #[error("trend_band_sigma ({trend}) must be below reversion_band_sigma ({reversion})")]
    RegimeBandInverted { trend: f64, reversion: f64 },
}

/// Thresholds and intervals for every pipeline stage.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bar aggregation interval in seconds.
    pub bar_interval_sec: i64,
    /// Decimal places used for footprint price bins.
    pub price_decimals: usize,

    /// Largest level / mean of remaining levels ratio that registers a wall.
    pub big_wall_ratio: f64,
    /// Traded volume at the wall price that fires one absorption event.
    pub absorption_min_qty: u64,
    /// Minimum wall lifetime before its break is eligible for a reclaim.
    pub min_wall_durability_sec: i64,
    /// Broken walls remembered per instrument.
    pub broken_wall_history: usize,

    /// Closed-bar lookback for the regime EMA and band.
    pub ema_period: usize,
    /// Inside this band (in sigmas) the regime is TREND.
    pub trend_band_sigma: f64,
    /// Outside this band (in sigmas) the regime is REVERSION.
    pub reversion_band_sigma: f64,
    /// Buy candidates in TREND mode may not sit more than this fraction
    /// below session VWAP (mirrored for sells).
    pub vwap_tolerance_frac: f64,

    /// Minimum seconds between order book imbalance recomputes.
    pub obi_throttle_sec: i64,
    /// Buy candidates need OBI above this.
    pub obi_buy_threshold: f64,
    /// Sell candidates need OBI below this.
    pub obi_sell_threshold: f64,

    /// Seconds a position must be held before a reversal is allowed.
    pub min_hold_time_sec: i64,
    /// Take profit distance as a multiple of stop distance.
    pub rr_ratio: f64,
    /// Stop placement distance beyond the reclaimed wall price.
    pub stop_buffer: f64,
    /// Contracts/lots per entry.
    pub default_qty: u64,
    /// Unrealized profit (in R) that arms the trailing stop at breakeven.
    pub trail_trigger_r: f64,
    /// Fixed trail distance behind price once armed.
    pub trail_distance: f64,
    /// Positions open longer than this without progress are force-closed.
    pub time_stop_sec: i64,
    /// "Progress" for the time stop, as a fraction of risk distance.
    pub time_stop_min_progress_r: f64,

    /// Maximum concurrent instrument lanes.
    pub max_instruments: usize,
    /// Minimum interval between in-progress bar snapshots (ms).
    pub snapshot_throttle_ms: i64,
    /// Minimum interval between persisted bar metrics per instrument (ms).
    pub persist_throttle_ms: i64,
    /// Bounded persistence queue depth.
    pub persist_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bar_interval_sec: 60,
            price_decimals: 2,
            big_wall_ratio: 3.0,
            absorption_min_qty: 1000,
            min_wall_durability_sec: 30,
            broken_wall_history: 5,
            ema_period: 20,
            trend_band_sigma: 0.5,
            reversion_band_sigma: 2.5,
            vwap_tolerance_frac: 0.001,
            obi_throttle_sec: 1,
            obi_buy_threshold: 1.2,
            obi_sell_threshold: 0.8,
            min_hold_time_sec: 60,
            rr_ratio: 1.5,
            stop_buffer: 2.0,
            default_qty: 1,
            trail_trigger_r: 1.0,
            trail_distance: 4.0,
            time_stop_sec: 900, // 15 minutes of theta bleed is enough
            time_stop_min_progress_r: 0.25,
            max_instruments: 64,
            snapshot_throttle_ms: 500, // at most 2 snapshots per second
            persist_throttle_ms: 60_000,
            persist_queue_depth: 1024,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the pipeline cannot run under. Called once at
    /// startup; a failure here is the only crash-worthy condition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("bar_interval_sec", self.bar_interval_sec as f64),
            ("big_wall_ratio", self.big_wall_ratio),
            ("absorption_min_qty", self.absorption_min_qty as f64),
            ("min_wall_durability_sec", self.min_wall_durability_sec as f64),
            ("ema_period", self.ema_period as f64),
            ("rr_ratio", self.rr_ratio),
            ("stop_buffer", self.stop_buffer),
            ("default_qty", self.default_qty as f64),
            ("trail_distance", self.trail_distance),
            ("time_stop_sec", self.time_stop_sec as f64),
            ("max_instruments", self.max_instruments as f64),
            ("persist_queue_depth", self.persist_queue_depth as f64),
        ];
        for (field, value) in positive {
            if value <= 0.0 {
                return Err(ConfigError::NonPositive { field, value });
            }
        }

        if self.obi_buy_threshold <= self.obi_sell_threshold {
            return Err(ConfigError::ObiBandInverted {
                buy: self.obi_buy_threshold,
                sell: self.obi_sell_threshold,
            });
        }
        if self.trend_band_sigma >= self.reversion_band_sigma {
            return Err(ConfigError::RegimeBandInverted {
                trend: self.trend_band_sigma,
                reversion: self.reversion_band_sigma,
            });
        }
        Ok(())
    }
}
