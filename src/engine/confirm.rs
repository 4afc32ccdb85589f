//! Signal confirmation filter chain.
//!
//! A candidate from the order flow detector must survive, in order: the
//! regime filter (EMA band + session VWAP direction), the order book
//! imbalance filter (throttled recompute), the candlestick filter (last two
//! closed bars), and the minimum-hold filter (no instant reversals). Any
//! filter can veto; only a candidate that passes all four reaches the risk
//! manager.

use std::collections::VecDeque;

use tracing::{debug, info};

use super::bars::Bar;
use super::patterns;
use super::regime::{Regime, RegimeTracker};
use super::risk::Position;
use crate::config::EngineConfig;
use crate::types::{CandidateSignal, Side, Tick};

/// A candidate that passed every filter, ready for the risk manager.
#[derive(Debug, Clone)]
pub struct ConfirmedEntry {
    pub side: Side,
    pub price: f64,
    pub stop_loss: f64,
    pub reason: String,
}

pub struct SignalConfirmer {
    obi_throttle_ms: i64,
    obi_buy_threshold: f64,
    obi_sell_threshold: f64,
    vwap_tolerance_frac: f64,
    min_hold_ms: i64,
    stop_buffer: f64,
    regime: RegimeTracker,
    /// The two most recently closed bars, oldest first.
    recent_bars: VecDeque<Bar>,
    obi_cached: Option<f64>,
    obi_computed_at_ms: Option<i64>,
}

impl SignalConfirmer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            obi_throttle_ms: config.obi_throttle_sec * 1000,
            obi_buy_threshold: config.obi_buy_threshold,
            obi_sell_threshold: config.obi_sell_threshold,
            vwap_tolerance_frac: config.vwap_tolerance_frac,
            min_hold_ms: config.min_hold_time_sec * 1000,
            stop_buffer: config.stop_buffer,
            regime: RegimeTracker::new(
                config.ema_period,
                config.trend_band_sigma,
                config.reversion_band_sigma,
            ),
            recent_bars: VecDeque::with_capacity(3),
            obi_cached: None,
            obi_computed_at_ms: None,
        }
    }

    pub fn on_bar_close(&mut self, bar: &Bar) {
        self.regime.on_bar_close(bar);
        self.recent_bars.push_back(bar.clone());
        while self.recent_bars.len() > 2 {
            self.recent_bars.pop_front();
        }
    }

    /// Run the filter chain. Returns the confirmed entry or `None` with the
    /// veto logged.
    pub fn confirm(
        &mut self,
        candidate: &CandidateSignal,
        tick: &Tick,
        position: Option<&Position>,
        now_ms: i64,
    ) -> Option<ConfirmedEntry> {
        let side = candidate.kind.side();

        if !self.passes_regime(side, candidate.price) {
            return None;
        }
        if !self.passes_obi(side, tick, now_ms) {
            return None;
        }
        if !self.passes_candlestick(side) {
            return None;
        }
        if !self.passes_min_hold(side, position, now_ms) {
            return None;
        }

        let stop_loss = match side {
            Side::Long => candidate.wall_price - self.stop_buffer,
            Side::Short => candidate.wall_price + self.stop_buffer,
        };

        info!(
            "CONFIRMED [{}]: {} {} @ {:.2} | Stop: {:.2}",
            candidate.instrument, candidate.kind, side, candidate.price, stop_loss
        );

        Some(ConfirmedEntry {
            side,
            price: candidate.price,
            stop_loss,
            reason: candidate.kind.to_string(),
        })
    }

    fn passes_regime(&self, side: Side, price: f64) -> bool {
        match self.regime.classify(price) {
            Regime::Skip => {
                debug!("veto: regime SKIP at {:.2}", price);
                false
            }
            Regime::Trend => {
                // With-value trades must agree with the session VWAP side.
                let Some(vwap) = self.regime.vwap() else {
                    debug!("veto: no session VWAP yet");
                    return false;
                };
                let ok = match side {
                    Side::Long => price >= vwap * (1.0 - self.vwap_tolerance_frac),
                    Side::Short => price <= vwap * (1.0 + self.vwap_tolerance_frac),
                };
                if !ok {
                    debug!(
                        "veto: TREND {} against VWAP ({:.2} vs {:.2})",
                        side, price, vwap
                    );
                }
                ok
            }
            Regime::Reversion => {
                // Stretched market: only the contrarian direction trades.
                let ema = self.regime.ema().unwrap_or(price);
                let overbought = price > ema;
                let ok = match side {
                    Side::Long => !overbought,
                    Side::Short => overbought,
                };
                if !ok {
                    debug!("veto: REVERSION rejects {} (overbought: {})", side, overbought);
                }
                ok
            }
        }
    }

    fn passes_obi(&mut self, side: Side, tick: &Tick, now_ms: i64) -> bool {
        let stale = match self.obi_computed_at_ms {
            Some(at) => now_ms - at >= self.obi_throttle_ms,
            None => true,
        };
        if stale {
            self.obi_cached = compute_obi(tick);
            self.obi_computed_at_ms = Some(now_ms);
        }

        let Some(obi) = self.obi_cached else {
            debug!("veto: no order book depth for OBI");
            return false;
        };
        let ok = match side {
            Side::Long => obi > self.obi_buy_threshold,
            Side::Short => obi < self.obi_sell_threshold,
        };
        if !ok {
            debug!("veto: OBI {:.2} rejects {}", obi, side);
        }
        ok
    }

    fn passes_candlestick(&self, side: Side) -> bool {
        if self.recent_bars.len() < 2 {
            debug!("veto: not enough closed bars for candlestick filter");
            return false;
        }
        let (Some(prev), Some(last)) = (self.recent_bars.front(), self.recent_bars.back()) else {
            return false;
        };
        let ok = match side {
            Side::Long => patterns::confirms_buy(prev, last),
            Side::Short => patterns::confirms_sell(prev, last),
        };
        if !ok {
            debug!("veto: no {} candlestick confirmation", side);
        }
        ok
    }

    fn passes_min_hold(&self, side: Side, position: Option<&Position>, now_ms: i64) -> bool {
        let Some(pos) = position else {
            return true;
        };
        if pos.side == side {
            // Same-side duplicates fall through to the risk manager's no-op.
            return true;
        }
        let held_ms = now_ms - pos.entry_ts_ms;
        if held_ms < self.min_hold_ms {
            debug!(
                "veto: reversal after {}ms, minimum hold {}ms",
                held_ms, self.min_hold_ms
            );
            return false;
        }
        true
    }
}

/// Total resting bid quantity over total resting ask quantity. `None` when
/// either side of the book is empty.
fn compute_obi(tick: &Tick) -> Option<f64> {
    let bid_qty: u64 = tick.bids.iter().map(|l| l.qty).sum();
    let ask_qty: u64 = tick.asks.iter().map(|l| l.qty).sum();
    if bid_qty == 0 || ask_qty == 0 {
        return None;
    }
    Some(bid_qty as f64 / ask_qty as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DepthLevel, SignalKind};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn bar(start_ts_ms: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            instrument: "NIFTY-FUT".to_string(),
            start_ts_ms,
            open,
            high,
            low,
            close,
            volume: 10,
            buy_volume: 5,
            sell_volume: 5,
            footprint: BTreeMap::new(),
            cvd: 0,
            trade_count: 5,
        }
    }

    /// Confirmer warmed up so a buy near 100 confirms: regime TREND around
    /// 100, bullish engulfing as the last two closed bars.
    fn buy_ready_confirmer() -> SignalConfirmer {
        let mut c = SignalConfirmer::new(&EngineConfig::default());
        for i in 0..18i64 {
            let close = if i % 2 == 0 { 99.0 } else { 101.0 };
            c.on_bar_close(&bar(i * 60_000, close, close + 0.5, close - 0.5, close));
        }
        // Bearish bar then a bullish engulfing bar.
        c.on_bar_close(&bar(18 * 60_000, 101.0, 101.5, 99.5, 100.0));
        c.on_bar_close(&bar(19 * 60_000, 99.8, 102.0, 99.5, 101.5));
        c
    }

    /// Mirror of the above for sell candidates: bearish engulfing last.
    fn sell_ready_confirmer() -> SignalConfirmer {
        let mut c = SignalConfirmer::new(&EngineConfig::default());
        for i in 0..18i64 {
            let close = if i % 2 == 0 { 99.0 } else { 101.0 };
            c.on_bar_close(&bar(i * 60_000, close, close + 0.5, close - 0.5, close));
        }
        c.on_bar_close(&bar(18 * 60_000, 99.5, 101.0, 99.3, 100.5));
        c.on_bar_close(&bar(19 * 60_000, 100.7, 101.0, 99.2, 99.4));
        c
    }

    fn candidate(kind: SignalKind, price: f64) -> CandidateSignal {
        CandidateSignal {
            instrument: "NIFTY-FUT".to_string(),
            kind,
            price,
            wall_price: 99.5,
            ts_ms: 1_200_000,
        }
    }

    fn tick_with_book(bid_qty: u64, ask_qty: u64) -> Tick {
        Tick {
            instrument: "NIFTY-FUT".to_string(),
            price: 100.0,
            qty: 10,
            ts_ms: 1_200_000,
            bids: vec![DepthLevel { price: 99.9, qty: bid_qty }],
            asks: vec![DepthLevel { price: 100.1, qty: ask_qty }],
        }
    }

    fn position(side: Side, entry_ts_ms: i64) -> Position {
        Position {
            trade_id: Uuid::new_v4(),
            side,
            entry_price: 100.0,
            entry_ts_ms,
            stop_loss: 96.0,
            take_profit: 106.0,
            quantity: 10,
            trailing_armed: false,
            initial_risk: 4.0,
        }
    }

    #[test]
    fn test_buy_confirms_through_all_filters() {
        let mut c = buy_ready_confirmer();
        let entry = c
            .confirm(
                &candidate(SignalKind::FailedAuctionBuy, 100.0),
                &tick_with_book(300, 100),
                None,
                1_200_000,
            )
            .unwrap();
        assert_eq!(entry.side, Side::Long);
        // Stop sits one buffer below the reclaimed wall.
        assert!((entry.stop_loss - 97.5).abs() < 1e-9);
    }

    #[test]
    fn test_obi_vetoes_weak_book() {
        let mut c = buy_ready_confirmer();
        // Balanced book: OBI 1.0 is under the 1.2 buy threshold.
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionBuy, 100.0),
                &tick_with_book(100, 100),
                None,
                1_200_000,
            )
            .is_none());
    }

    #[test]
    fn test_obi_throttle_caches_value() {
        let mut c = buy_ready_confirmer();
        // First call computes OBI 1.0 and vetoes.
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionBuy, 100.0),
                &tick_with_book(100, 100),
                None,
                1_200_000,
            )
            .is_none());
        // 200ms later the book flipped bid-heavy, but the cached value is
        // still live inside the throttle window.
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionBuy, 100.0),
                &tick_with_book(500, 100),
                None,
                1_200_200,
            )
            .is_none());
        // Past the throttle the fresh book is seen.
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionBuy, 100.0),
                &tick_with_book(500, 100),
                None,
                1_201_000,
            )
            .is_some());
    }

    #[test]
    fn test_candlestick_vetoes_wrong_direction() {
        // Buy-ready bars cannot confirm a sell.
        let mut c = buy_ready_confirmer();
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionSell, 100.0),
                &tick_with_book(100, 300),
                None,
                1_200_000,
            )
            .is_none());
    }

    #[test]
    fn test_min_hold_blocks_fast_reversal() {
        let mut c = sell_ready_confirmer();
        // LONG opened 10s ago: the reversal is vetoed.
        let pos = position(Side::Long, 1_190_000);
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionSell, 100.0),
                &tick_with_book(100, 300),
                Some(&pos),
                1_200_000,
            )
            .is_none());

        // The same candidate 70s after entry is allowed.
        let pos = position(Side::Long, 1_130_000);
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionSell, 100.0),
                &tick_with_book(100, 300),
                Some(&pos),
                1_200_000,
            )
            .is_some());
    }

    #[test]
    fn test_no_bars_vetoes_everything() {
        let mut c = SignalConfirmer::new(&EngineConfig::default());
        assert!(c
            .confirm(
                &candidate(SignalKind::FailedAuctionBuy, 100.0),
                &tick_with_book(300, 100),
                None,
                1_200_000,
            )
            .is_none());
    }
}
