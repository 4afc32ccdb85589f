//! Position and exit management.
//!
//! Owns at most one position per instrument. Entries come from the signal
//! confirmer; every tick afterwards is consulted for stop-loss, take-profit,
//! trailing and time-based exits. When stop and target are both touched
//! inside one bar the stop wins (worst-case ordering). Bad state never
//! crashes the lane: unknown trade references are logged and ignored,
//! corrupted positions are dropped with an error.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::types::{ExitReason, Side, TradeExit, TradeSignal};

/// The open position for one instrument. Created by `open`, mutated only by
/// trailing updates, removed on close.
#[derive(Debug, Clone)]
pub struct Position {
    pub trade_id: Uuid,
    pub side: Side,
    pub entry_price: f64,
    pub entry_ts_ms: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: u64,
    pub trailing_armed: bool,
    /// Entry-to-initial-stop distance; the 1R reference for trailing and
    /// progress checks. The live stop moves, this does not.
    pub initial_risk: f64,
}

impl Position {
    fn unrealized(&self, current_price: f64) -> f64 {
        match self.side {
            Side::Long => current_price - self.entry_price,
            Side::Short => self.entry_price - current_price,
        }
    }

    fn is_sane(&self) -> bool {
        self.entry_price.is_finite()
            && self.stop_loss.is_finite()
            && self.take_profit.is_finite()
            && self.initial_risk.is_finite()
            && self.initial_risk > 0.0
            && self.quantity > 0
    }
}

/// Entry/exit events produced by one risk operation, in emit order.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    Entry(TradeSignal),
    Exit(TradeExit),
}

/// Running per-instrument totals, reported at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct RiskStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
}

pub struct PositionRiskManager {
    instrument: String,
    rr_ratio: f64,
    trail_trigger_r: f64,
    trail_distance: f64,
    time_stop_ms: i64,
    time_stop_min_progress_r: f64,
    position: Option<Position>,
    stats: RiskStats,
}

impl PositionRiskManager {
    pub fn new(instrument: &str, config: &EngineConfig) -> Self {
        Self {
            instrument: instrument.to_string(),
            rr_ratio: config.rr_ratio,
            trail_trigger_r: config.trail_trigger_r,
            trail_distance: config.trail_distance,
            time_stop_ms: config.time_stop_sec * 1000,
            time_stop_min_progress_r: config.time_stop_min_progress_r,
            position: None,
            stats: RiskStats::default(),
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn stats(&self) -> RiskStats {
        self.stats
    }

    /// Open a position. A same-side duplicate is a no-op; an opposite-side
    /// position is closed first with reason REVERSAL. Take-profit derives
    /// from the stop distance and the configured reward ratio.
    pub fn open(
        &mut self,
        side: Side,
        price: f64,
        stop_loss: f64,
        quantity: u64,
        reason: &str,
        now_ms: i64,
    ) -> Vec<RiskEvent> {
        self.drop_if_corrupt();

        let mut events = Vec::new();

        if let Some(pos) = self.position.as_ref() {
            if pos.side == side {
                debug!(
                    "[{}] ignoring {} entry, already {} since {}",
                    self.instrument, side, pos.side, pos.entry_ts_ms
                );
                return events;
            }
            let trade_id = pos.trade_id;
            if let Some(exit) = self.close(trade_id, price, ExitReason::Reversal, now_ms) {
                events.push(RiskEvent::Exit(exit));
            }
        }

        let risk_distance = (price - stop_loss).abs();
        if !risk_distance.is_finite() || risk_distance <= 0.0 {
            error!(
                "[{}] rejecting entry with degenerate stop ({} @ {:.2}, sl {:.2})",
                self.instrument, side, price, stop_loss
            );
            return events;
        }

        let take_profit = match side {
            Side::Long => price + risk_distance * self.rr_ratio,
            Side::Short => price - risk_distance * self.rr_ratio,
        };

        let position = Position {
            trade_id: Uuid::new_v4(),
            side,
            entry_price: price,
            entry_ts_ms: now_ms,
            stop_loss,
            take_profit,
            quantity,
            trailing_armed: false,
            initial_risk: risk_distance,
        };

        info!(
            "ENTRY [{}]: {} @ {:.2} | Stop: {:.2} | Target: {:.2} | {}",
            self.instrument, side, price, stop_loss, take_profit, reason
        );

        events.push(RiskEvent::Entry(TradeSignal {
            trade_id: position.trade_id,
            instrument: self.instrument.clone(),
            side,
            price,
            stop_loss,
            take_profit,
            quantity,
            reason: reason.to_string(),
            ts_ms: now_ms,
        }));
        self.position = Some(position);
        events
    }

    /// Test the open position against a bar's (or tick's) extremes. When
    /// stop and target are both touched, the stop wins.
    pub fn check_intrabar_exit(&mut self, high: f64, low: f64, now_ms: i64) -> Option<TradeExit> {
        self.drop_if_corrupt();
        let pos = self.position.as_ref()?;

        let (sl_hit, tp_hit) = match pos.side {
            Side::Long => (low <= pos.stop_loss, high >= pos.take_profit),
            Side::Short => (high >= pos.stop_loss, low <= pos.take_profit),
        };

        let (exit_price, reason) = if sl_hit {
            (pos.stop_loss, ExitReason::SlHit)
        } else if tp_hit {
            (pos.take_profit, ExitReason::TpHit)
        } else {
            return None;
        };

        let trade_id = pos.trade_id;
        self.close(trade_id, exit_price, reason, now_ms)
    }

    /// Move the stop to breakeven once unrealized profit reaches the
    /// configured fraction of risk, then trail a fixed distance behind
    /// price. The stop never loosens.
    pub fn apply_trailing(&mut self, current_price: f64) {
        let Some(pos) = self.position.as_mut() else {
            return;
        };

        if !pos.trailing_armed {
            if pos.unrealized(current_price) >= self.trail_trigger_r * pos.initial_risk {
                pos.trailing_armed = true;
                match pos.side {
                    Side::Long => pos.stop_loss = pos.stop_loss.max(pos.entry_price),
                    Side::Short => pos.stop_loss = pos.stop_loss.min(pos.entry_price),
                }
                debug!(
                    "[{}] trailing armed, stop at breakeven {:.2}",
                    self.instrument, pos.stop_loss
                );
            }
            return;
        }

        match pos.side {
            Side::Long => {
                let trail = current_price - self.trail_distance;
                if trail > pos.stop_loss {
                    pos.stop_loss = trail;
                    debug!("[{}] trail stop -> {:.2}", self.instrument, trail);
                }
            }
            Side::Short => {
                let trail = current_price + self.trail_distance;
                if trail < pos.stop_loss {
                    pos.stop_loss = trail;
                    debug!("[{}] trail stop -> {:.2}", self.instrument, trail);
                }
            }
        }
    }

    /// Force-close a stale position that has not progressed. Guards against
    /// time-decay bleed when holding options exposure.
    pub fn apply_time_stop(&mut self, now_ms: i64, current_price: f64) -> Option<TradeExit> {
        let pos = self.position.as_ref()?;

        if now_ms - pos.entry_ts_ms < self.time_stop_ms {
            return None;
        }
        let progressed =
            pos.unrealized(current_price) >= self.time_stop_min_progress_r * pos.initial_risk;
        if progressed {
            return None;
        }

        let trade_id = pos.trade_id;
        self.close(trade_id, current_price, ExitReason::TimeStop, now_ms)
    }

    /// Close by trade id. An unknown id is a reported, non-fatal error.
    pub fn close(
        &mut self,
        trade_id: Uuid,
        exit_price: f64,
        reason: ExitReason,
        now_ms: i64,
    ) -> Option<TradeExit> {
        match self.position.as_ref() {
            Some(pos) if pos.trade_id == trade_id => {}
            _ => {
                warn!(
                    "[{}] close for unknown trade {} ignored",
                    self.instrument, trade_id
                );
                return None;
            }
        }
        let pos = self.position.take().expect("position checked above");

        let pnl = match pos.side {
            Side::Long => (exit_price - pos.entry_price) * pos.quantity as f64,
            Side::Short => (pos.entry_price - exit_price) * pos.quantity as f64,
        };

        self.stats.trades += 1;
        self.stats.total_pnl += pnl;
        if pnl > 0.0 {
            self.stats.wins += 1;
        } else if pnl < 0.0 {
            self.stats.losses += 1;
        }

        info!(
            "EXIT {} [{}]: {} @ {:.2} | P&L: {:+.2}",
            reason, self.instrument, pos.side, exit_price, pnl
        );

        Some(TradeExit {
            trade_id,
            instrument: self.instrument.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            pnl,
            reason,
            ts_ms: now_ms,
        })
    }

    /// Flush the open position at the given price (graceful shutdown).
    pub fn flush(&mut self, price: f64, now_ms: i64) -> Option<TradeExit> {
        let trade_id = self.position.as_ref()?.trade_id;
        self.close(trade_id, price, ExitReason::Shutdown, now_ms)
    }

    /// Structural check: a position with non-finite numbers is defensively
    /// dropped so one bad instrument cannot poison the pipeline.
    fn drop_if_corrupt(&mut self) {
        if let Some(pos) = self.position.as_ref() {
            if !pos.is_sane() {
                error!(
                    "[{}] dropping corrupted position state: {:?}",
                    self.instrument, pos
                );
                self.position = None;
            }
        }
    }

    pub fn status(&self) -> String {
        format!(
            "Trades: {} | W/L: {}/{} | P&L: {:+.2} | Position: {}",
            self.stats.trades,
            self.stats.wins,
            self.stats.losses,
            self.stats.total_pnl,
            if self.position.is_some() { "OPEN" } else { "FLAT" }
        )
    }
}
