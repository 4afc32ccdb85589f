//! Per-instrument processing lane.
//!
//! All mutable state for one instrument lives here and is driven by exactly
//! one task, one tick at a time: bar aggregation, wall tracking, signal
//! confirmation and position management, in that order. Exit checks run
//! before new entries so a stop and a fresh signal on the same tick cannot
//! race each other.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::bars::BarAggregator;
use super::confirm::SignalConfirmer;
use super::risk::{PositionRiskManager, RiskEvent, RiskStats};
use super::walls::{FlowEvent, OrderFlowDetector};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::persist::PersistHandle;
use crate::types::{EngineEvent, SinkRecord, Tick, TradeExit, TradeSignal};

pub struct InstrumentLane {
    instrument: String,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<EngineEvent>,
    persist: PersistHandle,
    aggregator: BarAggregator,
    detector: OrderFlowDetector,
    confirmer: SignalConfirmer,
    risk: PositionRiskManager,
    default_qty: u64,
    snapshot_throttle_ms: i64,
    last_snapshot_ms: Option<i64>,
    last_price: Option<f64>,
}

impl InstrumentLane {
    pub fn new(
        instrument: &str,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<EngineEvent>,
        persist: PersistHandle,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            clock,
            events,
            persist,
            aggregator: BarAggregator::new(
                instrument,
                config.bar_interval_sec,
                config.price_decimals,
            ),
            detector: OrderFlowDetector::new(instrument, config),
            confirmer: SignalConfirmer::new(config),
            risk: PositionRiskManager::new(instrument, config),
            default_qty: config.default_qty,
            snapshot_throttle_ms: config.snapshot_throttle_ms,
            last_snapshot_ms: None,
            last_price: None,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn stats(&self) -> RiskStats {
        self.risk.stats()
    }

    /// Process one canonical tick through the full pipeline. Atomic per
    /// tick: every mutation this tick causes happens before the call
    /// returns.
    pub fn on_tick(&mut self, tick: &Tick) {
        let now_ms = self.clock.now_ms();
        self.last_price = Some(tick.price);

        // 1. Bars. A closed bar feeds the regime/candlestick state.
        if let Some(bar) = self.aggregator.on_tick(tick) {
            self.confirmer.on_bar_close(&bar);
            self.persist.enqueue(SinkRecord::BarClose {
                instrument_key: bar.instrument.clone(),
                timestamp: bar.start_ts_ms,
                close: bar.close,
                volume: bar.volume,
                cvd: bar.cvd,
            });
            let _ = self.events.send(EngineEvent::BarClosed(bar));
        }

        // 2. Exits before entries.
        self.risk.apply_trailing(tick.price);
        if let Some(exit) = self.risk.check_intrabar_exit(tick.price, tick.price, now_ms) {
            self.emit_exit(exit);
        } else if let Some(exit) = self.risk.apply_time_stop(now_ms, tick.price) {
            self.emit_exit(exit);
        }

        // 3. Wall tracking, then candidate confirmation and entries.
        for event in self.detector.on_tick(tick, now_ms) {
            match event {
                FlowEvent::WallDetected { side, price, qty }
                | FlowEvent::WallReload { side, price, qty } => {
                    let _ = self.events.send(EngineEvent::WallDetected {
                        instrument: self.instrument.clone(),
                        side,
                        price,
                        qty,
                    });
                }
                FlowEvent::WallBroken {
                    side,
                    price,
                    durability_sec,
                } => {
                    let _ = self.events.send(EngineEvent::WallBroken {
                        instrument: self.instrument.clone(),
                        side,
                        price,
                        durability_sec,
                    });
                }
                FlowEvent::Absorption {
                    side,
                    price,
                    absorbed_qty,
                } => {
                    let _ = self.events.send(EngineEvent::Absorption {
                        instrument: self.instrument.clone(),
                        side,
                        price,
                        absorbed_qty,
                    });
                }
                FlowEvent::WallFaded { side, price } => {
                    debug!("[{}] {} wall faded at {:.2}", self.instrument, side, price);
                }
                FlowEvent::FailedAuction(candidate) => {
                    let confirmed =
                        self.confirmer
                            .confirm(&candidate, tick, self.risk.position(), now_ms);
                    if let Some(entry) = confirmed {
                        let events = self.risk.open(
                            entry.side,
                            entry.price,
                            entry.stop_loss,
                            self.default_qty,
                            &entry.reason,
                            now_ms,
                        );
                        for event in events {
                            match event {
                                RiskEvent::Entry(signal) => self.emit_entry(signal),
                                RiskEvent::Exit(exit) => self.emit_exit(exit),
                            }
                        }
                    }
                }
            }
        }

        // 4. Throttled in-progress bar snapshot for observers.
        let snapshot_due = match self.last_snapshot_ms {
            Some(at) => now_ms - at >= self.snapshot_throttle_ms,
            None => true,
        };
        if snapshot_due {
            if let Some(snapshot) = self.aggregator.snapshot() {
                self.last_snapshot_ms = Some(now_ms);
                let _ = self.events.send(EngineEvent::BarSnapshot(snapshot));
            }
        }
    }

    fn emit_entry(&self, signal: TradeSignal) {
        self.persist.enqueue(SinkRecord::from(&signal));
        let _ = self.events.send(EngineEvent::Entry(signal));
    }

    fn emit_exit(&self, exit: TradeExit) {
        self.persist.enqueue(SinkRecord::from(&exit));
        let _ = self.events.send(EngineEvent::Exit(exit));
    }

    /// Graceful teardown: close any open position at the last seen price
    /// and flush the open bar to the sink.
    pub fn flush(&mut self) {
        let now_ms = self.clock.now_ms();
        if let Some(price) = self.last_price {
            if let Some(exit) = self.risk.flush(price, now_ms) {
                self.emit_exit(exit);
            }
        }
        if let Some(bar) = self.aggregator.snapshot() {
            self.persist.enqueue(SinkRecord::BarClose {
                instrument_key: bar.instrument.clone(),
                timestamp: bar.start_ts_ms,
                close: bar.close,
                volume: bar.volume,
                cvd: bar.cvd,
            });
        }
        debug!("[{}] lane flushed: {}", self.instrument, self.risk.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::types::DepthLevel;

    fn lv(price: f64, qty: u64) -> DepthLevel {
        DepthLevel { price, qty }
    }

    fn tick(ts_ms: i64, price: f64, qty: u64) -> Tick {
        Tick {
            instrument: "NIFTY-FUT".to_string(),
            price,
            qty,
            ts_ms,
            bids: vec![lv(price - 0.5, 100), lv(price - 1.0, 100)],
            asks: vec![lv(price, 100), lv(price + 0.5, 100)],
        }
    }

    struct Harness {
        lane: InstrumentLane,
        clock: Arc<VirtualClock>,
        rx: broadcast::Receiver<EngineEvent>,
        persist: PersistHandle,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(VirtualClock::new(0));
            let (tx, rx) = broadcast::channel(4096);
            let persist = PersistHandle::new(4096);
            let lane = InstrumentLane::new(
                "NIFTY-FUT",
                &EngineConfig::default(),
                clock.clone(),
                tx,
                persist.clone(),
            );
            Self {
                lane,
                clock,
                rx,
                persist,
            }
        }

        /// The clock follows tick timestamps, exactly as replay drives it.
        fn feed(&mut self, t: &Tick) {
            self.clock.advance_to(t.ts_ms);
            self.lane.on_tick(t);
        }

        fn events(&mut self) -> Vec<EngineEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.rx.try_recv() {
                out.push(e);
            }
            out
        }
    }

    #[test]
    fn test_bar_close_emitted_on_interval_roll() {
        let mut h = Harness::new();
        h.feed(&tick(1_000, 100.0, 10));
        h.feed(&tick(61_000, 101.0, 5));

        let events = h.events();
        let closed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::BarClosed(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close, 100.0);

        let records = h.persist.drain();
        assert!(records
            .iter()
            .any(|r| matches!(r, SinkRecord::BarClose { .. })));
    }

    #[test]
    fn test_snapshots_throttled() {
        let mut h = Harness::new();
        // Ten ticks inside the same half second: one snapshot.
        for i in 0..10 {
            h.feed(&tick(1_000 + i * 10, 100.0, 1));
        }
        let snapshots = h
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::BarSnapshot(_)))
            .count();
        assert_eq!(snapshots, 1);

        // Past the throttle window the next tick snapshots again.
        h.feed(&tick(1_700, 100.0, 1));
        let snapshots = h
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::BarSnapshot(_)))
            .count();
        assert_eq!(snapshots, 1);
    }

    #[test]
    fn test_flush_persists_open_bar() {
        let mut h = Harness::new();
        h.feed(&tick(1_000, 100.0, 10));
        h.persist.drain();

        h.lane.flush();
        let records = h.persist.drain();
        assert!(matches!(
            records.as_slice(),
            [SinkRecord::BarClose { volume: 10, .. }]
        ));
    }
}
