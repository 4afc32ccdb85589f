//! Historical replay through the live pipeline.
//!
//! Streams historical ticks in timestamp order through the same lanes used
//! for live processing, pacing emission with `sleep(delta / speed)` and
//! advancing a virtual clock the whole pipeline reads its time from. A
//! strategy validated here behaves identically in production because no
//! strategy code can tell the difference.
//!
//! State machine: IDLE -> RUNNING -> (PAUSED <-> RUNNING) -> FINISHED | STOPPED.
//! Pause, resume, stop and speed changes are cooperative, applied between
//! ticks; every dispatched tick is fully applied before the next control
//! check, so a stop never leaves state half-updated.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::clock::VirtualClock;
use crate::config::EngineConfig;
use crate::persist::PersistHandle;
use crate::registry::LaneRegistry;
use crate::types::{EngineEvent, RawDepthLevel, RawTick, ReplayStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Running,
    Paused,
    Finished,
    Stopped,
}

impl std::fmt::Display for ReplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayState::Idle => write!(f, "IDLE"),
            ReplayState::Running => write!(f, "RUNNING"),
            ReplayState::Paused => write!(f, "PAUSED"),
            ReplayState::Finished => write!(f, "FINISHED"),
            ReplayState::Stopped => write!(f, "STOPPED"),
        }
    }
}

struct ControlInner {
    state: Mutex<ReplayState>,
    paused: AtomicBool,
    stopped: AtomicBool,
    speed_bits: AtomicU64,
    notify: Notify,
    events: broadcast::Sender<EngineEvent>,
}

/// Operator surface: pause/resume/stop/set_speed, checked between ticks.
#[derive(Clone)]
pub struct ReplayControl {
    inner: Arc<ControlInner>,
}

impl ReplayControl {
    fn new(events: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                state: Mutex::new(ReplayState::Idle),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                speed_bits: AtomicU64::new(1.0f64.to_bits()),
                notify: Notify::new(),
                events,
            }),
        }
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.transition(ReplayState::Paused);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.transition(ReplayState::Running);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.emit_status();
    }

    pub fn set_speed(&self, speed: f64) {
        if !speed.is_finite() || speed <= 0.0 {
            warn!("ignoring invalid replay speed {}", speed);
            return;
        }
        self.inner.speed_bits.store(speed.to_bits(), Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.emit_status();
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.inner.speed_bits.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> ReplayState {
        *self.inner.state.lock().expect("replay state lock")
    }

    pub fn status(&self) -> ReplayStatus {
        let state = self.state();
        ReplayStatus {
            active: matches!(state, ReplayState::Running | ReplayState::Paused),
            paused: state == ReplayState::Paused,
            speed: self.speed(),
        }
    }

    fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn transition(&self, state: ReplayState) {
        {
            let mut current = self.inner.state.lock().expect("replay state lock");
            *current = state;
        }
        self.inner.notify.notify_waiters();
        self.emit_status();
        info!("replay -> {}", state);
    }

    fn emit_status(&self) {
        let _ = self.inner.events.send(EngineEvent::Replay(self.status()));
    }
}

/// Drives historical ticks through a registry owned by this coordinator,
/// with all pipeline time reads served by its virtual clock.
pub struct ReplayCoordinator {
    registry: LaneRegistry,
    clock: Arc<VirtualClock>,
    control: ReplayControl,
}

impl ReplayCoordinator {
    pub fn new(
        config: Arc<EngineConfig>,
        events: broadcast::Sender<EngineEvent>,
        persist: PersistHandle,
    ) -> Self {
        let clock = Arc::new(VirtualClock::new(0));
        let registry = LaneRegistry::new(config, clock.clone(), events.clone(), persist);
        Self {
            registry,
            clock,
            control: ReplayControl::new(events),
        }
    }

    pub fn control(&self) -> ReplayControl {
        self.control.clone()
    }

    /// The virtual clock every pipeline component reads under replay.
    pub fn clock(&self) -> Arc<VirtualClock> {
        self.clock.clone()
    }

    /// Stream `ticks` (already sorted by timestamp) through the pipeline.
    /// Returns the terminal state. Lanes are drained and flushed before this
    /// returns, whatever the outcome.
    pub async fn run(&mut self, ticks: Vec<RawTick>, speed: f64) -> ReplayState {
        self.control.set_speed(speed);
        self.control.transition(ReplayState::Running);

        let mut prev_ts: Option<i64> = None;
        let total = ticks.len();
        let mut replayed = 0usize;

        for raw in ticks {
            if self.control.is_stopped() {
                break;
            }
            while self.control.is_paused() && !self.control.is_stopped() {
                // Re-check periodically; a resume between the flag check and
                // the await must not strand the loop.
                tokio::select! {
                    _ = self.control.inner.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
            if self.control.is_stopped() {
                break;
            }

            let Some(ts_ms) = raw.ts_ms else {
                // Malformed rows are the normalizer's problem; no pacing.
                self.registry.dispatch_gated(raw).await;
                continue;
            };

            if let Some(prev) = prev_ts {
                let delta_ms = (ts_ms - prev).max(0) as f64;
                let speed = self.control.speed();
                let wait = Duration::from_millis((delta_ms / speed) as u64);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            prev_ts = Some(ts_ms);

            self.clock.advance_to(ts_ms);
            self.registry.dispatch_gated(raw).await;
            replayed += 1;
        }

        let terminal = if self.control.is_stopped() {
            ReplayState::Stopped
        } else {
            ReplayState::Finished
        };

        self.registry.shutdown().await;
        self.control.transition(terminal);
        info!("replay {}: {}/{} ticks", terminal, replayed, total);
        terminal
    }
}

/// One row of a historical tick file: trade print plus up to five levels of
/// depth per side.
#[derive(Debug, Deserialize)]
struct ReplayRow {
    ts_ms: i64,
    price: f64,
    qty: i64,
    bid_price_1: Option<f64>,
    bid_qty_1: Option<i64>,
    bid_price_2: Option<f64>,
    bid_qty_2: Option<i64>,
    bid_price_3: Option<f64>,
    bid_qty_3: Option<i64>,
    bid_price_4: Option<f64>,
    bid_qty_4: Option<i64>,
    bid_price_5: Option<f64>,
    bid_qty_5: Option<i64>,
    ask_price_1: Option<f64>,
    ask_qty_1: Option<i64>,
    ask_price_2: Option<f64>,
    ask_qty_2: Option<i64>,
    ask_price_3: Option<f64>,
    ask_qty_3: Option<i64>,
    ask_price_4: Option<f64>,
    ask_qty_4: Option<i64>,
    ask_price_5: Option<f64>,
    ask_qty_5: Option<i64>,
}

impl ReplayRow {
    fn into_raw(self, instrument: &str) -> RawTick {
        let level = |p: Option<f64>, q: Option<i64>| RawDepthLevel { price: p, qty: q };
        let side = |levels: [(Option<f64>, Option<i64>); 5]| {
            levels
                .into_iter()
                .filter(|(p, q)| p.is_some() && q.is_some())
                .map(|(p, q)| level(p, q))
                .collect()
        };
        RawTick {
            instrument: Some(instrument.to_string()),
            price: Some(self.price),
            qty: Some(self.qty),
            ts_ms: Some(self.ts_ms),
            bids: side([
                (self.bid_price_1, self.bid_qty_1),
                (self.bid_price_2, self.bid_qty_2),
                (self.bid_price_3, self.bid_qty_3),
                (self.bid_price_4, self.bid_qty_4),
                (self.bid_price_5, self.bid_qty_5),
            ]),
            asks: side([
                (self.ask_price_1, self.ask_qty_1),
                (self.ask_price_2, self.ask_qty_2),
                (self.ask_price_3, self.ask_qty_3),
                (self.ask_price_4, self.ask_qty_4),
                (self.ask_price_5, self.ask_qty_5),
            ]),
        }
    }
}

/// Load `{instrument}_{date}.csv` for each instrument and merge the streams
/// in timestamp order. The sort is stable, so equal timestamps keep their
/// per-instrument file order.
pub fn load_ticks(data_dir: &Path, date: &str, instruments: &[String]) -> Result<Vec<RawTick>> {
    let mut ticks = Vec::new();
    for instrument in instruments {
        let path = data_dir.join(format!("{}_{}.csv", instrument, date));
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("opening tick file {:?}", path))?;
        let mut count = 0usize;
        for row in reader.deserialize::<ReplayRow>() {
            let row = row.with_context(|| format!("parsing tick row in {:?}", path))?;
            ticks.push(row.into_raw(instrument));
            count += 1;
        }
        info!("loaded {} ticks for {} from {:?}", count, instrument, path);
    }
    ticks.sort_by_key(|t| t.ts_ms);
    Ok(ticks)
}
