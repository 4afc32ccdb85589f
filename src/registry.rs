//! Instrument lane registry.
//!
//! One bounded channel and one task per instrument: every tick for an
//! instrument is processed by exactly one lane, strictly in arrival order.
//! Lanes for different instruments run concurrently. Lanes are created on
//! the first tick for an unknown instrument and torn down on unsubscribe or
//! shutdown; shutdown drains each lane's in-flight ticks and flushes open
//! bar/position state before returning.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::{InstrumentLane, TickNormalizer};
use crate::persist::PersistHandle;
use crate::types::{EngineEvent, RawTick, Tick};

const LANE_QUEUE_DEPTH: usize = 1024;

/// A tick plus an optional completion ack. Replay acks every tick so a
/// cooperative stop never leaves one half-applied; live feeds fire and
/// forget.
type LaneMsg = (Tick, Option<tokio::sync::oneshot::Sender<()>>);

struct LaneHandle {
    tx: mpsc::Sender<LaneMsg>,
    task: JoinHandle<()>,
}

pub struct LaneRegistry {
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<EngineEvent>,
    persist: PersistHandle,
    normalizer: TickNormalizer,
    lanes: HashMap<String, LaneHandle>,
    refused: u64,
}

impl LaneRegistry {
    pub fn new(
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<EngineEvent>,
        persist: PersistHandle,
    ) -> Self {
        Self {
            config,
            clock,
            events,
            persist,
            normalizer: TickNormalizer::new(),
            lanes: HashMap::new(),
            refused: 0,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Validate and route one raw tick to its instrument lane, creating the
    /// lane on first contact. Awaits only when the lane's queue is full,
    /// which backpressures the feed, never another lane.
    pub async fn dispatch(&mut self, raw: RawTick) {
        self.route(raw, None).await;
    }

    /// Dispatch and wait until the lane has fully applied the tick. The
    /// replay coordinator uses this so simulated time never runs ahead of
    /// lane state and a stop is always tick-atomic.
    pub async fn dispatch_gated(&mut self, raw: RawTick) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.route(raw, Some(ack_tx)).await {
            let _ = ack_rx.await;
        }
    }

    async fn route(&mut self, raw: RawTick, ack: Option<tokio::sync::oneshot::Sender<()>>) -> bool {
        let Some(tick) = self.normalizer.normalize(raw) else {
            return false;
        };

        if !self.lanes.contains_key(&tick.instrument) {
            if self.lanes.len() >= self.config.max_instruments {
                self.refused += 1;
                if self.refused % 1000 == 1 {
                    warn!(
                        "instrument limit {} reached, refusing ticks for {}",
                        self.config.max_instruments, tick.instrument
                    );
                }
                return false;
            }
            let handle = self.spawn_lane(&tick.instrument);
            self.lanes.insert(tick.instrument.clone(), handle);
        }

        let lane = self.lanes.get(&tick.instrument).expect("lane just ensured");
        if lane.tx.send((tick, ack)).await.is_err() {
            warn!("lane channel closed, tick dropped");
            return false;
        }
        true
    }

    fn spawn_lane(&self, instrument: &str) -> LaneHandle {
        info!("creating lane for {}", instrument);
        let (tx, mut rx) = mpsc::channel::<LaneMsg>(LANE_QUEUE_DEPTH);
        let mut lane = InstrumentLane::new(
            instrument,
            &self.config,
            self.clock.clone(),
            self.events.clone(),
            self.persist.clone(),
        );

        let task = tokio::spawn(async move {
            while let Some((tick, ack)) = rx.recv().await {
                lane.on_tick(&tick);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            lane.flush();
            info!("lane {} stopped, {} trades", lane.instrument(), lane.stats().trades);
        });

        LaneHandle { tx, task }
    }

    /// Tear down one instrument's lane, flushing its state.
    pub async fn unsubscribe(&mut self, instrument: &str) {
        if let Some(handle) = self.lanes.remove(instrument) {
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                warn!("lane {} shutdown error: {}", instrument, e);
            }
        }
    }

    /// Graceful shutdown: stop accepting ticks, drain every lane, flush.
    pub async fn shutdown(&mut self) {
        let instruments: Vec<String> = self.lanes.keys().cloned().collect();
        for instrument in instruments {
            self.unsubscribe(&instrument).await;
        }
        info!(
            "registry stopped ({} ticks accepted, {} rejected)",
            self.normalizer.accepted(),
            self.normalizer.rejected()
        );
    }
}
