//! Order flow detection: resting-order walls, absorption, and failed auctions.
//!
//! Wall lifecycle per side, per instrument:
//! NO_WALL -> WALL_ACTIVE -> (BROKEN | GONE) -> NO_WALL
//!
//! A wall registers when the largest visible level on one side dwarfs the
//! mean of the remaining levels (`big_wall_ratio`). Traded volume at the
//! wall price accumulates toward absorption events. A wall whose ratio
//! condition stops holding exits as BROKEN when price has traded through it
//! (recorded, reclaim-eligible) or as GONE when it merely faded (no record).
//! A broken wall older than `min_wall_durability_sec` that price re-crosses
//! in the opposite direction of the break fires exactly one failed-auction
//! candidate.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::types::{BookSide, CandidateSignal, DepthLevel, SignalKind, Tick};

/// An active wall on one side of the book. Replaced or cleared on price
/// changes, never mutated in place across a price change.
#[derive(Debug, Clone)]
pub struct WallState {
    pub price: f64,
    pub qty: u64,
    pub created_at_ms: i64,
    /// Volume traded at the wall price since the last absorption event.
    pub tested_volume: u64,
    /// Set once a trade prints through the wall price while it is active.
    traded_through: bool,
}

/// A wall that disappeared because price traded through it.
#[derive(Debug, Clone)]
pub struct BrokenWall {
    pub price: f64,
    pub side: BookSide,
    pub broken_at_ms: i64,
    /// Seconds the wall existed before breaking.
    pub durability_sec: f64,
    /// False once this record has fired a reclaim candidate.
    pub active: bool,
}

/// Transitions and events produced while consuming one tick.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    WallDetected {
        side: BookSide,
        price: f64,
        qty: u64,
    },
    /// Same price, larger size: the wall was topped up, not replaced.
    WallReload {
        side: BookSide,
        price: f64,
        qty: u64,
    },
    Absorption {
        side: BookSide,
        price: f64,
        absorbed_qty: u64,
    },
    WallBroken {
        side: BookSide,
        price: f64,
        durability_sec: f64,
    },
    /// Ratio stopped holding without a trade-through; nothing recorded.
    WallFaded {
        side: BookSide,
        price: f64,
    },
    FailedAuction(CandidateSignal),
}

/// Per-instrument wall/absorption/reclaim state machine.
#[derive(Debug)]
pub struct OrderFlowDetector {
    instrument: String,
    big_wall_ratio: f64,
    absorption_min_qty: u64,
    min_wall_durability_ms: i64,
    history_cap: usize,
    bid_wall: Option<WallState>,
    ask_wall: Option<WallState>,
    broken: VecDeque<BrokenWall>,
}

impl OrderFlowDetector {
    pub fn new(instrument: &str, config: &EngineConfig) -> Self {
        Self {
            instrument: instrument.to_string(),
            big_wall_ratio: config.big_wall_ratio,
            absorption_min_qty: config.absorption_min_qty,
            min_wall_durability_ms: config.min_wall_durability_sec * 1000,
            history_cap: config.broken_wall_history,
            bid_wall: None,
            ask_wall: None,
            broken: VecDeque::new(),
        }
    }

    pub fn wall(&self, side: BookSide) -> Option<&WallState> {
        match side {
            BookSide::Bid => self.bid_wall.as_ref(),
            BookSide::Ask => self.ask_wall.as_ref(),
        }
    }

    pub fn broken_walls(&self) -> &VecDeque<BrokenWall> {
        &self.broken
    }

    /// Drop all wall state for this instrument. Used on state corruption.
    pub fn reset(&mut self) {
        self.bid_wall = None;
        self.ask_wall = None;
        self.broken.clear();
    }

    /// Consume one tick: update absorption and trade-through state from the
    /// trade print, check broken walls for reclaims, then re-evaluate both
    /// book sides against the current snapshot.
    pub fn on_tick(&mut self, tick: &Tick, now_ms: i64) -> Vec<FlowEvent> {
        let mut events = Vec::new();

        if tick.is_trade() {
            self.apply_trade(tick, &mut events);
            self.check_reclaims(tick, now_ms, &mut events);
        }

        self.evaluate_side(BookSide::Bid, &tick.bids, now_ms, &mut events);
        self.evaluate_side(BookSide::Ask, &tick.asks, now_ms, &mut events);

        events
    }

    fn apply_trade(&mut self, tick: &Tick, events: &mut Vec<FlowEvent>) {
        let absorption_min = self.absorption_min_qty;
        let instrument = self.instrument.clone();

        for (side, wall) in [
            (BookSide::Bid, self.bid_wall.as_mut()),
            (BookSide::Ask, self.ask_wall.as_mut()),
        ] {
            let Some(wall) = wall else { continue };

            let through = match side {
                BookSide::Bid => tick.price < wall.price,
                BookSide::Ask => tick.price > wall.price,
            };
            if through {
                wall.traded_through = true;
            }

            // Absorption accumulates only on trades exactly at the wall.
            if (tick.price - wall.price).abs() < f64::EPSILON {
                wall.tested_volume += tick.qty;
                if wall.tested_volume > absorption_min {
                    let absorbed = wall.tested_volume;
                    wall.tested_volume = 0;
                    info!(
                        "ABSORPTION_{} [{}]: {} absorbed at {:.2}",
                        side, instrument, absorbed, wall.price
                    );
                    events.push(FlowEvent::Absorption {
                        side,
                        price: wall.price,
                        absorbed_qty: absorbed,
                    });
                }
            }
        }
    }

    fn check_reclaims(&mut self, tick: &Tick, now_ms: i64, events: &mut Vec<FlowEvent>) {
        let min_age = self.min_wall_durability_ms;
        for bw in self.broken.iter_mut().filter(|b| b.active) {
            if now_ms - bw.broken_at_ms < min_age {
                continue;
            }
            let reclaimed = match bw.side {
                // A bid-wall break is reclaimed when price rises back above it.
                BookSide::Bid => tick.price > bw.price,
                BookSide::Ask => tick.price < bw.price,
            };
            if reclaimed {
                bw.active = false;
                let kind = match bw.side {
                    BookSide::Bid => SignalKind::FailedAuctionBuy,
                    BookSide::Ask => SignalKind::FailedAuctionSell,
                };
                info!(
                    "{} [{}]: reclaimed {:.2} wall at {:.2}",
                    kind, self.instrument, bw.price, tick.price
                );
                events.push(FlowEvent::FailedAuction(CandidateSignal {
                    instrument: self.instrument.clone(),
                    kind,
                    price: tick.price,
                    wall_price: bw.price,
                    ts_ms: tick.ts_ms,
                }));
            }
        }
    }

    fn evaluate_side(
        &mut self,
        side: BookSide,
        levels: &[DepthLevel],
        now_ms: i64,
        events: &mut Vec<FlowEvent>,
    ) {
        let candidate = find_wall_level(levels, self.big_wall_ratio);
        let existing = match side {
            BookSide::Bid => self.bid_wall.take(),
            BookSide::Ask => self.ask_wall.take(),
        };

        let next = match (existing, candidate) {
            (None, None) => None,
            (None, Some(level)) => {
                info!(
                    "WALL [{}]: {} {}@{:.2}",
                    self.instrument, side, level.qty, level.price
                );
                events.push(FlowEvent::WallDetected {
                    side,
                    price: level.price,
                    qty: level.qty,
                });
                Some(WallState {
                    price: level.price,
                    qty: level.qty,
                    created_at_ms: now_ms,
                    tested_volume: 0,
                    traded_through: false,
                })
            }
            (Some(wall), Some(level)) if (wall.price - level.price).abs() < f64::EPSILON => {
                // Same price: a larger size is a reload, not a new wall.
                if level.qty > wall.qty {
                    debug!(
                        "WALL RELOAD [{}]: {} {:.2} {} -> {}",
                        self.instrument, side, wall.price, wall.qty, level.qty
                    );
                    events.push(FlowEvent::WallReload {
                        side,
                        price: level.price,
                        qty: level.qty,
                    });
                }
                Some(WallState {
                    qty: level.qty,
                    ..wall
                })
            }
            (Some(_), Some(level)) => {
                // Different price: implicit cancellation of the old wall,
                // never a break.
                info!(
                    "WALL [{}]: {} moved to {}@{:.2}",
                    self.instrument, side, level.qty, level.price
                );
                events.push(FlowEvent::WallDetected {
                    side,
                    price: level.price,
                    qty: level.qty,
                });
                Some(WallState {
                    price: level.price,
                    qty: level.qty,
                    created_at_ms: now_ms,
                    tested_volume: 0,
                    traded_through: false,
                })
            }
            (Some(wall), None) => {
                if wall.traded_through {
                    let durability_sec = (now_ms - wall.created_at_ms) as f64 / 1000.0;
                    info!(
                        "WALL BROKEN [{}]: {} {:.2} after {:.1}s",
                        self.instrument, side, wall.price, durability_sec
                    );
                    events.push(FlowEvent::WallBroken {
                        side,
                        price: wall.price,
                        durability_sec,
                    });
                    self.broken.push_back(BrokenWall {
                        price: wall.price,
                        side,
                        broken_at_ms: now_ms,
                        durability_sec,
                        active: true,
                    });
                    while self.broken.len() > self.history_cap {
                        self.broken.pop_front();
                    }
                } else {
                    debug!(
                        "WALL FADED [{}]: {} {:.2}",
                        self.instrument, side, wall.price
                    );
                    events.push(FlowEvent::WallFaded {
                        side,
                        price: wall.price,
                    });
                }
                None
            }
        };

        match side {
            BookSide::Bid => self.bid_wall = next,
            BookSide::Ask => self.ask_wall = next,
        }
    }
}

/// Pick the wall level of one book side: the largest level, if it is at
/// least `ratio` times the mean of the remaining levels. Needs two or more
/// levels; a lone order has nothing to dwarf.
fn find_wall_level(levels: &[DepthLevel], ratio: f64) -> Option<DepthLevel> {
    if levels.len() < 2 {
        return None;
    }
    let max = levels
        .iter()
        .copied()
        .max_by_key(|l| l.qty)
        .expect("non-empty levels");
    let rest_sum: u64 = levels
        .iter()
        .filter(|l| l.price != max.price)
        .map(|l| l.qty)
        .sum();
    let rest_count = levels.iter().filter(|l| l.price != max.price).count();
    if rest_count == 0 {
        return None;
    }
    let avg_others = rest_sum as f64 / rest_count as f64;
    if avg_others > 0.0 && max.qty as f64 / avg_others >= ratio {
        Some(max)
    } else {
        None
    }
}
