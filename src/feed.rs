//! Synthetic live feed.
//!
//! The production vendor adapter is an external collaborator; this feed
//! stands in for it so the live pipeline can be run end-to-end. It emits a
//! random-walk price with a five-level book and occasionally parks an
//! oversized resting order on one side, which is exactly the shape the wall
//! detector hunts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};

use crate::clock::Clock;
use crate::types::{RawDepthLevel, RawTick};

pub struct SimFeedConfig {
    pub instruments: Vec<String>,
    pub start_price: f64,
    pub tick_size: f64,
    /// Per-tick price volatility in ticks.
    pub volatility_ticks: f64,
    /// Probability per tick of planting a wall on one side.
    pub wall_probability: f64,
}

impl Default for SimFeedConfig {
    fn default() -> Self {
        Self {
            instruments: vec!["NIFTY-FUT".to_string()],
            start_price: 22_000.0,
            tick_size: 0.05,
            volatility_ticks: 2.0,
            wall_probability: 0.02,
        }
    }
}

pub struct SimFeed {
    config: SimFeedConfig,
    rng: StdRng,
    prices: Vec<f64>,
    step: Normal<f64>,
    qty: Poisson<f64>,
}

impl SimFeed {
    pub fn new(config: SimFeedConfig, seed: u64) -> Self {
        let step = Normal::new(0.0, config.volatility_ticks * config.tick_size)
            .expect("valid volatility");
        let qty = Poisson::new(40.0).expect("valid qty rate");
        let prices = vec![config.start_price; config.instruments.len()];
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            prices,
            step,
            qty,
        }
    }

    /// One batch of ticks, one per instrument, stamped with the given time.
    pub fn next_batch(&mut self, ts_ms: i64) -> Vec<RawTick> {
        (0..self.config.instruments.len())
            .map(|i| self.next_tick(i, ts_ms))
            .collect()
    }

    fn next_tick(&mut self, idx: usize, ts_ms: i64) -> RawTick {
        let tick_size = self.config.tick_size;
        let drift = self.step.sample(&mut self.rng);
        let price = ((self.prices[idx] + drift) / tick_size).round() * tick_size;
        self.prices[idx] = price;

        let qty = self.qty.sample(&mut self.rng) as i64;
        let wall_side = if self.rng.gen_bool(self.config.wall_probability) {
            Some(self.rng.gen_bool(0.5))
        } else {
            None
        };

        let mut bids = Vec::with_capacity(5);
        let mut asks = Vec::with_capacity(5);
        for level in 1..=5i64 {
            let base: i64 = self.rng.gen_range(50..200);
            let bid_qty = match wall_side {
                Some(true) if level == 2 => base * 10,
                _ => base,
            };
            let ask_qty = match wall_side {
                Some(false) if level == 2 => base * 10,
                _ => base,
            };
            bids.push(RawDepthLevel {
                price: Some(price - level as f64 * tick_size),
                qty: Some(bid_qty),
            });
            asks.push(RawDepthLevel {
                price: Some(price + level as f64 * tick_size),
                qty: Some(ask_qty),
            });
        }

        RawTick {
            instrument: Some(self.config.instruments[idx].clone()),
            price: Some(price),
            qty: Some(qty),
            ts_ms: Some(ts_ms),
            bids,
            asks,
        }
    }
}

/// Run the feed against the registry until shutdown is signalled.
pub async fn run_sim_feed(
    mut feed: SimFeed,
    registry: &mut crate::registry::LaneRegistry,
    clock: std::sync::Arc<dyn Clock>,
    interval_ms: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ts_ms = clock.now_ms();
                for raw in feed.next_batch(ts_ms) {
                    registry.dispatch(raw).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
