//! Core pipeline: tick -> bar -> order flow state -> signal -> position.
//!
//! Everything here is synchronous, per-instrument state driven one tick at a
//! time. The async world (lanes, feeds, replay, persistence) lives outside
//! and owns these pieces through [`lane::InstrumentLane`].

pub mod bars;
pub mod confirm;
pub mod lane;
pub mod normalizer;
pub mod patterns;
pub mod regime;
pub mod risk;
pub mod walls;

pub use bars::{Bar, BarAggregator, FootprintCell};
pub use confirm::{ConfirmedEntry, SignalConfirmer};
pub use lane::InstrumentLane;
pub use normalizer::TickNormalizer;
pub use regime::{Regime, RegimeTracker};
pub use risk::{Position, PositionRiskManager, RiskEvent};
pub use walls::{BrokenWall, FlowEvent, OrderFlowDetector, WallState};
