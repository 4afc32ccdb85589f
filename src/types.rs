use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::bars::Bar;

/// One resting level of the order book, best-first in the containing Vec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: u64,
}

/// Loose tick shape as the feed adapter delivers it. Every field the feed
/// may omit is optional here; `TickNormalizer` decides what is acceptable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTick {
    #[serde(rename = "instrumentKey")]
    pub instrument: Option<String>,
    pub price: Option<f64>,
    pub qty: Option<i64>,
    #[serde(rename = "timestampMs")]
    pub ts_ms: Option<i64>,
    #[serde(default)]
    pub bids: Vec<RawDepthLevel>,
    #[serde(default)]
    pub asks: Vec<RawDepthLevel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDepthLevel {
    pub price: Option<f64>,
    pub qty: Option<i64>,
}

/// Canonical market update for one instrument. `qty` is the last traded
/// quantity and may be 0 for quote-only updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub price: f64,
    pub qty: u64,
    pub ts_ms: i64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl Tick {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// True when this tick carries an actual trade print.
    pub fn is_trade(&self) -> bool {
        self.qty > 0
    }
}

/// Side of the order book a wall rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookSide::Bid => write!(f, "BID"),
            BookSide::Ask => write!(f, "ASK"),
        }
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Candidate signal kinds produced by the order flow detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    FailedAuctionBuy,
    FailedAuctionSell,
}

impl SignalKind {
    pub fn side(self) -> Side {
        match self {
            SignalKind::FailedAuctionBuy => Side::Long,
            SignalKind::FailedAuctionSell => Side::Short,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::FailedAuctionBuy => write!(f, "FAILED_AUCTION_BUY"),
            SignalKind::FailedAuctionSell => write!(f, "FAILED_AUCTION_SELL"),
        }
    }
}

/// A candidate produced by the detector, not yet confirmed.
#[derive(Debug, Clone)]
pub struct CandidateSignal {
    pub instrument: String,
    pub kind: SignalKind,
    /// Price at the moment the candidate fired.
    pub price: f64,
    /// The broken wall price that was reclaimed.
    pub wall_price: f64,
    pub ts_ms: i64,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    SlHit,
    TpHit,
    TimeStop,
    Reversal,
    Shutdown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::SlHit => write!(f, "SL_HIT"),
            ExitReason::TpHit => write!(f, "TP_HIT"),
            ExitReason::TimeStop => write!(f, "TIME_STOP"),
            ExitReason::Reversal => write!(f, "REVERSAL"),
            ExitReason::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Immutable entry event, emitted once per position open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub trade_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: u64,
    pub reason: String,
    pub ts_ms: i64,
}

/// Immutable exit event. `pnl` is signed: positive means the trade won.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExit {
    pub trade_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: u64,
    pub pnl: f64,
    pub reason: ExitReason,
    pub ts_ms: i64,
}

/// Replay control status, emitted on every control transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplayStatus {
    pub active: bool,
    pub paused: bool,
    pub speed: f64,
}

/// Events broadcast to observers (UI, loggers). One channel carries the
/// whole pipeline output so replay and live observers see the same stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    BarClosed(Bar),
    /// Throttled snapshot of the in-progress bar.
    BarSnapshot(Bar),
    WallDetected {
        instrument: String,
        side: BookSide,
        price: f64,
        qty: u64,
    },
    WallBroken {
        instrument: String,
        side: BookSide,
        price: f64,
        durability_sec: f64,
    },
    Absorption {
        instrument: String,
        side: BookSide,
        price: f64,
        absorbed_qty: u64,
    },
    Entry(TradeSignal),
    Exit(TradeExit),
    Replay(ReplayStatus),
}

/// Record shapes handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkRecord {
    #[serde(rename = "ENTRY")]
    Entry {
        #[serde(rename = "instrumentKey")]
        instrument_key: String,
        #[serde(rename = "tradeId")]
        trade_id: Uuid,
        timestamp: i64,
        price: f64,
        position_after: String,
        sl_price: f64,
        tp_price: f64,
        quantity: u64,
        reason: String,
    },
    #[serde(rename = "EXIT")]
    Exit {
        #[serde(rename = "instrumentKey")]
        instrument_key: String,
        #[serde(rename = "tradeId")]
        trade_id: Uuid,
        timestamp: i64,
        exit_price: f64,
        entry_price: f64,
        position_closed: String,
        pnl: f64,
        reason_code: String,
        quantity: u64,
    },
    #[serde(rename = "BAR")]
    BarClose {
        #[serde(rename = "instrumentKey")]
        instrument_key: String,
        timestamp: i64,
        close: f64,
        volume: u64,
        cvd: i64,
    },
}

impl SinkRecord {
    pub fn instrument(&self) -> &str {
        match self {
            SinkRecord::Entry { instrument_key, .. } => instrument_key,
            SinkRecord::Exit { instrument_key, .. } => instrument_key,
            SinkRecord::BarClose { instrument_key, .. } => instrument_key,
        }
    }

    /// Bar records are throttled per instrument; trade records never are.
    pub fn is_throttled(&self) -> bool {
        matches!(self, SinkRecord::BarClose { .. })
    }
}

impl From<&TradeSignal> for SinkRecord {
    fn from(s: &TradeSignal) -> Self {
        SinkRecord::Entry {
            instrument_key: s.instrument.clone(),
            trade_id: s.trade_id,
            timestamp: s.ts_ms,
            price: s.price,
            position_after: match s.side {
                Side::Long => "BUY".to_string(),
                Side::Short => "SELL".to_string(),
            },
            sl_price: s.stop_loss,
            tp_price: s.take_profit,
            quantity: s.quantity,
            reason: s.reason.clone(),
        }
    }
}

impl From<&TradeExit> for SinkRecord {
    fn from(e: &TradeExit) -> Self {
        SinkRecord::Exit {
            instrument_key: e.instrument.clone(),
            trade_id: e.trade_id,
            timestamp: e.ts_ms,
            exit_price: e.exit_price,
            entry_price: e.entry_price,
            position_closed: e.side.to_string(),
            pnl: e.pnl,
            reason_code: e.reason.to_string(),
            quantity: e.quantity,
        }
    }
}
