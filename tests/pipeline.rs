//! End-to-end pipeline scenarios driven through the public API: the full
//! wall -> break -> reclaim -> confirmation -> position round trip, and the
//! live/replay determinism property.

use std::sync::Arc;

use tokio::sync::broadcast;

use wallflow::clock::VirtualClock;
use wallflow::config::EngineConfig;
use wallflow::persist::PersistHandle;
use wallflow::registry::LaneRegistry;
use wallflow::replay::{ReplayCoordinator, ReplayState};
use wallflow::types::{EngineEvent, RawDepthLevel, RawTick, SinkRecord};

const INSTRUMENT: &str = "NIFTY-FUT";

fn lv(price: f64, qty: i64) -> RawDepthLevel {
    RawDepthLevel {
        price: Some(price),
        qty: Some(qty),
    }
}

fn tick(
    ts_ms: i64,
    price: f64,
    qty: i64,
    bids: Vec<RawDepthLevel>,
    asks: Vec<RawDepthLevel>,
) -> RawTick {
    RawTick {
        instrument: Some(INSTRUMENT.to_string()),
        price: Some(price),
        qty: Some(qty),
        ts_ms: Some(ts_ms),
        bids,
        asks,
    }
}

fn balanced_book(price: f64) -> (Vec<RawDepthLevel>, Vec<RawDepthLevel>) {
    (
        vec![lv(price - 0.5, 100), lv(price - 1.0, 100)],
        vec![lv(price + 0.5, 100), lv(price + 1.0, 100)],
    )
}

/// Scripted session: 20 closed bars of warm-up (regime window + a bullish
/// engulfing pair), then a bid wall at 99 that breaks and is reclaimed 45
/// seconds later with a supportive book, then a push through take-profit.
fn fixture_ticks() -> Vec<RawTick> {
    let mut ticks = Vec::new();

    // 18 one-tick bars alternating around 99.3 so the EMA band brackets the
    // reclaim price.
    for i in 0..18i64 {
        let price = if i % 2 == 0 { 98.0 } else { 100.6 };
        let (bids, asks) = balanced_book(price);
        ticks.push(tick(i * 60_000 + 1_000, price, 10, bids, asks));
    }

    // Bearish bar.
    let (bids, asks) = balanced_book(100.0);
    ticks.push(tick(18 * 60_000 + 1_000, 100.0, 10, bids.clone(), asks.clone()));
    let (bids, asks) = balanced_book(99.0);
    ticks.push(tick(18 * 60_000 + 30_000, 99.0, 10, bids, asks));

    // Bullish engulfing bar.
    let (bids, asks) = balanced_book(98.9);
    ticks.push(tick(19 * 60_000 + 1_000, 98.9, 10, bids, asks));
    let (bids, asks) = balanced_book(100.1);
    ticks.push(tick(19 * 60_000 + 30_000, 100.1, 10, bids, asks));

    let wall_start = 20 * 60_000;
    let walled_bids = vec![lv(99.0, 1000), lv(98.5, 100), lv(98.0, 100)];
    let asks = vec![lv(100.5, 100), lv(101.0, 100)];

    // t0: a 10x bid wall rests at 99.
    ticks.push(tick(wall_start, 100.0, 10, walled_bids.clone(), asks.clone()));
    // t0+5s: price trades through the wall.
    ticks.push(tick(wall_start + 5_000, 98.5, 50, walled_bids, asks.clone()));
    // t0+10s: the wall is gone from the book: BROKEN.
    ticks.push(tick(
        wall_start + 10_000,
        98.5,
        0,
        vec![lv(98.4, 100), lv(98.3, 100)],
        asks,
    ));
    // t0+55s (45s after the break): price reclaims 99 on a bid-heavy book.
    ticks.push(tick(
        wall_start + 55_000,
        99.3,
        20,
        vec![lv(99.0, 150), lv(98.5, 150)],
        vec![lv(99.5, 100), lv(100.0, 100)],
    ));
    // Push through take-profit (99.3 + 1.5 * 2.3 = 102.75).
    let (bids, asks) = balanced_book(102.8);
    ticks.push(tick(wall_start + 58_000, 102.8, 10, bids, asks));

    ticks
}

/// Run the fixture through the live-mode registry with a mocked clock
/// advanced to each tick's timestamp. Returns (events, sink records).
async fn run_live_mode(ticks: Vec<RawTick>) -> (Vec<EngineEvent>, Vec<SinkRecord>) {
    let config = Arc::new(EngineConfig::default());
    let clock = Arc::new(VirtualClock::new(0));
    let (events_tx, mut events_rx) = broadcast::channel(8192);
    let persist = PersistHandle::new(8192);

    let mut registry = LaneRegistry::new(config, clock.clone(), events_tx, persist.clone());
    for raw in ticks {
        if let Some(ts) = raw.ts_ms {
            clock.advance_to(ts);
        }
        registry.dispatch_gated(raw).await;
    }
    registry.shutdown().await;

    let mut events = Vec::new();
    while let Ok(e) = events_rx.try_recv() {
        events.push(e);
    }
    (events, persist.drain())
}

/// Strip volatile fields (trade ids) so live and replay runs can be compared.
fn normalize(records: &[SinkRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r {
            SinkRecord::Entry {
                instrument_key,
                timestamp,
                price,
                position_after,
                sl_price,
                tp_price,
                quantity,
                reason,
                ..
            } => Some(format!(
                "ENTRY|{}|{}|{}|{}|{}|{}|{}|{}",
                instrument_key, timestamp, price, position_after, sl_price, tp_price, quantity, reason
            )),
            SinkRecord::Exit {
                instrument_key,
                timestamp,
                exit_price,
                entry_price,
                position_closed,
                pnl,
                reason_code,
                quantity,
                ..
            } => Some(format!(
                "EXIT|{}|{}|{}|{}|{}|{}|{}|{}",
                instrument_key,
                timestamp,
                exit_price,
                entry_price,
                position_closed,
                pnl,
                reason_code,
                quantity
            )),
            SinkRecord::BarClose { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn test_failed_auction_round_trip() {
    let (events, records) = run_live_mode(fixture_ticks()).await;

    // Exactly one entry, at the reclaim, not at the break.
    let entries: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Entry(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(entries.len(), 1, "expected one confirmed entry");
    let entry = entries[0];
    assert_eq!(entry.reason, "FAILED_AUCTION_BUY");
    assert_eq!(entry.ts_ms, 20 * 60_000 + 55_000);
    assert!((entry.price - 99.3).abs() < 1e-9);
    // Stop one buffer under the broken wall, target at 1.5R.
    assert!((entry.stop_loss - 97.0).abs() < 1e-9);
    assert!((entry.take_profit - 102.75).abs() < 1e-9);

    // The wall break was observed before the entry.
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::WallBroken { price, .. } if (*price - 99.0).abs() < 1e-9
    )));

    // The push to 102.8 takes profit.
    let exits: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Exit(x) => Some(x),
            _ => None,
        })
        .collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].trade_id, entry.trade_id);
    assert!((exits[0].exit_price - 102.75).abs() < 1e-9);
    assert!((exits[0].pnl - 3.45).abs() < 1e-9);

    // Sink saw the same round trip.
    let normalized = normalize(&records);
    assert_eq!(normalized.len(), 2);
    assert!(normalized[0].starts_with("ENTRY|"));
    assert!(normalized[1].starts_with("EXIT|"));
}

#[tokio::test(start_paused = true)]
async fn test_replay_matches_live_at_any_speed() {
    let (_, live_records) = run_live_mode(fixture_ticks()).await;
    let live = normalize(&live_records);
    assert!(!live.is_empty(), "fixture must produce trades");

    for speed in [1.0, 500.0] {
        let config = Arc::new(EngineConfig::default());
        let (events_tx, _events_rx) = broadcast::channel(8192);
        let persist = PersistHandle::new(8192);
        let mut coordinator = ReplayCoordinator::new(config, events_tx, persist.clone());

        let state = coordinator.run(fixture_ticks(), speed).await;
        assert_eq!(state, ReplayState::Finished);

        let replayed = normalize(&persist.drain());
        assert_eq!(
            replayed, live,
            "replay at {}x diverged from live pipeline",
            speed
        );
    }
}
