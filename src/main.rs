use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use wallflow::clock::{Clock, SystemClock};
use wallflow::config::EngineConfig;
use wallflow::feed::{run_sim_feed, SimFeed, SimFeedConfig};
use wallflow::persist::{spawn_writer, JsonlSink, PersistHandle};
use wallflow::registry::LaneRegistry;
use wallflow::replay::{load_ticks, ReplayCoordinator};
use wallflow::types::EngineEvent;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Signal sink output file (JSONL)
    #[arg(long, default_value = "signals.jsonl", env = "WALLFLOW_SINK")]
    sink: PathBuf,

    /// Bar aggregation interval in seconds
    #[arg(long, default_value = "60")]
    bar_interval: u32,

    /// Contracts/lots per entry
    #[arg(long, default_value = "1")]
    qty: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the live pipeline against the synthetic feed
    Live {
        /// Instruments to trade (comma-separated)
        #[arg(short, long, default_value = "NIFTY-FUT,BANKNIFTY-FUT")]
        symbols: String,

        /// Milliseconds between synthetic ticks
        #[arg(long, default_value = "250")]
        interval_ms: u64,

        /// Feed RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Replay historical ticks through the identical pipeline
    Replay {
        /// Session date (YYYY-MM-DD), selects the tick files
        #[arg(short, long)]
        date: String,

        /// Instruments to replay (comma-separated)
        #[arg(short, long, default_value = "NIFTY-FUT")]
        symbols: String,

        /// Time compression factor
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Directory holding {instrument}_{date}.csv tick files
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wallflow=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = EngineConfig {
        bar_interval_sec: args.bar_interval as i64,
        default_qty: args.qty,
        ..EngineConfig::default()
    };
    config.validate().context("invalid engine configuration")?;
    let config = Arc::new(config);

    let (events, _rx) = broadcast::channel::<EngineEvent>(4096);
    spawn_event_logger(events.subscribe());

    match args.command {
        Command::Live {
            symbols,
            interval_ms,
            seed,
        } => run_live(config, events, args.sink, parse_symbols(&symbols), interval_ms, seed).await,
        Command::Replay {
            date,
            symbols,
            speed,
            data_dir,
        } => {
            run_replay(
                config,
                events,
                args.sink,
                data_dir,
                date,
                parse_symbols(&symbols),
                speed,
            )
            .await
        }
    }
}

async fn run_live(
    config: Arc<EngineConfig>,
    events: broadcast::Sender<EngineEvent>,
    sink_path: PathBuf,
    symbols: Vec<String>,
    interval_ms: u64,
    seed: u64,
) -> Result<()> {
    info!("=== LIVE PIPELINE ===");
    info!("Instruments: {:?}", symbols);
    info!("Sink: {:?}", sink_path);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let sink = JsonlSink::create(&sink_path)?;
    let persist = PersistHandle::new(config.persist_queue_depth);
    let writer = spawn_writer(
        &persist,
        Box::new(sink),
        clock.clone(),
        config.persist_throttle_ms,
    );

    let mut registry = LaneRegistry::new(config.clone(), clock.clone(), events, persist.clone());

    let feed = SimFeed::new(
        SimFeedConfig {
            instruments: symbols,
            ..SimFeedConfig::default()
        },
        seed,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    run_sim_feed(feed, &mut registry, clock, interval_ms, shutdown_rx).await;

    registry.shutdown().await;
    persist.close();
    writer.await.ok();
    info!("live pipeline stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_replay(
    config: Arc<EngineConfig>,
    events: broadcast::Sender<EngineEvent>,
    sink_path: PathBuf,
    data_dir: PathBuf,
    date: String,
    symbols: Vec<String>,
    speed: f64,
) -> Result<()> {
    info!("=== REPLAY ===");
    info!("Date: {} | Speed: {}x | Instruments: {:?}", date, speed, symbols);

    let ticks = load_ticks(&data_dir, &date, &symbols)?;
    if ticks.is_empty() {
        anyhow::bail!("no ticks found under {:?} for {}", data_dir, date);
    }
    info!("Loaded {} ticks", ticks.len());

    let sink = JsonlSink::create(&sink_path)?;
    let persist = PersistHandle::new(config.persist_queue_depth);

    let mut coordinator = ReplayCoordinator::new(config.clone(), events, persist.clone());

    // Replay throttling must run on simulated time, so the writer shares
    // the coordinator's virtual clock.
    let writer = spawn_writer(
        &persist,
        Box::new(sink),
        coordinator.clock(),
        config.persist_throttle_ms,
    );

    spawn_control_reader(coordinator.control());

    let terminal = coordinator.run(ticks, speed).await;

    persist.close();
    writer.await.ok();
    info!("replay ended: {}", terminal);
    Ok(())
}

/// Map operator stdin lines onto the replay control surface.
fn spawn_control_reader(control: wallflow::replay::ReplayControl) {
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("pause") => control.pause(),
                Some("resume") => control.resume(),
                Some("stop") => {
                    control.stop();
                    break;
                }
                Some("speed") => match parts.next().and_then(|v| v.parse::<f64>().ok()) {
                    Some(speed) => control.set_speed(speed),
                    None => warn!("usage: speed <factor>"),
                },
                Some(other) => warn!("unknown replay command '{}'", other),
                None => {}
            }
        }
    });
}

/// Keep one subscriber draining the event stream and surface the headline
/// events in the log.
fn spawn_event_logger(mut rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::Entry(signal)) => {
                    info!(
                        "observer: ENTRY {} {} @ {:.2} ({})",
                        signal.instrument, signal.side, signal.price, signal.reason
                    );
                }
                Ok(EngineEvent::Exit(exit)) => {
                    info!(
                        "observer: EXIT {} {} @ {:.2} pnl {:+.2} ({})",
                        exit.instrument, exit.side, exit.exit_price, exit.pnl, exit.reason
                    );
                }
                Ok(EngineEvent::Replay(status)) => {
                    info!(
                        "observer: replay active={} paused={} speed={}",
                        status.active, status.paused, status.speed
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("observer lagged, {} events missed", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
