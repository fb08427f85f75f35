//! readgate-stress: many readers on pooled slots, one writer that pauses them
//! with the barrier before each compaction.
//!
//! Prints a JSON report on stdout. Exit code 2 for usage errors, 1 if the run
//! fails or a write ever overlapped an open read.

mod engine;

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use futures::future::try_join_all;
use readgate::{ConcurrencyManager, Error, ManagerConfig, ManagerSnapshot};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::engine::{MemEngine, key};

#[derive(Debug, thiserror::Error)]
enum ArgsError {
    #[error("")]
    Help,
    #[error("{0} requires a value")]
    MissingValue(&'static str),
    #[error("{flag} expects a positive integer, got '{value}'")]
    InvalidNumber { flag: &'static str, value: String },
    #[error("unknown flag: {0}")]
    UnknownFlag(String),
}

#[derive(Debug, Clone)]
struct Args {
    readers: usize,
    slots: Option<usize>,
    rounds: usize,
    keys: usize,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            readers: 32,
            slots: None,
            rounds: 10,
            keys: 1024,
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    readers: usize,
    slots: usize,
    rounds: usize,
    reads: u64,
    commits: u64,
    generation: u64,
    overlapping_writes: usize,
    elapsed_ms: u128,
    manager: ManagerSnapshot,
}

fn print_usage() {
    eprintln!("Usage: readgate-stress [--readers N] [--slots N] [--rounds N] [--keys N]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --readers <n>    Concurrent reader tasks [default: 32]");
    eprintln!("  --slots <n>      Reader slots [default: READGATE_MAX_READERS or 256]");
    eprintln!("  --rounds <n>     Writer compaction rounds [default: 10]");
    eprintln!("  --keys <n>       Keys seeded into the store [default: 1024]");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(ArgsError::Help) => {
            print_usage();
            process::exit(2);
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    match run(args).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("error: JSON serialization failed: {e}");
                    process::exit(1);
                }
            }
            if report.overlapping_writes > 0 {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

/// Logs go to stderr so stdout carries only the JSON report.
///
/// `RUST_LOG` wins when set. Otherwise `READGATE_LOG` picks one level for
/// both crates, defaulting to warn. Thread names are always shown since they
/// identify the pinned worker a line came from.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("READGATE_LOG")
            .ok()
            .and_then(|raw| raw.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::WARN);
        EnvFilter::new(format!("readgate={level},readgate_stress={level}"))
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json");
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_thread_names(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_thread_names(true)
            .with_writer(std::io::stderr)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

fn parse_args(args: &[String]) -> Result<Args, ArgsError> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--readers" => {
                i += 1;
                parsed.readers = count(args.get(i), "--readers")?;
            }
            "--slots" => {
                i += 1;
                parsed.slots = Some(count(args.get(i), "--slots")?);
            }
            "--rounds" => {
                i += 1;
                parsed.rounds = args
                    .get(i)
                    .ok_or(ArgsError::MissingValue("--rounds"))?
                    .parse()
                    .map_err(|_| ArgsError::InvalidNumber {
                        flag: "--rounds",
                        value: args[i].clone(),
                    })?;
            }
            "--keys" => {
                i += 1;
                parsed.keys = count(args.get(i), "--keys")?;
            }
            "--help" | "-h" => return Err(ArgsError::Help),
            arg => return Err(ArgsError::UnknownFlag(arg.to_string())),
        }
        i += 1;
    }

    Ok(parsed)
}

fn count(value: Option<&String>, flag: &'static str) -> Result<usize, ArgsError> {
    let value = value.ok_or(ArgsError::MissingValue(flag))?;
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ArgsError::InvalidNumber {
            flag,
            value: value.clone(),
        }),
    }
}

async fn run(args: Args) -> anyhow::Result<Report> {
    let engine = MemEngine::seeded(args.keys);
    run_with(args, engine).await
}

async fn run_with(args: Args, engine: MemEngine) -> anyhow::Result<Report> {
    let mut config = ManagerConfig::from_env().context("invalid READGATE_* environment")?;
    if let Some(slots) = args.slots {
        config = config.with_max_readers(slots);
    }
    let slots = config.max_readers;

    let manager = Arc::new(ConcurrencyManager::new(engine.clone(), config)?);
    let stop = Arc::new(AtomicBool::new(args.rounds == 0));
    let reads = Arc::new(AtomicU64::new(0));
    // Cancelled when any reader stops early, since it can no longer park.
    let reader_lost = CancellationToken::new();

    tracing::info!(readers = args.readers, slots, rounds = args.rounds, "Starting stress run");
    let started = Instant::now();

    let readers: Vec<_> = (0..args.readers)
        .map(|id| {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            let reads = Arc::clone(&reads);
            let keys = args.keys;
            let lost = reader_lost.clone().drop_guard();
            tokio::spawn(async move {
                let outcome = reader_loop(id, keys, manager, stop, reads).await;
                if outcome.is_ok() {
                    let _ = lost.disarm();
                }
                outcome
            })
        })
        .collect();

    let written = writer_rounds(&manager, args.readers, args.rounds, &stop, &reader_lost).await;
    // Release whatever is parked so readers can observe `stop` and exit.
    stop.store(true, Ordering::Release);
    if manager.barrier().release().await.is_err() {
        tracing::warn!("Barrier already closed when finishing the run");
    }

    let reader_outcome = try_join_all(readers).await;
    let snapshot = manager.snapshot().await;
    manager.shutdown().await.context("shutdown failed")?;

    // A reader's own error explains a writer that gave up waiting for it.
    for outcome in reader_outcome.context("reader task panicked")? {
        outcome?;
    }
    written?;

    Ok(Report {
        readers: args.readers,
        slots,
        rounds: args.rounds,
        reads: reads.load(Ordering::Acquire),
        commits: engine.commits(),
        generation: engine.generation(),
        overlapping_writes: engine.overlapping_writes(),
        elapsed_ms: started.elapsed().as_millis(),
        manager: snapshot,
    })
}

async fn reader_loop(
    id: usize,
    keys: usize,
    manager: Arc<ConcurrencyManager<MemEngine>>,
    stop: Arc<AtomicBool>,
    reads: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    let mut n = id;
    loop {
        match manager.barrier().park_if_raised(id as u64).await {
            Ok(()) => {}
            Err(Error::ShutdownInProgress) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let k = key(n % keys);
        let found = manager
            .run_pooled_read(move |txn| Ok(txn.get(&k)?.is_some()))
            .await
            .with_context(|| format!("reader {id} failed"))?;
        if !found {
            anyhow::bail!("reader {id} missed a seeded key");
        }

        reads.fetch_add(1, Ordering::Relaxed);
        n = n.wrapping_add(7);
        tokio::task::yield_now().await;
    }
}

async fn writer_rounds(
    manager: &ConcurrencyManager<MemEngine>,
    readers: usize,
    rounds: usize,
    stop: &AtomicBool,
    reader_lost: &CancellationToken,
) -> anyhow::Result<()> {
    for round in 0..rounds {
        tokio::select! {
            biased;

            _ = reader_lost.cancelled() => {
                anyhow::bail!("round {round}: a reader stopped before parking");
            }

            parked = manager.barrier().raise_and_wait(readers) => {
                parked.with_context(|| format!("round {round}: readers never parked"))?;
            }
        }

        let generation = manager
            .run_update(|txn, _| txn.compact())
            .await
            .with_context(|| format!("round {round}: compaction failed"))?;
        tracing::debug!(round, generation, "Compaction committed");

        if round + 1 == rounds {
            stop.store(true, Ordering::Release);
        }
        manager.barrier().release().await?;
    }
    Ok(())
}
