//! Managed ledger load generator
//!
//! Runs producers and consumers against a set of ledgers backed by the
//! in-memory segment store and either the in-memory or the redb metadata store, then
//! reports throughput and cache behaviour.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use mledger::{InitialPosition, LedgerStats, ManagedLedger, ManagedLedgerFactory};
use mledger_common::FactoryConfig;
use mledger_meta_store::{MemoryMetadataStore, MetadataStore, RedbMetadataStore};
use mledger_segment::MemorySegmentStore;
use rand::RngCore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetaBackend {
    Memory,
    Redb,
}

#[derive(Parser, Debug)]
#[command(name = "mledger-bench")]
#[command(about = "Managed ledger load generator")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML, optional)
    #[arg(short, long, default_value = "mledger-bench.toml")]
    config: String,

    /// Ledger name prefix
    #[arg(long, default_value = "bench")]
    ledger: String,

    /// Number of ledgers
    #[arg(short, long, default_value = "1")]
    ledgers: usize,

    /// Concurrent producers per ledger
    #[arg(short, long, default_value = "4")]
    producers: usize,

    /// Number of consumers, each with its own durable cursor
    #[arg(short = 'C', long, default_value = "2")]
    consumers: usize,

    /// Entries written by each producer
    #[arg(short, long, default_value = "10000")]
    messages: u64,

    /// Payload size in bytes
    #[arg(short, long, default_value = "1024")]
    size: usize,

    /// Entries requested per consumer read
    #[arg(long, default_value = "100")]
    batch: i64,

    /// Metadata store backend
    #[arg(long, value_enum, default_value = "memory")]
    meta: MetaBackend,

    /// Path of the redb file when `--meta redb` is used
    #[arg(long, default_value = "./mledger-bench.redb")]
    meta_path: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// File and environment settings. Environment variables use the
/// `MLEDGER__` prefix with `__` between nested keys, for example
/// `MLEDGER__FACTORY__CACHE_MAX_SIZE_MB=64`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BenchConfig {
    factory: FactoryConfig,
}

fn load_config(path: &str) -> Result<BenchConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("MLEDGER")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("loading configuration from {path}"))?;
    Ok(settings.try_deserialize()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config)?;
    info!("Config file: {}", args.config);

    let metadata: Arc<dyn MetadataStore> = match args.meta {
        MetaBackend::Memory => Arc::new(MemoryMetadataStore::new()),
        MetaBackend::Redb => {
            info!("Metadata store: redb at {}", args.meta_path);
            Arc::new(RedbMetadataStore::open(&args.meta_path)?)
        }
    };
    let factory = Arc::new(ManagedLedgerFactory::new(
        Arc::new(MemorySegmentStore::new()),
        metadata,
        config.factory,
    ));

    let mut ledgers = Vec::with_capacity(args.ledgers);
    for i in 0..args.ledgers {
        ledgers.push(factory.open(&format!("{}-{i}", args.ledger)).await?);
    }
    info!(
        "Opened {} ledgers: {} producers x {} entries of {} bytes, {} consumers each",
        args.ledgers, args.producers, args.messages, args.size, args.consumers
    );

    let started = Instant::now();
    let total = args.messages * args.producers as u64;
    let mut consumers = Vec::new();
    for ledger in &ledgers {
        for i in 0..args.consumers {
            let ledger = Arc::clone(ledger);
            let name = format!("bench-sub-{i}");
            let batch = args.batch;
            consumers.push(tokio::spawn(async move {
                consume(ledger, name, total, batch).await
            }));
        }
    }

    // Give consumers a chance to open their cursors before the first add
    tokio::task::yield_now().await;

    let mut producers = Vec::new();
    for ledger in &ledgers {
        for _ in 0..args.producers {
            let ledger = Arc::clone(ledger);
            let (messages, size) = (args.messages, args.size);
            producers.push(tokio::spawn(async move { produce(ledger, messages, size).await }));
        }
    }

    for result in futures::future::join_all(producers).await {
        result.context("producer task panicked")??;
    }
    let produce_elapsed = started.elapsed();

    for result in futures::future::join_all(consumers).await {
        result.context("consumer task panicked")??;
    }
    let total_elapsed = started.elapsed();

    report(&factory, &ledgers, &args, produce_elapsed, total_elapsed);

    factory.shutdown().await?;
    info!("Benchmark finished");
    Ok(())
}

async fn produce(ledger: Arc<ManagedLedger>, messages: u64, size: usize) -> Result<()> {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    let payload = Bytes::from(payload);

    for _ in 0..messages {
        ledger.add_entry(payload.clone()).await?;
    }
    Ok(())
}

async fn consume(ledger: Arc<ManagedLedger>, name: String, total: u64, batch: i64) -> Result<()> {
    let cursor = ledger
        .open_cursor_with(&name, InitialPosition::Earliest, BTreeMap::new())
        .await?;

    let mut received = 0u64;
    while received < total {
        let entries = match tokio::time::timeout(
            Duration::from_secs(30),
            cursor.read_entries_or_wait(batch),
        )
        .await
        {
            Ok(entries) => entries?,
            Err(_) => bail!("[{}] {name}: no entries for 30s after {received} of {total}", ledger.name()),
        };
        let Some(last) = entries.last().map(mledger::Entry::position) else {
            continue;
        };
        received += entries.len() as u64;
        if let Err(e) = cursor.mark_delete(last).await {
            warn!("[{}] {name}: mark delete at {last} failed: {e}", ledger.name());
        }
    }
    info!("[{}] {name} consumed {received} entries", ledger.name());
    cursor.close().await?;
    Ok(())
}

fn total_counter(ledgers: &[Arc<ManagedLedger>], counter: fn(&LedgerStats) -> &AtomicU64) -> u64 {
    ledgers
        .iter()
        .map(|l| LedgerStats::get(counter(l.stats())))
        .sum()
}

#[allow(clippy::cast_precision_loss)]
fn report(
    factory: &ManagedLedgerFactory,
    ledgers: &[Arc<ManagedLedger>],
    args: &Args,
    produce_elapsed: Duration,
    total_elapsed: Duration,
) {
    let sum = |counter: fn(&LedgerStats) -> &AtomicU64| total_counter(ledgers, counter);
    let added = sum(|s| &s.adds_succeeded);
    let bytes = sum(|s| &s.bytes_added);
    let segments: usize = ledgers.iter().map(|l| l.segments().len()).sum();
    let produce_secs = produce_elapsed.as_secs_f64().max(f64::EPSILON);
    let total_secs = total_elapsed.as_secs_f64().max(f64::EPSILON);

    info!("============================================");
    info!("Produced:   {} entries in {:.2}s", added, produce_secs);
    info!("  Rate:     {:.0} entries/s", added as f64 / produce_secs);
    info!(
        "  Bytes:    {:.2} MB/s",
        bytes as f64 / (1024.0 * 1024.0) / produce_secs
    );
    info!(
        "Consumed:   {} entries x {} cursors in {:.2}s",
        added, args.consumers, total_secs
    );
    info!("Failed adds: {}", sum(|s| &s.adds_failed));
    info!("Rollovers:  {}", sum(|s| &s.rollovers));
    info!("Segments:   {}", segments);

    let cache = factory.cache_manager().stats();
    info!(
        "Cache:      hit ratio {:.2}, {} hits, {} misses, {} evicted",
        cache.hit_ratio(),
        cache.hits.load(Ordering::Relaxed),
        cache.misses.load(Ordering::Relaxed),
        cache.evicted.load(Ordering::Relaxed)
    );
    info!("============================================");
}
