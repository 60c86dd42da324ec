//! respool-soak: hammer a pool of synthetic connections and report what happened.

mod synthetic;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use respool::{PoolBuilder, PoolConfig, PoolError, PoolStatus, RESPOOL_VERSION};
use synthetic::SyntheticConnections;

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    workers: usize,
    iterations: usize,
    hold: Duration,
    create_latency: Duration,
    fail_every: Option<u64>,
    evict_every: Duration,
    idle: Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            workers: 16,
            iterations: 100,
            hold: Duration::from_millis(2),
            create_latency: Duration::from_millis(5),
            fail_every: None,
            evict_every: Duration::from_millis(50),
            idle: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    pool_full: AtomicU64,
    create_failed: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Report {
    version: &'static str,
    pool: String,
    workers: usize,
    iterations: usize,
    acquired: u64,
    pool_full: u64,
    create_failed: u64,
    created: u64,
    destroyed: u64,
    final_eviction: usize,
    status: PoolStatus,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: respool-soak [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --config <file>        JSON pool config (RESPOOL_* env vars override it)");
            eprintln!("  --workers <n>          Concurrent workers [default: 16]");
            eprintln!("  --iterations <n>       Acquire/release cycles per worker [default: 100]");
            eprintln!("  --hold-ms <ms>         Time each resource is held [default: 2]");
            eprintln!("  --create-ms <ms>       Synthetic create latency [default: 5]");
            eprintln!("  --fail-every <n>       Fail every n-th create");
            eprintln!("  --evict-every-ms <ms>  Eviction period [default: 50]");
            eprintln!("  --idle-ms <ms>         Idle time before eviction [default: 20]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// Initialize tracing with RESPOOL_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RESPOOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("respool={level},respool_soak={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();

        match flag {
            "--config" => parsed.config = Some(PathBuf::from(take_value(args, &mut i)?)),
            "--workers" => parsed.workers = parse_num(flag, take_value(args, &mut i)?)?,
            "--iterations" => parsed.iterations = parse_num(flag, take_value(args, &mut i)?)?,
            "--hold-ms" => parsed.hold = parse_millis(flag, take_value(args, &mut i)?)?,
            "--create-ms" => parsed.create_latency = parse_millis(flag, take_value(args, &mut i)?)?,
            "--fail-every" => parsed.fail_every = Some(parse_num(flag, take_value(args, &mut i)?)?),
            "--evict-every-ms" => {
                parsed.evict_every = parse_millis(flag, take_value(args, &mut i)?)?
            }
            "--idle-ms" => parsed.idle = parse_millis(flag, take_value(args, &mut i)?)?,
            "--help" | "-h" => return Err("help requested".to_string()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    if parsed.evict_every.is_zero() {
        return Err("--evict-every-ms must be greater than 0".to_string());
    }
    if parsed.fail_every == Some(0) {
        return Err("--fail-every must be greater than 0".to_string());
    }

    Ok(parsed)
}

/// Advance past a flag and return the value that follows it.
fn take_value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_num<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value for {flag}: '{value}'"))
}

fn parse_millis(flag: &str, value: &str) -> Result<Duration, String> {
    parse_num(flag, value).map(Duration::from_millis)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PoolConfig> {
    let config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            PoolConfig::from_json(&json)?
        }
        None => PoolConfig {
            max_count: Some(8),
            ..Default::default()
        },
    };
    Ok(config.with_env_overrides()?)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;
    tracing::info!(version = RESPOOL_VERSION, ?config, workers = args.workers, "Starting soak run");

    let manager = SyntheticConnections::new(args.create_latency, args.fail_every);
    let created = manager.created();
    let destroyed = manager.destroyed();

    let (pool, admin) = PoolBuilder::new(manager)
        .config(config)
        .build()
        .context("invalid pool config")?;

    let cancel = CancellationToken::new();
    let evictor = admin.spawn_evictor(args.evict_every, args.idle, cancel.clone());

    let counters = Arc::new(Counters::default());
    let mut workers = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let pool = pool.clone();
        let counters = Arc::clone(&counters);
        let hold = args.hold;
        let iterations = args.iterations;

        workers.push(tokio::spawn(async move {
            for _ in 0..iterations {
                match pool.acquire().await {
                    Ok(conn) => {
                        counters.acquired.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(hold).await;
                        if let Err(e) = pool.release(conn) {
                            tracing::error!(worker, error = %e, "Release failed");
                        }
                    }
                    Err(e) if e.is_pool_full() => {
                        counters.pool_full.fetch_add(1, Ordering::Relaxed);
                        tokio::task::yield_now().await;
                    }
                    Err(e @ PoolError::Create(_)) => {
                        counters.create_failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(worker, error = %e, "Create failed");
                    }
                    Err(e) => {
                        tracing::warn!(worker, error = %e, "Acquire failed");
                    }
                }
            }
        }));
    }

    for worker in workers {
        worker.await.context("worker panicked")?;
    }

    cancel.cancel();
    evictor.await.context("evictor panicked")?;

    // Everything is idle now; drain whatever the evictor left above min_count.
    let final_eviction = admin.run_eviction(Duration::ZERO).await;
    for error in &final_eviction.errors {
        tracing::warn!(error = %error, "Destroy failed during final eviction");
    }

    let report = Report {
        version: RESPOOL_VERSION,
        pool: admin.id().to_string(),
        workers: args.workers,
        iterations: args.iterations,
        acquired: counters.acquired.load(Ordering::Relaxed),
        pool_full: counters.pool_full.load(Ordering::Relaxed),
        create_failed: counters.create_failed.load(Ordering::Relaxed),
        created: created.load(Ordering::Relaxed),
        destroyed: destroyed.load(Ordering::Relaxed),
        final_eviction: final_eviction.resources_deleted,
        status: admin.status(),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
