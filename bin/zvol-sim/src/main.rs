#![allow(clippy::result_large_err)]
//! zvol workload simulator
//!
//! Wires the volume core to the in-memory pool, property store and device
//! framework, runs the basic open/write/flush/reopen scenario and then a
//! concurrent verified workload against a single volume.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use zvol_core::memory::{MemoryDevices, MemoryPool, MemoryProperties};
use zvol_core::{
    Attribute, Backends, OpenMode, Request, VolumeHandle, VolumeMode, ZvolConfig, ZvolManager,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "zvol-sim", about = "Block-volume core workload simulator")]
struct Args {
    /// Dataset / volume name
    #[arg(long, default_value = "tank/vol0")]
    volume: String,

    /// Volume size in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    size: u64,

    /// Volume block size in bytes
    #[arg(long, default_value_t = 4096)]
    block_size: u32,

    /// Concurrent submitter threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Requests issued by each thread
    #[arg(long, default_value_t = 1000)]
    requests: usize,

    /// Keep intent logs in journal files under this directory
    #[arg(long, env = "ZVOL_JOURNAL_DIR")]
    journal_dir: Option<PathBuf>,

    /// Use journal files in a throwaway directory
    #[arg(long, conflicts_with = "journal_dir")]
    journal: bool,

    /// Volume layer config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `max_transfer` from the config
    #[arg(long)]
    max_transfer: Option<u64>,

    /// Pool capacity in bytes
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    pool_capacity: u64,

    /// Seed for the workload generator
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Print the final statistics as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Setup ─────────────────────────────────────────────────────────────────────

/// Config file, then `ZVOL_*` environment variables, then CLI flags
fn load_config(args: &Args) -> Result<ZvolConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("ZVOL")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let mut cfg: ZvolConfig = builder
        .build()
        .context("load configuration")?
        .try_deserialize()
        .context("parse configuration")?;
    if let Some(max_transfer) = args.max_transfer {
        cfg.max_transfer = max_transfer;
    }
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

struct Sim {
    manager: ZvolManager,
    pool: Arc<MemoryPool>,
    devices: Arc<MemoryDevices>,
}

impl Sim {
    fn new(pool: MemoryPool, cfg: ZvolConfig) -> Result<Self> {
        let pool = Arc::new(pool);
        let devices = Arc::new(MemoryDevices::new());
        let backends = Backends::new(
            pool.clone(),
            Arc::new(MemoryProperties::new()),
            devices.clone(),
        );
        let manager = ZvolManager::new(backends, cfg).context("create volume manager")?;
        Ok(Self {
            manager,
            pool,
            devices,
        })
    }
}

fn build_pool(args: &Args, journal_dir: Option<&Path>) -> MemoryPool {
    match journal_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Intent logs in journal files");
            MemoryPool::with_journal_dir(args.pool_capacity, dir)
        }
        None => MemoryPool::new(args.pool_capacity),
    }
}

// ── Scenario ──────────────────────────────────────────────────────────────────

/// Write, flush, close, reopen read-only and read back
fn run_scenario(sim: &Sim, name: &str) -> Result<()> {
    let vol = sim
        .manager
        .open(name, OpenMode::read_write())
        .with_context(|| format!("open {name} for writing"))?;
    let written = vol.write(0, vec![0xABu8; 4096]).context("scenario write")?;
    ensure!(written == 4096, "short scenario write: {written}");
    vol.flush().context("scenario flush")?;
    vol.close();

    let vol = sim
        .manager
        .open(name, OpenMode::read())
        .with_context(|| format!("open {name} for reading"))?;
    let data = vol.read(0, 4096).context("scenario read")?;
    ensure!(
        data.iter().all(|b| *b == 0xAB),
        "scenario read returned unexpected data"
    );
    let media_size = vol.query(Attribute::MediaSize)?;
    debug!(volume = %name, media_size, "scenario read back");
    vol.close();

    info!(volume = %name, "Scenario passed");
    Ok(())
}

// ── Concurrent workload ───────────────────────────────────────────────────────

struct Region {
    offset: u64,
    length: u64,
}

#[derive(Clone, Copy)]
struct SubmitFlags {
    /// DELETE frees storage, so deleted ranges read back as zeros
    unmap: bool,
    /// The volume has a deferred worker
    deferred: bool,
}

/// One submitter. Each thread owns a disjoint region and keeps a shadow
/// copy of it to verify every read.
fn run_submitter(
    vol: &VolumeHandle,
    region: &Region,
    block_size: u64,
    requests: usize,
    flags: SubmitFlags,
    seed: u64,
) -> Result<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut shadow = vec![0u8; usize::try_from(region.length)?];
    let blocks = region.length / block_size;
    let mut bytes = 0u64;

    for _ in 0..requests {
        let first = rng.gen_range(0..blocks);
        let count = rng.gen_range(1..=8).min(blocks - first);
        let offset = region.offset + first * block_size;
        let length = count * block_size;
        let at = usize::try_from(first * block_size)?;
        let span = at..at + usize::try_from(length)?;

        match rng.gen_range(0..10) {
            0..=3 => {
                let mut data = vec![0u8; span.len()];
                rng.fill_bytes(&mut data);
                shadow[span].copy_from_slice(&data);
                bytes += vol.write(offset, data)?;
            }
            4..=6 => {
                let data = vol.read(offset, length)?;
                if data[..] != shadow[span] {
                    bail!("data mismatch at offset {offset} length {length}");
                }
                bytes += length;
            }
            7 => {
                bytes += vol.delete(offset, length)?;
                if flags.unmap {
                    shadow[span].fill(0);
                }
            }
            _ => {
                let mut data = vec![0u8; span.len()];
                rng.fill_bytes(&mut data);
                shadow[span].copy_from_slice(&data);
                let request = Request::write(offset, Bytes::from(data));
                let completion = if flags.deferred {
                    vol.submit_deferred(request)?.wait()?
                } else {
                    vol.submit(request)
                };
                bytes += completion.into_result()?.bytes_transferred;
            }
        }
    }

    vol.flush()?;
    Ok(bytes)
}

fn run_workload(sim: &Sim, name: &str, args: &Args) -> Result<u64> {
    let block_size = u64::from(args.block_size);
    let threads = u64::try_from(args.threads.max(1))?;
    let per_thread = args.size / threads / block_size * block_size;
    ensure!(
        per_thread >= block_size,
        "volume too small for {threads} threads"
    );
    let flags = SubmitFlags {
        unmap: sim.manager.config().unmap_enabled,
        deferred: sim.manager.find(name).is_some_and(|z| z.mode() == VolumeMode::Geom),
    };

    let mut handles = Vec::new();
    for i in 0..threads {
        let vol = sim
            .manager
            .open(name, OpenMode::read_write())
            .with_context(|| format!("open {name}"))?;
        handles.push((i, vol));
    }

    let started = Instant::now();
    let total = thread::scope(|s| -> Result<u64> {
        let workers: Vec<_> = handles
            .into_iter()
            .map(|(i, vol)| {
                let region = Region {
                    offset: i * per_thread,
                    length: per_thread,
                };
                let seed = args.seed.wrapping_add(i);
                s.spawn(move || {
                    run_submitter(&vol, &region, block_size, args.requests, flags, seed)
                })
            })
            .collect();

        let mut total = 0;
        for worker in workers {
            total += worker
                .join()
                .map_err(|_| anyhow!("submitter thread panicked"))??;
        }
        Ok(total)
    })?;

    let elapsed = started.elapsed();
    info!(
        volume = %name,
        threads,
        bytes = total,
        elapsed_ms = elapsed.as_millis(),
        "Workload finished"
    );
    Ok(total)
}

// ── Reconfiguration ───────────────────────────────────────────────────────────

fn run_reconfigure(sim: &Sim, name: &str, args: &Args) -> Result<String> {
    let grown = args.size + 1024 * 1024;
    sim.manager
        .resize(name, grown)
        .with_context(|| format!("resize {name}"))?;

    let renamed = format!("{name}-renamed");
    sim.pool
        .rename_dataset(name, &renamed)
        .context("rename dataset")?;
    sim.manager
        .rename_minor(name, &renamed)
        .with_context(|| format!("rename {name}"))?;

    let vol = sim.manager.open(&renamed, OpenMode::read())?;
    ensure!(vol.size() == grown, "size lost across rename");
    let data = vol.read(0, 4096)?;
    debug!(volume = %renamed, first_byte = data[0], "reopened after rename");
    vol.close();
    Ok(renamed)
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting zvol simulator");

    let cfg = load_config(&args)?;
    info!(
        max_transfer = cfg.max_transfer,
        unmap = cfg.unmap_enabled,
        volmode = %cfg.default_volmode,
        "Loaded configuration"
    );
    if cfg.default_volmode != VolumeMode::Geom {
        warn!("default volmode is not geom; all requests run inline");
    }

    let scratch = if args.journal {
        Some(tempfile::tempdir().context("create journal directory")?)
    } else {
        None
    };
    let journal_dir = args
        .journal_dir
        .as_deref()
        .or_else(|| scratch.as_ref().map(tempfile::TempDir::path));

    let sim = Sim::new(build_pool(&args, journal_dir), cfg)?;
    let name = args.volume.as_str();

    sim.pool
        .create_volume(name, args.size, args.block_size)
        .with_context(|| format!("create dataset {name}"))?;
    sim.manager
        .create_minor(name)
        .with_context(|| format!("create volume {name}"))?;

    run_scenario(&sim, name)?;
    run_workload(&sim, name, &args)?;

    let stats = sim
        .manager
        .find(name)
        .map(|zvol| zvol.stats())
        .unwrap_or_default();

    let renamed = run_reconfigure(&sim, name, &args)?;
    sim.manager
        .destroy_minor(&renamed)
        .with_context(|| format!("destroy {renamed}"))?;

    let remaining = sim.manager.shutdown();
    if !remaining.is_empty() {
        bail!("volumes still open at shutdown: {remaining:?}");
    }

    info!(
        reads = stats.read_ops,
        writes = stats.write_ops,
        deletes = stats.delete_ops,
        flushes = stats.flush_ops,
        deferred = stats.deferred_ops,
        failed = stats.failed_ops,
        device_events = sim.devices.events().len(),
        "Simulation complete"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
