mod config;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use islands_author::{IslandGenerator, IslandShape};
use islands_common::{ChunkPos, LoaderId, TilePos};
use islands_kernel::TileId;
use islands_persist::{ChunkStorage, FileChunkStore, MemoryChunkStore};
use islands_stream::{DrainOutcome, OperationHandle, World};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "islands-cli", about = "CLI tool for islands tile worlds")]
struct Cli {
    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store root directory, overrides the config file
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// World name, overrides the config file
    #[arg(short, long)]
    world: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version, configuration and store summary
    Info,
    /// Generate an island centered on the origin
    Generate {
        /// square, square_no_borders, circle or perlin
        #[arg(short, long, default_value = "perlin")]
        kind: IslandShape,
        /// Island side length in tiles
        #[arg(short, long, default_value = "32")]
        size: i32,
        /// Noise seed
        #[arg(long, default_value = "42")]
        seed: u32,
    },
    /// Show the tile and properties at a position
    Inspect {
        #[arg(short, allow_negative_numbers = true)]
        x: i32,
        #[arg(short, allow_negative_numbers = true)]
        y: i32,
        #[arg(short, default_value = "0", allow_negative_numbers = true)]
        z: i32,
    },
    /// List stored chunk files and verify their integrity
    Chunks,
    /// Hammer an in-memory world with load/unload bursts and check its bookkeeping
    Stress {
        /// Number of bursts
        #[arg(short, long, default_value = "100")]
        rounds: usize,
        /// Number of competing loaders
        #[arg(short, long, default_value = "4")]
        loaders: usize,
        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let mut config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(name) = cli.world {
        config.stream.world.name = name;
    }
    tracing::debug!(root = %config.root.display(), world = %config.stream.world, "configuration loaded");

    match cli.command {
        Commands::Info => info(&config).await?,
        Commands::Generate { kind, size, seed } => generate(&config, kind, size, seed).await?,
        Commands::Inspect { x, y, z } => inspect(&config, TilePos::new(x, y, z)).await?,
        Commands::Chunks => chunks(&config).await?,
        Commands::Stress {
            rounds,
            loaders,
            seed,
        } => stress(&config, rounds, loaders.max(1), seed).await?,
    }

    Ok(())
}

async fn open_store(config: &CliConfig) -> anyhow::Result<FileChunkStore> {
    let store = FileChunkStore::open(&config.root, config.stream.chunk_extent)
        .with_context(|| format!("opening store at {}", config.root.display()))?;
    store.prepare_world(&config.stream.world).await?;
    Ok(store)
}

async fn open_world(config: &CliConfig) -> anyhow::Result<World<FileChunkStore>> {
    let store = open_store(config).await?;
    Ok(World::new(Arc::new(store), config.stream.clone()))
}

/// Drain, then wait for `handle`. A drain already in progress picks the operation up.
async fn run<S: ChunkStorage, T>(world: &World<S>, handle: OperationHandle<T>) -> anyhow::Result<T> {
    world.process_operations().await?;
    Ok(handle.await?)
}

async fn info(config: &CliConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let stored = store.stored_positions(&config.stream.world).await?;
    println!("islands-cli v{}", env!("CARGO_PKG_VERSION"));
    println!("world: {} (id {})", config.stream.world.name, config.stream.world.id());
    println!("store: {}", store.world_dir(&config.stream.world).display());
    println!("chunk extent: {}", config.stream.chunk_extent.size());
    println!("drain interval: {:?}", config.stream.drain_interval());
    println!("stored chunks: {}", stored.len());
    Ok(())
}

async fn generate(config: &CliConfig, kind: IslandShape, size: i32, seed: u32) -> anyhow::Result<()> {
    let world = open_world(config).await?;
    let generator = IslandGenerator::centered(kind, size, seed)?;
    let report = generator.generate(&world).await?;
    world.shutdown().await?;
    println!(
        "Generated {kind} island: size={size}, seed={seed}, cells={}, written={}, kept={}, chunks={}",
        report.cells, report.written, report.kept, report.chunks
    );
    Ok(())
}

async fn inspect(config: &CliConfig, tile: TilePos) -> anyhow::Result<()> {
    let world = open_world(config).await?;
    let loader = LoaderId::new();
    let chunk_pos = world.extent().tile_to_chunk(tile);
    run(&world, world.request_load([chunk_pos], loader)).await?;

    let id = run(&world, world.read_tile(tile)).await?;
    let chunk = world.chunk_data(chunk_pos)?;
    let mut properties: Vec<_> = chunk.read().await.properties().all_at(tile).into_iter().collect();
    properties.sort_by(|a, b| a.0.cmp(&b.0));

    println!("tile {tile} in chunk {chunk_pos}");
    match id {
        Some(id) => println!("  tile: {id}"),
        None => println!("  tile: <empty>"),
    }
    for (name, value) in properties {
        println!("  {name} = {value} ({})", value.kind());
    }

    run(&world, world.request_unload([chunk_pos], loader)).await?;
    world.shutdown().await?;
    Ok(())
}

async fn chunks(config: &CliConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let positions = store.stored_positions(&config.stream.world).await?;
    for pos in &positions {
        println!("{pos}");
    }
    println!("{} chunk(s) stored", positions.len());
    match store.verify_integrity(&config.stream.world).await {
        Ok(()) => println!("Integrity: OK"),
        Err(e) => println!("Integrity: FAILED ({e})"),
    }
    Ok(())
}

/// Splitmix64 step; deterministic so a failing burst can be replayed from its seed.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

async fn stress(config: &CliConfig, rounds: usize, loader_count: usize, seed: u64) -> anyhow::Result<()> {
    let mut stream = config.stream.clone();
    stream.drain_interval_ms = 1;
    let store = Arc::new(MemoryChunkStore::with_latency(Duration::from_micros(200)));
    let world = World::new(Arc::clone(&store), stream);
    // The background driver races with the explicit drains below.
    let driver = world.spawn_driver();

    let extent = world.extent();
    let loaders: Vec<LoaderId> = (0..loader_count).map(|_| LoaderId::new()).collect();
    let mut held: Vec<HashSet<ChunkPos>> = vec![HashSet::new(); loader_count];
    let mut written: HashMap<TilePos, TileId> = HashMap::new();
    let mut state = seed;
    let mut busy = 0;

    for round in 0..rounds {
        for _ in 0..16 {
            let who = (splitmix64(&mut state) % loader_count as u64) as usize;
            let x = (splitmix64(&mut state) % 8) as i32 - 4;
            let y = (splitmix64(&mut state) % 8) as i32 - 4;
            let pos = ChunkPos::flat(x, y);
            match splitmix64(&mut state) % 3 {
                0 => {
                    let _ = world.request_load([pos], loaders[who]);
                    held[who].insert(pos);
                }
                1 => {
                    let _ = world.request_unload([pos], loaders[who]);
                    held[who].remove(&pos);
                }
                _ => {
                    let tile = extent.chunk_origin(pos);
                    let id = TileId::new(format!("r{round}"));
                    let _ = world.write_tile(tile, id.clone());
                    written.insert(tile, id);
                }
            }
        }
        if world.process_operations().await? == DrainOutcome::AlreadyDraining {
            busy += 1;
        }
    }

    driver.stop().await;
    world.process_operations().await?;

    let expected: HashSet<ChunkPos> = held.iter().flatten().copied().collect();
    let resident: HashSet<ChunkPos> = world.resident_positions().into_iter().collect();
    if resident != expected {
        anyhow::bail!(
            "residency mismatch: {} resident, {} requested",
            resident.len(),
            expected.len()
        );
    }

    let reads: Vec<_> = written
        .iter()
        .map(|(tile, id)| (*tile, id.clone(), world.read_tile(*tile)))
        .collect();
    world.process_operations().await?;
    for (tile, id, read) in reads {
        let found = read.await?;
        if found.as_ref() != Some(&id) {
            anyhow::bail!("tile {tile}: expected {id}, found {found:?}");
        }
    }

    let history = world.drain_history();
    let totals = history.totals();
    println!("Stress: rounds={rounds}, loaders={loader_count}, seed={seed}");
    println!(
        "Resident: {} chunks, all requested; writes verified: {}",
        resident.len(),
        written.len()
    );
    println!(
        "Storage: loads={}, saves={}, chunks saved={}",
        store.load_calls(),
        store.save_calls(),
        store.saved_chunks()
    );
    println!(
        "Drains: skipped while busy={busy}, recent={}, evicted={}, avg={:?}, max={:?}",
        history.len(),
        totals.evicted,
        history.mean_duration(),
        history.slowest().map(|d| d.duration).unwrap_or_default()
    );
    Ok(())
}
