use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use islands_common::{ChunkExtent, ChunkPos, LoaderId, TilePos};
use islands_persist::MemoryChunkStore;
use islands_stream::{StreamConfig, World};

fn world() -> World<MemoryChunkStore> {
    let config = StreamConfig {
        chunk_extent: ChunkExtent::flat(16, 16).unwrap(),
        ..StreamConfig::default()
    };
    World::new(Arc::new(MemoryChunkStore::new()), config)
}

async fn bench_resident_writes(side: i32, iterations: usize) {
    let world = world();
    let loader = LoaderId::new();
    let positions: Vec<ChunkPos> = (0..side)
        .flat_map(|y| (0..side).map(move |x| ChunkPos::flat(x, y)))
        .collect();
    let _ = world.request_load(positions, loader);
    world.process_operations().await.unwrap();

    let tiles = side * 16;
    let start = Instant::now();
    for i in 0..iterations {
        let x = (i as i32 * 7) % tiles;
        let y = (i as i32 * 13) % tiles;
        let _ = world.write_tile(TilePos::flat(x, y), "grass");
    }
    world.process_operations().await.unwrap();
    let elapsed = start.elapsed();
    let per_op = elapsed / iterations as u32;
    println!(
        "  resident writes ({side}x{side} chunks, {iterations} ops): {per_op:?}/op, total {elapsed:?}"
    );
}

async fn bench_evicting_writes(iterations: usize) {
    let world = world();
    let start = Instant::now();
    for i in 0..iterations {
        let _ = world.write_tile(TilePos::flat(i as i32 * 16, 0), "sand");
    }
    world.process_operations().await.unwrap();
    let elapsed = start.elapsed();
    let per_op = elapsed / iterations as u32;
    println!(
        "  save + evict ({iterations} chunks): {per_op:?}/chunk, total {elapsed:?}"
    );
}

async fn bench_load_unload_cycles(side: i32, rounds: usize) {
    let world = world();
    let loader = LoaderId::new();
    let positions: Vec<ChunkPos> = (0..side)
        .flat_map(|y| (0..side).map(move |x| ChunkPos::flat(x, y)))
        .collect();

    let start = Instant::now();
    for _ in 0..rounds {
        let _ = world.request_load(positions.clone(), loader);
        let _ = world.request_unload(positions.clone(), loader);
        black_box(world.process_operations().await.unwrap());
    }
    let elapsed = start.elapsed();
    let per_round = elapsed / rounds as u32;
    println!(
        "  load/unload ({side}x{side} chunks, {rounds} rounds): {per_round:?}/round, total {elapsed:?}"
    );
}

fn main() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    println!("=== Drain Benchmarks ===\n");

    println!("Queued tile writes:");
    runtime.block_on(bench_resident_writes(4, 10_000));
    runtime.block_on(bench_resident_writes(16, 100_000));

    println!("\nEviction:");
    runtime.block_on(bench_evicting_writes(1_000));

    println!("\nLoad/unload churn:");
    runtime.block_on(bench_load_unload_cycles(4, 1_000));
    runtime.block_on(bench_load_unload_cycles(8, 100));

    println!("\n=== Done ===");
}
