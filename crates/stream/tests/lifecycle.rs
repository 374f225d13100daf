//! End-to-end chunk lifecycle: requests, queued operations, persistence and eviction.

use std::sync::Arc;
use std::time::Duration;

use islands_common::{ChunkExtent, ChunkPos, LoaderId, TileBounds, TilePos, WorldInfo};
use islands_kernel::{Chunk, TileId};
use islands_persist::{ChunkStorage, FileChunkStore, MemoryChunkStore};
use islands_stream::{DrainOutcome, StreamConfig, World};

fn extent() -> ChunkExtent {
    ChunkExtent::flat(8, 8).unwrap()
}

fn config() -> StreamConfig {
    StreamConfig {
        chunk_extent: extent(),
        world: WorldInfo::new("lifecycle"),
        ..StreamConfig::default()
    }
}

fn memory_world(latency: Duration) -> (World<MemoryChunkStore>, Arc<MemoryChunkStore>) {
    let store = Arc::new(MemoryChunkStore::with_latency(latency));
    (World::new(Arc::clone(&store), config()), store)
}

async fn drain<S: ChunkStorage>(world: &World<S>) {
    match world.process_operations().await {
        Ok(DrainOutcome::Drained(_)) => {}
        other => panic!("expected a completed drain, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_get_or_create_loads_once() {
    let (world, store) = memory_world(Duration::from_millis(25));
    let pos = ChunkPos::flat(-3, 2);
    let mut seeded = Chunk::new(pos, extent());
    seeded.set_tile(extent().chunk_origin(pos), "stone");
    store.insert(world.info(), seeded);

    let calls = (0..16).map(|_| world.get_or_create_chunk(pos));
    let chunks = futures::future::join_all(calls).await;

    assert_eq!(store.load_calls(), 1);
    assert!(chunks.iter().all(|c| Arc::ptr_eq(c, &chunks[0])));
    assert_eq!(chunks[0].read().await.tile_count(), 1);
    assert_eq!(world.pending_loads(), 0);
}

#[tokio::test]
async fn chunk_stays_resident_while_queued_operations_need_it() {
    let (world, store) = memory_world(Duration::ZERO);
    let pos = ChunkPos::flat(0, 0);

    let write = world.write_tile(TilePos::flat(1, 1), "grass");
    let read = world.read_tile(TilePos::flat(1, 1));
    drain(&world).await;

    // Both operations hit the same resident chunk: no reload in between.
    assert!(write.await.unwrap());
    assert_eq!(read.await.unwrap(), Some(TileId::from("grass")));
    assert_eq!(store.load_calls(), 0);
    assert_eq!(store.save_calls(), 1);
    assert!(!world.is_resident(pos));
}

#[tokio::test]
async fn dirty_chunk_survives_save_evict_reload() {
    let (world, store) = memory_world(Duration::ZERO);
    let loader = LoaderId::new();
    let pos = ChunkPos::flat(2, -1);
    let tile = TilePos::flat(17, -3);

    let _load = world.request_load([pos], loader);
    let write = world.write_tile(tile, "sand");
    drain(&world).await;
    assert!(write.await.unwrap());

    let chunk = world.chunk_data(pos).unwrap();
    assert!(chunk.read().await.is_dirty());
    assert_eq!(store.save_calls(), 0);

    let _unload = world.request_unload([pos], loader);
    drain(&world).await;
    assert!(!world.is_resident(pos));
    assert!(store.contains(world.info(), pos));
    // The evicted handle was wiped.
    assert!(chunk.read().await.is_blank());

    let read = world.read_tile(tile);
    drain(&world).await;
    assert_eq!(read.await.unwrap(), Some(TileId::from("sand")));
    assert_eq!(store.load_calls(), 1);
}

#[tokio::test]
async fn chunk_is_kept_until_every_loader_releases_it() {
    let (world, _store) = memory_world(Duration::ZERO);
    let (first, second) = (LoaderId::new(), LoaderId::new());
    let pos = ChunkPos::flat(4, 4);

    let _ = world.request_load([pos], first);
    let _ = world.request_load([pos], second);
    drain(&world).await;
    assert!(world.is_resident(pos));

    let _ = world.request_unload([pos], first);
    drain(&world).await;
    assert!(world.is_resident(pos));
    assert!(world.is_requested(pos));

    let _ = world.request_unload([pos], second);
    drain(&world).await;
    assert!(!world.is_resident(pos));
    assert!(!world.is_requested(pos));
}

#[tokio::test]
async fn bounds_requests_cover_partial_chunks() {
    let (world, _store) = memory_world(Duration::ZERO);
    let loader = LoaderId::new();
    // Tiles -1..9 touch chunks -1, 0 and 1 on both axes.
    let bounds = TileBounds::flat(TilePos::flat(-1, -1), TilePos::flat(9, 9));
    let _ = world.request_load_bounds(bounds, loader);
    drain(&world).await;
    assert_eq!(world.resident_len(), 9);
    assert!(world.is_resident(ChunkPos::flat(-1, -1)));
    assert!(world.is_resident(ChunkPos::flat(1, 1)));

    let _ = world.request_unload_bounds(bounds, loader);
    drain(&world).await;
    assert_eq!(world.resident_len(), 0);
}

#[tokio::test]
async fn rapid_load_unload_bursts_keep_residency_consistent() {
    let (world, store) = memory_world(Duration::ZERO);
    let loaders: Vec<LoaderId> = (0..4).map(|_| LoaderId::new()).collect();
    let mut held: Vec<Vec<ChunkPos>> = vec![Vec::new(); loaders.len()];
    let mut written: std::collections::HashMap<TilePos, String> = Default::default();

    // Small linear congruential generator; the sequence is fixed so failures reproduce.
    let mut seed: u64 = 0x5eed;
    let mut next = move |bound: u64| {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) % bound
    };

    for round in 0..200 {
        for _ in 0..8 {
            let who = next(loaders.len() as u64) as usize;
            let pos = ChunkPos::flat(next(6) as i32 - 3, next(6) as i32 - 3);
            match next(3) {
                0 => {
                    let _ = world.request_load([pos], loaders[who]);
                    held[who].push(pos);
                }
                1 => {
                    let _ = world.request_unload([pos], loaders[who]);
                    held[who].retain(|p| *p != pos);
                }
                _ => {
                    let tile = extent().chunk_origin(pos);
                    let id = format!("t{round}");
                    let _ = world.write_tile(tile, id.as_str());
                    written.insert(tile, id);
                }
            }
        }
        drain(&world).await;

        let mut expected: Vec<ChunkPos> = held.iter().flatten().copied().collect();
        expected.sort_by_key(|p| (p.x(), p.y()));
        expected.dedup();
        let mut resident = world.resident_positions();
        resident.sort_by_key(|p| (p.x(), p.y()));
        assert_eq!(resident, expected, "round {round}");
        assert_eq!(world.pending_loads(), 0);
    }

    // Every write is observable, whether its chunk stayed resident or went through storage.
    let reads: Vec<_> = written
        .iter()
        .map(|(tile, id)| (world.read_tile(*tile), id.clone()))
        .collect();
    drain(&world).await;
    for (read, id) in reads {
        assert_eq!(read.await.unwrap(), Some(TileId::new(id)));
    }
    assert!(store.saved_chunks() > 0);
}

#[tokio::test]
async fn file_store_round_trips_through_eviction() {
    let tmp = tempfile::tempdir().unwrap();
    let tile = TilePos::flat(-5, 12);
    {
        let store = Arc::new(FileChunkStore::open(tmp.path(), extent()).unwrap());
        let world = World::new(store, config());
        let write = world.write_tile(tile, "rock");
        drain(&world).await;
        assert!(write.await.unwrap());
        assert_eq!(world.resident_len(), 0);
    }

    let store = Arc::new(FileChunkStore::open(tmp.path(), extent()).unwrap());
    store.verify_integrity(&WorldInfo::new("lifecycle")).await.unwrap();
    let world = World::new(Arc::clone(&store), config());
    let read = world.read_tile(tile);
    drain(&world).await;
    assert_eq!(read.await.unwrap(), Some(TileId::from("rock")));
    assert_eq!(
        store.stored_positions(world.info()).await.unwrap(),
        vec![ChunkPos::flat(-1, 1)]
    );
}
