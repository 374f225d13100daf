//! File-backed chunk persistence.
//!
//! Layout inside the store root, one directory per world id:
//! ```text
//! <world_id>/
//!   world.meta.json              - schema version and chunk extent
//!   chunks/
//!     <x>_<y>_<z>.chunk.cbor.zst - CBOR+zstd compressed chunk
//!   integrity/
//!     manifest.json              - sha256 of every chunk file
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use islands_common::{ChunkExtent, ChunkPos, WorldInfo};
use islands_kernel::Chunk;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ChunkStorage;

/// Current on-disk schema version.
const SCHEMA_VERSION: u32 = 1;
const CHUNK_SUFFIX: &str = ".chunk.cbor.zst";
const ZSTD_LEVEL: i32 = 3;

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("world was created with chunk extent {stored}, store configured for {configured}")]
    ExtentMismatch {
        stored: ChunkExtent,
        configured: ChunkExtent,
    },
    #[error("chunk file for {chunk} does not describe that chunk")]
    Corrupt { chunk: ChunkPos },
}

/// Metadata stored in world.meta.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub schema_version: u32,
    pub name: String,
    pub chunk_extent: ChunkExtent,
}

/// Hash record for one chunk file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
}

/// Integrity manifest: chunk file name to content hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: BTreeMap<String, ManifestEntry>,
}

/// A world whose directory has been checked, with its manifest in memory.
struct OpenWorld {
    meta: WorldMeta,
    manifest: IntegrityManifest,
}

/// Chunk store writing one compressed file per chunk.
///
/// A file whose hash disagrees with the manifest, or that fails to decode, reads as absent.
/// A world's metadata is read once, on first use, and kept.
pub struct FileChunkStore {
    root: PathBuf,
    extent: ChunkExtent,
    /// Worlds opened so far, keyed by world id.
    worlds: Mutex<HashMap<String, OpenWorld>>,
    /// Held for a whole save: chunk files and the manifest written from it go out together.
    writes: tokio::sync::Mutex<()>,
    tmp_seq: AtomicU64,
}

impl FileChunkStore {
    /// Open or create a store rooted at `path` for chunks of `extent`.
    pub fn open(path: impl AsRef<Path>, extent: ChunkExtent) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            extent,
            worlds: Mutex::new(HashMap::new()),
            writes: tokio::sync::Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Get the path to the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extent(&self) -> ChunkExtent {
        self.extent
    }

    pub fn world_dir(&self, info: &WorldInfo) -> PathBuf {
        self.root.join(info.id())
    }

    fn chunk_path(&self, info: &WorldInfo, chunk: ChunkPos) -> PathBuf {
        self.world_dir(info).join("chunks").join(chunk_file_name(chunk))
    }

    fn manifest_path(&self, info: &WorldInfo) -> PathBuf {
        self.world_dir(info).join("integrity").join("manifest.json")
    }

    fn worlds(&self) -> MutexGuard<'_, HashMap<String, OpenWorld>> {
        self.worlds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the world directory on first use and check its metadata against this store.
    /// Later calls answer from memory.
    pub async fn prepare_world(&self, info: &WorldInfo) -> Result<WorldMeta, StoreError> {
        let cached = self.worlds().get(&info.id()).map(|w| w.meta.clone());
        if let Some(meta) = cached {
            return Ok(meta);
        }

        let dir = self.world_dir(info);
        tokio::fs::create_dir_all(dir.join("chunks")).await?;
        tokio::fs::create_dir_all(dir.join("integrity")).await?;

        let meta_path = dir.join("world.meta.json");
        let meta = match read_json::<WorldMeta>(&meta_path).await? {
            Some(meta) => {
                if meta.schema_version != SCHEMA_VERSION {
                    return Err(StoreError::SchemaMismatch {
                        file_version: meta.schema_version,
                        expected_version: SCHEMA_VERSION,
                    });
                }
                if meta.chunk_extent != self.extent {
                    return Err(StoreError::ExtentMismatch {
                        stored: meta.chunk_extent,
                        configured: self.extent,
                    });
                }
                meta
            }
            None => {
                let meta = WorldMeta {
                    schema_version: SCHEMA_VERSION,
                    name: info.name.clone(),
                    chunk_extent: self.extent,
                };
                self.write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)
                    .await?;
                tracing::debug!(world = %info, "created world directory");
                meta
            }
        };
        let manifest = read_json::<IntegrityManifest>(&self.manifest_path(info))
            .await?
            .unwrap_or_default();

        // Another task may have opened the world meanwhile; the first one in wins.
        let mut worlds = self.worlds();
        let world = worlds
            .entry(info.id())
            .or_insert(OpenWorld { meta, manifest });
        Ok(world.meta.clone())
    }

    /// Positions of every chunk file of the world, sorted.
    pub async fn stored_positions(&self, info: &WorldInfo) -> Result<Vec<ChunkPos>, StoreError> {
        let dir = self.world_dir(info).join("chunks");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut positions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(pos) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
                positions.push(pos);
            }
        }
        positions.sort_by_key(|p| (p.z(), p.y(), p.x()));
        Ok(positions)
    }

    /// Verify every manifest hash of the world against the files on disk.
    pub async fn verify_integrity(&self, info: &WorldInfo) -> Result<(), StoreError> {
        self.prepare_world(info).await?;
        let entries = self.manifest_snapshot(info);
        let chunks_dir = self.world_dir(info).join("chunks");
        for (file, entry) in entries {
            let data = tokio::fs::read(chunks_dir.join(&file)).await?;
            let actual = sha256_hex(&data);
            if actual != entry.sha256 {
                return Err(StoreError::IntegrityMismatch {
                    file,
                    expected: entry.sha256,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn manifest_snapshot(&self, info: &WorldInfo) -> BTreeMap<String, ManifestEntry> {
        self.worlds()
            .get(&info.id())
            .map(|w| w.manifest.entries.clone())
            .unwrap_or_default()
    }

    fn expected_hash(&self, info: &WorldInfo, file: &str) -> Option<String> {
        self.worlds()
            .get(&info.id())
            .and_then(|w| w.manifest.entries.get(file))
            .map(|e| e.sha256.clone())
    }

    async fn read_chunk(&self, info: &WorldInfo, pos: ChunkPos) -> Result<Option<Chunk>, StoreError> {
        let path = self.chunk_path(info, pos);
        let compressed = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file = chunk_file_name(pos);
        if let Some(expected) = self.expected_hash(info, &file) {
            let actual = sha256_hex(&compressed);
            if actual != expected {
                return Err(StoreError::IntegrityMismatch {
                    file,
                    expected,
                    actual,
                });
            }
        }

        let cbor_bytes = zstd_decompress(&compressed)?;
        let chunk: Chunk = cbor_deserialize(&cbor_bytes)?;
        if !chunk.is_consistent_with(pos, self.extent) {
            return Err(StoreError::Corrupt { chunk: pos });
        }
        Ok(Some(chunk))
    }

    /// Caller holds `writes`.
    async fn write_chunk(&self, info: &WorldInfo, chunk: &Chunk) -> Result<(), StoreError> {
        let file = chunk_file_name(chunk.position());
        let path = self.chunk_path(info, chunk.position());

        let cbor_bytes = cbor_serialize(chunk)?;
        let compressed = zstd_compress(&cbor_bytes)?;
        let hash = sha256_hex(&compressed);
        self.write_atomic(&path, &compressed).await?;

        if let Some(world) = self.worlds().get_mut(&info.id()) {
            world
                .manifest
                .entries
                .insert(file, ManifestEntry { sha256: hash });
        }
        Ok(())
    }

    /// Caller holds `writes`.
    async fn save_manifest(&self, info: &WorldInfo) -> Result<(), StoreError> {
        let manifest = IntegrityManifest {
            entries: self.manifest_snapshot(info),
        };
        self.write_atomic(&self.manifest_path(info), &serde_json::to_vec_pretty(&manifest)?)
            .await
    }

    /// Write under a scratch name next to `path`, then rename over it, so a crash never
    /// leaves half a file behind. Every write gets its own scratch name.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{seq}.tmp"));
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl ChunkStorage for FileChunkStore {
    async fn existing_among(&self, positions: &[ChunkPos], info: &WorldInfo) -> Vec<ChunkPos> {
        if let Err(e) = self.prepare_world(info).await {
            tracing::warn!(world = %info, error = %e, "cannot open world directory");
            return Vec::new();
        }
        let mut existing = Vec::with_capacity(positions.len());
        for &pos in positions {
            if tokio::fs::try_exists(self.chunk_path(info, pos))
                .await
                .unwrap_or(false)
            {
                existing.push(pos);
            }
        }
        existing
    }

    async fn load(&self, positions: &[ChunkPos], info: &WorldInfo) -> Vec<Chunk> {
        if let Err(e) = self.prepare_world(info).await {
            tracing::warn!(world = %info, error = %e, "cannot open world directory");
            return Vec::new();
        }
        let mut chunks = Vec::with_capacity(positions.len());
        for &pos in positions {
            match self.read_chunk(info, pos).await {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => tracing::trace!(chunk = %pos, "no chunk file"),
                Err(e) => tracing::warn!(chunk = %pos, error = %e, "discarding unreadable chunk"),
            }
        }
        tracing::debug!(requested = positions.len(), loaded = chunks.len(), "loaded chunks");
        chunks
    }

    async fn save(&self, chunks: &[Chunk], info: &WorldInfo) -> Result<(), StoreError> {
        self.prepare_world(info).await?;
        let _writing = self.writes.lock().await;
        let mut result = Ok(());
        for chunk in chunks {
            if let Err(e) = self.write_chunk(info, chunk).await {
                tracing::error!(chunk = %chunk.position(), error = %e, "failed to write chunk");
                result = Err(e);
                break;
            }
        }
        // Record whatever made it to disk, even when a later chunk failed.
        self.save_manifest(info).await?;
        if result.is_ok() {
            tracing::debug!(count = chunks.len(), world = %info, "saved chunks");
        }
        result
    }
}

/// Parse a JSON file, `None` if it does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn chunk_file_name(pos: ChunkPos) -> String {
    format!("{}_{}_{}{CHUNK_SUFFIX}", pos.x(), pos.y(), pos.z())
}

fn parse_chunk_file_name(name: &str) -> Option<ChunkPos> {
    let stem = name.strip_suffix(CHUNK_SUFFIX)?;
    let mut parts = stem.split('_').map(str::parse::<i32>);
    let (x, y, z) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    if parts.next().is_some() {
        return None;
    }
    Some(ChunkPos::new(x, y, z))
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
