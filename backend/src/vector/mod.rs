use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::db::models::Tier;
use crate::error::AppError;

pub mod hnsw;
pub mod pq;

use hnsw::HnswIndex;
use pq::{IvfPqIndex, PqIndex};

const SAVE_EVERY_ADDS: usize = 1000;
const MAGIC: &[u8; 4] = b"AVI1";

pub(crate) fn l2_distance(query: &[f32], stored: &[f16]) -> f32 {
    query
        .iter()
        .zip(stored.iter())
        .map(|(q, s)| {
            let d = q - s.to_f32();
            d * d
        })
        .sum()
}

pub mod codec {
    use crate::error::AppError;

    /// Little-endian append-only byte sink for index files.
    pub struct ByteWriter {
        buf: Vec<u8>,
    }

    impl ByteWriter {
        pub fn new() -> Self {
            Self { buf: Vec::new() }
        }

        pub fn put_u8(&mut self, value: u8) {
            self.buf.push(value);
        }

        pub fn put_u16(&mut self, value: u16) {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }

        pub fn put_u32(&mut self, value: u32) {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }

        pub fn put_u64(&mut self, value: u64) {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }

        pub fn put_f32(&mut self, value: f32) {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }

        pub fn put_bytes(&mut self, bytes: &[u8]) {
            self.buf.extend_from_slice(bytes);
        }

        pub fn into_bytes(self) -> Vec<u8> {
            self.buf
        }
    }

    impl Default for ByteWriter {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct ByteReader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> ByteReader<'a> {
        pub fn new(data: &'a [u8]) -> Self {
            Self { data, pos: 0 }
        }

        fn take(&mut self, n: usize) -> Result<&'a [u8], AppError> {
            if self.pos + n > self.data.len() {
                return Err(AppError::VectorIndex("index file truncated".to_string()));
            }
            let slice = &self.data[self.pos..self.pos + n];
            self.pos += n;
            Ok(slice)
        }

        pub fn get_u8(&mut self) -> Result<u8, AppError> {
            Ok(self.take(1)?[0])
        }

        pub fn get_u16(&mut self) -> Result<u16, AppError> {
            let b = self.take(2)?;
            Ok(u16::from_le_bytes([b[0], b[1]]))
        }

        pub fn get_u32(&mut self) -> Result<u32, AppError> {
            let b = self.take(4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub fn get_u64(&mut self) -> Result<u64, AppError> {
            let b = self.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            Ok(u64::from_le_bytes(arr))
        }

        pub fn get_f32(&mut self) -> Result<f32, AppError> {
            let b = self.take(4)?;
            Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, AppError> {
            Ok(self.take(n)?.to_vec())
        }
    }
}

use codec::{ByteReader, ByteWriter};

enum TierIndex {
    Hnsw(HnswIndex),
    IvfPq(IvfPqIndex),
    Pq(PqIndex),
}

impl TierIndex {
    fn new_for(tier: Tier, dim: usize) -> Self {
        match tier {
            Tier::Hot => TierIndex::Hnsw(HnswIndex::new(dim, 32, 200, 50)),
            Tier::Warm => TierIndex::IvfPq(IvfPqIndex::new(dim, 100, 8)),
            Tier::Cold => TierIndex::Pq(PqIndex::new(dim, 16, 256)),
        }
    }

    fn add(&mut self, vector: &[f32]) -> u32 {
        match self {
            TierIndex::Hnsw(index) => index.add(vector),
            TierIndex::IvfPq(index) => index.add(vector),
            TierIndex::Pq(index) => index.add(vector),
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(f32, u32)> {
        match self {
            TierIndex::Hnsw(index) => index.search(query, k),
            TierIndex::IvfPq(index) => index.search(query, k),
            TierIndex::Pq(index) => index.search(query, k),
        }
    }

    fn len(&self) -> usize {
        match self {
            TierIndex::Hnsw(index) => index.len(),
            TierIndex::IvfPq(index) => index.len(),
            TierIndex::Pq(index) => index.len(),
        }
    }

    fn is_trained(&self) -> bool {
        match self {
            TierIndex::Hnsw(_) => true,
            TierIndex::IvfPq(index) => index.is_trained(),
            TierIndex::Pq(index) => index.is_trained(),
        }
    }

    fn compression_ratio(&self) -> f64 {
        match self {
            TierIndex::Hnsw(_) => 2.0, // f32 -> f16
            TierIndex::IvfPq(index) => index.compression_ratio(),
            TierIndex::Pq(index) => index.compression_ratio(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TierIndex::Hnsw(_) => "hnsw_flat",
            TierIndex::IvfPq(_) => "ivf_pq",
            TierIndex::Pq(_) => "pq",
        }
    }

    fn write_to(&self, out: &mut ByteWriter) {
        match self {
            TierIndex::Hnsw(index) => {
                out.put_u8(0);
                index.write_to(out);
            }
            TierIndex::IvfPq(index) => {
                out.put_u8(1);
                index.write_to(out);
            }
            TierIndex::Pq(index) => {
                out.put_u8(2);
                index.write_to(out);
            }
        }
    }

    fn read_from(reader: &mut ByteReader) -> Result<Self, AppError> {
        match reader.get_u8()? {
            0 => Ok(TierIndex::Hnsw(HnswIndex::read_from(reader)?)),
            1 => Ok(TierIndex::IvfPq(IvfPqIndex::read_from(reader)?)),
            2 => Ok(TierIndex::Pq(PqIndex::read_from(reader)?)),
            other => Err(AppError::VectorIndex(format!(
                "unknown index kind {other}"
            ))),
        }
    }
}

struct TierEntry {
    index: TierIndex,
    /// internal id -> memory id. A missing entry means logically removed.
    id_map: HashMap<u32, String>,
    adds_since_save: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierIndexStats {
    pub kind: String,
    pub total_vectors: usize,
    pub active_ids: usize,
    pub dimension: usize,
    pub file_size_bytes: u64,
    pub compression_ratio: f64,
    pub is_trained: bool,
}

/// One ANN match: distance, memory id, tier it was found in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMatch {
    pub distance: f32,
    pub memory_id: String,
    pub tier: Tier,
}

/// Tier-partitioned ANN store. Each tier persists as an index file plus a
/// JSON id-map sidecar, written together; a pair that fails to load is
/// dropped and rebuilt from the relational store.
pub struct VectorStore {
    dim: usize,
    base_dir: PathBuf,
    tiers: Mutex<HashMap<Tier, TierEntry>>,
}

impl VectorStore {
    pub fn open(base_dir: impl Into<PathBuf>, dim: usize) -> Result<Self, AppError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let mut tiers = HashMap::new();
        for tier in Tier::ALL {
            let entry = match Self::load_tier(&base_dir, tier, dim) {
                Ok(Some(entry)) => {
                    tracing::info!(
                        target: "aster.vector",
                        "{} index loaded: {} vectors",
                        tier,
                        entry.index.len()
                    );
                    entry
                }
                Ok(None) => TierEntry {
                    index: TierIndex::new_for(tier, dim),
                    id_map: HashMap::new(),
                    adds_since_save: 0,
                },
                Err(e) => {
                    tracing::warn!("{tier} index unreadable ({e}), starting fresh for rebuild");
                    TierEntry {
                        index: TierIndex::new_for(tier, dim),
                        id_map: HashMap::new(),
                        adds_since_save: 0,
                    }
                }
            };
            tiers.insert(tier, entry);
        }

        Ok(Self {
            dim,
            base_dir,
            tiers: Mutex::new(tiers),
        })
    }

    fn index_path(base_dir: &Path, tier: Tier) -> PathBuf {
        base_dir.join(format!("{tier}_index.bin"))
    }

    fn id_map_path(base_dir: &Path, tier: Tier) -> PathBuf {
        base_dir.join(format!("{tier}_id_map.json"))
    }

    fn load_tier(base_dir: &Path, tier: Tier, dim: usize) -> Result<Option<TierEntry>, AppError> {
        let index_path = Self::index_path(base_dir, tier);
        let id_map_path = Self::id_map_path(base_dir, tier);
        if !index_path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&index_path)?;
        if bytes.len() < 4 || &bytes[..4] != MAGIC {
            return Err(AppError::VectorIndex("bad index magic".to_string()));
        }
        let mut reader = ByteReader::new(&bytes[4..]);
        let index = TierIndex::read_from(&mut reader)?;

        let id_map: HashMap<u32, String> = if id_map_path.exists() {
            let raw: HashMap<String, String> =
                serde_json::from_str(&fs::read_to_string(&id_map_path)?)?;
            raw.into_iter()
                .filter_map(|(k, v)| k.parse::<u32>().ok().map(|k| (k, v)))
                .collect()
        } else {
            HashMap::new()
        };

        let loaded_dim = match &index {
            TierIndex::Hnsw(h) => h.dim(),
            _ => dim,
        };
        if loaded_dim != dim {
            return Err(AppError::VectorIndex(format!(
                "dimension mismatch: file {loaded_dim}, configured {dim}"
            )));
        }

        Ok(Some(TierEntry {
            index,
            id_map,
            adds_since_save: 0,
        }))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Add vectors with their memory ids; returns internal ids. Persists the
    /// pair every 1000 adds.
    pub fn add(
        &self,
        tier: Tier,
        vectors: &[Vec<f32>],
        ids: &[String],
    ) -> Result<Vec<u32>, AppError> {
        if vectors.len() != ids.len() {
            return Err(AppError::VectorIndex(
                "vectors and ids length mismatch".to_string(),
            ));
        }

        let mut tiers = self
            .tiers
            .lock()
            .map_err(|_| AppError::VectorIndex("vector store lock poisoned".to_string()))?;
        let entry = tiers
            .get_mut(&tier)
            .ok_or_else(|| AppError::VectorIndex(format!("unknown tier {tier}")))?;

        let mut internal_ids = Vec::with_capacity(vectors.len());
        for (vector, id) in vectors.iter().zip(ids.iter()) {
            if vector.len() != self.dim {
                return Err(AppError::VectorIndex(format!(
                    "vector dimension {} != {}",
                    vector.len(),
                    self.dim
                )));
            }
            let internal = entry.index.add(vector);
            entry.id_map.insert(internal, id.clone());
            internal_ids.push(internal);
        }

        entry.adds_since_save += vectors.len();
        if entry.adds_since_save >= SAVE_EVERY_ADDS {
            entry.adds_since_save = 0;
            Self::persist_tier(&self.base_dir, tier, entry)?;
        }

        Ok(internal_ids)
    }

    pub fn search(&self, tier: Tier, query: &[f32], k: usize) -> Vec<VectorMatch> {
        let tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(_) => return Vec::new(),
        };
        let Some(entry) = tiers.get(&tier) else {
            return Vec::new();
        };

        // Over-fetch to absorb logically-removed ids.
        entry
            .index
            .search(query, k * 2)
            .into_iter()
            .filter_map(|(dist, internal)| {
                entry.id_map.get(&internal).map(|memory_id| VectorMatch {
                    distance: dist,
                    memory_id: memory_id.clone(),
                    tier,
                })
            })
            .take(k)
            .collect()
    }

    /// Search several tiers and merge by ascending distance.
    pub fn multi_tier_search(&self, query: &[f32], k: usize, tiers: &[Tier]) -> Vec<VectorMatch> {
        let mut all = Vec::new();
        for &tier in tiers {
            all.extend(self.search(tier, query, k));
        }
        all.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(k);
        all
    }

    /// Logical removal: drop ids from the map; the rows compact at vacuum.
    pub fn remove(&self, tier: Tier, memory_ids: &[String]) -> usize {
        let mut tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(_) => return 0,
        };
        let Some(entry) = tiers.get_mut(&tier) else {
            return 0;
        };

        let victim: std::collections::HashSet<&String> = memory_ids.iter().collect();
        let before = entry.id_map.len();
        entry.id_map.retain(|_, memory_id| !victim.contains(memory_id));
        before - entry.id_map.len()
    }

    pub fn remove_everywhere(&self, memory_ids: &[String]) -> usize {
        Tier::ALL
            .iter()
            .map(|&tier| self.remove(tier, memory_ids))
            .sum()
    }

    /// Every memory id currently indexed, across tiers.
    pub fn all_memory_ids(&self) -> Vec<String> {
        let tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(_) => return Vec::new(),
        };
        let mut ids = Vec::new();
        for entry in tiers.values() {
            ids.extend(entry.id_map.values().cloned());
        }
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn contains(&self, memory_id: &str) -> bool {
        let tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(_) => return false,
        };
        tiers
            .values()
            .any(|entry| entry.id_map.values().any(|id| id == memory_id))
    }

    pub fn stats(&self, tier: Tier) -> Option<TierIndexStats> {
        let tiers = self.tiers.lock().ok()?;
        let entry = tiers.get(&tier)?;
        let file_size = fs::metadata(Self::index_path(&self.base_dir, tier))
            .map(|m| m.len())
            .unwrap_or(0);

        Some(TierIndexStats {
            kind: entry.index.kind().to_string(),
            total_vectors: entry.index.len(),
            active_ids: entry.id_map.len(),
            dimension: self.dim,
            file_size_bytes: file_size,
            compression_ratio: entry.index.compression_ratio(),
            is_trained: entry.index.is_trained(),
        })
    }

    /// Physically drop logically-removed rows where the tier representation
    /// allows it, then persist everything. The vacuum sweep calls this.
    pub fn compact_and_save(&self) -> Result<(), AppError> {
        let mut tiers = self
            .tiers
            .lock()
            .map_err(|_| AppError::VectorIndex("vector store lock poisoned".to_string()))?;

        for (&tier, entry) in tiers.iter_mut() {
            match &mut entry.index {
                TierIndex::Hnsw(index) => {
                    // Graph links are positional; rebuild from live vectors.
                    if entry.id_map.len() < index.len() {
                        let mut rebuilt = HnswIndex::new(self.dim, 32, 200, 50);
                        let mut new_map = HashMap::new();
                        let mut live: Vec<(u32, String)> = entry
                            .id_map
                            .iter()
                            .map(|(k, v)| (*k, v.clone()))
                            .collect();
                        live.sort_by_key(|(k, _)| *k);
                        for (old_id, memory_id) in live {
                            if let Some(vector) = index.vector(old_id) {
                                let new_id = rebuilt.add(&vector);
                                new_map.insert(new_id, memory_id);
                            }
                        }
                        *index = rebuilt;
                        entry.id_map = new_map;
                    }
                }
                TierIndex::IvfPq(index) => {
                    let id_map = entry.id_map.clone();
                    let mapping = index.compact(&|id| id_map.contains_key(&id));
                    entry.id_map = remap(&id_map, &mapping);
                }
                TierIndex::Pq(index) => {
                    let id_map = entry.id_map.clone();
                    let mapping = index.compact(&|id| id_map.contains_key(&id));
                    entry.id_map = remap(&id_map, &mapping);
                }
            }
            entry.adds_since_save = 0;
            Self::persist_tier(&self.base_dir, tier, entry)?;
        }

        Ok(())
    }

    /// Persist every tier pair. Shutdown path.
    pub fn save_all(&self) -> Result<(), AppError> {
        let mut tiers = self
            .tiers
            .lock()
            .map_err(|_| AppError::VectorIndex("vector store lock poisoned".to_string()))?;
        for (&tier, entry) in tiers.iter_mut() {
            entry.adds_since_save = 0;
            Self::persist_tier(&self.base_dir, tier, entry)?;
        }
        Ok(())
    }

    fn persist_tier(base_dir: &Path, tier: Tier, entry: &TierEntry) -> Result<(), AppError> {
        let mut writer = ByteWriter::new();
        writer.put_bytes(MAGIC);
        entry.index.write_to(&mut writer);
        let bytes = writer.into_bytes();

        write_atomic(&Self::index_path(base_dir, tier), &bytes)?;

        let raw: HashMap<String, &String> = entry
            .id_map
            .iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        write_atomic(
            &Self::id_map_path(base_dir, tier),
            serde_json::to_string(&raw)?.as_bytes(),
        )?;

        Ok(())
    }
}

fn remap(old_map: &HashMap<u32, String>, mapping: &[(u32, u32)]) -> HashMap<u32, String> {
    let mut new_map = HashMap::with_capacity(mapping.len());
    for (old_id, new_id) in mapping {
        if let Some(memory_id) = old_map.get(old_id) {
            new_map.insert(*new_id, memory_id.clone());
        }
    }
    new_map
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vector(seed: usize, dim: usize) -> Vec<f32> {
        (0..dim).map(|i| ((seed * 31 + i) % 17) as f32 / 17.0).collect()
    }

    #[test]
    fn add_search_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VectorStore::open(dir.path(), 16).expect("open");

        let vectors: Vec<Vec<f32>> = (0..10).map(|i| sample_vector(i, 16)).collect();
        let ids: Vec<String> = (0..10).map(|i| format!("mem-{i}")).collect();
        store.add(Tier::Hot, &vectors, &ids).expect("add");

        let hits = store.search(Tier::Hot, &sample_vector(3, 16), 3);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].memory_id, "mem-3");

        let removed = store.remove(Tier::Hot, &["mem-3".to_string()]);
        assert_eq!(removed, 1);
        let hits = store.search(Tier::Hot, &sample_vector(3, 16), 3);
        assert!(hits.iter().all(|h| h.memory_id != "mem-3"));
    }

    #[test]
    fn multi_tier_search_merges_ascending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VectorStore::open(dir.path(), 8).expect("open");

        store
            .add(Tier::Hot, &[vec![0.0; 8]], &["hot-0".to_string()])
            .expect("add hot");
        store
            .add(Tier::Warm, &[vec![1.0; 8]], &["warm-0".to_string()])
            .expect("add warm");

        let hits = store.multi_tier_search(&vec![0.1; 8], 2, &Tier::ALL);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].memory_id, "hot-0");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = VectorStore::open(dir.path(), 8).expect("open");
            let vectors: Vec<Vec<f32>> = (0..5).map(|i| sample_vector(i, 8)).collect();
            let ids: Vec<String> = (0..5).map(|i| format!("m{i}")).collect();
            store.add(Tier::Hot, &vectors, &ids).expect("add");
            store.save_all().expect("save");
        }

        let store = VectorStore::open(dir.path(), 8).expect("reopen");
        let stats = store.stats(Tier::Hot).expect("stats");
        assert_eq!(stats.total_vectors, 5);
        assert_eq!(stats.active_ids, 5);
        assert!(stats.is_trained);

        let hits = store.search(Tier::Hot, &sample_vector(2, 8), 1);
        assert_eq!(hits[0].memory_id, "m2");
    }

    #[test]
    fn corrupt_index_pair_is_recoverable() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("hot_index.bin"), b"garbage").expect("write");

        let store = VectorStore::open(dir.path(), 8).expect("open survives corruption");
        assert_eq!(store.stats(Tier::Hot).expect("stats").total_vectors, 0);
    }

    #[test]
    fn compaction_drops_removed_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VectorStore::open(dir.path(), 8).expect("open");

        let vectors: Vec<Vec<f32>> = (0..6).map(|i| sample_vector(i, 8)).collect();
        let ids: Vec<String> = (0..6).map(|i| format!("m{i}")).collect();
        store.add(Tier::Hot, &vectors, &ids).expect("add");
        store.remove(Tier::Hot, &["m1".to_string(), "m4".to_string()]);

        store.compact_and_save().expect("compact");
        let stats = store.stats(Tier::Hot).expect("stats");
        assert_eq!(stats.total_vectors, 4);
        assert_eq!(stats.active_ids, 4);

        let hits = store.search(Tier::Hot, &sample_vector(2, 8), 4);
        assert!(hits.iter().all(|h| h.memory_id != "m1" && h.memory_id != "m4"));
    }
}
