use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use half::f16;

use crate::vector::codec::{ByteReader, ByteWriter};
use crate::vector::l2_distance;
use crate::error::AppError;

/// Graph-based index for the hot tier: full (f16) vectors, layered
/// small-world graph, best recency-latency of the three tiers.
pub struct HnswIndex {
    dim: usize,
    m: usize,
    m0: usize,
    ef_construction: usize,
    ef_search: usize,
    vectors: Vec<Vec<f16>>,
    /// links[node][layer] -> neighbor ids. A node has entries for layers
    /// 0..=level(node).
    links: Vec<Vec<Vec<u32>>>,
    entry_point: Option<u32>,
    max_level: usize,
    rng_state: u64,
}

#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    id: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl HnswIndex {
    pub fn new(dim: usize, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            dim,
            m,
            m0: m * 2,
            ef_construction,
            ef_search,
            vectors: Vec::new(),
            links: Vec::new(),
            entry_point: None,
            max_level: 0,
            rng_state: 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vector(&self, id: u32) -> Option<Vec<f32>> {
        self.vectors
            .get(id as usize)
            .map(|v| v.iter().map(|x| x.to_f32()).collect())
    }

    fn next_rand(&mut self) -> f64 {
        // xorshift64*; deterministic so rebuilds reproduce the same graph.
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        let bits = x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }

    fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.m as f64).ln();
        let uniform = self.next_rand().max(f64::MIN_POSITIVE);
        (-(uniform.ln()) * ml) as usize
    }

    fn distance_to(&self, query: &[f32], id: u32) -> f32 {
        let stored = &self.vectors[id as usize];
        l2_distance(query, stored)
    }

    pub fn add(&mut self, vector: &[f32]) -> u32 {
        debug_assert_eq!(vector.len(), self.dim);
        let id = self.vectors.len() as u32;
        let level = self.random_level();

        self.vectors
            .push(vector.iter().map(|x| f16::from_f32(*x)).collect());
        self.links.push(vec![Vec::new(); level + 1]);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return id;
        };

        let mut ep = entry;

        // Descend through the upper layers greedily.
        let mut layer = self.max_level;
        while layer > level {
            ep = self.greedy_closest(vector, ep, layer);
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        // Insert with full candidate search on the shared layers.
        let top = level.min(self.max_level);
        for layer in (0..=top).rev() {
            let candidates = self.search_layer(vector, &[ep], self.ef_construction, layer);
            if let Some(best) = candidates.first() {
                ep = best.id;
            }

            let max_links = if layer == 0 { self.m0 } else { self.m };
            let neighbors: Vec<u32> = candidates.iter().take(self.m).map(|c| c.id).collect();
            self.links[id as usize][layer] = neighbors.clone();

            for neighbor in neighbors {
                let list = &mut self.links[neighbor as usize][layer];
                list.push(id);
                if list.len() > max_links {
                    // Prune to the closest max_links around the neighbor.
                    let anchor: Vec<f32> = self.vectors[neighbor as usize]
                        .iter()
                        .map(|x| x.to_f32())
                        .collect();
                    let mut scored: Vec<(f32, u32)> = self.links[neighbor as usize][layer]
                        .iter()
                        .map(|&other| (self.distance_to(&anchor, other), other))
                        .collect();
                    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                    scored.truncate(max_links);
                    self.links[neighbor as usize][layer] =
                        scored.into_iter().map(|(_, other)| other).collect();
                }
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }

        id
    }

    fn greedy_closest(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance_to(query, current);
        loop {
            let mut improved = false;
            let neighbors = self.links[current as usize]
                .get(layer)
                .cloned()
                .unwrap_or_default();
            for neighbor in neighbors {
                let dist = self.distance_to(query, neighbor);
                if dist < current_dist {
                    current = neighbor;
                    current_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    fn search_layer(&self, query: &[f32], entries: &[u32], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited: HashSet<u32> = entries.iter().copied().collect();
        let mut to_visit: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut found: BinaryHeap<Candidate> = BinaryHeap::new();

        for &entry in entries {
            let dist = self.distance_to(query, entry);
            to_visit.push(Reverse(Candidate { dist, id: entry }));
            found.push(Candidate { dist, id: entry });
        }

        while let Some(Reverse(closest)) = to_visit.pop() {
            if let Some(worst) = found.peek() {
                if closest.dist > worst.dist && found.len() >= ef {
                    break;
                }
            }

            let neighbors = self.links[closest.id as usize]
                .get(layer)
                .cloned()
                .unwrap_or_default();
            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.distance_to(query, neighbor);
                let should_add = found.len() < ef
                    || found.peek().map(|w| dist < w.dist).unwrap_or(true);
                if should_add {
                    to_visit.push(Reverse(Candidate { dist, id: neighbor }));
                    found.push(Candidate { dist, id: neighbor });
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        let mut results: Vec<Candidate> = found.into_vec();
        results.sort();
        results
    }

    /// k nearest internal ids with distances, ascending.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, u32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };

        let mut ep = entry;
        let mut layer = self.max_level;
        while layer > 0 {
            ep = self.greedy_closest(query, ep, layer);
            layer -= 1;
        }

        let ef = self.ef_search.max(k);
        self.search_layer(query, &[ep], ef, 0)
            .into_iter()
            .take(k)
            .map(|c| (c.dist, c.id))
            .collect()
    }

    pub fn write_to(&self, out: &mut ByteWriter) {
        out.put_u32(self.dim as u32);
        out.put_u32(self.m as u32);
        out.put_u32(self.ef_construction as u32);
        out.put_u32(self.ef_search as u32);
        out.put_u32(self.max_level as u32);
        out.put_u32(self.entry_point.map(|e| e + 1).unwrap_or(0));
        out.put_u64(self.rng_state);

        out.put_u32(self.vectors.len() as u32);
        for vector in &self.vectors {
            for value in vector {
                out.put_u16(value.to_bits());
            }
        }
        for node in &self.links {
            out.put_u32(node.len() as u32);
            for layer in node {
                out.put_u32(layer.len() as u32);
                for neighbor in layer {
                    out.put_u32(*neighbor);
                }
            }
        }
    }

    pub fn read_from(reader: &mut ByteReader) -> Result<Self, AppError> {
        let dim = reader.get_u32()? as usize;
        let m = reader.get_u32()? as usize;
        let ef_construction = reader.get_u32()? as usize;
        let ef_search = reader.get_u32()? as usize;
        let max_level = reader.get_u32()? as usize;
        let entry_raw = reader.get_u32()?;
        let rng_state = reader.get_u64()?;

        let count = reader.get_u32()? as usize;
        let mut vectors = Vec::with_capacity(count);
        for _ in 0..count {
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(f16::from_bits(reader.get_u16()?));
            }
            vectors.push(vector);
        }

        let mut links = Vec::with_capacity(count);
        for _ in 0..count {
            let layers = reader.get_u32()? as usize;
            let mut node = Vec::with_capacity(layers);
            for _ in 0..layers {
                let len = reader.get_u32()? as usize;
                let mut layer = Vec::with_capacity(len);
                for _ in 0..len {
                    layer.push(reader.get_u32()?);
                }
                node.push(layer);
            }
            links.push(node);
        }

        Ok(Self {
            dim,
            m,
            m0: m * 2,
            ef_construction,
            ef_search,
            vectors,
            links,
            entry_point: if entry_raw == 0 { None } else { Some(entry_raw - 1) },
            max_level,
            rng_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::codec::{ByteReader, ByteWriter};

    fn basis_vector(dim: usize, hot: usize, value: f32) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = value;
        v
    }

    #[test]
    fn nearest_neighbor_is_found() {
        let mut index = HnswIndex::new(8, 32, 200, 50);
        for i in 0..50 {
            index.add(&basis_vector(8, i % 8, 1.0 + (i / 8) as f32 * 0.1));
        }

        let query = basis_vector(8, 3, 1.0);
        let results = index.search(&query, 5);
        assert_eq!(results.len(), 5);
        // Closest hit must share the query's direction.
        let best = index.vector(results[0].1).unwrap();
        assert!(best[3] > 0.0);
        // Distances come back ascending.
        for pair in results.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn serialization_roundtrip_preserves_search() {
        let mut index = HnswIndex::new(4, 8, 40, 16);
        for i in 0..30 {
            index.add(&[i as f32, (i * 2) as f32, 0.5, -(i as f32)]);
        }

        let mut writer = ByteWriter::new();
        index.write_to(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = ByteReader::new(&bytes);
        let restored = HnswIndex::read_from(&mut reader).expect("read");

        let query = [10.0, 20.0, 0.5, -10.0];
        assert_eq!(index.search(&query, 3), restored.search(&query, 3));
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = HnswIndex::new(4, 8, 40, 16);
        assert!(index.search(&[0.0; 4], 5).is_empty());
    }
}
