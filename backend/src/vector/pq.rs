use half::f16;

use crate::error::AppError;
use crate::vector::codec::{ByteReader, ByteWriter};
use crate::vector::l2_distance;

const KSUB: usize = 256;
const KMEANS_ITERS: usize = 20;
const NPROBE: usize = 8;

fn f32_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Plain k-means with deterministic seeding. Empty clusters steal the point
/// furthest from its centroid.
fn kmeans(data: &[Vec<f32>], k: usize, iters: usize) -> Vec<Vec<f32>> {
    let k = k.min(data.len()).max(1);
    let dim = data[0].len();

    // Spread the initial centroids across the data set.
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| data[(i * data.len()) / k].clone())
        .collect();

    let mut assignments = vec![0usize; data.len()];

    for _ in 0..iters {
        let mut changed = false;
        for (i, point) in data.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = f32_l2(point, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in data.iter().zip(assignments.iter()) {
            counts[cluster] += 1;
            for (s, v) in sums[cluster].iter_mut().zip(point.iter()) {
                *s += v;
            }
        }

        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed from the point furthest from its current centroid.
                let far = data
                    .iter()
                    .enumerate()
                    .max_by(|(i, a), (j, b)| {
                        let da = f32_l2(a, &centroids[assignments[*i]]);
                        let db = f32_l2(b, &centroids[assignments[*j]]);
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                centroids[c] = data[far].clone();
                continue;
            }
            for (dst, s) in centroids[c].iter_mut().zip(sums[c].iter()) {
                *dst = s / counts[c] as f32;
            }
        }

        if !changed {
            break;
        }
    }

    centroids
}

/// Product quantizer: m sub-spaces, one byte per sub-space code.
pub struct PqCodebook {
    pub m: usize,
    pub dsub: usize,
    pub ksub: usize,
    /// centroids[sub][code] -> dsub floats
    centroids: Vec<Vec<Vec<f32>>>,
}

impl PqCodebook {
    pub fn train(data: &[Vec<f32>], m: usize) -> Self {
        let dim = data[0].len();
        let dsub = dim / m;
        let ksub = KSUB.min(data.len());

        let mut centroids = Vec::with_capacity(m);
        for sub in 0..m {
            let slice: Vec<Vec<f32>> = data
                .iter()
                .map(|v| v[sub * dsub..(sub + 1) * dsub].to_vec())
                .collect();
            centroids.push(kmeans(&slice, ksub, KMEANS_ITERS));
        }

        Self {
            m,
            dsub,
            ksub,
            centroids,
        }
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let slice = &vector[sub * self.dsub..(sub + 1) * self.dsub];
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for (c, centroid) in self.centroids[sub].iter().enumerate() {
                let dist = f32_l2(slice, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            codes.push(best as u8);
        }
        codes
    }

    /// Asymmetric distance table: table[sub][code] = ||q_sub - centroid||^2.
    pub fn distance_table(&self, query: &[f32]) -> Vec<Vec<f32>> {
        (0..self.m)
            .map(|sub| {
                let slice = &query[sub * self.dsub..(sub + 1) * self.dsub];
                self.centroids[sub]
                    .iter()
                    .map(|centroid| f32_l2(slice, centroid))
                    .collect()
            })
            .collect()
    }

    pub fn adc_distance(&self, table: &[Vec<f32>], codes: &[u8]) -> f32 {
        codes
            .iter()
            .enumerate()
            .map(|(sub, &code)| table[sub][code as usize])
            .sum()
    }

    /// float32 bytes vs m code bytes per vector.
    pub fn compression_ratio(&self, dim: usize) -> f64 {
        (dim * 4) as f64 / self.m as f64
    }

    fn write_to(&self, out: &mut ByteWriter) {
        out.put_u32(self.m as u32);
        out.put_u32(self.dsub as u32);
        out.put_u32(self.ksub as u32);
        for sub in &self.centroids {
            out.put_u32(sub.len() as u32);
            for centroid in sub {
                for value in centroid {
                    out.put_f32(*value);
                }
            }
        }
    }

    fn read_from(reader: &mut ByteReader) -> Result<Self, AppError> {
        let m = reader.get_u32()? as usize;
        let dsub = reader.get_u32()? as usize;
        let ksub = reader.get_u32()? as usize;
        let mut centroids = Vec::with_capacity(m);
        for _ in 0..m {
            let len = reader.get_u32()? as usize;
            let mut sub = Vec::with_capacity(len);
            for _ in 0..len {
                let mut centroid = Vec::with_capacity(dsub);
                for _ in 0..dsub {
                    centroid.push(reader.get_f32()?);
                }
                sub.push(centroid);
            }
            centroids.push(sub);
        }
        Ok(Self {
            m,
            dsub,
            ksub,
            centroids,
        })
    }
}

/// Pure PQ index for the cold tier: maximum compression, trained lazily;
/// buffers raw f16 vectors and brute-forces until enough rows arrive.
pub struct PqIndex {
    dim: usize,
    m: usize,
    train_threshold: usize,
    codebook: Option<PqCodebook>,
    codes: Vec<Vec<u8>>,
    raw: Vec<Vec<f16>>,
}

impl PqIndex {
    pub fn new(dim: usize, m: usize, train_threshold: usize) -> Self {
        Self {
            dim,
            m,
            train_threshold,
            codebook: None,
            codes: Vec::new(),
            raw: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        if self.codebook.is_some() {
            self.codes.len()
        } else {
            self.raw.len()
        }
    }

    pub fn is_trained(&self) -> bool {
        self.codebook.is_some()
    }

    pub fn compression_ratio(&self) -> f64 {
        match &self.codebook {
            Some(cb) => cb.compression_ratio(self.dim),
            None => 2.0, // f32 -> f16 only
        }
    }

    pub fn add(&mut self, vector: &[f32]) -> u32 {
        debug_assert_eq!(vector.len(), self.dim);
        let id = self.len() as u32;

        match &self.codebook {
            Some(cb) => self.codes.push(cb.encode(vector)),
            None => {
                self.raw
                    .push(vector.iter().map(|x| f16::from_f32(*x)).collect());
                if self.raw.len() >= self.train_threshold {
                    self.train_from_buffer();
                }
            }
        }
        id
    }

    fn train_from_buffer(&mut self) {
        let data: Vec<Vec<f32>> = self
            .raw
            .iter()
            .map(|v| v.iter().map(|x| x.to_f32()).collect())
            .collect();
        let cb = PqCodebook::train(&data, self.m);
        self.codes = data.iter().map(|v| cb.encode(v)).collect();
        self.codebook = Some(cb);
        self.raw.clear();
        tracing::info!("Trained PQ index on {} vectors (m={})", self.codes.len(), self.m);
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, u32)> {
        let mut results: Vec<(f32, u32)> = match &self.codebook {
            Some(cb) => {
                let table = cb.distance_table(query);
                self.codes
                    .iter()
                    .enumerate()
                    .map(|(i, codes)| (cb.adc_distance(&table, codes), i as u32))
                    .collect()
            }
            None => self
                .raw
                .iter()
                .enumerate()
                .map(|(i, v)| (l2_distance(query, v), i as u32))
                .collect(),
        };
        results.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        results
    }

    /// Drop rows not in `live`, renumbering survivors in order. Returns the
    /// old-id -> new-id mapping.
    pub fn compact(&mut self, live: &dyn Fn(u32) -> bool) -> Vec<(u32, u32)> {
        let mut mapping = Vec::new();
        let mut next = 0u32;

        if self.codebook.is_some() {
            let mut kept = Vec::with_capacity(self.codes.len());
            for (i, codes) in self.codes.drain(..).enumerate() {
                if live(i as u32) {
                    mapping.push((i as u32, next));
                    kept.push(codes);
                    next += 1;
                }
            }
            self.codes = kept;
        } else {
            let mut kept = Vec::with_capacity(self.raw.len());
            for (i, v) in self.raw.drain(..).enumerate() {
                if live(i as u32) {
                    mapping.push((i as u32, next));
                    kept.push(v);
                    next += 1;
                }
            }
            self.raw = kept;
        }
        mapping
    }

    pub fn write_to(&self, out: &mut ByteWriter) {
        out.put_u32(self.dim as u32);
        out.put_u32(self.m as u32);
        out.put_u32(self.train_threshold as u32);
        out.put_u8(self.codebook.is_some() as u8);
        if let Some(cb) = &self.codebook {
            cb.write_to(out);
            out.put_u32(self.codes.len() as u32);
            for codes in &self.codes {
                out.put_bytes(codes);
            }
        } else {
            out.put_u32(self.raw.len() as u32);
            for vector in &self.raw {
                for value in vector {
                    out.put_u16(value.to_bits());
                }
            }
        }
    }

    pub fn read_from(reader: &mut ByteReader) -> Result<Self, AppError> {
        let dim = reader.get_u32()? as usize;
        let m = reader.get_u32()? as usize;
        let train_threshold = reader.get_u32()? as usize;
        let trained = reader.get_u8()? != 0;

        if trained {
            let cb = PqCodebook::read_from(reader)?;
            let count = reader.get_u32()? as usize;
            let mut codes = Vec::with_capacity(count);
            for _ in 0..count {
                codes.push(reader.get_bytes(m)?);
            }
            Ok(Self {
                dim,
                m,
                train_threshold,
                codebook: Some(cb),
                codes,
                raw: Vec::new(),
            })
        } else {
            let count = reader.get_u32()? as usize;
            let mut raw = Vec::with_capacity(count);
            for _ in 0..count {
                let mut vector = Vec::with_capacity(dim);
                for _ in 0..dim {
                    vector.push(f16::from_bits(reader.get_u16()?));
                }
                raw.push(vector);
            }
            Ok(Self {
                dim,
                m,
                train_threshold,
                codebook: None,
                codes: Vec::new(),
                raw,
            })
        }
    }
}

/// IVF-PQ index for the warm tier: coarse k-means partitioning plus PQ
/// codes, probing the closest NPROBE lists at query time.
pub struct IvfPqIndex {
    dim: usize,
    nlist: usize,
    m: usize,
    coarse: Vec<Vec<f32>>,
    codebook: Option<PqCodebook>,
    /// lists[cluster] -> (internal id, codes)
    lists: Vec<Vec<(u32, Vec<u8>)>>,
    count: usize,
    raw: Vec<Vec<f16>>,
}

impl IvfPqIndex {
    pub fn new(dim: usize, nlist: usize, m: usize) -> Self {
        Self {
            dim,
            nlist,
            m,
            coarse: Vec::new(),
            codebook: None,
            lists: Vec::new(),
            count: 0,
            raw: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        if self.is_trained() {
            self.count
        } else {
            self.raw.len()
        }
    }

    pub fn is_trained(&self) -> bool {
        self.codebook.is_some()
    }

    pub fn compression_ratio(&self) -> f64 {
        match &self.codebook {
            Some(cb) => cb.compression_ratio(self.dim),
            None => 2.0,
        }
    }

    fn nearest_list(&self, vector: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_dist = f32::MAX;
        for (c, centroid) in self.coarse.iter().enumerate() {
            let dist = f32_l2(vector, centroid);
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        best
    }

    pub fn add(&mut self, vector: &[f32]) -> u32 {
        debug_assert_eq!(vector.len(), self.dim);

        if let Some(cb) = &self.codebook {
            let id = self.count as u32;
            let list = self.nearest_list(vector);
            let codes = cb.encode(vector);
            self.lists[list].push((id, codes));
            self.count += 1;
            return id;
        }

        let id = self.raw.len() as u32;
        self.raw
            .push(vector.iter().map(|x| f16::from_f32(*x)).collect());
        if self.raw.len() >= self.nlist {
            self.train_from_buffer();
        }
        id
    }

    fn train_from_buffer(&mut self) {
        let data: Vec<Vec<f32>> = self
            .raw
            .iter()
            .map(|v| v.iter().map(|x| x.to_f32()).collect())
            .collect();

        self.coarse = kmeans(&data, self.nlist, KMEANS_ITERS);
        let cb = PqCodebook::train(&data, self.m);
        self.lists = vec![Vec::new(); self.coarse.len()];

        for (i, vector) in data.iter().enumerate() {
            let list = self.nearest_list(vector);
            self.lists[list].push((i as u32, cb.encode(vector)));
        }

        self.count = data.len();
        self.codebook = Some(cb);
        self.raw.clear();
        tracing::info!(
            "Trained IVF-PQ index on {} vectors (nlist={}, m={})",
            self.count,
            self.coarse.len(),
            self.m
        );
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(f32, u32)> {
        let Some(cb) = &self.codebook else {
            let mut results: Vec<(f32, u32)> = self
                .raw
                .iter()
                .enumerate()
                .map(|(i, v)| (l2_distance(query, v), i as u32))
                .collect();
            results.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            results.truncate(k);
            return results;
        };

        // Probe the closest coarse cells.
        let mut cells: Vec<(f32, usize)> = self
            .coarse
            .iter()
            .enumerate()
            .map(|(c, centroid)| (f32_l2(query, centroid), c))
            .collect();
        cells.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let table = cb.distance_table(query);
        let mut results = Vec::new();
        for &(_, cell) in cells.iter().take(NPROBE) {
            for (id, codes) in &self.lists[cell] {
                results.push((cb.adc_distance(&table, codes), *id));
            }
        }

        results.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        results
    }

    pub fn compact(&mut self, live: &dyn Fn(u32) -> bool) -> Vec<(u32, u32)> {
        let mut mapping = Vec::new();
        let mut next = 0u32;

        if self.codebook.is_some() {
            for list in self.lists.iter_mut() {
                list.retain(|(id, _)| live(*id));
            }
            // Renumber in list order.
            for list in self.lists.iter_mut() {
                for (id, _) in list.iter_mut() {
                    mapping.push((*id, next));
                    *id = next;
                    next += 1;
                }
            }
            self.count = next as usize;
        } else {
            let mut kept = Vec::with_capacity(self.raw.len());
            for (i, v) in self.raw.drain(..).enumerate() {
                if live(i as u32) {
                    mapping.push((i as u32, next));
                    kept.push(v);
                    next += 1;
                }
            }
            self.raw = kept;
        }
        mapping
    }

    pub fn write_to(&self, out: &mut ByteWriter) {
        out.put_u32(self.dim as u32);
        out.put_u32(self.nlist as u32);
        out.put_u32(self.m as u32);
        out.put_u8(self.codebook.is_some() as u8);

        if let Some(cb) = &self.codebook {
            cb.write_to(out);
            out.put_u32(self.coarse.len() as u32);
            for centroid in &self.coarse {
                for value in centroid {
                    out.put_f32(*value);
                }
            }
            out.put_u32(self.lists.len() as u32);
            for list in &self.lists {
                out.put_u32(list.len() as u32);
                for (id, codes) in list {
                    out.put_u32(*id);
                    out.put_bytes(codes);
                }
            }
            out.put_u32(self.count as u32);
        } else {
            out.put_u32(self.raw.len() as u32);
            for vector in &self.raw {
                for value in vector {
                    out.put_u16(value.to_bits());
                }
            }
        }
    }

    pub fn read_from(reader: &mut ByteReader) -> Result<Self, AppError> {
        let dim = reader.get_u32()? as usize;
        let nlist = reader.get_u32()? as usize;
        let m = reader.get_u32()? as usize;
        let trained = reader.get_u8()? != 0;

        if trained {
            let cb = PqCodebook::read_from(reader)?;
            let coarse_len = reader.get_u32()? as usize;
            let mut coarse = Vec::with_capacity(coarse_len);
            for _ in 0..coarse_len {
                let mut centroid = Vec::with_capacity(dim);
                for _ in 0..dim {
                    centroid.push(reader.get_f32()?);
                }
                coarse.push(centroid);
            }
            let list_count = reader.get_u32()? as usize;
            let mut lists = Vec::with_capacity(list_count);
            for _ in 0..list_count {
                let len = reader.get_u32()? as usize;
                let mut list = Vec::with_capacity(len);
                for _ in 0..len {
                    let id = reader.get_u32()?;
                    let codes = reader.get_bytes(m)?;
                    list.push((id, codes));
                }
                lists.push(list);
            }
            let count = reader.get_u32()? as usize;
            Ok(Self {
                dim,
                nlist,
                m,
                coarse,
                codebook: Some(cb),
                lists,
                count,
                raw: Vec::new(),
            })
        } else {
            let count = reader.get_u32()? as usize;
            let mut raw = Vec::with_capacity(count);
            for _ in 0..count {
                let mut vector = Vec::with_capacity(dim);
                for _ in 0..dim {
                    vector.push(f16::from_bits(reader.get_u16()?));
                }
                raw.push(vector);
            }
            Ok(Self {
                dim,
                nlist,
                m,
                coarse: Vec::new(),
                codebook: None,
                lists: Vec::new(),
                count: 0,
                raw,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered_data(clusters: usize, per_cluster: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut data = Vec::new();
        for c in 0..clusters {
            for i in 0..per_cluster {
                let mut v = vec![c as f32 * 10.0; dim];
                v[0] += (i as f32) * 0.01;
                data.push(v);
            }
        }
        data
    }

    #[test]
    fn kmeans_finds_separated_clusters() {
        let data = clustered_data(4, 20, 8);
        let centroids = kmeans(&data, 4, 20);
        assert_eq!(centroids.len(), 4);

        // Every point should be close to some centroid.
        for point in &data {
            let best = centroids
                .iter()
                .map(|c| f32_l2(point, c))
                .fold(f32::MAX, f32::min);
            assert!(best < 5.0, "point far from all centroids: {best}");
        }
    }

    #[test]
    fn pq_index_trains_lazily_and_searches() {
        let mut index = PqIndex::new(8, 4, 32);
        let data = clustered_data(4, 10, 8);
        for v in &data {
            index.add(v);
        }
        assert!(index.is_trained());
        assert_eq!(index.len(), 40);
        assert!(index.compression_ratio() > 2.0);

        // A query in cluster 2 should surface cluster-2 ids (rows 20..30).
        let results = index.search(&vec![20.0; 8], 5);
        assert_eq!(results.len(), 5);
        assert!((20..30).contains(&(results[0].1 as usize)));
    }

    #[test]
    fn pq_brute_forces_before_training() {
        let mut index = PqIndex::new(4, 2, 1000);
        index.add(&[0.0, 0.0, 0.0, 0.0]);
        index.add(&[5.0, 5.0, 5.0, 5.0]);
        assert!(!index.is_trained());

        let results = index.search(&[4.9, 5.0, 5.1, 5.0], 1);
        assert_eq!(results[0].1, 1);
    }

    /// Round-robin cluster order, so a lazily-trained index has seen every
    /// cluster by the time training fires.
    fn interleaved_data(clusters: usize, rounds: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut data = Vec::new();
        for i in 0..rounds {
            for c in 0..clusters {
                let mut v = vec![c as f32 * 10.0; dim];
                v[0] += (i as f32) * 0.01;
                data.push(v);
            }
        }
        data
    }

    #[test]
    fn ivf_pq_trains_at_nlist_and_probes() {
        let mut index = IvfPqIndex::new(8, 16, 4);
        let data = interleaved_data(4, 10, 8);
        for v in &data {
            index.add(v);
        }
        assert!(index.is_trained());

        // Row ids cycle through clusters; a cluster-3 query must surface a
        // cluster-3 row first.
        let results = index.search(&vec![30.0; 8], 3);
        assert!(!results.is_empty());
        assert_eq!(results[0].1 as usize % 4, 3);
    }

    #[test]
    fn pq_serialization_roundtrip() {
        let mut index = PqIndex::new(8, 4, 16);
        for v in clustered_data(4, 5, 8) {
            index.add(&v);
        }
        assert!(index.is_trained());

        let mut writer = ByteWriter::new();
        index.write_to(&mut writer);
        let bytes = writer.into_bytes();
        let restored = PqIndex::read_from(&mut ByteReader::new(&bytes)).expect("read");

        let query = vec![10.0; 8];
        assert_eq!(index.search(&query, 3), restored.search(&query, 3));
    }
}
