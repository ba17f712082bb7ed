//! In-memory HNSW graphs, one per partition.
//!
//! Graphs hold vectors from every tenant in a partition, so results are only
//! candidates: callers must post-filter them through the tenant's visible rows.
//! `hnsw_rs` has no deletion; removed chunks are tombstoned and skipped.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use hnsw_rs::hnsw::Hnsw;
use hnsw_rs::prelude::*;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::storage::load_partition_vectors;

#[derive(Default)]
struct SlotMap {
    by_id: HashMap<String, usize>,
    ids: Vec<String>,
    tombstones: HashSet<usize>,
}

struct PartitionGraph {
    hnsw: Hnsw<'static, f32, DistCosine>,
    slots: RwLock<SlotMap>,
}

pub struct AnnIndex {
    graphs: Vec<PartitionGraph>,
    dimensions: usize,
    ef_search: usize,
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("partitions", &self.graphs.len())
            .field("dimensions", &self.dimensions)
            .field("ef_search", &self.ef_search)
            .finish()
    }
}

impl AnnIndex {
    pub fn new(config: &IndexConfig, partitions: u32) -> Self {
        let graphs = (0..partitions)
            .map(|_| PartitionGraph {
                hnsw: Hnsw::<f32, DistCosine>::new(
                    config.m,
                    config.max_elements,
                    config.max_layer,
                    config.ef_construction,
                    DistCosine {},
                ),
                slots: RwLock::new(SlotMap::default()),
            })
            .collect();
        Self {
            graphs,
            dimensions: config.dimensions,
            ef_search: config.ef_search,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn graph(&self, partition: u32) -> Result<&PartitionGraph> {
        self.graphs
            .get(partition as usize)
            .ok_or_else(|| Error::Storage(format!("no ANN graph for partition {partition}")))
    }

    pub fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::Validation(format!(
                "vector has {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    /// Add a chunk's vector to its partition graph.
    pub fn insert(&self, partition: u32, chunk_id: &str, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;
        let graph = self.graph(partition)?;
        let slot = {
            let mut slots = graph.slots.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(&existing) = slots.by_id.get(chunk_id) {
                if !slots.tombstones.contains(&existing) {
                    return Ok(());
                }
            }
            let slot = slots.ids.len();
            slots.ids.push(chunk_id.to_string());
            slots.by_id.insert(chunk_id.to_string(), slot);
            slot
        };
        graph.hnsw.insert_slice((vector, slot));
        debug!(partition, slot, "vector added to ANN graph");
        Ok(())
    }

    /// Tombstone a chunk. Returns whether it was live.
    pub fn remove(&self, partition: u32, chunk_id: &str) -> bool {
        let Ok(graph) = self.graph(partition) else {
            return false;
        };
        let mut slots = graph.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.by_id.remove(chunk_id) {
            Some(slot) => slots.tombstones.insert(slot),
            None => false,
        }
    }

    /// Live vectors in a partition.
    pub fn live_len(&self, partition: u32) -> usize {
        self.graph(partition)
            .map(|g| {
                let slots = g.slots.read().unwrap_or_else(PoisonError::into_inner);
                slots.ids.len() - slots.tombstones.len()
            })
            .unwrap_or(0)
    }

    /// Up to `fetch` live neighbors of `query` across all tenants in the
    /// partition, as `(chunk_id, similarity)` best first.
    pub fn search(&self, partition: u32, query: &[f32], fetch: usize) -> Result<Vec<(String, f32)>> {
        self.check_dimensions(query)?;
        let graph = self.graph(partition)?;
        let (live, dead) = {
            let slots = graph.slots.read().unwrap_or_else(PoisonError::into_inner);
            (slots.ids.len() - slots.tombstones.len(), slots.tombstones.len())
        };
        if live == 0 || fetch == 0 {
            return Ok(Vec::new());
        }

        // Ask for enough extra neighbors to cover tombstoned slots.
        let knbn = (fetch + dead).min(live + dead);
        let ef = self.ef_search.max(knbn);
        let neighbours = graph.hnsw.search(query, knbn, ef);

        let slots = graph.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(fetch.min(neighbours.len()));
        for n in neighbours {
            if slots.tombstones.contains(&n.d_id) {
                continue;
            }
            if let Some(id) = slots.ids.get(n.d_id) {
                out.push((id.clone(), 1.0 - n.distance));
            }
            if out.len() == fetch {
                break;
            }
        }
        Ok(out)
    }

    /// Load every stored vector into the graphs. `conn` must be able to see
    /// every tenant's rows (a maintenance connection).
    pub fn rebuild(&self, conn: &Connection) -> Result<usize> {
        let mut total = 0;
        for partition in 0..self.graphs.len() as u32 {
            let vectors = load_partition_vectors(conn, partition)?;
            for (id, vector) in &vectors {
                self.insert(partition, id, vector)?;
            }
            debug!(partition, count = vectors.len(), "partition graph loaded");
            total += vectors.len();
        }
        info!(vectors = total, partitions = self.graphs.len(), "ANN index rebuilt");
        Ok(total)
    }
}
