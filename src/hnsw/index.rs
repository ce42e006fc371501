//! The HNSW graph proper.
//!
//! Insert: draw a random top layer from an exponential distribution,
//! descend greedily from the entry point, then wire neighbors on every
//! layer from the drawn layer down to 0 using a diversity-preserving
//! selection heuristic. Search: greedy descent to layer 1, then a beam
//! search on layer 0 with `ef` candidates.
//!
//! Deletion is lazy: a removed label's slot is tombstoned and stays part
//! of the graph for routing, but is never admitted into a result set.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roaring::RoaringBitmap;

use super::node::Node;
use super::visited::VisitedGuard;
use super::{DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH, DEFAULT_M};
use crate::config::Metric;
use crate::error::{DbError, Result};
use crate::simd::{dot, l2_squared};

/// Traversal candidate (min-heap by distance).
#[derive(Clone, Copy)]
struct Candidate {
    slot: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller distance pops first.
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Admitted result (max-heap, so the worst element is on top).
#[derive(Clone, Copy)]
struct Admitted {
    slot: u32,
    distance: f32,
}

impl PartialEq for Admitted {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Admitted {}

impl Ord for Admitted {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Admitted {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct HnswIndex {
    pub(super) dim: usize,
    pub(super) metric: Metric,
    pub(super) max_elements: usize,

    pub(super) m: usize,
    pub(super) m0: usize,
    pub(super) ml: f64,
    pub(super) ef_construction: usize,
    pub(super) ef_search: usize,

    pub(super) nodes: Vec<Node>,
    pub(super) label_to_slot: HashMap<u64, u32>,
    /// Tombstoned slots: routed through, never yielded.
    pub(super) dead: RoaringBitmap,
    pub(super) entry_point: Option<u32>,
    pub(super) max_layer: usize,

    rng: StdRng,
}

impl HnswIndex {
    pub fn new(dim: usize, max_elements: usize, metric: Metric) -> Self {
        Self::with_params(
            dim,
            max_elements,
            metric,
            DEFAULT_M,
            DEFAULT_EF_CONSTRUCTION,
            DEFAULT_EF_SEARCH,
        )
    }

    pub fn with_params(
        dim: usize,
        max_elements: usize,
        metric: Metric,
        m: usize,
        ef_construction: usize,
        ef_search: usize,
    ) -> Self {
        Self {
            dim,
            metric,
            max_elements,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction,
            ef_search,
            nodes: Vec::new(),
            label_to_slot: HashMap::new(),
            dead: RoaringBitmap::new(),
            entry_point: None,
            max_layer: 0,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    /// Number of live (non-tombstoned) points.
    pub fn len(&self) -> usize {
        self.label_to_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_to_slot.is_empty()
    }

    pub fn contains(&self, label: u64) -> bool {
        self.label_to_slot.contains_key(&label)
    }

    #[inline]
    fn vector_of(&self, slot: u32) -> &[f32] {
        &self.nodes[slot as usize].vector
    }

    /// Internal traversal distance: always ascending-is-closer.
    #[inline]
    fn dist_vec(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            Metric::L2 => l2_squared(a, b),
            Metric::InnerProduct => -dot(a, b),
        }
    }

    #[inline]
    fn distance(&self, query: &[f32], slot: u32) -> f32 {
        self.dist_vec(query, self.vector_of(slot))
    }

    /// Convert an internal distance back to the surfaced value.
    #[inline]
    fn surface(&self, internal: f32) -> f32 {
        match self.metric {
            Metric::L2 => internal,
            Metric::InnerProduct => -internal,
        }
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        (-r.ln() * self.ml).floor() as usize
    }

    /// Add one point labeled `label`. A live point with the same label is
    /// tombstoned first, so the new point replaces it in search results.
    pub fn insert(&mut self, vector: &[f32], label: u64) -> Result<()> {
        if vector.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        if let Some(old_slot) = self.label_to_slot.remove(&label) {
            self.dead.insert(old_slot);
        }
        if self.label_to_slot.len() >= self.max_elements {
            return Err(DbError::CapacityExceeded {
                max: self.max_elements,
            });
        }

        let node_layer = self.random_layer();
        let slot = self.nodes.len() as u32;
        let mut node = Node::new(label, vector.to_vec(), node_layer);

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = node_layer;
            self.label_to_slot.insert(label, slot);
            self.nodes.push(node);
            return Ok(());
        };

        let query = vector;
        let mut current = entry_point;

        // Zoom in from the top layer down to just above the node's layer.
        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(query, &[current], 1, layer, None).first()
            {
                current = nearest;
            }
        }

        // Wire the new point on every layer from its drawn layer down to 0.
        // Reverse-edge additions and prunes are collected first because the
        // node is not part of the graph until the end.
        let start_layer = node_layer.min(self.max_layer);
        let mut reverse_edges: Vec<(u32, usize)> = Vec::new();
        let mut prune_ops: Vec<(u32, usize, Vec<u32>)> = Vec::new();

        for layer in (0..=start_layer).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };
            let candidates =
                self.search_layer(query, &[current], self.ef_construction, layer, None);
            let neighbors = self.select_neighbors(&candidates, m_layer, None);

            for &(neighbor, _) in &neighbors {
                node.add_neighbor(layer, neighbor);

                let existing = self.nodes[neighbor as usize].neighbors(layer);
                if existing.len() >= m_layer {
                    // The reverse edge would overflow the neighbor; re-select
                    // its adjacency including the new point.
                    let neighbor_vec = self.vector_of(neighbor).to_vec();
                    let mut pool: Vec<(u32, f32)> = existing
                        .iter()
                        .map(|&n| (n, self.dist_vec(&neighbor_vec, self.vector_of(n))))
                        .collect();
                    pool.push((slot, self.dist_vec(&neighbor_vec, query)));

                    let kept = self.select_neighbors(&pool, m_layer, Some((slot, query)));
                    prune_ops.push((neighbor, layer, kept.iter().map(|(s, _)| *s).collect()));
                } else {
                    reverse_edges.push((neighbor, layer));
                }
            }

            if let Some(&(first, _)) = candidates.first() {
                current = first;
            }
        }

        let pruned: HashSet<(u32, usize)> =
            prune_ops.iter().map(|(s, layer, _)| (*s, *layer)).collect();
        for (neighbor, layer) in reverse_edges {
            if !pruned.contains(&(neighbor, layer)) {
                self.nodes[neighbor as usize].add_neighbor(layer, slot);
            }
        }
        for (neighbor, layer, kept) in prune_ops {
            if let Some(neighbors) = self.nodes[neighbor as usize].neighbors_mut(layer) {
                neighbors.clear();
                neighbors.extend(kept);
            }
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(slot);
        }
        self.label_to_slot.insert(label, slot);
        self.nodes.push(node);
        Ok(())
    }

    /// Tombstone each labeled point if present; unknown labels are a no-op.
    pub fn remove(&mut self, labels: &[u64]) {
        for &label in labels {
            if let Some(slot) = self.label_to_slot.remove(&label) {
                self.dead.insert(slot);
            }
        }
    }

    /// Beam search on one layer. `yield_filter`, when supplied, gates
    /// admission into the result set; traversal still expands through
    /// non-matching points.
    fn search_layer(
        &self,
        query: &[f32],
        entries: &[u32],
        ef: usize,
        layer: usize,
        yield_filter: Option<&dyn Fn(u32) -> bool>,
    ) -> Vec<(u32, f32)> {
        let mut visited = VisitedGuard::new(self.nodes.len().max(64));
        let mut candidates = std::collections::BinaryHeap::with_capacity(ef);
        let mut results: std::collections::BinaryHeap<Admitted> =
            std::collections::BinaryHeap::with_capacity(ef + 1);

        let admit = |slot: u32| yield_filter.map_or(true, |f| f(slot));

        for &entry in entries {
            if visited.is_visited(entry) {
                continue;
            }
            visited.visit(entry);
            let distance = self.distance(query, entry);
            candidates.push(Candidate {
                slot: entry,
                distance,
            });
            if admit(entry) {
                results.push(Admitted {
                    slot: entry,
                    distance,
                });
            }
        }

        while let Some(current) = candidates.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }

            for &neighbor in self.nodes[current.slot as usize].neighbors(layer) {
                if visited.is_visited(neighbor) {
                    continue;
                }
                visited.visit(neighbor);

                let distance = self.distance(query, neighbor);
                let dominated = results.len() >= ef
                    && results
                        .peek()
                        .map_or(false, |worst| distance > worst.distance);
                if dominated {
                    continue;
                }

                candidates.push(Candidate {
                    slot: neighbor,
                    distance,
                });
                if admit(neighbor) {
                    results.push(Admitted {
                        slot: neighbor,
                        distance,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results
            .into_iter()
            .map(|r| (r.slot, r.distance))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Diversity-preserving neighbor selection: a candidate (distances are
    /// relative to the base point) is kept only when it is closer to the
    /// base than to every already-selected neighbor, then the remainder is
    /// filled with the closest leftovers.
    ///
    /// `pending` maps the slot of a point that is mid-insert onto its
    /// vector, since that point is not in the graph yet.
    fn select_neighbors(
        &self,
        candidates: &[(u32, f32)],
        m: usize,
        pending: Option<(u32, &[f32])>,
    ) -> Vec<(u32, f32)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let resolve = |slot: u32| -> &[f32] {
            match pending {
                Some((pending_slot, vec)) if pending_slot == slot => vec,
                _ => self.vector_of(slot),
            }
        };

        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut selected: Vec<(u32, f32)> = Vec::with_capacity(m);
        for &(candidate, candidate_dist) in &sorted {
            if selected.len() >= m {
                break;
            }
            let candidate_vec = resolve(candidate);
            let diverse = selected.iter().all(|&(existing, _)| {
                self.dist_vec(candidate_vec, resolve(existing)) >= candidate_dist
            });
            if diverse {
                selected.push((candidate, candidate_dist));
            }
        }

        if selected.len() < m {
            for &(candidate, candidate_dist) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|(s, _)| *s == candidate) {
                    selected.push((candidate, candidate_dist));
                }
            }
        }

        selected
    }

    /// k nearest live points. The label predicate (and the tombstone
    /// check) is applied when a point is admitted into the result set, not
    /// as a post-filter over a finished candidate list.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(u64) -> bool>,
    ) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        let Some(entry_point) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut current = entry_point;
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(query, &[current], 1, layer, None).first()
            {
                current = nearest;
            }
        }

        let live = |slot: u32| {
            if self.dead.contains(slot) {
                return false;
            }
            match filter {
                Some(f) => f(self.nodes[slot as usize].label),
                None => true,
            }
        };
        let ef = self.ef_search.max(k);
        let found = self.search_layer(query, &[current], ef, 0, Some(&live));

        Ok(found
            .into_iter()
            .take(k)
            .map(|(slot, distance)| (self.nodes[slot as usize].label, self.surface(distance)))
            .collect())
    }
}
