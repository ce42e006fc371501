//! Graph node: one stored point and its per-layer adjacency.

/// A point in the graph, addressed by slot. Layer 0 links every live
/// point; higher layers hold progressively fewer points for express
/// routing.
#[derive(Debug, Clone)]
pub(super) struct Node {
    /// Client-assigned label.
    pub label: u64,
    /// The stored vector, owned by the index.
    pub vector: Vec<f32>,
    /// `layers[n]` holds neighbor slots at layer n.
    pub layers: Vec<Vec<u32>>,
}

impl Node {
    pub fn new(label: u64, vector: Vec<f32>, top_layer: usize) -> Self {
        Self {
            label,
            vector,
            layers: vec![Vec::new(); top_layer + 1],
        }
    }

    pub fn neighbors(&self, layer: usize) -> &[u32] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn neighbors_mut(&mut self, layer: usize) -> Option<&mut Vec<u32>> {
        self.layers.get_mut(layer)
    }

    pub fn add_neighbor(&mut self, layer: usize, slot: u32) {
        if let Some(neighbors) = self.layers.get_mut(layer) {
            if !neighbors.contains(&slot) {
                neighbors.push(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_span_zero_to_top() {
        let node = Node::new(42, vec![0.0; 4], 3);
        assert_eq!(node.layers.len(), 4);
        assert!(node.neighbors(5).is_empty());
    }

    #[test]
    fn add_neighbor_deduplicates() {
        let mut node = Node::new(0, vec![0.0; 4], 1);
        node.add_neighbor(0, 7);
        node.add_neighbor(0, 7);
        node.add_neighbor(1, 3);

        assert_eq!(node.neighbors(0), &[7]);
        assert_eq!(node.neighbors(1), &[3]);
    }
}
