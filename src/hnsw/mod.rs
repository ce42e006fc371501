//! Hierarchical navigable small-world graph index.
//!
//! Layered proximity graph with greedy top-down descent and a beam search
//! on the base layer. Points are stored in append-only slots; labels map
//! to their live slot and deletion tombstones a slot without unlinking it,
//! so removed points stay navigable but are never yielded.

mod index;
mod node;
mod serialize;
mod visited;

pub use index::HnswIndex;

/// Default graph out-degree.
pub const DEFAULT_M: usize = 16;
/// Default construction-time beam width.
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
/// Default query-time beam width.
pub const DEFAULT_EF_SEARCH: usize = 50;
