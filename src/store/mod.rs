mod categories;
mod counters;
mod edges;
mod error;
pub mod interval;
mod locks;
mod mutations;
mod queries;
mod render;
mod storage;
mod types;

#[cfg(test)]
mod tests;

pub use error::GroveError;
pub use interval::{Interval, Violation};
pub use locks::TreeLocks;
pub use queries::SubtreeQuery;
pub use render::render;
pub use storage::GroveStorage;
pub use types::{
    json_contains, Category, CategoryId, CategoryPatch, CounterName, Edge, EdgeId, GroveId,
    NewEdge, NewNode, NewTree, Node, NodeId, NodePatch, Properties, PropertyKey, Tree, TreeEntry,
    TreeId, TreePatch, COUNTERS_KEY, TYPE_KEY,
};
