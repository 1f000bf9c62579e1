//! Grove: hierarchical trees stored as nested-set intervals in SQLite.
//!
//! Subtree and ancestor reads are single range scans over `(left, right)`;
//! inserts, moves and deletes renumber intervals inside one transaction.

pub mod config;
pub mod store;

pub use config::GroveConfig;
pub use store::{
    GroveError, GroveStorage, NewNode, Node, NodeId, NodePatch, Properties, SubtreeQuery, TreeId,
};
