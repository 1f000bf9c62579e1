use super::interval::Violation;
use super::types::{CategoryId, NodeId, TreeId};
use thiserror::Error;

/// Errors surfaced by [`GroveStorage`](super::GroveStorage).
///
/// Missing nodes on read-and-mutate paths are reported as `Ok(None)`, not
/// as errors; the `*NotFound` variants cover references an operation
/// cannot proceed without.
#[derive(Debug, Error)]
pub enum GroveError {
    /// The requested new parent lies inside the subtree being moved
    #[error("Cycle prevented: the new parent is part of the subtree.")]
    Cycle,

    #[error("A category cannot be its own parent.")]
    CategorySelfParent,

    /// The requested parent category descends from the category being updated
    #[error("Cycle prevented: category {0} is a descendant of the category being moved.")]
    CategoryCycle(CategoryId),

    #[error("Tree not found: {0}")]
    TreeNotFound(TreeId),

    #[error("Parent node not found: {0}")]
    ParentNotFound(NodeId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Category not found: {0}")]
    CategoryNotFound(CategoryId),

    #[error("Invalid property key {0:?}: keys must be non-empty and free of quotes and backslashes")]
    InvalidKey(String),

    #[error("Properties must be a JSON object, got {0}")]
    InvalidProperties(String),

    #[error("Invalid identifier {0}")]
    InvalidId(String),

    /// Stored parent links cannot be turned into intervals
    #[error("Corrupt tree structure: {0}")]
    Corrupt(#[from] Violation),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GroveError {
    /// Structural violations: the request was well-formed but would break the hierarchy
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            GroveError::Cycle | GroveError::CategorySelfParent | GroveError::CategoryCycle(_)
        )
    }

    /// A referenced record does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GroveError::TreeNotFound(_)
                | GroveError::ParentNotFound(_)
                | GroveError::NodeNotFound(_)
                | GroveError::CategoryNotFound(_)
        )
    }
}
