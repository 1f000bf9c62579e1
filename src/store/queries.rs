//! Read-only traversal. Every query is a single range/equality lookup over
//! the interval columns; none of them recurse.

use super::error::GroveError;
use super::interval::{self, Skeleton, Violation};
use super::storage::{node_from_row, GroveStorage};
use super::types::{Node, NodeId, Properties, PropertyKey, TreeEntry, TreeId, TYPE_KEY};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Options for [`GroveStorage::get_subtree`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubtreeQuery {
    /// Only return nodes at most this many hops below the queried node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
}

impl SubtreeQuery {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_depth(max_depth: u32) -> Self {
        Self {
            max_depth: Some(max_depth),
        }
    }
}

impl GroveStorage {
    /// Get a node by ID within a tree
    pub async fn get_node(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
    ) -> Result<Option<Node>, GroveError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ? AND tree_id = ?")
            .bind(node_id.to_string())
            .bind(tree_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    /// Direct children of `parent_id`, or the tree's roots when `None`,
    /// in sibling order
    pub async fn list_children(
        &self,
        tree_id: &TreeId,
        parent_id: Option<&NodeId>,
    ) -> Result<Vec<Node>, GroveError> {
        let rows = sqlx::query(
            "SELECT * FROM nodes
             WHERE tree_id = ? AND parent_id IS ?
             ORDER BY position, rowid",
        )
        .bind(tree_id.to_string())
        .bind(parent_id.map(|p| p.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    /// Every node of a tree, grouped by parent and in sibling order within
    /// each group (roots first)
    pub async fn list_all_nodes(&self, tree_id: &TreeId) -> Result<Vec<Node>, GroveError> {
        let rows = sqlx::query(
            "SELECT * FROM nodes
             WHERE tree_id = ?
             ORDER BY parent_id, position, rowid",
        )
        .bind(tree_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    /// Ancestors of a node followed by the node itself, root first.
    ///
    /// `level` is the distance from the root end of the path. Empty when
    /// the node does not exist in this tree.
    pub async fn get_path_to_root(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
    ) -> Result<Vec<TreeEntry>, GroveError> {
        let rows = sqlx::query(
            "SELECT n.*, n.depth AS level
             FROM nodes n
             JOIN nodes t ON t.id = ? AND t.tree_id = n.tree_id
             WHERE n.tree_id = ? AND n.lft <= t.lft AND n.rgt >= t.rgt
             ORDER BY n.lft",
        )
        .bind(node_id.to_string())
        .bind(tree_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// A node and its descendants in pre-order, optionally cut off
    /// `max_depth` hops below it.
    ///
    /// `level` is the distance from the queried node. Empty when the node
    /// does not exist in this tree.
    pub async fn get_subtree(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
        query: SubtreeQuery,
    ) -> Result<Vec<TreeEntry>, GroveError> {
        let max_depth = query.max_depth.map(i64::from);

        let rows = sqlx::query(
            "SELECT n.*, n.depth - t.depth AS level
             FROM nodes n
             JOIN nodes t ON t.id = ? AND t.tree_id = n.tree_id
             WHERE n.tree_id = ? AND n.lft >= t.lft AND n.rgt <= t.rgt
               AND (? IS NULL OR n.depth - t.depth <= ?)
             ORDER BY n.lft",
        )
        .bind(node_id.to_string())
        .bind(tree_id.to_string())
        .bind(max_depth)
        .bind(max_depth)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Nodes whose `type` property equals `type_value`, in pre-order
    pub async fn list_by_type(
        &self,
        tree_id: &TreeId,
        type_value: &str,
    ) -> Result<Vec<Node>, GroveError> {
        let key = PropertyKey::new(TYPE_KEY)?;
        self.list_by_property(tree_id, &key, &Value::String(type_value.to_string()))
            .await
    }

    /// Nodes whose properties contain `{key: value}` (jsonb `@>`
    /// semantics), in pre-order. An array-valued property therefore does
    /// not match a bare scalar.
    ///
    /// The store narrows candidates to nodes carrying the key; containment
    /// itself is decided here.
    pub async fn list_by_property(
        &self,
        tree_id: &TreeId,
        key: &PropertyKey,
        value: &Value,
    ) -> Result<Vec<Node>, GroveError> {
        let rows = sqlx::query(
            "SELECT * FROM nodes
             WHERE tree_id = ? AND json_type(properties, ?) IS NOT NULL
             ORDER BY lft",
        )
        .bind(tree_id.to_string())
        .bind(key.path())
        .fetch_all(&self.pool)
        .await?;

        let wanted = Properties::new().with(key.as_str(), value.clone());
        let mut matches = Vec::new();
        for row in &rows {
            let node = node_from_row(row)?;
            if node.properties.contains(&wanted) {
                matches.push(node);
            }
        }

        Ok(matches)
    }

    /// Check every nested-set invariant of a tree. Empty means healthy.
    pub async fn verify_tree(&self, tree_id: &TreeId) -> Result<Vec<Violation>, GroveError> {
        let nodes = self.list_all_nodes(tree_id).await?;
        let skeletons: Vec<Skeleton> = nodes.iter().map(Skeleton::from).collect();
        Ok(interval::check(&skeletons))
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<TreeEntry, GroveError> {
    Ok(TreeEntry {
        node: node_from_row(row)?,
        level: row.try_get("level")?,
    })
}
