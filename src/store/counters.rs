use super::error::GroveError;
use super::storage::{current_timestamp, node_from_row, GroveStorage};
use super::types::{CounterName, Node, NodeId, TreeId};

impl GroveStorage {
    /// Add `delta` to `properties.counters.<name>`, creating it at `delta`
    /// when absent, and return the updated node.
    ///
    /// The read-modify-write is a single statement evaluated by SQLite, so
    /// concurrent increments never lose updates. A `counters` value that is
    /// not an object is replaced by a fresh one. Returns `None` if the node
    /// does not exist in this tree.
    pub async fn increment_counter(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
        name: &CounterName,
        delta: i64,
    ) -> Result<Option<Node>, GroveError> {
        let row = sqlx::query(
            "UPDATE nodes
             SET properties = json_set(
                     properties,
                     '$.counters',
                     json_set(
                         CASE WHEN json_type(properties, '$.counters') = 'object'
                              THEN json_extract(properties, '$.counters')
                              ELSE '{}' END,
                         ?,
                         COALESCE(json_extract(properties, ?), 0) + ?
                     )
                 ),
                 updated_at = ?
             WHERE id = ? AND tree_id = ?
             RETURNING *",
        )
        .bind(name.path())
        .bind(name.counter_path())
        .bind(delta)
        .bind(current_timestamp())
        .bind(node_id.to_string())
        .bind(tree_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let node = row.as_ref().map(node_from_row).transpose()?;
        if let Some(node) = &node {
            tracing::trace!(
                tree = %tree_id,
                node = %node_id,
                counter = %name,
                value = ?node.properties.counter(name.as_str()),
                "Incremented counter"
            );
        }
        Ok(node)
    }
}
