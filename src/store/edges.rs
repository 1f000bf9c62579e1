use super::error::GroveError;
use super::storage::{
    current_timestamp, fetch_node, parse_id, parse_properties, touch_tree, GroveStorage,
};
use super::types::{Edge, EdgeId, NewEdge, NodeId, TreeId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

impl GroveStorage {
    /// Link two nodes of the same tree. Edges are removed with either
    /// endpoint.
    pub async fn create_edge(&self, tree_id: &TreeId, input: NewEdge) -> Result<Edge, GroveError> {
        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        // Write first: a read before the first write cannot be upgraded
        // once another connection has committed.
        if !touch_tree(&mut tx, tree_id, now).await? {
            return Err(GroveError::TreeNotFound(*tree_id));
        }

        for endpoint in [&input.source_id, &input.target_id] {
            if fetch_node(&mut tx, tree_id, endpoint).await?.is_none() {
                return Err(GroveError::NodeNotFound(*endpoint));
            }
        }

        let row = sqlx::query(
            "INSERT INTO edges (id, tree_id, source_id, target_id, edge_type, properties, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(EdgeId::new().to_string())
        .bind(tree_id.to_string())
        .bind(input.source_id.to_string())
        .bind(input.target_id.to_string())
        .bind(&input.edge_type)
        .bind(serde_json::to_string(&input.properties)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let edge = edge_from_row(&row)?;
        tx.commit().await?;
        Ok(edge)
    }

    /// Edges of a tree, or only those touching `node_id` (either direction)
    pub async fn list_edges(
        &self,
        tree_id: &TreeId,
        node_id: Option<&NodeId>,
    ) -> Result<Vec<Edge>, GroveError> {
        let node = node_id.map(|n| n.to_string());

        let rows = sqlx::query(
            "SELECT * FROM edges
             WHERE tree_id = ? AND (? IS NULL OR source_id = ? OR target_id = ?)
             ORDER BY created_at, rowid",
        )
        .bind(tree_id.to_string())
        .bind(node.as_deref())
        .bind(node.as_deref())
        .bind(node.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(edge_from_row).collect()
    }

    pub async fn delete_edge(&self, tree_id: &TreeId, edge_id: &EdgeId) -> Result<bool, GroveError> {
        let result = sqlx::query("DELETE FROM edges WHERE id = ? AND tree_id = ?")
            .bind(edge_id.to_string())
            .bind(tree_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn edge_from_row(row: &SqliteRow) -> Result<Edge, GroveError> {
    Ok(Edge {
        id: parse_id(row, "id")?,
        tree_id: parse_id(row, "tree_id")?,
        source_id: parse_id(row, "source_id")?,
        target_id: parse_id(row, "target_id")?,
        edge_type: row.try_get("edge_type")?,
        properties: parse_properties(row)?,
        created_at: row.try_get("created_at")?,
    })
}
