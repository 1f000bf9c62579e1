//! Structural mutations. This is the only code that writes `lft`, `rgt`
//! or `depth`; each operation holds its tree's lock and runs in a single
//! transaction, so a failure anywhere leaves the numbering untouched.

use super::categories::category_exists;
use super::error::GroveError;
use super::interval::{self, Closure, Destination, Gap, Interval, ParentBound, Skeleton};
use super::storage::{current_timestamp, fetch_node, node_from_row, touch_tree, GroveStorage};
use super::types::{NewNode, Node, NodeId, NodePatch, TreeId};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

impl GroveStorage {
    /// Insert a node as a new root, or as the last child (interval-wise)
    /// of `input.parent_id`, widening every enclosing interval by 2.
    pub async fn create_node(&self, tree_id: &TreeId, input: NewNode) -> Result<Node, GroveError> {
        let _guard = self.locks.acquire(*tree_id).await;
        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        if !touch_tree(&mut tx, tree_id, now).await? {
            return Err(GroveError::TreeNotFound(*tree_id));
        }

        let parent = match &input.parent_id {
            Some(parent_id) => Some(
                fetch_node(&mut tx, tree_id, parent_id)
                    .await?
                    .ok_or(GroveError::ParentNotFound(*parent_id))?,
            ),
            None => None,
        };

        if let Some(category_id) = &input.category_id {
            if !category_exists(&mut tx, category_id).await? {
                return Err(GroveError::CategoryNotFound(*category_id));
            }
        }

        let current_max = match parent {
            Some(_) => None,
            None => max_right(&mut tx, tree_id).await?,
        };
        let allocation = interval::allocate(parent.as_ref().map(ParentBound::from), current_max);

        if let Some(gap) = allocation.gap {
            open_gap(&mut tx, tree_id, gap).await?;
        }

        let position = match input.position {
            Some(position) => position,
            None => next_position(&mut tx, tree_id, input.parent_id.as_ref()).await?,
        };
        let properties = serde_json::to_string(&input.properties)?;
        let Interval { left, right, depth } = allocation.interval;

        let row = sqlx::query(
            "INSERT INTO nodes (id, tree_id, parent_id, name, position, properties, category_id,
                                lft, rgt, depth, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(NodeId::new().to_string())
        .bind(tree_id.to_string())
        .bind(input.parent_id.map(|p| p.to_string()))
        .bind(&input.name)
        .bind(position)
        .bind(properties)
        .bind(input.category_id.map(|c| c.to_string()))
        .bind(left)
        .bind(right)
        .bind(depth)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let node = node_from_row(&row)?;
        tx.commit().await?;

        tracing::debug!(tree = %tree_id, node = %node.id, left, right, depth, "Created node");
        Ok(node)
    }

    /// Reattach a node and its whole subtree under `new_parent_id`, or make
    /// it a root when `None`.
    ///
    /// Fails with [`GroveError::Cycle`] when the new parent is the node
    /// itself or one of its descendants; nothing is written in that case.
    /// The moved node is appended after its new siblings. Returns the
    /// moved node, or `None` if it does not exist in this tree.
    pub async fn move_subtree(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
        new_parent_id: Option<&NodeId>,
    ) -> Result<Option<Node>, GroveError> {
        let _guard = self.locks.acquire(*tree_id).await;
        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        if !touch_tree(&mut tx, tree_id, now).await? {
            return Ok(None);
        }
        let Some(node) = fetch_node(&mut tx, tree_id, node_id).await? else {
            return Ok(None);
        };
        let subtree = node.interval();

        let destination = match new_parent_id {
            Some(parent_id) => {
                let parent = fetch_node(&mut tx, tree_id, parent_id)
                    .await?
                    .ok_or(GroveError::ParentNotFound(*parent_id))?;
                if subtree.encloses(&parent.interval()) {
                    return Err(GroveError::Cycle);
                }
                Destination::Parent(ParentBound::from(&parent))
            }
            None => Destination::Root {
                max_right_outside: max_right_outside(&mut tx, tree_id, subtree).await?,
            },
        };

        if node.parent_id.as_ref() == new_parent_id {
            return Ok(Some(node));
        }

        let position = next_position(&mut tx, tree_id, new_parent_id).await?;
        let plan = interval::plan_move(subtree, destination);

        // Park the subtree in negative space while the rest is renumbered.
        sqlx::query(
            "UPDATE nodes SET lft = -lft, rgt = -rgt
             WHERE tree_id = ? AND lft >= ? AND rgt <= ?",
        )
        .bind(tree_id.to_string())
        .bind(subtree.left)
        .bind(subtree.right)
        .execute(&mut *tx)
        .await?;

        close_gap(&mut tx, tree_id, plan.close).await?;
        if let Some(gap) = plan.open {
            open_gap(&mut tx, tree_id, gap).await?;
        }

        sqlx::query(
            "UPDATE nodes SET lft = ? - lft, rgt = ? - rgt, depth = depth + ?
             WHERE tree_id = ? AND lft < 0",
        )
        .bind(plan.offset)
        .bind(plan.offset)
        .bind(plan.depth_delta)
        .bind(tree_id.to_string())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "UPDATE nodes SET parent_id = ?, position = ?, updated_at = ?
             WHERE id = ? AND tree_id = ?
             RETURNING *",
        )
        .bind(new_parent_id.map(|p| p.to_string()))
        .bind(position)
        .bind(now)
        .bind(node_id.to_string())
        .bind(tree_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let moved = node_from_row(&row)?;
        tx.commit().await?;

        tracing::debug!(
            tree = %tree_id,
            node = %node_id,
            width = plan.close.width,
            offset = plan.offset,
            depth_delta = plan.depth_delta,
            "Moved subtree"
        );
        Ok(Some(moved))
    }

    /// Delete a node with all of its descendants and close the gap they
    /// leave. Returns how many nodes were removed, or `None` if the node
    /// does not exist in this tree.
    pub async fn delete_subtree(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
    ) -> Result<Option<u64>, GroveError> {
        let _guard = self.locks.acquire(*tree_id).await;
        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        if !touch_tree(&mut tx, tree_id, now).await? {
            return Ok(None);
        }
        let Some(node) = fetch_node(&mut tx, tree_id, node_id).await? else {
            return Ok(None);
        };
        let subtree = node.interval();

        let removed = sqlx::query("DELETE FROM nodes WHERE tree_id = ? AND lft >= ? AND rgt <= ?")
            .bind(tree_id.to_string())
            .bind(subtree.left)
            .bind(subtree.right)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        close_gap(&mut tx, tree_id, Closure::of(subtree)).await?;
        tx.commit().await?;

        tracing::debug!(tree = %tree_id, node = %node_id, removed, "Deleted subtree");
        Ok(Some(removed))
    }

    /// Update name, position, category or properties. Never touches the
    /// interval columns or the parent link.
    pub async fn update_node(
        &self,
        tree_id: &TreeId,
        node_id: &NodeId,
        patch: NodePatch,
    ) -> Result<Option<Node>, GroveError> {
        let mut conn = self.pool.acquire().await?;

        if let Some(Some(category_id)) = &patch.category_id {
            if !category_exists(&mut conn, category_id).await? {
                return Err(GroveError::CategoryNotFound(*category_id));
            }
        }

        let properties = patch
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(
            "UPDATE nodes
             SET name = COALESCE(?, name),
                 position = COALESCE(?, position),
                 properties = COALESCE(?, properties),
                 category_id = CASE WHEN ? THEN ? ELSE category_id END,
                 updated_at = ?
             WHERE id = ? AND tree_id = ?
             RETURNING *",
        )
        .bind(patch.name)
        .bind(patch.position)
        .bind(properties)
        .bind(patch.category_id.is_some())
        .bind(patch.category_id.flatten().map(|c| c.to_string()))
        .bind(current_timestamp())
        .bind(node_id.to_string())
        .bind(tree_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    /// Recompute every interval and depth of a tree from its parent links
    /// and sibling positions. Returns the number of renumbered nodes, or
    /// `None` if the tree does not exist.
    pub async fn renumber_tree(&self, tree_id: &TreeId) -> Result<Option<usize>, GroveError> {
        let _guard = self.locks.acquire(*tree_id).await;
        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        if !touch_tree(&mut tx, tree_id, now).await? {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT * FROM nodes
             WHERE tree_id = ?
             ORDER BY parent_id, position, rowid",
        )
        .bind(tree_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let skeletons = rows
            .iter()
            .map(|row| node_from_row(row).map(|node| Skeleton::from(&node)))
            .collect::<Result<Vec<_>, _>>()?;
        let numbered = interval::renumber(&skeletons)?;

        for (node_id, interval) in &numbered {
            sqlx::query("UPDATE nodes SET lft = ?, rgt = ?, depth = ? WHERE id = ?")
                .bind(interval.left)
                .bind(interval.right)
                .bind(interval.depth)
                .bind(node_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(tree = %tree_id, nodes = numbered.len(), "Renumbered tree");
        Ok(Some(numbered.len()))
    }
}

/// Largest `right` in the tree
async fn max_right(conn: &mut SqliteConnection, tree_id: &TreeId) -> Result<Option<i64>, GroveError> {
    let row = sqlx::query("SELECT MAX(rgt) AS max_right FROM nodes WHERE tree_id = ?")
        .bind(tree_id.to_string())
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.try_get("max_right")?)
}

/// Largest `right` among nodes outside `subtree`
async fn max_right_outside(
    conn: &mut SqliteConnection,
    tree_id: &TreeId,
    subtree: Interval,
) -> Result<Option<i64>, GroveError> {
    let row = sqlx::query(
        "SELECT MAX(rgt) AS max_right FROM nodes
         WHERE tree_id = ? AND NOT (lft >= ? AND rgt <= ?)",
    )
    .bind(tree_id.to_string())
    .bind(subtree.left)
    .bind(subtree.right)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("max_right")?)
}

/// One past the largest sibling position under `parent_id` (0 for the first)
async fn next_position(
    conn: &mut SqliteConnection,
    tree_id: &TreeId,
    parent_id: Option<&NodeId>,
) -> Result<i64, GroveError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(position), -1) + 1 AS next_pos
         FROM nodes WHERE tree_id = ? AND parent_id IS ?",
    )
    .bind(tree_id.to_string())
    .bind(parent_id.map(|p| p.to_string()))
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.try_get("next_pos")?)
}

async fn open_gap(conn: &mut SqliteConnection, tree_id: &TreeId, gap: Gap) -> Result<(), GroveError> {
    sqlx::query("UPDATE nodes SET rgt = rgt + ? WHERE tree_id = ? AND rgt >= ?")
        .bind(gap.width)
        .bind(tree_id.to_string())
        .bind(gap.at)
        .execute(&mut *conn)
        .await?;

    sqlx::query("UPDATE nodes SET lft = lft + ? WHERE tree_id = ? AND lft >= ?")
        .bind(gap.width)
        .bind(tree_id.to_string())
        .bind(gap.at)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn close_gap(
    conn: &mut SqliteConnection,
    tree_id: &TreeId,
    closure: Closure,
) -> Result<(), GroveError> {
    sqlx::query("UPDATE nodes SET rgt = rgt - ? WHERE tree_id = ? AND rgt > ?")
        .bind(closure.width)
        .bind(tree_id.to_string())
        .bind(closure.after)
        .execute(&mut *conn)
        .await?;

    sqlx::query("UPDATE nodes SET lft = lft - ? WHERE tree_id = ? AND lft > ?")
        .bind(closure.width)
        .bind(tree_id.to_string())
        .bind(closure.after)
        .execute(&mut *conn)
        .await?;

    Ok(())
}
