//! Categories form their own parent hierarchy, independent of any tree.
//! It is kept acyclic by walking the parent chain on every reparent.

use super::error::GroveError;
use super::storage::{current_timestamp, parse_id, parse_optional_id, GroveStorage};
use super::types::{Category, CategoryId, CategoryPatch};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

impl GroveStorage {
    /// Create a category, optionally under an existing parent.
    ///
    /// The parent check is part of the insert itself, so no read precedes
    /// the write.
    pub async fn create_category(
        &self,
        name: &str,
        parent_id: Option<&CategoryId>,
    ) -> Result<Category, GroveError> {
        let now = current_timestamp();
        let parent = parent_id.map(|p| p.to_string());

        let row = sqlx::query(
            "INSERT INTO categories (id, name, parent_id, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?
             WHERE ? IS NULL OR EXISTS (SELECT 1 FROM categories WHERE id = ?)
             RETURNING *",
        )
        .bind(CategoryId::new().to_string())
        .bind(name)
        .bind(parent.as_deref())
        .bind(now)
        .bind(now)
        .bind(parent.as_deref())
        .bind(parent.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        match (row, parent_id) {
            (Some(row), _) => category_from_row(&row),
            (None, Some(parent_id)) => Err(GroveError::CategoryNotFound(*parent_id)),
            (None, None) => Err(GroveError::Database(sqlx::Error::RowNotFound)),
        }
    }

    pub async fn get_category(
        &self,
        category_id: &CategoryId,
    ) -> Result<Option<Category>, GroveError> {
        let row = sqlx::query("SELECT * FROM categories WHERE id = ?")
            .bind(category_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(category_from_row).transpose()
    }

    /// All categories, oldest first
    pub async fn list_categories(&self) -> Result<Vec<Category>, GroveError> {
        let rows = sqlx::query("SELECT * FROM categories ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(category_from_row).collect()
    }

    /// Rename and/or reparent a category.
    ///
    /// Rejects making a category its own parent, and reparenting under one
    /// of its own descendants.
    pub async fn update_category(
        &self,
        category_id: &CategoryId,
        patch: CategoryPatch,
    ) -> Result<Option<Category>, GroveError> {
        if patch.parent_id == Some(Some(*category_id)) {
            return Err(GroveError::CategorySelfParent);
        }

        let now = current_timestamp();
        let mut tx = self.pool.begin().await?;

        // Write first: takes the database write lock before the chain is read.
        let touched = sqlx::query("UPDATE categories SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(category_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if touched == 0 {
            return Ok(None);
        }

        if let Some(Some(parent_id)) = &patch.parent_id {
            if !category_exists(&mut tx, parent_id).await? {
                return Err(GroveError::CategoryNotFound(*parent_id));
            }
            if chain_contains(&mut tx, parent_id, category_id).await? {
                return Err(GroveError::CategoryCycle(*parent_id));
            }
        }

        let row = sqlx::query(
            "UPDATE categories
             SET name = COALESCE(?, name),
                 parent_id = CASE WHEN ? THEN ? ELSE parent_id END
             WHERE id = ?
             RETURNING *",
        )
        .bind(patch.name)
        .bind(patch.parent_id.is_some())
        .bind(patch.parent_id.flatten().map(|p| p.to_string()))
        .bind(category_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let category = category_from_row(&row)?;
        tx.commit().await?;

        tracing::debug!(category = %category_id, parent = ?category.parent_id, "Updated category");
        Ok(Some(category))
    }

    /// Delete a category. Child categories become top-level and nodes
    /// referencing it lose their category.
    pub async fn delete_category(&self, category_id: &CategoryId) -> Result<bool, GroveError> {
        let result = sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(category_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub(crate) async fn category_exists(
    conn: &mut SqliteConnection,
    category_id: &CategoryId,
) -> Result<bool, GroveError> {
    let row = sqlx::query("SELECT 1 FROM categories WHERE id = ?")
        .bind(category_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.is_some())
}

/// Whether `needle` appears on the parent chain starting at `start`
/// (inclusive). `UNION` keeps the walk finite even over a corrupt cycle.
async fn chain_contains(
    conn: &mut SqliteConnection,
    start: &CategoryId,
    needle: &CategoryId,
) -> Result<bool, GroveError> {
    let row = sqlx::query(
        "WITH RECURSIVE chain(id, parent_id) AS (
             SELECT id, parent_id FROM categories WHERE id = ?
             UNION
             SELECT c.id, c.parent_id FROM categories c JOIN chain ON c.id = chain.parent_id
         )
         SELECT 1 FROM chain WHERE id = ?",
    )
    .bind(start.to_string())
    .bind(needle.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.is_some())
}

fn category_from_row(row: &SqliteRow) -> Result<Category, GroveError> {
    Ok(Category {
        id: parse_id(row, "id")?,
        name: row.try_get("name")?,
        parent_id: parse_optional_id(row, "parent_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
