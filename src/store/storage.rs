use super::error::GroveError;
use super::locks::TreeLocks;
use super::types::{GroveId, Node, NewTree, Properties, Tree, TreeId, TreePatch};
use crate::config::GroveConfig;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{ConnectOptions, Row};
use std::time::Duration;

/// SQLite-backed storage for trees, nested-set nodes, categories and edges.
///
/// # Usage Pattern: Direct Injection
///
/// Construct one instance per database and share it behind an `Arc`; every
/// operation takes `&self`. The per-tree locks live inside the instance, so
/// two `GroveStorage` values over the same file do not serialize against
/// each other (the database transaction still keeps each mutation atomic).
///
/// ```ignore
/// let storage = Arc::new(GroveStorage::new(GroveConfig::at("forest.db")).await?);
/// let tree = storage.create_tree(NewTree { name: "docs".into(), ..Default::default() }).await?;
/// let root = storage.create_node(&tree.id, NewNode::new("root")).await?;
/// ```
pub struct GroveStorage {
    pub(crate) pool: SqlitePool,
    pub(crate) locks: TreeLocks,
    config: GroveConfig,
}

impl GroveStorage {
    /// Create a new storage instance and run migrations
    pub async fn new(config: GroveConfig) -> Result<Self, GroveError> {
        if let Some(dir) = config.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                GroveError::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let mut connect_options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));
        connect_options.disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options)
            .await?;

        let storage = Self {
            pool,
            locks: TreeLocks::new(),
            config,
        };
        storage.run_migrations().await?;

        tracing::debug!(db = %storage.config.db_path.display(), "Grove storage ready");
        Ok(storage)
    }

    pub fn config(&self) -> &GroveConfig {
        &self.config
    }

    /// The underlying pool, for callers composing their own queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), GroveError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trees (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (parent_id) REFERENCES categories(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                tree_id TEXT NOT NULL,
                parent_id TEXT,
                name TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                properties TEXT NOT NULL DEFAULT '{}',
                category_id TEXT,
                lft INTEGER NOT NULL,
                rgt INTEGER NOT NULL,
                depth INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (tree_id) REFERENCES trees(id) ON DELETE CASCADE,
                FOREIGN KEY (parent_id) REFERENCES nodes(id) ON DELETE CASCADE,
                FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS edges (
                id TEXT PRIMARY KEY,
                tree_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                FOREIGN KEY (tree_id) REFERENCES trees(id) ON DELETE CASCADE,
                FOREIGN KEY (source_id) REFERENCES nodes(id) ON DELETE CASCADE,
                FOREIGN KEY (target_id) REFERENCES nodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_tree_lft ON nodes(tree_id, lft);
            CREATE INDEX IF NOT EXISTS idx_nodes_tree_rgt ON nodes(tree_id, rgt);
            CREATE INDEX IF NOT EXISTS idx_nodes_siblings ON nodes(tree_id, parent_id, position);
            CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_category ON nodes(category_id);
            CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_id);
            CREATE INDEX IF NOT EXISTS idx_edges_tree ON edges(tree_id);
            CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
            CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Tree Operations
    // ========================================================================

    /// Create a new, empty tree
    pub async fn create_tree(&self, input: NewTree) -> Result<Tree, GroveError> {
        let now = current_timestamp();
        let properties = serde_json::to_string(&input.properties)?;

        let row = sqlx::query(
            "INSERT INTO trees (id, name, properties, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(TreeId::new().to_string())
        .bind(&input.name)
        .bind(properties)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tree_from_row(&row)
    }

    /// Get a tree by ID
    pub async fn get_tree(&self, tree_id: &TreeId) -> Result<Option<Tree>, GroveError> {
        let row = sqlx::query("SELECT * FROM trees WHERE id = ?")
            .bind(tree_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(tree_from_row).transpose()
    }

    /// List all trees, oldest first
    pub async fn list_trees(&self) -> Result<Vec<Tree>, GroveError> {
        let rows = sqlx::query("SELECT * FROM trees ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(tree_from_row).collect()
    }

    /// Rename a tree and/or replace its properties
    pub async fn update_tree(
        &self,
        tree_id: &TreeId,
        patch: TreePatch,
    ) -> Result<Option<Tree>, GroveError> {
        let properties = patch
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(
            "UPDATE trees
             SET name = COALESCE(?, name),
                 properties = COALESCE(?, properties),
                 updated_at = ?
             WHERE id = ?
             RETURNING *",
        )
        .bind(patch.name)
        .bind(properties)
        .bind(current_timestamp())
        .bind(tree_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tree_from_row).transpose()
    }

    /// Delete a tree together with its nodes and edges
    pub async fn delete_tree(&self, tree_id: &TreeId) -> Result<bool, GroveError> {
        let _guard = self.locks.acquire(*tree_id).await;

        let result = sqlx::query("DELETE FROM trees WHERE id = ?")
            .bind(tree_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Shared statement helpers
// ============================================================================

/// Bump the tree's `updated_at`.
///
/// Issued first in every structural transaction so the write lock is taken
/// before any read; `false` means the tree does not exist.
pub(crate) async fn touch_tree(
    conn: &mut SqliteConnection,
    tree_id: &TreeId,
    now: i64,
) -> Result<bool, GroveError> {
    let result = sqlx::query("UPDATE trees SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(tree_id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Fetch one node scoped to its tree
pub(crate) async fn fetch_node(
    conn: &mut SqliteConnection,
    tree_id: &TreeId,
    node_id: &GroveId,
) -> Result<Option<Node>, GroveError> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ? AND tree_id = ?")
        .bind(node_id.to_string())
        .bind(tree_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(node_from_row).transpose()
}

pub(crate) fn tree_from_row(row: &SqliteRow) -> Result<Tree, GroveError> {
    Ok(Tree {
        id: parse_id(row, "id")?,
        name: row.try_get("name")?,
        properties: parse_properties(row)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn node_from_row(row: &SqliteRow) -> Result<Node, GroveError> {
    Ok(Node {
        id: parse_id(row, "id")?,
        tree_id: parse_id(row, "tree_id")?,
        parent_id: parse_optional_id(row, "parent_id")?,
        name: row.try_get("name")?,
        position: row.try_get("position")?,
        properties: parse_properties(row)?,
        category_id: parse_optional_id(row, "category_id")?,
        left: row.try_get("lft")?,
        right: row.try_get("rgt")?,
        depth: row.try_get("depth")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn parse_id(row: &SqliteRow, column: &str) -> Result<GroveId, GroveError> {
    let raw: String = row.try_get(column)?;
    GroveId::parse_str(&raw)
}

pub(crate) fn parse_optional_id(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<GroveId>, GroveError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref().map(GroveId::parse_str).transpose()
}

pub(crate) fn parse_properties(row: &SqliteRow) -> Result<Properties, GroveError> {
    let raw: String = row.try_get("properties")?;
    Ok(serde_json::from_str(&raw)?)
}

/// Get current Unix timestamp in seconds
pub(crate) fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
