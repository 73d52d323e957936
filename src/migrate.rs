use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::store::ItemStore;

/// `chaos init`: creates the storage layout and the index schema.
pub async fn run_init(config: &Config) -> Result<()> {
    ItemStore::new(&config.storage.root).init()?;
    run_migrations(config).await
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the index tables if they do not exist yet. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            title TEXT NOT NULL,
            keywords TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='items_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE items_fts USING fts5(
                kind UNINDEXED,
                id UNINDEXED,
                title,
                keywords,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_updated_at ON items(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
