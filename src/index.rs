//! Full-text index maintenance.
//!
//! The index mirrors the item files into SQLite (`items` + FTS5 `items_fts`).
//! The web server updates single rows on every mutation; `chaos reindex`
//! and `chaos sync` rebuild it from scratch.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{Item, ItemRef};
use crate::store::ItemStore;

pub async fn upsert_item(pool: &SqlitePool, item: &Item) -> Result<()> {
    let mut tx = pool.begin().await?;
    write_item(&mut tx, item).await?;
    tx.commit().await?;
    Ok(())
}

async fn write_item(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, item: &Item) -> Result<()> {
    let kind = item.kind.plural();
    let keywords = item
        .meta
        .keywords
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let body = indexable_body(item);

    sqlx::query("DELETE FROM items_fts WHERE kind = ? AND id = ?")
        .bind(kind)
        .bind(&item.id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO items (kind, id, title, keywords, body, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(kind, id) DO UPDATE SET
            title = excluded.title,
            keywords = excluded.keywords,
            body = excluded.body,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(kind)
    .bind(&item.id)
    .bind(item.display_title())
    .bind(&keywords)
    .bind(&body)
    .bind(item.updated_ts())
    .execute(&mut **tx)
    .await?;

    sqlx::query("INSERT INTO items_fts (kind, id, title, keywords, body) VALUES (?, ?, ?, ?, ?)")
        .bind(kind)
        .bind(&item.id)
        .bind(item.display_title())
        .bind(&keywords)
        .bind(&body)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Body text plus the kind-specific fields worth matching on.
fn indexable_body(item: &Item) -> String {
    let mut parts = vec![item.body.clone()];
    if let Some(url) = &item.meta.url {
        parts.push(url.clone());
    }
    if let Some(name) = &item.meta.filename {
        parts.push(name.clone());
    }
    if let Some(query) = &item.meta.query {
        parts.push(query.clone());
    }
    parts.retain(|p| !p.trim().is_empty());
    parts.join("\n")
}

pub async fn remove_item(pool: &SqlitePool, item_ref: &ItemRef) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM items_fts WHERE kind = ? AND id = ?")
        .bind(item_ref.kind.plural())
        .bind(&item_ref.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM items WHERE kind = ? AND id = ?")
        .bind(item_ref.kind.plural())
        .bind(&item_ref.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Clears the index and re-inserts every item from the store.
pub async fn rebuild(pool: &SqlitePool, store: &ItemStore) -> Result<usize> {
    let items = store.list_all()?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM items_fts").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM items").execute(&mut *tx).await?;
    for item in &items {
        write_item(&mut tx, item).await?;
    }
    tx.commit().await?;

    tracing::info!(items = items.len(), "rebuilt search index");
    Ok(items.len())
}

/// `chaos reindex`
pub async fn run_reindex(config: &Config) -> Result<()> {
    let store = ItemStore::new(&config.storage.root);
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let count = rebuild(&pool, &store).await?;
    pool.close().await;

    println!("reindex");
    println!("  indexed items: {}", count);
    println!("ok");
    Ok(())
}
