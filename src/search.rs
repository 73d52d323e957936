//! Keyword search over the FTS5 index.
//!
//! Scores are BM25 ranks (title weighted above keywords, keywords above
//! body), min-max normalized to `[0, 1]` within a result set. Results sort by
//! score desc, updated desc, ref asc so output is deterministic.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{ItemKind, ItemRef};

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub item: ItemRef,
    pub title: String,
    pub score: f64,
    pub snippet: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
struct Candidate {
    item: ItemRef,
    title: String,
    raw_score: f64,
    snippet: String,
    updated_at: i64,
}

/// Turns free text into an FTS5 query: each alphanumeric token quoted,
/// tokens implicitly AND-ed. Returns `None` when nothing is searchable.
pub fn fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

pub async fn search_items(
    pool: &SqlitePool,
    query: &str,
    kind: Option<ItemKind>,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let Some(fts) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let mut sql = String::from(
        r#"
        SELECT items_fts.kind AS kind, items_fts.id AS id, items.title AS title,
               items.updated_at AS updated_at,
               bm25(items_fts, 0.0, 0.0, 10.0, 5.0, 1.0) AS rank,
               snippet(items_fts, 4, '[', ']', '...', 24) AS snippet
        FROM items_fts
        JOIN items ON items.kind = items_fts.kind AND items.id = items_fts.id
        WHERE items_fts MATCH ?
        "#,
    );
    if kind.is_some() {
        sql.push_str(" AND items_fts.kind = ?");
    }
    sql.push_str(" ORDER BY rank LIMIT ?");

    let mut q = sqlx::query(&sql).bind(&fts);
    if let Some(k) = kind {
        q = q.bind(k.plural());
    }
    let rows = q.bind(limit).fetch_all(pool).await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in &rows {
        let kind: String = row.get("kind");
        let id: String = row.get("id");
        let Ok(item) = ItemRef::from_parts(&kind, &id) else {
            continue;
        };
        let rank: f64 = row.get("rank");
        candidates.push(Candidate {
            item,
            title: row.get("title"),
            raw_score: -rank, // negate so higher = better
            snippet: row.get("snippet"),
            updated_at: row.get("updated_at"),
        });
    }

    let mut hits: Vec<SearchHit> = normalize_scores(&candidates)
        .into_iter()
        .map(|(c, score)| SearchHit {
            item: c.item.clone(),
            title: c.title.clone(),
            score,
            snippet: c.snippet.clone(),
            updated_at: c.updated_at,
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.item.cmp(&b.item))
    });
    Ok(hits)
}

/// `chaos search`
pub async fn run_search(
    config: &Config,
    query: &str,
    kind: Option<ItemKind>,
    limit: i64,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let hits = search_items(&pool, query, kind, limit).await?;
    pool.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(hit.updated_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, hit.item.kind, hit.title);
        println!("    updated: {}", date);
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    ref: {}", hit.item);
        println!();
    }
    Ok(())
}

/// Min-max normalize scores to [0, 1].
fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}
