//! Repository statistics.
//!
//! `chaos stats` summarizes what the store holds: item counts per kind,
//! attachment volume, keyword usage, relation pairs and the state of the
//! search index.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::ItemKind;
use crate::relations::RelationGraph;
use crate::store::ItemStore;

struct KindStats {
    kind: ItemKind,
    count: usize,
    attachment_bytes: u64,
    last_update: Option<i64>,
}

/// Run the stats command: read the store and index and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = ItemStore::new(&config.storage.root);

    let mut per_kind = Vec::new();
    let mut all = Vec::new();
    for kind in ItemKind::ALL {
        let items = store.list(kind)?;
        let attachment_bytes = items
            .iter()
            .filter_map(|item| store.attachment_path(item))
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|m| m.len())
            .sum();
        per_kind.push(KindStats {
            kind,
            count: items.len(),
            attachment_bytes,
            last_update: items.iter().map(|i| i.updated_ts()).filter(|&ts| ts > 0).max(),
        });
        all.extend(items);
    }

    let graph = RelationGraph::from_items(all.iter(), config.relations.min_shared);
    let keyword_count = graph.keyword_counts().len();

    let index_path = config.index_path();
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
        .fetch_one(&pool)
        .await?;
    pool.close().await;
    let index_size = std::fs::metadata(&index_path).map(|m| m.len()).unwrap_or(0);

    println!("chaos: Repository Stats");
    println!("=======================");
    println!();
    println!("  Root:        {}", config.storage.root.display());
    println!("  Index:       {}", index_path.display());
    println!("  Index size:  {}", format_bytes(index_size));
    println!();
    println!("  Items:       {}", all.len());
    println!("  Indexed:     {}", indexed);
    println!("  Keywords:    {}", keyword_count);
    println!(
        "  Relations:   {} pairs (min shared keywords: {})",
        graph.pair_count(),
        config.relations.min_shared
    );
    if indexed as usize != all.len() {
        println!("  (index is out of date, run `chaos reindex`)");
    }

    println!();
    println!("  By kind:");
    println!(
        "  {:<12} {:>6} {:>12}   {}",
        "KIND", "ITEMS", "ATTACHMENTS", "LAST UPDATE"
    );
    println!("  {}", "-".repeat(52));
    for s in &per_kind {
        let last = match s.last_update {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        };
        let attachments = if s.kind.has_attachment() {
            format_bytes(s.attachment_bytes)
        } else {
            "-".to_string()
        };
        println!(
            "  {:<12} {:>6} {:>12}   {}",
            s.kind.plural(),
            s.count,
            attachments,
            last
        );
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
