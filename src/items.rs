//! Item commands of the CLI: list, show, create, related items and keywords.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::index;
use crate::migrate;
use crate::models::{Item, ItemDraft, ItemKind, ItemRef, Upload};
use crate::relations::RelationGraph;
use crate::store::ItemStore;

fn open_store(config: &Config) -> ItemStore {
    ItemStore::new(&config.storage.root)
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn load_graph(config: &Config, store: &ItemStore) -> Result<(Vec<Item>, RelationGraph)> {
    let items = store.list_all()?;
    let graph = RelationGraph::from_items(items.iter(), config.relations.min_shared);
    Ok((items, graph))
}

/// `chaos list <kind>`
pub async fn run_list(config: &Config, kind: ItemKind) -> Result<()> {
    let items = open_store(config).list(kind)?;
    if items.is_empty() {
        println!("No {}.", kind.plural());
        return Ok(());
    }
    for item in &items {
        let keywords = item.meta.keywords.iter().cloned().collect::<Vec<_>>();
        println!(
            "{}  {}  {}{}",
            item.item_ref(),
            format_ts_iso(item.updated_ts()),
            item.display_title(),
            if keywords.is_empty() {
                String::new()
            } else {
                format!("  [{}]", keywords.join(", "))
            }
        );
    }
    Ok(())
}

/// `chaos get <ref>`
pub async fn run_get(config: &Config, item_ref: &ItemRef) -> Result<()> {
    let store = open_store(config);
    let item = store.get(item_ref)?;
    let meta = &item.meta;

    println!("--- Item ---");
    println!("ref:          {}", item_ref);
    println!("title:        {}", item.display_title());
    println!(
        "keywords:     {}",
        meta.keywords.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!(
        "created:      {}",
        format_ts_iso(meta.created.map(|t| t.timestamp()).unwrap_or(0))
    );
    println!("updated:      {}", format_ts_iso(item.updated_ts()));
    if let Some(url) = &meta.url {
        println!("url:          {}", url);
    }
    if let Some(name) = &meta.filename {
        println!(
            "attachment:   {} ({}, {} bytes)",
            name,
            meta.content_type.as_deref().unwrap_or("unknown"),
            meta.size.unwrap_or(0)
        );
    }
    if let Some(query) = &meta.query {
        println!("query:        {}", query);
    }
    if let Some(plot) = &meta.plot {
        println!("plot:         {} x={} y={}", plot.kind.as_str(), plot.x, plot.y.join(","));
    }
    if !meta.members.is_empty() {
        println!("members:");
        for (i, member) in meta.members.iter().enumerate() {
            let marker = if store.exists(member) { "" } else { " (missing)" };
            println!("  {}. {}{}", i + 1, member, marker);
        }
    }
    println!();
    println!("--- Body ---");
    println!("{}", item.body);
    Ok(())
}

/// `chaos new <kind>`: creates the item, indexes it and prints its ref.
pub async fn run_new(
    config: &Config,
    kind: ItemKind,
    mut draft: ItemDraft,
    attach: Option<&Path>,
) -> Result<()> {
    if let Some(path) = attach {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        draft.attachment = Some(Upload { filename, bytes });
    }

    let store = open_store(config);
    store.init()?;
    let item = store.create(kind, draft)?;

    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    index::upsert_item(&pool, &item).await?;
    pool.close().await;

    println!("{}", item.item_ref());
    Ok(())
}

/// `chaos related <ref>`
pub async fn run_related(config: &Config, item_ref: &ItemRef, limit: usize) -> Result<()> {
    let store = open_store(config);
    store.get(item_ref)?;
    let (items, graph) = load_graph(config, &store)?;

    let related = graph.related(item_ref, limit);
    if related.is_empty() {
        println!("No related items.");
        return Ok(());
    }
    for rel in related {
        let title = items
            .iter()
            .find(|i| i.item_ref() == rel.target)
            .map(|i| i.display_title().to_string())
            .unwrap_or_default();
        println!(
            "{}  {}  ({} shared: {})",
            rel.target,
            title,
            rel.shared.len(),
            rel.shared.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(())
}

/// `chaos keywords`
pub async fn run_keywords(config: &Config, limit: Option<usize>) -> Result<()> {
    let store = open_store(config);
    let (_, graph) = load_graph(config, &store)?;
    let counts = graph.keyword_counts();
    if counts.is_empty() {
        println!("No keywords.");
        return Ok(());
    }
    for (keyword, count) in counts.into_iter().take(limit.unwrap_or(usize::MAX)) {
        println!("{:>5}  {}", count, keyword);
    }
    Ok(())
}
