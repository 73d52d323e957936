//! One-way mirror of a remote chaos instance into the local store.
//!
//! The remote publishes a manifest of `(ref, updated, hash)` entries at
//! `/api/manifest`. An entry is fetched when the local item is missing or its
//! [`content_hash`](ItemStore::content_hash) differs. Markdown is written
//! before the attachment so the attachment lands where the new frontmatter
//! says it belongs.
//!
//! A failing item is logged and counted; it never aborts the run. Only a
//! failure to read the manifest does.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::{Config, SyncConfig};
use crate::db;
use crate::index;
use crate::migrate;
use crate::models::ItemRef;
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::store::ItemStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub item: ItemRef,
    pub updated: i64,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub items: Vec<ManifestEntry>,
}

/// Builds the manifest this instance serves to its mirrors.
pub fn local_manifest(store: &ItemStore) -> Result<Manifest> {
    let mut items = Vec::new();
    for item in store.list_all()? {
        let item_ref = item.item_ref();
        let hash = store.content_hash(&item_ref)?;
        items.push(ManifestEntry {
            item: item_ref,
            updated: item.updated_ts(),
            hash,
        });
    }
    items.sort_by(|a, b| a.item.cmp(&b.item));
    Ok(Manifest { items })
}

/// A source of items to mirror.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Human-readable name used in progress output.
    fn name(&self) -> &str;

    async fn manifest(&self) -> Result<Manifest>;

    async fn fetch_raw(&self, item: &ItemRef) -> Result<String>;

    /// `None` when the remote item has no attachment.
    async fn fetch_attachment(&self, item: &ItemRef) -> Result<Option<Vec<u8>>>;
}

/// Another chaos instance reached over its JSON API.
pub struct HttpRemote {
    base: String,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl HttpRemote {
    pub fn from_config(sync: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(sync.timeout_secs))
            .build()?;
        Ok(Self {
            base: sync.remote.trim_end_matches('/').to_string(),
            client,
            username: sync.username.clone(),
            password: sync.password.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(format!("{}{}", self.base, path));
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_ref()),
            None => req,
        }
    }
}

#[async_trait]
impl Remote for HttpRemote {
    fn name(&self) -> &str {
        &self.base
    }

    async fn manifest(&self) -> Result<Manifest> {
        let resp = self
            .get("/api/manifest")
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("manifest request failed with {}: {}", status, body);
        }
        Ok(resp.json().await?)
    }

    async fn fetch_raw(&self, item: &ItemRef) -> Result<String> {
        let resp = self
            .get(&format!("/api/items/{}/raw", item))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("fetching {} failed with {}", item, status);
        }
        Ok(resp.text().await?)
    }

    async fn fetch_attachment(&self, item: &ItemRef) -> Result<Option<Vec<u8>>> {
        let resp = self
            .get(&format!("/api/items/{}/attachment", item))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("fetching attachment of {} failed with {}", item, status);
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    pub dry_run: bool,
    pub prune: bool,
    /// Matched against `kind/id`. Excluded items are neither fetched nor pruned.
    pub exclude: GlobSet,
}

impl MirrorOptions {
    pub fn new(dry_run: bool, prune: bool, exclude: &[String]) -> Result<Self> {
        Ok(Self {
            dry_run,
            prune,
            exclude: build_globset(exclude)?,
        })
    }

    fn excludes(&self, item: &ItemRef) -> bool {
        self.exclude.is_match(item.to_string())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Outcome of one mirror run. In dry-run mode `fetched` and `pruned` count
/// what would have happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub pruned: u64,
    pub failed: u64,
}

pub async fn run_mirror(
    store: &ItemStore,
    remote: &dyn Remote,
    opts: &MirrorOptions,
    reporter: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    let name = remote.name().to_string();
    reporter.report(SyncProgressEvent::Discovering {
        remote: name.clone(),
    });
    let manifest = remote.manifest().await?;
    let total = manifest.items.len() as u64;

    let mut report = SyncReport::default();
    let mut remote_refs = HashSet::with_capacity(manifest.items.len());

    for (i, entry) in manifest.items.iter().enumerate() {
        remote_refs.insert(entry.item.clone());
        if opts.excludes(&entry.item) {
            report.skipped += 1;
        } else if local_hash(store, &entry.item).as_deref() == Some(entry.hash.as_str()) {
            report.unchanged += 1;
        } else if opts.dry_run {
            tracing::info!(item = %entry.item, "would fetch");
            report.fetched += 1;
        } else {
            match fetch_item(store, remote, &entry.item).await {
                Ok(()) => {
                    tracing::debug!(item = %entry.item, "fetched");
                    report.fetched += 1;
                }
                Err(e) => {
                    tracing::warn!(item = %entry.item, error = %e, "failed to mirror item");
                    report.failed += 1;
                }
            }
        }
        reporter.report(SyncProgressEvent::Mirroring {
            remote: name.clone(),
            n: i as u64 + 1,
            total,
        });
    }

    if opts.prune {
        let stale: Vec<ItemRef> = store
            .list_all()?
            .into_iter()
            .map(|item| item.item_ref())
            .filter(|r| !remote_refs.contains(r) && !opts.excludes(r))
            .collect();
        if !stale.is_empty() {
            reporter.report(SyncProgressEvent::Pruning {
                remote: name.clone(),
                count: stale.len() as u64,
            });
        }
        for item_ref in stale {
            if opts.dry_run {
                tracing::info!(item = %item_ref, "would prune");
                report.pruned += 1;
                continue;
            }
            match store.delete(&item_ref) {
                Ok(_) => report.pruned += 1,
                Err(e) => {
                    tracing::warn!(item = %item_ref, error = %e, "failed to prune item");
                    report.failed += 1;
                }
            }
        }
    }

    tracing::info!(
        remote = %name,
        fetched = report.fetched,
        unchanged = report.unchanged,
        skipped = report.skipped,
        pruned = report.pruned,
        failed = report.failed,
        dry_run = opts.dry_run,
        "mirror finished"
    );
    Ok(report)
}

fn local_hash(store: &ItemStore, item: &ItemRef) -> Option<String> {
    if !store.exists(item) {
        return None;
    }
    match store.content_hash(item) {
        Ok(hash) => Some(hash),
        Err(e) => {
            tracing::warn!(item = %item, error = %e, "cannot hash local item, refetching");
            None
        }
    }
}

async fn fetch_item(store: &ItemStore, remote: &dyn Remote, item_ref: &ItemRef) -> Result<()> {
    let raw = remote.fetch_raw(item_ref).await?;
    let item = store.write_raw(item_ref, &raw)?;
    if store.attachment_path(&item).is_some() {
        if let Some(bytes) = remote.fetch_attachment(item_ref).await? {
            store.write_attachment_bytes(item_ref, &bytes)?;
        }
    }
    Ok(())
}

/// `chaos sync`: mirror once, or every `interval` seconds when given.
pub async fn run_sync_command(
    config: &Config,
    dry_run: bool,
    prune: bool,
    interval: Option<u64>,
    mode: ProgressMode,
) -> Result<()> {
    if interval == Some(0) {
        bail!("sync interval must be at least 1 second");
    }
    let sync = config
        .sync
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No [sync] section in config"))?;
    let remote = HttpRemote::from_config(sync)?;
    let opts = MirrorOptions::new(dry_run, prune || sync.prune, &sync.exclude)?;
    let store = ItemStore::new(&config.storage.root);
    store.init()?;
    let reporter = mode.reporter();

    loop {
        match sync_once(config, &store, &remote, &opts, reporter.as_ref()).await {
            Ok(()) => {}
            // One bad round must not stop the periodic mirror.
            Err(e) if interval.is_some() => {
                tracing::error!(remote = %remote.name(), error = %e, "sync run failed");
            }
            Err(e) => return Err(e),
        }

        let Some(secs) = interval else {
            return Ok(());
        };
        tracing::info!(seconds = secs, "waiting for next sync run");
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

async fn sync_once(
    config: &Config,
    store: &ItemStore,
    remote: &HttpRemote,
    opts: &MirrorOptions,
    reporter: &dyn SyncProgressReporter,
) -> Result<()> {
    let report = run_mirror(store, remote, opts, reporter).await?;

    if opts.dry_run {
        println!("sync {} (dry-run)", remote.name());
        println!("  would fetch: {}", report.fetched);
        println!("  unchanged: {}", report.unchanged);
        println!("  skipped: {}", report.skipped);
        if opts.prune {
            println!("  would prune: {}", report.pruned);
        }
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let indexed = index::rebuild(&pool, store).await?;
    pool.close().await;

    println!("sync {}", remote.name());
    println!("  fetched: {}", report.fetched);
    println!("  unchanged: {}", report.unchanged);
    println!("  skipped: {}", report.skipped);
    println!("  pruned: {}", report.pruned);
    println!("  failed: {}", report.failed);
    println!("  indexed: {}", indexed);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemDraft, ItemKind};
    use tempfile::TempDir;

    #[test]
    fn excludes_match_refs() {
        let opts = MirrorOptions::new(false, false, &["databases/*".to_string()]).unwrap();
        let db = ItemRef::new(ItemKind::Database, "sales").unwrap();
        let note = ItemRef::new(ItemKind::Note, "sales").unwrap();
        assert!(opts.excludes(&db));
        assert!(!opts.excludes(&note));
        assert!(MirrorOptions::new(false, false, &["[".to_string()]).is_err());
    }

    #[test]
    fn local_manifest_lists_every_item_sorted() {
        let tmp = TempDir::new().unwrap();
        let store = ItemStore::new(tmp.path());
        store.init().unwrap();
        let note = store
            .create(
                ItemKind::Note,
                ItemDraft {
                    title: "Hello".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .create(
                ItemKind::Link,
                ItemDraft {
                    title: "Site".to_string(),
                    url: Some("https://example.org".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let manifest = local_manifest(&store).unwrap();
        assert_eq!(manifest.items.len(), 2);
        assert_eq!(manifest.items[0].item.kind, ItemKind::Note);
        assert_eq!(manifest.items[0].item, note.item_ref());
        assert_eq!(
            manifest.items[0].hash,
            store.content_hash(&note.item_ref()).unwrap()
        );
        assert_eq!(manifest.items[0].hash.len(), 64);

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains(&format!("\"notes/{}\"", note.id)));
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
