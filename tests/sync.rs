use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tempfile::TempDir;

use chaos::models::{parse_keyword_list, ItemDraft, ItemKind, ItemRef, Upload};
use chaos::progress::NoProgress;
use chaos::store::ItemStore;
use chaos::sync::{
    local_manifest, run_mirror, Manifest, ManifestEntry, MirrorOptions, Remote,
};

/// Serves another store in-process, the way `/api/manifest` and
/// `/api/items/...` serve it over HTTP.
struct StoreRemote {
    store: ItemStore,
}

#[async_trait]
impl Remote for StoreRemote {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn manifest(&self) -> Result<Manifest> {
        local_manifest(&self.store)
    }

    async fn fetch_raw(&self, item: &ItemRef) -> Result<String> {
        self.store.read_raw(item)
    }

    async fn fetch_attachment(&self, item: &ItemRef) -> Result<Option<Vec<u8>>> {
        let existing = self.store.get(item)?;
        match self.store.attachment_path(&existing) {
            Some(path) if path.is_file() => Ok(Some(self.store.read_attachment(item)?.0)),
            _ => Ok(None),
        }
    }
}

/// A remote serving fixed Markdown texts. Refs without a text fail to fetch.
struct ScriptedRemote {
    entries: Vec<(ItemRef, Option<String>)>,
    attachments: HashMap<ItemRef, Vec<u8>>,
}

#[async_trait]
impl Remote for ScriptedRemote {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn manifest(&self) -> Result<Manifest> {
        let items = self
            .entries
            .iter()
            .map(|(item, _)| ManifestEntry {
                item: item.clone(),
                updated: 0,
                hash: format!("remote-{}", item.id),
            })
            .collect();
        Ok(Manifest { items })
    }

    async fn fetch_raw(&self, item: &ItemRef) -> Result<String> {
        match self.entries.iter().find(|(r, _)| r == item) {
            Some((_, Some(text))) => Ok(text.clone()),
            _ => bail!("connection reset while fetching {}", item),
        }
    }

    async fn fetch_attachment(&self, item: &ItemRef) -> Result<Option<Vec<u8>>> {
        Ok(self.attachments.get(item).cloned())
    }
}

fn stores() -> (TempDir, StoreRemote, ItemStore) {
    let tmp = TempDir::new().unwrap();
    let remote = ItemStore::new(tmp.path().join("remote"));
    remote.init().unwrap();
    let local = ItemStore::new(tmp.path().join("local"));
    local.init().unwrap();
    (tmp, StoreRemote { store: remote }, local)
}

fn note(store: &ItemStore, title: &str, keywords: &str) -> ItemRef {
    store
        .create(
            ItemKind::Note,
            ItemDraft {
                title: title.to_string(),
                body: format!("{} body", title),
                keywords: parse_keyword_list(keywords),
                ..Default::default()
            },
        )
        .unwrap()
        .item_ref()
}

fn image(store: &ItemStore, title: &str, bytes: &[u8]) -> ItemRef {
    store
        .create(
            ItemKind::Image,
            ItemDraft {
                title: title.to_string(),
                attachment: Some(Upload {
                    filename: "pic.png".to_string(),
                    bytes: bytes.to_vec(),
                }),
                ..Default::default()
            },
        )
        .unwrap()
        .item_ref()
}

fn opts(dry_run: bool, prune: bool, exclude: &[&str]) -> MirrorOptions {
    let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
    MirrorOptions::new(dry_run, prune, &exclude).unwrap()
}

#[tokio::test]
async fn mirrors_items_and_attachments() {
    let (_tmp, remote, local) = stores();
    let n = note(&remote.store, "Remote note", "sync");
    let img = image(&remote.store, "Remote image", b"\x89PNG-bytes");

    let report = run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.failed, 0);

    let copied = local.get(&n).unwrap();
    assert_eq!(copied.meta.title, "Remote note");
    assert!(copied.meta.keywords.contains("sync"));
    let (bytes, content_type) = local.read_attachment(&img).unwrap();
    assert_eq!(bytes, b"\x89PNG-bytes");
    assert_eq!(content_type, "image/png");

    assert_eq!(
        local_manifest(&local).unwrap(),
        local_manifest(&remote.store).unwrap()
    );
}

#[tokio::test]
async fn second_run_is_unchanged_until_remote_edits() {
    let (_tmp, remote, local) = stores();
    let n = note(&remote.store, "Stable", "");
    note(&remote.store, "Other", "");
    run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();

    let report = run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(report.unchanged, 2);

    remote
        .store
        .update(
            &n,
            ItemDraft {
                title: "Stable, edited".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    let report = run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(local.get(&n).unwrap().meta.title, "Stable, edited");
}

#[tokio::test]
async fn prune_removes_items_gone_from_remote() {
    let (_tmp, remote, local) = stores();
    note(&remote.store, "Shared", "");
    let local_only = note(&local, "Local only", "");
    let kept_local = note(&local, "Excluded local", "");

    let report = run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.pruned, 0);
    assert!(local.exists(&local_only));

    let pattern = kept_local.to_string();
    let report = run_mirror(
        &local,
        &remote,
        &opts(false, true, &[pattern.as_str()]),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(report.pruned, 1);
    assert!(!local.exists(&local_only));
    assert!(local.exists(&kept_local));
}

#[tokio::test]
async fn excluded_refs_are_skipped() {
    let (_tmp, remote, local) = stores();
    let n = note(&remote.store, "Note", "");
    let img = image(&remote.store, "Image", b"bytes");

    let report = run_mirror(&local, &remote, &opts(false, false, &["images/*"]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.skipped, 1);
    assert!(local.exists(&n));
    assert!(!local.exists(&img));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let (_tmp, remote, local) = stores();
    let n = note(&remote.store, "Note", "");
    let stale = note(&local, "Stale", "");

    let report = run_mirror(&local, &remote, &opts(true, true, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.pruned, 1);
    assert!(!local.exists(&n));
    assert!(local.exists(&stale));
}

#[tokio::test]
async fn failing_item_is_counted_and_run_continues() {
    let tmp = TempDir::new().unwrap();
    let local = ItemStore::new(tmp.path().join("local"));
    local.init().unwrap();

    let first = ItemRef::new(ItemKind::Note, "first").unwrap();
    let broken = ItemRef::new(ItemKind::Note, "broken").unwrap();
    let last = ItemRef::new(ItemKind::Note, "last").unwrap();
    let remote = ScriptedRemote {
        entries: vec![
            (first.clone(), Some("---\ntitle: First\n---\n".to_string())),
            (broken.clone(), None),
            (last.clone(), Some("---\ntitle: Last\n---\n".to_string())),
        ],
        attachments: HashMap::new(),
    };

    let report = run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.fetched, 2);
    assert!(local.exists(&first));
    assert!(!local.exists(&broken));
    assert_eq!(local.get(&last).unwrap().meta.title, "Last");
}

#[tokio::test]
async fn attachment_filename_cannot_escape_the_store() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("a").join("store");
    let local = ItemStore::new(&root);
    local.init().unwrap();

    let sneaky = ItemRef::new(ItemKind::File, "sneaky").unwrap();
    let fine = ItemRef::new(ItemKind::File, "fine").unwrap();
    let mut attachments = HashMap::new();
    attachments.insert(sneaky.clone(), b"payload".to_vec());
    attachments.insert(fine.clone(), b"report".to_vec());
    let remote = ScriptedRemote {
        entries: vec![
            (
                sneaky.clone(),
                Some("---\ntitle: Sneaky\nfilename: ../../../escaped.txt\n---\n".to_string()),
            ),
            (
                fine.clone(),
                Some("---\ntitle: Fine\nfilename: report.txt\n---\n".to_string()),
            ),
        ],
        attachments,
    };

    let report = run_mirror(&local, &remote, &opts(false, false, &[]), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.fetched, 1);
    assert!(!tmp.path().join("a").join("escaped.txt").exists());
    assert!(!tmp.path().join("escaped.txt").exists());
    assert!(!local.exists(&sneaky));
    assert_eq!(local.read_attachment(&fine).unwrap().0, b"report");
}
