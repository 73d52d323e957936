//! Filesystem item store.
//!
//! The Markdown files are the source of truth; the search index and the
//! relation graph are derived from them and can be rebuilt at any time.
//!
//! ```text
//! <root>/notes/<id>.md
//! <root>/images/<id>.md
//! <root>/images/<id>/<filename>
//! <root>/databases/<id>.md
//! <root>/databases/<id>.sqlite
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::frontmatter;
use crate::models::{
    new_id, normalize_keywords, validate_id, Frontmatter, Item, ItemDraft, ItemKind, ItemRef,
    Upload,
};

#[derive(Debug, Clone)]
pub struct ItemStore {
    root: PathBuf,
}

impl ItemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the per-kind directories. Safe to call repeatedly.
    pub fn init(&self) -> Result<()> {
        for kind in ItemKind::ALL {
            let dir = self.kind_dir(kind);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn kind_dir(&self, kind: ItemKind) -> PathBuf {
        self.root.join(kind.plural())
    }

    fn item_path(&self, item_ref: &ItemRef) -> PathBuf {
        self.kind_dir(item_ref.kind)
            .join(format!("{}.md", item_ref.id))
    }

    pub fn database_path(&self, id: &str) -> PathBuf {
        self.kind_dir(ItemKind::Database)
            .join(format!("{}.sqlite", id))
    }

    /// Location of the binary payload owned by `item`, if it has one.
    pub fn attachment_path(&self, item: &Item) -> Option<PathBuf> {
        match item.kind {
            ItemKind::Database => Some(self.database_path(&item.id)),
            // Names that would not survive sanitizing could leave the item directory.
            ItemKind::Image | ItemKind::File => item
                .meta
                .filename
                .as_ref()
                .filter(|name| is_safe_filename(name))
                .map(|name| self.kind_dir(item.kind).join(&item.id).join(name)),
            _ => None,
        }
    }

    pub fn exists(&self, item_ref: &ItemRef) -> bool {
        self.item_path(item_ref).is_file()
    }

    /// Lists all items of one kind, newest first.
    ///
    /// Files that fail to parse are skipped with a warning rather than
    /// failing the whole listing.
    pub fn list(&self, kind: ItemKind) -> Result<Vec<Item>> {
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_id(stem).is_err() {
                tracing::warn!(path = %path.display(), "skipping file with invalid item id");
                continue;
            }
            let item_ref = ItemRef {
                kind,
                id: stem.to_string(),
            };
            match self.load(&item_ref, path) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable item")
                }
            }
        }

        sort_newest_first(&mut items);
        Ok(items)
    }

    pub fn list_all(&self) -> Result<Vec<Item>> {
        let mut all = Vec::new();
        for kind in ItemKind::ALL {
            all.extend(self.list(kind)?);
        }
        Ok(all)
    }

    pub fn get(&self, item_ref: &ItemRef) -> Result<Item> {
        let path = self.item_path(item_ref);
        if !path.is_file() {
            return Err(StoreError::NotFound(item_ref.to_string()).into());
        }
        self.load(item_ref, &path)
    }

    fn load(&self, item_ref: &ItemRef, path: &Path) -> Result<Item> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (mut meta, body) = frontmatter::parse(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        meta.keywords = normalize_keywords(&meta.keywords);
        Ok(Item {
            kind: item_ref.kind,
            id: item_ref.id.clone(),
            meta,
            body,
        })
    }

    /// Writes the item's Markdown file as-is (no timestamp changes).
    pub fn save(&self, item: &Item) -> Result<()> {
        let text = frontmatter::render(&item.meta, &item.body)?;
        atomic_write(&self.item_path(&item.item_ref()), text.as_bytes())
    }

    pub fn create(&self, kind: ItemKind, draft: ItemDraft) -> Result<Item> {
        let id = new_id();
        let now = Utc::now();
        let mut item = Item {
            kind,
            id,
            meta: Frontmatter {
                created: Some(now),
                updated: Some(now),
                ..Default::default()
            },
            body: String::new(),
        };

        if matches!(kind, ItemKind::Image | ItemKind::File) && draft.attachment.is_none() {
            return Err(StoreError::Invalid(format!("{} items need an attachment", kind.label())).into());
        }

        self.apply_draft(&mut item, draft)?;
        self.save(&item)?;
        tracing::info!(item = %item.item_ref(), "created item");
        Ok(item)
    }

    /// Replaces the editable content of an item and bumps `updated`.
    pub fn update(&self, item_ref: &ItemRef, draft: ItemDraft) -> Result<Item> {
        let mut item = self.get(item_ref)?;
        self.apply_draft(&mut item, draft)?;
        item.meta.updated = Some(Utc::now());
        self.save(&item)?;
        tracing::info!(item = %item_ref, "updated item");
        Ok(item)
    }

    fn apply_draft(&self, item: &mut Item, draft: ItemDraft) -> Result<()> {
        item.meta.title = draft.title.trim().to_string();
        item.meta.keywords = normalize_keywords(&draft.keywords);
        item.body = draft.body;

        match item.kind {
            ItemKind::Link => {
                let url = draft.url.map(|u| u.trim().to_string()).unwrap_or_default();
                if url.is_empty() {
                    return Err(StoreError::Invalid("link items need a url".to_string()).into());
                }
                item.meta.url = Some(url);
            }
            ItemKind::Database => {
                item.meta.query = draft.query.filter(|q| !q.trim().is_empty());
                item.meta.plot = draft.plot;
            }
            ItemKind::Listset => {
                if let Some(members) = draft.members {
                    let own = item.item_ref();
                    if members.contains(&own) {
                        return Err(StoreError::Invalid(
                            "a listset cannot contain itself".to_string(),
                        )
                        .into());
                    }
                    item.meta.members = members;
                }
            }
            _ => {}
        }

        if let Some(upload) = draft.attachment {
            self.store_upload(item, upload)?;
        }
        Ok(())
    }

    fn store_upload(&self, item: &mut Item, upload: Upload) -> Result<()> {
        match item.kind {
            ItemKind::Image | ItemKind::File => {
                if let Some(old) = self.attachment_path(item) {
                    remove_if_exists(&old)?;
                }
                let filename = sanitize_filename(&upload.filename);
                let content_type = mime_guess::from_path(&filename)
                    .first_or_octet_stream()
                    .to_string();
                item.meta.size = Some(upload.bytes.len() as u64);
                item.meta.content_type = Some(content_type);
                item.meta.filename = Some(filename);
                if let Some(path) = self.attachment_path(item) {
                    atomic_write(&path, &upload.bytes)?;
                }
            }
            ItemKind::Database => {
                item.meta.size = Some(upload.bytes.len() as u64);
                atomic_write(&self.database_path(&item.id), &upload.bytes)?;
            }
            other => {
                return Err(StoreError::Invalid(format!(
                    "{} items do not take attachments",
                    other.label()
                ))
                .into())
            }
        }
        Ok(())
    }

    pub fn set_keywords<I, S>(&self, item_ref: &ItemRef, keywords: I) -> Result<Item>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut item = self.get(item_ref)?;
        item.meta.keywords = normalize_keywords(keywords);
        item.meta.updated = Some(Utc::now());
        self.save(&item)?;
        Ok(item)
    }

    pub fn set_members(&self, item_ref: &ItemRef, members: Vec<ItemRef>) -> Result<Item> {
        if item_ref.kind != ItemKind::Listset {
            return Err(StoreError::Invalid(format!("{} is not a listset", item_ref)).into());
        }
        let mut item = self.get(item_ref)?;
        item.meta.members = members;
        item.meta.updated = Some(Utc::now());
        self.save(&item)?;
        Ok(item)
    }

    /// Deletes an item and its attachment, then drops it from every listset.
    ///
    /// Returns the listsets whose membership changed.
    pub fn delete(&self, item_ref: &ItemRef) -> Result<Vec<Item>> {
        let item = self.get(item_ref)?;

        match item.kind {
            ItemKind::Image | ItemKind::File => {
                let dir = self.kind_dir(item.kind).join(&item.id);
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)
                        .with_context(|| format!("Failed to remove {}", dir.display()))?;
                }
            }
            ItemKind::Database => {
                let db = self.database_path(&item.id);
                remove_if_exists(&db)?;
                remove_if_exists(&db.with_extension("sqlite-wal"))?;
                remove_if_exists(&db.with_extension("sqlite-shm"))?;
            }
            _ => {}
        }
        remove_if_exists(&self.item_path(item_ref))?;

        let mut touched = Vec::new();
        for mut listset in self.list(ItemKind::Listset)? {
            let before = listset.meta.members.len();
            listset.meta.members.retain(|m| m != item_ref);
            if listset.meta.members.len() != before {
                listset.meta.updated = Some(Utc::now());
                self.save(&listset)?;
                touched.push(listset);
            }
        }

        tracing::info!(item = %item_ref, listsets = touched.len(), "deleted item");
        Ok(touched)
    }

    /// Attachment bytes and their content type.
    pub fn read_attachment(&self, item_ref: &ItemRef) -> Result<(Vec<u8>, String)> {
        let item = self.get(item_ref)?;
        let path = self
            .attachment_path(&item)
            .filter(|p| p.is_file())
            .ok_or_else(|| StoreError::NotFound(format!("attachment of {}", item_ref)))?;
        let bytes =
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let content_type = match item.kind {
            ItemKind::Database => "application/vnd.sqlite3".to_string(),
            _ => item.meta.content_type.clone().unwrap_or_else(|| {
                mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string()
            }),
        };
        Ok((bytes, content_type))
    }

    pub fn read_raw(&self, item_ref: &ItemRef) -> Result<String> {
        let path = self.item_path(item_ref);
        if !path.is_file() {
            return Err(StoreError::NotFound(item_ref.to_string()).into());
        }
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Replaces an item file with raw Markdown received from elsewhere.
    ///
    /// The text must parse. If the new frontmatter names a different
    /// attachment than before, the stale attachment is removed.
    pub fn write_raw(&self, item_ref: &ItemRef, text: &str) -> Result<Item> {
        let (meta, body) = frontmatter::parse(text)?;
        if let Some(name) = meta.filename.as_deref() {
            if !is_safe_filename(name) {
                return Err(StoreError::Invalid(format!(
                    "attachment filename '{}' of {} is not a plain file name",
                    name, item_ref
                ))
                .into());
            }
        }
        let previous = self.get(item_ref).ok();

        std::fs::create_dir_all(self.kind_dir(item_ref.kind))?;
        atomic_write(&self.item_path(item_ref), text.as_bytes())?;

        let item = Item {
            kind: item_ref.kind,
            id: item_ref.id.clone(),
            meta,
            body,
        };
        if let Some(old) = previous.as_ref().and_then(|p| self.attachment_path(p)) {
            if Some(&old) != self.attachment_path(&item).as_ref() {
                remove_if_exists(&old)?;
            }
        }
        Ok(item)
    }

    pub fn write_attachment_bytes(&self, item_ref: &ItemRef, bytes: &[u8]) -> Result<()> {
        let item = self.get(item_ref)?;
        let path = self.attachment_path(&item).ok_or_else(|| {
            StoreError::Invalid(format!("{} has no attachment slot", item_ref))
        })?;
        atomic_write(&path, bytes)
    }

    /// Hex SHA-256 over the Markdown file followed by the attachment bytes.
    pub fn content_hash(&self, item_ref: &ItemRef) -> Result<String> {
        let raw = self.read_raw(item_ref)?;
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());

        let item = self.get(item_ref)?;
        if let Some(path) = self.attachment_path(&item).filter(|p| p.is_file()) {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            hasher.update(&bytes);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

fn sort_newest_first(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.updated_ts()
            .cmp(&a.updated_ts())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Write to a sibling temp file, then rename over the target.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", name));
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// True when `name` is already what [`sanitize_filename`] would produce.
pub fn is_safe_filename(name: &str) -> bool {
    sanitize_filename(name) == name
}

/// Reduces an uploaded file name to a safe basename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(128)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
