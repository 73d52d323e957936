//! Core data models used throughout chaos.
//!
//! Every item is one Markdown file whose YAML frontmatter deserializes into
//! [`Frontmatter`]. Items are addressed by an [`ItemRef`] (`notes/<id>`,
//! `databases/<id>`, ...), which is also the URL path of the item's page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::plot::PlotSpec;

/// The six item types the repository stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Note,
    Link,
    Image,
    File,
    Database,
    Listset,
}

impl ItemKind {
    pub const ALL: [ItemKind; 6] = [
        ItemKind::Note,
        ItemKind::Link,
        ItemKind::Image,
        ItemKind::File,
        ItemKind::Database,
        ItemKind::Listset,
    ];

    /// Directory name under the storage root, also the URL segment.
    pub fn plural(self) -> &'static str {
        match self {
            ItemKind::Note => "notes",
            ItemKind::Link => "links",
            ItemKind::Image => "images",
            ItemKind::File => "files",
            ItemKind::Database => "databases",
            ItemKind::Listset => "listsets",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ItemKind::Note => "note",
            ItemKind::Link => "link",
            ItemKind::Image => "image",
            ItemKind::File => "file",
            ItemKind::Database => "database",
            ItemKind::Listset => "listset",
        }
    }

    /// Whether items of this kind own a binary file next to their Markdown.
    pub fn has_attachment(self) -> bool {
        matches!(
            self,
            ItemKind::Image | ItemKind::File | ItemKind::Database
        )
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

impl FromStr for ItemKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemKind::ALL
            .into_iter()
            .find(|k| k.plural() == s || k.label() == s)
            .ok_or_else(|| StoreError::UnknownKind(s.to_string()))
    }
}

/// Address of a single item: its kind plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub id: String,
}

impl ItemRef {
    pub fn new(kind: ItemKind, id: impl Into<String>) -> Result<Self, StoreError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self { kind, id })
    }

    /// Parses the two path segments used by the web routes.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, StoreError> {
        Self::new(kind.parse()?, id)
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.plural(), self.id)
    }
}

impl FromStr for ItemRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('/');
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidRef(s.to_string()))?;
        Self::from_parts(kind, id)
    }
}

impl Serialize for ItemRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ItemRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ids double as file names, so only a conservative character set is allowed.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// YAML frontmatter of an item file.
///
/// Kind-specific fields are optional and omitted from the file when unset.
/// Keys this struct does not know about are kept in `extra` so hand-edited
/// files survive a round trip through the web UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub keywords: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,

    /// Target of a link item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Attachment file name of image and file items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Default SQL query of a database item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotSpec>,

    /// Ordered members of a listset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ItemRef>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A fully loaded item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub kind: ItemKind,
    pub id: String,
    pub meta: Frontmatter,
    pub body: String,
}

impl Item {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            kind: self.kind,
            id: self.id.clone(),
        }
    }

    pub fn display_title(&self) -> &str {
        if self.meta.title.trim().is_empty() {
            &self.id
        } else {
            &self.meta.title
        }
    }

    /// Last modification time as a Unix timestamp (0 when unknown).
    pub fn updated_ts(&self) -> i64 {
        self.meta
            .updated
            .or(self.meta.created)
            .map(|t| t.timestamp())
            .unwrap_or(0)
    }
}

/// An uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// User-supplied content for creating or updating an item.
///
/// `members` and `attachment` are left untouched on update when `None`.
#[derive(Debug, Clone, Default)]
pub struct ItemDraft {
    pub title: String,
    pub body: String,
    pub keywords: BTreeSet<String>,
    pub url: Option<String>,
    pub query: Option<String>,
    pub plot: Option<PlotSpec>,
    pub members: Option<Vec<ItemRef>>,
    pub attachment: Option<Upload>,
}

/// Lowercase, trim and collapse inner whitespace. Returns `None` for blanks.
pub fn normalize_keyword(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}

pub fn normalize_keywords<I, S>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|k| normalize_keyword(k.as_ref()))
        .collect()
}

/// Parses the comma-separated keyword field of the edit forms.
pub fn parse_keyword_list(raw: &str) -> BTreeSet<String> {
    normalize_keywords(raw.split(','))
}
