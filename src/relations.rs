//! Keyword/relation engine.
//!
//! Two items are related when they share at least `min_shared` keywords.
//! The table is derived entirely from the keyword sets: every mutation
//! recomputes all pairs. Repositories are personal-sized, so the quadratic
//! pass is fine.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{normalize_keyword, Item, ItemRef};

/// One edge of the relation graph, as seen from its source item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relation {
    pub target: ItemRef,
    pub shared: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    min_shared: usize,
    keywords: HashMap<ItemRef, BTreeSet<String>>,
    relations: HashMap<ItemRef, Vec<Relation>>,
    by_keyword: BTreeMap<String, BTreeSet<ItemRef>>,
}

impl RelationGraph {
    pub fn new(min_shared: usize) -> Self {
        Self {
            min_shared: min_shared.max(1),
            ..Default::default()
        }
    }

    pub fn from_items<'a, I>(items: I, min_shared: usize) -> Self
    where
        I: IntoIterator<Item = &'a Item>,
    {
        let mut graph = Self::new(min_shared);
        for item in items {
            if !item.meta.keywords.is_empty() {
                graph
                    .keywords
                    .insert(item.item_ref(), item.meta.keywords.clone());
            }
        }
        graph.recompute();
        graph
    }

    /// Replaces the keyword set of one item and recomputes the table.
    pub fn set_keywords(&mut self, item: ItemRef, keywords: BTreeSet<String>) {
        if keywords.is_empty() {
            self.keywords.remove(&item);
        } else {
            self.keywords.insert(item, keywords);
        }
        self.recompute();
    }

    pub fn remove(&mut self, item: &ItemRef) -> bool {
        let removed = self.keywords.remove(item).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    fn recompute(&mut self) {
        let mut refs: Vec<&ItemRef> = self.keywords.keys().collect();
        refs.sort();

        let mut relations: HashMap<ItemRef, Vec<Relation>> = HashMap::new();
        for (i, a) in refs.iter().enumerate() {
            let ka = &self.keywords[*a];
            for b in &refs[i + 1..] {
                let kb = &self.keywords[*b];
                let shared: BTreeSet<String> = ka.intersection(kb).cloned().collect();
                if shared.is_empty() || shared.len() < self.min_shared {
                    continue;
                }
                relations.entry((*a).clone()).or_default().push(Relation {
                    target: (*b).clone(),
                    shared: shared.clone(),
                });
                relations.entry((*b).clone()).or_default().push(Relation {
                    target: (*a).clone(),
                    shared,
                });
            }
        }
        for list in relations.values_mut() {
            list.sort_by(|x, y| {
                y.shared
                    .len()
                    .cmp(&x.shared.len())
                    .then_with(|| x.target.cmp(&y.target))
            });
        }

        let mut by_keyword: BTreeMap<String, BTreeSet<ItemRef>> = BTreeMap::new();
        for (item, kws) in &self.keywords {
            for kw in kws {
                by_keyword
                    .entry(kw.clone())
                    .or_default()
                    .insert(item.clone());
            }
        }

        self.relations = relations;
        self.by_keyword = by_keyword;
    }

    /// Related items, most shared keywords first.
    pub fn related(&self, item: &ItemRef, limit: usize) -> Vec<Relation> {
        self.relations
            .get(item)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn keywords_of(&self, item: &ItemRef) -> Option<&BTreeSet<String>> {
        self.keywords.get(item)
    }

    pub fn items_with_keyword(&self, keyword: &str) -> Vec<ItemRef> {
        normalize_keyword(keyword)
            .and_then(|kw| self.by_keyword.get(&kw))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keyword usage counts, most used first.
    pub fn keyword_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .by_keyword
            .iter()
            .map(|(kw, items)| (kw.clone(), items.len()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }

    /// Number of items carrying at least one keyword.
    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Number of unordered related pairs.
    pub fn pair_count(&self) -> usize {
        self.relations.values().map(Vec::len).sum::<usize>() / 2
    }
}
