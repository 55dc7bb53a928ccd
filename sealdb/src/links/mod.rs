use crate::error::{Result, SealDbError};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Adjacency = IndexMap<String, IndexSet<String>>;

/// An edge that references a key missing from the document mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkViolation {
    MissingSource { source: String, target: String },
    MissingTarget { source: String, target: String },
}

/// Outcome of an integrity repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Edges deleted.
    pub removed: usize,
    /// Source entries that lost some targets but still have at least one.
    pub fixed: usize,
}

/// Directed key graph with a reverse index.
///
/// Invariant: `target ∈ forward[source]` iff `source ∈ reverse[target]`.
/// Empty adjacency entries are never kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkGraph {
    forward: Adjacency,
    reverse: Adjacency,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted tables. Edges present in only one table are
    /// mirrored into the other so the invariant holds after loading.
    pub fn from_tables(forward: Adjacency, reverse: Adjacency) -> Self {
        let mut graph = LinkGraph::new();
        for (source, targets) in &forward {
            for target in targets {
                graph.insert_edge(source, target);
            }
        }
        for (target, sources) in &reverse {
            for source in sources {
                graph.insert_edge(source, target);
            }
        }
        graph
    }

    /// Link `source → target`. Both keys must exist in `documents`. Linking an
    /// existing edge again is a no-op.
    pub fn link(&mut self, source: &str, target: &str, documents: &Map<String, Value>) -> Result<()> {
        if source.is_empty() || target.is_empty() {
            return Err(SealDbError::Link("Link keys must be non-empty strings".into()));
        }
        if !documents.contains_key(source) {
            return Err(SealDbError::Link(format!("Source key '{source}' does not exist")));
        }
        if !documents.contains_key(target) {
            return Err(SealDbError::Link(format!("Target key '{target}' does not exist")));
        }
        self.insert_edge(source, target);
        Ok(())
    }

    /// Remove `source → target`. Returns whether the edge existed.
    pub fn unlink(&mut self, source: &str, target: &str) -> bool {
        let removed = remove_from(&mut self.forward, source, target);
        remove_from(&mut self.reverse, target, source);
        removed
    }

    pub fn links(&self, key: &str) -> Vec<String> {
        copy_of(&self.forward, key)
    }

    pub fn linked_to(&self, key: &str) -> Vec<String> {
        copy_of(&self.reverse, key)
    }

    /// Keys linked in either direction, deduplicated.
    pub fn neighbors(&self, key: &str) -> Vec<String> {
        let mut all: IndexSet<String> = self.links(key).into_iter().collect();
        all.extend(self.linked_to(key));
        all.into_iter().collect()
    }

    pub fn is_linked(&self, source: &str, target: &str) -> bool {
        self.forward
            .get(source)
            .map(|targets| targets.contains(target))
            .unwrap_or(false)
    }

    pub fn has_any_links(&self, key: &str) -> bool {
        self.forward.contains_key(key) || self.reverse.contains_key(key)
    }

    pub fn all_links(&self) -> &Adjacency {
        &self.forward
    }

    pub fn all_linked_to(&self) -> &Adjacency {
        &self.reverse
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(IndexSet::len).sum()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Detach `key` from the graph entirely and return the keys it pointed to.
    pub fn remove_key(&mut self, key: &str) -> Vec<String> {
        let targets: Vec<String> = self
            .forward
            .shift_remove(key)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for target in &targets {
            remove_from(&mut self.reverse, target, key);
        }

        if let Some(sources) = self.reverse.shift_remove(key) {
            for source in &sources {
                remove_from(&mut self.forward, source, key);
            }
        }

        targets
    }

    /// Every edge whose source or target is absent from `documents`.
    pub fn validate_integrity(&self, documents: &Map<String, Value>) -> Vec<LinkViolation> {
        let mut violations = Vec::new();
        for (source, targets) in &self.forward {
            let source_present = documents.contains_key(source);
            for target in targets {
                if !source_present {
                    violations.push(LinkViolation::MissingSource {
                        source: source.clone(),
                        target: target.clone(),
                    });
                } else if !documents.contains_key(target) {
                    violations.push(LinkViolation::MissingTarget {
                        source: source.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        violations
    }

    /// Drop every edge that touches an absent key, in both directions.
    pub fn repair_integrity(&mut self, documents: &Map<String, Value>) -> RepairReport {
        let mut report = RepairReport::default();
        let mut dangling: Vec<(String, String)> = Vec::new();

        for (source, targets) in &self.forward {
            let source_present = documents.contains_key(source);
            let mut dropped = 0;
            for target in targets {
                if !source_present || !documents.contains_key(target) {
                    dangling.push((source.clone(), target.clone()));
                    dropped += 1;
                }
            }
            if source_present && dropped > 0 && dropped < targets.len() {
                report.fixed += 1;
            }
        }

        for (source, target) in &dangling {
            if self.unlink(source, target) {
                report.removed += 1;
            }
        }

        report
    }

    fn insert_edge(&mut self, source: &str, target: &str) {
        self.forward
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string());
        self.reverse
            .entry(target.to_string())
            .or_default()
            .insert(source.to_string());
    }
}

fn remove_from(table: &mut Adjacency, key: &str, member: &str) -> bool {
    let Some(set) = table.get_mut(key) else {
        return false;
    };
    let removed = set.shift_remove(member);
    if set.is_empty() {
        table.shift_remove(key);
    }
    removed
}

fn copy_of(table: &Adjacency, key: &str) -> Vec<String> {
    table
        .get(key)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}
