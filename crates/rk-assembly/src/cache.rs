//! Solve Cache
//!
//! Keeps the chain nodes and variable snapshots of earlier solves so a solve
//! whose constraint list starts with an already solved prefix can resume
//! after that prefix. Entries only ever save work: a miss or a cleared cache
//! gives the same result as an uncached solve.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::constraint::Constraint;
use crate::system::{NodeId, SystemArena};
use crate::variables::{Snapshot, VARIABLES_PER_BODY};

/// Default bound on the number of entries
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// Default bound on the number of stored chain nodes
pub const DEFAULT_MAX_NODES: usize = 4096;

/// Identity of the anchor a chain was built on
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorKey {
    pub body: String,
    pub variables: [f64; VARIABLES_PER_BODY],
}

/// A chain solved for the first `prefix_len` constraints of a list
#[derive(Debug, Clone)]
struct CacheEntry {
    anchor: AnchorKey,
    constraints: Arc<[Constraint]>,
    prefix_len: usize,
    node: NodeId,
    snapshot: Snapshot,
}

impl CacheEntry {
    fn matches(&self, anchor: &AnchorKey, constraints: &[Constraint]) -> bool {
        self.anchor == *anchor
            && constraints.len() >= self.prefix_len
            && self.constraints[..self.prefix_len]
                .iter()
                .zip(&constraints[..self.prefix_len])
                .all(|(a, b)| a.same_definition(b))
    }
}

/// Chain state after one solved constraint, as produced by a solve
///
/// `node` refers to the arena the solve built its chain in.
#[derive(Debug, Clone)]
pub struct SolvedLevel {
    /// Number of constraints folded in
    pub prefix_len: usize,
    pub node: NodeId,
    pub snapshot: Snapshot,
}

/// Result of a successful lookup
///
/// `node` refers to [`SolveCache::arena`].
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub node: NodeId,
    /// Index of the first constraint still to be folded
    pub resume_index: usize,
    pub snapshot: Snapshot,
}

/// Process-lifetime store of solved chain prefixes
#[derive(Debug, Clone)]
pub struct SolveCache {
    arena: SystemArena,
    entries: Vec<CacheEntry>,
    max_entries: usize,
    max_nodes: usize,
}

impl Default for SolveCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SolveCache {
    pub fn new() -> Self {
        Self {
            arena: SystemArena::new(),
            entries: Vec::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }

    /// Bound the number of stored entries
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Bound the number of stored chain nodes
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.arena.clear();
    }

    /// Arena the cached nodes live in
    pub fn arena(&self) -> &SystemArena {
        &self.arena
    }

    /// Deepest cached chain whose constraint prefix matches `constraints`
    pub fn retrieve(&self, anchor: &AnchorKey, constraints: &[Constraint]) -> Option<CacheHit> {
        let entry = self
            .entries
            .iter()
            .filter(|e| e.matches(anchor, constraints))
            .max_by_key(|e| e.prefix_len)?;
        tracing::debug!(
            resume_index = entry.prefix_len,
            depth = self.arena.number_of_parent_systems(entry.node),
            "solve cache hit"
        );
        Some(CacheHit {
            node: entry.node,
            resume_index: entry.prefix_len,
            snapshot: entry.snapshot.clone(),
        })
    }

    /// Store the levels solved in this run
    ///
    /// `levels` hold nodes of `source` for prefixes of `constraints` beyond
    /// `resume_index`. `shared` maps nodes of `source` that were imported from
    /// [`Self::arena`] back to their stored ids; only the other nodes on the
    /// level paths are copied in. When either bound would be exceeded the
    /// cache is emptied and nothing is recorded.
    pub fn record(
        &mut self,
        anchor: &AnchorKey,
        constraints: &[Constraint],
        resume_index: usize,
        source: &SystemArena,
        shared: &HashMap<NodeId, NodeId>,
        levels: Vec<SolvedLevel>,
    ) {
        let levels: Vec<SolvedLevel> = levels
            .into_iter()
            .filter(|l| l.prefix_len > resume_index && l.prefix_len <= constraints.len())
            .collect();
        if levels.is_empty() {
            return;
        }

        let new_entries = levels
            .iter()
            .filter(|l| !self.has_entry(anchor, constraints, l.prefix_len))
            .count();
        let new_nodes = levels
            .iter()
            .flat_map(|l| source.path(l.node))
            .filter(|n| !shared.contains_key(n))
            .collect::<HashSet<_>>()
            .len();
        if self.entries.len() + new_entries > self.max_entries
            || self.arena.len() + new_nodes > self.max_nodes
        {
            tracing::debug!(
                entries = self.entries.len(),
                nodes = self.arena.len(),
                max_entries = self.max_entries,
                max_nodes = self.max_nodes,
                "solve cache full, clearing"
            );
            self.clear();
            return;
        }

        let mut mapped = shared.clone();
        let list: Arc<[Constraint]> = Arc::from(constraints);
        for level in levels {
            let node = self.arena.import(source, level.node, &mut mapped);
            self.entries
                .retain(|e| !(e.prefix_len == level.prefix_len && e.matches(anchor, constraints)));
            self.entries.push(CacheEntry {
                anchor: anchor.clone(),
                constraints: Arc::clone(&list),
                prefix_len: level.prefix_len,
                node,
                snapshot: level.snapshot,
            });
        }
    }

    fn has_entry(&self, anchor: &AnchorKey, constraints: &[Constraint], prefix_len: usize) -> bool {
        self.entries
            .iter()
            .any(|e| e.prefix_len == prefix_len && e.matches(anchor, constraints))
    }
}
