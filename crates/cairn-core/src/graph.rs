// SPDX-License-Identifier: Apache-2.0
//! The changeset DAG: parent links, leaf tracking, frontier diffs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cairn_schema::Csid;
use thiserror::Error;

use crate::audit::Audit;
use crate::changeset::Changeset;

/// Errors from DAG bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The named changeset is not in this store.
    #[error("unknown changeset {}", crate::ident::short_hex(&.0.0))]
    UnknownChangeset(Csid),
    /// Internal invariant violated (graph state corruption).
    #[error("graph invariant violated: {0}")]
    Corrupt(&'static str),
}

/// Append-only DAG of changesets for one store.
///
/// Nodes are keyed by their content-derived [`Csid`]; inserting a node whose
/// id already exists folds the new audit into the existing node instead of
/// duplicating it. The leaf set (nodes with no children) is maintained
/// incrementally: a freshly inserted node can never already be a parent,
/// because its id is derived from content that names its parents.
#[derive(Debug, Clone, Default)]
pub struct ChangesetGraph {
    nodes: BTreeMap<Csid, Changeset>,
    leaves: BTreeSet<Csid>,
}

impl ChangesetGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` when the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `true` when `csid` names a node in this graph.
    #[must_use]
    pub fn contains(&self, csid: &Csid) -> bool {
        self.nodes.contains_key(csid)
    }

    /// Returns a node when it exists.
    #[must_use]
    pub fn node(&self, csid: &Csid) -> Option<&Changeset> {
        self.nodes.get(csid)
    }

    /// Current leaves (heads), in ascending id order.
    #[must_use]
    pub fn leaves(&self) -> &BTreeSet<Csid> {
        &self.leaves
    }

    /// Iterate over all nodes in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (&Csid, &Changeset)> {
        self.nodes.iter()
    }

    /// Inserts a changeset, folding audits when the node already exists.
    ///
    /// Returns the node's id and whether a new node was created.
    ///
    /// # Errors
    /// Returns [`GraphError::UnknownChangeset`] when a parent is missing.
    pub fn insert(&mut self, changeset: Changeset) -> Result<(Csid, bool), GraphError> {
        for parent in &changeset.parents {
            if !self.nodes.contains_key(parent) {
                return Err(GraphError::UnknownChangeset(*parent));
            }
        }
        let csid = changeset.csid();
        if let Some(existing) = self.nodes.get_mut(&csid) {
            for audit in changeset.audits {
                fold_audit(existing, audit);
            }
            return Ok((csid, false));
        }
        for parent in &changeset.parents {
            self.leaves.remove(parent);
        }
        self.leaves.insert(csid);
        self.nodes.insert(csid, changeset);
        Ok((csid, true))
    }

    /// All ancestors of `csid`, inclusive.
    ///
    /// # Errors
    /// Returns [`GraphError::UnknownChangeset`] when `csid` is missing.
    pub fn ancestors(&self, csid: &Csid) -> Result<BTreeSet<Csid>, GraphError> {
        if !self.nodes.contains_key(csid) {
            return Err(GraphError::UnknownChangeset(*csid));
        }
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        seen.insert(*csid);
        queue.push_back(*csid);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(&current) else {
                return Err(GraphError::Corrupt("ancestor traversal hit a missing node"));
            };
            for parent in &node.parents {
                if seen.insert(*parent) {
                    queue.push_back(*parent);
                }
            }
        }
        Ok(seen)
    }

    /// `true` when `ancestor` is reachable from `descendant` (inclusive).
    ///
    /// # Errors
    /// Returns [`GraphError::UnknownChangeset`] when `descendant` is missing.
    pub fn is_ancestor(&self, ancestor: &Csid, descendant: &Csid) -> Result<bool, GraphError> {
        Ok(self.ancestors(descendant)?.contains(ancestor))
    }

    /// Deterministic topological order (parents first) over a node subset.
    ///
    /// Ties between simultaneously-ready nodes break by ascending id, so the
    /// linearization is stable across runs and writers.
    ///
    /// # Errors
    /// Returns [`GraphError::UnknownChangeset`] when a member is missing.
    pub fn topo_order(&self, subset: &BTreeSet<Csid>) -> Result<Vec<Csid>, GraphError> {
        let mut remaining_parents: BTreeMap<Csid, usize> = BTreeMap::new();
        for csid in subset {
            let Some(node) = self.nodes.get(csid) else {
                return Err(GraphError::UnknownChangeset(*csid));
            };
            let in_subset = node.parents.iter().filter(|p| subset.contains(p)).count();
            remaining_parents.insert(*csid, in_subset);
        }

        let mut ready: BTreeSet<Csid> = remaining_parents
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(c, _)| *c)
            .collect();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(next) = ready.iter().next().copied() {
            ready.remove(&next);
            order.push(next);
            // Children inside the subset become ready once all their
            // in-subset parents are emitted.
            for (csid, node) in &self.nodes {
                if !subset.contains(csid) || !node.parents.contains(&next) {
                    continue;
                }
                if let Some(n) = remaining_parents.get_mut(csid) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*csid);
                    }
                }
            }
        }
        if order.len() != subset.len() {
            return Err(GraphError::Corrupt("cycle detected in changeset graph"));
        }
        Ok(order)
    }

    /// Nodes reachable beyond a frontier: everything not an ancestor of any
    /// frontier member.
    ///
    /// The frontier is typically a remote replica's leaf set; members unknown
    /// to this graph are ignored (the remote is simply ahead of us there).
    /// Used for incremental replication by external sync tooling.
    #[must_use]
    pub fn new_nodes_since(&self, frontier: &BTreeSet<Csid>) -> BTreeSet<Csid> {
        let mut known = BTreeSet::new();
        for csid in frontier {
            if let Ok(ancestors) = self.ancestors(csid) {
                known.extend(ancestors);
            }
        }
        self.nodes
            .keys()
            .filter(|csid| !known.contains(*csid))
            .copied()
            .collect()
    }

    /// Common ancestors of every member of `heads`.
    ///
    /// # Errors
    /// Returns [`GraphError::UnknownChangeset`] when a head is missing.
    pub fn common_ancestors(&self, heads: &[Csid]) -> Result<BTreeSet<Csid>, GraphError> {
        let mut iter = heads.iter();
        let Some(first) = iter.next() else {
            return Ok(BTreeSet::new());
        };
        let mut common = self.ancestors(first)?;
        for head in iter {
            let ancestors = self.ancestors(head)?;
            common.retain(|c| ancestors.contains(c));
        }
        Ok(common)
    }
}

fn fold_audit(node: &mut Changeset, audit: Audit) {
    if !node.audits.contains(&audit) {
        node.audits.push(audit);
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::changeset::Delta;
    use cairn_schema::{Timestamp, UserIdent};

    fn audit(user: &str, at: u64) -> Audit {
        Audit::new(UserIdent::new(user), Timestamp::from_millis(at))
    }

    fn insert(graph: &mut ChangesetGraph, parents: Vec<Csid>, who: &str, at: u64) -> Csid {
        let cs = Changeset::new(parents, Delta::default(), audit(who, at));
        match graph.insert(cs) {
            Ok((csid, _)) => csid,
            Err(e) => panic!("insert failed: {e}"),
        }
    }

    #[test]
    fn leaves_track_divergence_and_folding() {
        let mut graph = ChangesetGraph::new();
        let root = insert(&mut graph, vec![], "a", 1);
        assert_eq!(graph.leaves().len(), 1);

        // Two writers commit identical content from the same baseline: one
        // node, two audits, still one leaf.
        let c1 = insert(&mut graph, vec![root], "a", 2);
        let c2 = insert(&mut graph, vec![root], "b", 3);
        assert_eq!(c1, c2);
        assert_eq!(graph.leaves().len(), 1);
        let audits = graph.node(&c1).map(|n| n.audits.len());
        assert_eq!(audits, Some(2));
    }

    #[test]
    fn frontier_diff_reports_only_new_nodes() {
        let mut graph = ChangesetGraph::new();
        let root = insert(&mut graph, vec![], "a", 1);
        let mid = insert(&mut graph, vec![root], "a", 2);
        let frontier: BTreeSet<Csid> = [mid].into_iter().collect();
        assert!(graph.new_nodes_since(&frontier).is_empty());

        let tip = insert(&mut graph, vec![mid], "a", 3);
        let new = graph.new_nodes_since(&frontier);
        assert_eq!(new.len(), 1);
        assert!(new.contains(&tip));

        // Unknown frontier members are ignored.
        let foreign: BTreeSet<Csid> = [Csid([9; 32])].into_iter().collect();
        assert_eq!(graph.new_nodes_since(&foreign).len(), 3);
    }

    #[test]
    fn topo_order_puts_parents_first() {
        let mut graph = ChangesetGraph::new();
        let root = insert(&mut graph, vec![], "a", 1);
        let left = insert(&mut graph, vec![root], "a", 2);
        let right = insert(&mut graph, vec![root], "b", 2);
        let all = match graph.ancestors(&left) {
            Ok(mut set) => {
                set.extend(match graph.ancestors(&right) {
                    Ok(s) => s,
                    Err(e) => panic!("ancestors failed: {e}"),
                });
                set
            }
            Err(e) => panic!("ancestors failed: {e}"),
        };
        let order = match graph.topo_order(&all) {
            Ok(o) => o,
            Err(e) => panic!("topo failed: {e}"),
        };
        assert_eq!(order[0], root);
        assert_eq!(order.len(), 3);
    }
}
