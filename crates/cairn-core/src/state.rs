// SPDX-License-Identifier: Apache-2.0
//! State materialization: resolving (changeset, recid) to content.
//!
//! The resolved state of a changeset is a fold of deltas over its ancestor
//! subgraph in deterministic topological order. At a merge node the parent
//! states are unioned; any recid on which the parents disagree must be
//! restated by the merge node's own delta — the merge engine guarantees this,
//! and the fold treats a gap as corruption rather than guessing.

use std::collections::{BTreeMap, HashMap};

use cairn_schema::{Csid, Recid};

use crate::changeset::Changeset;
use crate::graph::{ChangesetGraph, GraphError};
use crate::ident::Hidrec;
use crate::record::HistoryEntry;

/// Resolved state of one changeset: every live recid and its snapshot hash.
pub(crate) type ResolvedState = BTreeMap<Recid, Hidrec>;

/// Materializes the full resolved state as of `csid`.
pub(crate) fn state_at(graph: &ChangesetGraph, csid: &Csid) -> Result<ResolvedState, GraphError> {
    let ancestors = graph.ancestors(csid)?;
    let order = graph.topo_order(&ancestors)?;
    let mut states: HashMap<Csid, ResolvedState> = HashMap::with_capacity(order.len());

    for current in &order {
        let Some(node) = graph.node(current) else {
            return Err(GraphError::Corrupt("state fold hit a missing node"));
        };
        let mut state = merge_parent_states(node, &states)?;
        for (recid, hidrec) in &node.delta.writes {
            state.insert(*recid, *hidrec);
        }
        for recid in &node.delta.deletes {
            state.remove(recid);
        }
        states.insert(*current, state);
    }

    states
        .remove(csid)
        .ok_or(GraphError::Corrupt("state fold did not reach the target"))
}

fn merge_parent_states(
    node: &Changeset,
    states: &HashMap<Csid, ResolvedState>,
) -> Result<ResolvedState, GraphError> {
    let mut parents = node.parents.iter();
    let Some(first) = parents.next() else {
        return Ok(ResolvedState::new());
    };
    let Some(mut state) = states.get(first).cloned() else {
        return Err(GraphError::Corrupt("parent state missing during fold"));
    };
    for parent in parents {
        let Some(other) = states.get(parent) else {
            return Err(GraphError::Corrupt("parent state missing during fold"));
        };
        for (recid, hidrec) in other {
            match state.get(recid) {
                None => {
                    // Present on one side only: survives unless the merge
                    // delta deletes it.
                    state.insert(*recid, *hidrec);
                }
                Some(existing) if existing == hidrec => {}
                Some(_) => {
                    // Parents disagree; the merge node must restate this
                    // recid in its own delta.
                    if !node.delta.touches(recid) {
                        return Err(GraphError::Corrupt(
                            "merge node left a divergent recid unresolved",
                        ));
                    }
                }
            }
        }
    }
    Ok(state)
}

/// Reconstructs the version chain of `recid` as seen from `csid`.
///
/// Entries are returned newest-first. The chain holds one entry per changeset
/// that altered the record's content relative to the previous entry in the
/// deterministic linearization; a merge that restates the winning side's
/// value verbatim adds no entry.
pub(crate) fn history_at(
    graph: &ChangesetGraph,
    csid: &Csid,
    recid: &Recid,
) -> Result<Vec<HistoryEntry>, GraphError> {
    let ancestors = graph.ancestors(csid)?;
    let order = graph.topo_order(&ancestors)?;

    let mut chain: Vec<HistoryEntry> = Vec::new();
    for current in &order {
        let Some(node) = graph.node(current) else {
            return Err(GraphError::Corrupt("history walk hit a missing node"));
        };
        let touched = if node.delta.deletes.contains(recid) {
            Some(None)
        } else {
            node.delta.writes.get(recid).map(|h| Some(*h))
        };
        let Some(hidrec) = touched else {
            continue;
        };
        if chain.last().is_some_and(|last| last.hidrec == hidrec) {
            continue;
        }
        chain.push(HistoryEntry {
            csid: *current,
            hidrec,
            audit: node.first_audit_or_anonymous(),
        });
    }
    chain.reverse();
    Ok(chain)
}

/// The base version of `recid` shared by every head in `heads`: the newest
/// chain entry (in linearized order) whose changeset is a common ancestor of
/// all heads. `None` when the record was born after the heads diverged.
pub(crate) fn base_version(
    graph: &ChangesetGraph,
    heads: &[Csid],
    recid: &Recid,
) -> Result<Option<HistoryEntry>, GraphError> {
    let common = graph.common_ancestors(heads)?;
    if common.is_empty() {
        return Ok(None);
    }
    let order = graph.topo_order(&common)?;
    let mut newest: Option<HistoryEntry> = None;
    for current in &order {
        let Some(node) = graph.node(current) else {
            return Err(GraphError::Corrupt("base walk hit a missing node"));
        };
        if node.delta.deletes.contains(recid) {
            newest = Some(HistoryEntry {
                csid: *current,
                hidrec: None,
                audit: node.first_audit_or_anonymous(),
            });
        } else if let Some(hidrec) = node.delta.writes.get(recid) {
            newest = Some(HistoryEntry {
                csid: *current,
                hidrec: Some(*hidrec),
                audit: node.first_audit_or_anonymous(),
            });
        }
    }
    Ok(newest)
}
