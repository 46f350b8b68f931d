// SPDX-License-Identifier: Apache-2.0
//! Changeset nodes: immutable, content-addressed deltas.

use std::collections::{BTreeMap, BTreeSet};

use cairn_schema::{Csid, Recid};

use crate::audit::Audit;
use crate::content;
use crate::ident::Hidrec;

/// The delta a changeset applies to its parent state(s).
///
/// `writes` maps a recid to the content snapshot it has *after* this
/// changeset (creation and modification look the same); `deletes` lists
/// recids whose records become invisible from this changeset forward. A recid
/// never appears in both.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Delta {
    /// Records added or superseded, by content hash.
    pub writes: BTreeMap<Recid, Hidrec>,
    /// Records removed.
    pub deletes: BTreeSet<Recid>,
}

impl Delta {
    /// `true` when the delta changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    /// `true` when the delta writes or deletes `recid`.
    #[must_use]
    pub fn touches(&self, recid: &Recid) -> bool {
        self.writes.contains_key(recid) || self.deletes.contains(recid)
    }
}

/// One immutable DAG node.
///
/// Zero parents: root. One parent: ordinary edit. Two or more: a merge.
/// Identity is [`Changeset::csid`], a pure function of parents and delta;
/// audits are excluded so content-identical commits from different writers
/// fold into one node (gaining an audit entry each).
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Changeset {
    /// Parent changesets, stored in ascending id order.
    pub parents: Vec<Csid>,
    /// Delta from the parent state(s).
    pub delta: Delta,
    /// Audit entries; one per writer that produced this content.
    pub audits: Vec<Audit>,
}

impl Changeset {
    /// Constructs a changeset, canonicalizing parent order.
    #[must_use]
    pub fn new(mut parents: Vec<Csid>, delta: Delta, audit: Audit) -> Self {
        parents.sort_by(|a, b| a.0.cmp(&b.0));
        parents.dedup();
        Self {
            parents,
            delta,
            audits: vec![audit],
        }
    }

    /// Canonical identity of this node.
    #[must_use]
    pub fn csid(&self) -> Csid {
        content::hash_changeset(&self.parents, &self.delta)
    }

    /// The audit of the original writer (first to produce this content).
    ///
    /// Non-empty by construction; `None` only on a hand-built node.
    #[must_use]
    pub fn first_audit(&self) -> Option<&Audit> {
        self.audits.first()
    }

    /// Like [`Changeset::first_audit`] but owned, with an anonymous fallback.
    #[must_use]
    pub fn first_audit_or_anonymous(&self) -> Audit {
        self.audits.first().cloned().unwrap_or_else(|| {
            Audit::new(
                cairn_schema::UserIdent::anonymous(),
                cairn_schema::Timestamp::from_millis(0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_schema::{Timestamp, UserIdent};

    fn audit() -> Audit {
        Audit::new(UserIdent::new("tester"), Timestamp::from_millis(1))
    }

    #[test]
    fn identity_ignores_audits() {
        let a = Changeset::new(vec![], Delta::default(), audit());
        let b = Changeset::new(
            vec![],
            Delta::default(),
            Audit::new(UserIdent::new("other"), Timestamp::from_millis(99)),
        );
        assert_eq!(a.csid(), b.csid());
    }

    #[test]
    fn parents_are_canonicalized() {
        let p1 = Csid([3; 32]);
        let p2 = Csid([1; 32]);
        let cs = Changeset::new(vec![p1, p2, p1], Delta::default(), audit());
        assert_eq!(cs.parents, vec![p2, p1]);
    }
}
