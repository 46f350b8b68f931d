// SPDX-License-Identifier: Apache-2.0
//! Record snapshots and history entries.

use std::collections::BTreeMap;

use cairn_schema::{Csid, FieldValue};

use crate::audit::Audit;
use crate::content;
use crate::ident::Hidrec;

/// One immutable content snapshot of a record: its type and field values.
///
/// Snapshots are content-addressed; the store keeps one blob per distinct
/// [`Hidrec`] no matter how many changesets reference it. Absent optional
/// fields are absent map entries — there is no null value.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordSnapshot {
    /// Record type, fixed for the life of the record.
    pub rectype: String,
    /// Field name to value.
    pub fields: BTreeMap<String, FieldValue>,
}

impl RecordSnapshot {
    /// Constructs a snapshot.
    #[must_use]
    pub fn new(rectype: impl Into<String>, fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            rectype: rectype.into(),
            fields,
        }
    }

    /// Canonical content hash of this snapshot.
    #[must_use]
    pub fn hidrec(&self) -> Hidrec {
        content::hash_snapshot(&self.rectype, &self.fields)
    }
}

/// One entry in a record's version chain.
///
/// The chain is reconstructed purely from graph traversal — it is never
/// stored redundantly. `hidrec == None` marks the changeset that deleted the
/// record.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HistoryEntry {
    /// Changeset that altered the record.
    pub csid: Csid,
    /// Snapshot the record had after that changeset; `None` for a deletion.
    pub hidrec: Option<Hidrec>,
    /// Audit of the altering commit (the original writer when audits folded).
    pub audit: Audit,
}
