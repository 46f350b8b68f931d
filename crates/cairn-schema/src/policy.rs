// SPDX-License-Identifier: Apache-2.0
//! Per-field reconciliation policy: auto-merge operators, uniqueness repair,
//! default-value generators, and journal declarations.

use std::collections::BTreeMap;

/// One auto-merge operator.
///
/// When a record was modified divergently in two or more leaves, the merge
/// engine walks the field's ordered operator list and applies the first one
/// that *strictly* resolves the difference. An operator that would have to
/// break a genuine tie (equal timestamps, equal lengths) is treated as
/// inapplicable and the walk continues; if the list is exhausted the field is
/// surfaced as an unresolved conflict rather than silently picking a winner.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MergeOp {
    /// Pick the candidate whose field was set latest (by audit timestamp).
    MostRecent,
    /// Pick the candidate whose field was set earliest.
    LeastRecent,
    /// Numeric minimum across all candidate values.
    Min,
    /// Numeric maximum across all candidate values.
    Max,
    /// Numeric sum across all candidate values (n-way, not pairwise).
    Sum,
    /// Numeric average across all candidate values, truncated toward zero.
    Average,
    /// Longest string wins.
    Longest,
    /// Shortest string wins.
    Shortest,
}

impl MergeOp {
    /// Canonical operator name, as written in journals.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::MostRecent => "most_recent",
            Self::LeastRecent => "least_recent",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Longest => "longest",
            Self::Shortest => "shortest",
        }
    }
}

/// Ordered list of auto-merge operators, first applicable wins.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MergePolicy(pub Vec<MergeOp>);

impl MergePolicy {
    /// A policy consisting of a single operator.
    #[must_use]
    pub fn single(op: MergeOp) -> Self {
        Self(vec![op])
    }

    /// The operators in application order.
    #[must_use]
    pub fn ops(&self) -> &[MergeOp] {
        &self.0
    }
}

impl From<Vec<MergeOp>> for MergePolicy {
    fn from(ops: Vec<MergeOp>) -> Self {
        Self(ops)
    }
}

/// Selector for *which* record of a colliding set gets rewritten by uniqify.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UniqifyWhich {
    /// The record with the most recent field-altering edit.
    LastModified,
    /// The record whose creating changeset is most recent.
    LastCreated,
    /// The record with the fewest history entries (least disruption).
    LeastImpact,
}

impl UniqifyWhich {
    /// Canonical selector name, as written in journals.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::LastModified => "last_modified",
            Self::LastCreated => "last_created",
            Self::LeastImpact => "least_impact",
        }
    }
}

/// How a colliding unique value is rewritten.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UniqifyOp {
    /// Suffix the value with a deterministic, writer-scoped discriminator.
    AppendUserPrefixUnique,
    /// Re-run the field's `defaultfunc` generator under current
    /// collision-checking. Requires the field to declare a generator.
    RedoDefaultFunc,
}

impl UniqifyOp {
    /// Canonical operation name, as written in journals.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::AppendUserPrefixUnique => "append_userprefix_unique",
            Self::RedoDefaultFunc => "redo_defaultfunc",
        }
    }
}

/// Post-merge uniqueness-repair policy for a `unique` field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UniqifySpec {
    /// Which colliding record gets rewritten.
    pub which: UniqifyWhich,
    /// How the chosen record's value is rewritten.
    pub op: UniqifyOp,
}

/// Default-value generator for a field.
///
/// Generators guarantee freshness only within a single writer instance;
/// collisions between concurrent writers are repaired by uniqify at merge
/// time, not prevented here.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DefaultFunc {
    /// Short random-looking unique token derived from a keyed hash stream.
    GenRandomUnique,
    /// `<user>-<n>` with the smallest `n` that does not collide.
    GenUserPrefixUnique,
}

/// Declares that automatic merge/uniqify decisions on a field are journaled.
///
/// A journal record of `rectype` is created inside the merge changeset, one
/// per automatic decision, with each declared field filled from its message
/// pattern. Patterns substitute `$op`, `$field`, `$recid`, `$candidates`,
/// and `$resolved`.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JournalSpec {
    /// Record type of the journal records to create.
    pub rectype: String,
    /// Journal-field name to message pattern.
    pub fields: BTreeMap<String, String>,
}
