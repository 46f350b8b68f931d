// SPDX-License-Identifier: Apache-2.0
//! The merge engine: n-way reconciliation of divergent leaves.
//!
//! A merge materializes one changeset whose parents are the merged leaves.
//! Existence is resolved per record against its base version (the newest
//! version that is an ancestor of every leaf); content divergence is resolved
//! per field by the template's ordered operator lists. Anything the policies
//! cannot strictly decide is surfaced as an explicit [`MergeConflict`] and
//! the whole merge fails atomically, leaving the store untouched.
//!
//! After field resolution, uniqueness repair ("uniqify") scans `unique`
//! fields for cross-leaf duplicates and rewrites the colliding record the
//! field's policy selects. Automatic decisions on journaled fields create
//! journal records inside the same merge changeset.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use cairn_schema::{
    ConstraintKind, Csid, FieldValue, JournalSpec, MergeOp, Recid, Template, Timestamp,
    UniqifyOp, UniqifyWhich, UserIdent, Violation,
};
use thiserror::Error;

use crate::audit::{Audit, now};
use crate::changeset::{Changeset, Delta};
use crate::constants::TEMPLATE_RECID;
use crate::content;
use crate::defaults;
use crate::graph::GraphError;
use crate::ident::{Hidrec, short_hex};
use crate::record::RecordSnapshot;
use crate::state;
use crate::store::{Blob, Store};
use crate::validate;

/// Options for [`Store::merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    user: Option<UserIdent>,
    at: Option<Timestamp>,
    leaves: Option<Vec<Csid>>,
}

impl MergeOptions {
    /// Default options: all current leaves, anonymous user, wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user recorded in the merge audit (and used by uniqify
    /// rewrites).
    #[must_use]
    pub fn user(mut self, user: UserIdent) -> Self {
        self.user = Some(user);
        self
    }

    /// Pins the merge timestamp.
    #[must_use]
    pub fn at(mut self, at: Timestamp) -> Self {
        self.at = Some(at);
        self
    }

    /// Merges an explicit subset of the current leaves instead of all of
    /// them.
    #[must_use]
    pub fn leaves(mut self, leaves: Vec<Csid>) -> Self {
        self.leaves = Some(leaves);
        self
    }
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merge changeset.
    pub csid: Csid,
    /// The leaves it reconciled (now its parents).
    pub parents: Vec<Csid>,
}

/// Why one record or field could not be auto-resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Deleted in one leaf, modified in another.
    DeleteVsModify,
    /// The same recid carries different record types across leaves.
    RectypeDiverged,
    /// No merge operator in the field's list could decide.
    NoApplicablePolicy,
    /// An operator hit an exact tie between different values.
    Tie {
        /// The operator that tied.
        op: MergeOp,
    },
    /// The auto-merged value violates a constraint.
    Constraint(Violation),
}

/// One unresolved merge decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// Record involved.
    pub recid: Recid,
    /// The record's type, when known.
    pub rectype: Option<String>,
    /// Field involved; `None` for record-level conflicts.
    pub field: Option<String>,
    /// Why resolution failed.
    pub reason: ConflictReason,
}

impl core::fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "record {}", short_hex(&self.recid.0))?;
        if let Some(field) = &self.field {
            write!(f, " field {field}")?;
        }
        match &self.reason {
            ConflictReason::DeleteVsModify => write!(f, ": deleted and modified concurrently"),
            ConflictReason::RectypeDiverged => write!(f, ": record type diverged"),
            ConflictReason::NoApplicablePolicy => write!(f, ": no applicable merge operator"),
            ConflictReason::Tie { op } => write!(f, ": {} tie", op.name()),
            ConflictReason::Constraint(v) => write!(f, ": merged value invalid ({v})"),
        }
    }
}

/// Merge errors. [`MergeError::Unresolved`] carries every conflict found;
/// all variants leave the store untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Trivial stores are append-only chains; nothing to merge.
    #[error("trivial store does not merge")]
    TrivialStore,
    /// Merging needs at least two leaves.
    #[error("merge needs at least two leaves, have {have}")]
    NotEnoughLeaves {
        /// Leaves available.
        have: usize,
    },
    /// A named changeset is not a current leaf.
    #[error("changeset {} is not a current leaf", short_hex(&.0.0))]
    NotALeaf(Csid),
    /// The leaves carry different templates; reconcile the schema first.
    #[error("template diverged between leaves")]
    TemplateDiverged,
    /// Conflicts the policies could not resolve.
    #[error("merge unresolved: {} conflict(s)", .0.len())]
    Unresolved(Vec<MergeConflict>),
    /// DAG lookup failure.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// An automatic decision pending journaling.
struct AutoDecision {
    journal: JournalSpec,
    op: &'static str,
    field: String,
    recid: Recid,
    candidates: Vec<String>,
    resolved: String,
}

struct MergePlan {
    delta: Delta,
    staged: BTreeMap<Hidrec, RecordSnapshot>,
}

/// Everything `plan_merge` threads through its passes.
struct Planner<'a> {
    store: &'a Store,
    leaves: &'a [Csid],
    states: Vec<BTreeMap<Recid, Hidrec>>,
    template: Option<&'a Template>,
    user: &'a UserIdent,
    at: Timestamp,
    delta: Delta,
    staged: BTreeMap<Hidrec, RecordSnapshot>,
    resolved: BTreeMap<Recid, Hidrec>,
    conflicts: Vec<MergeConflict>,
    decisions: Vec<AutoDecision>,
}

impl Store {
    /// Reconciles divergent leaves into one merge changeset.
    ///
    /// With no explicit leaf list, all current leaves are merged. On success
    /// the leaf count drops by `n - 1`; on [`MergeError::Unresolved`] the
    /// store is untouched and the conflicts list every undecidable record or
    /// field.
    ///
    /// # Errors
    /// See [`MergeError`].
    pub fn merge(&mut self, opts: MergeOptions) -> Result<MergeOutcome, MergeError> {
        if self.config.trivial {
            return Err(MergeError::TrivialStore);
        }
        let mut leaves = match opts.leaves {
            Some(explicit) => explicit,
            None => self.get_leaves(),
        };
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        leaves.dedup();
        if leaves.len() < 2 {
            return Err(MergeError::NotEnoughLeaves { have: leaves.len() });
        }
        for leaf in &leaves {
            if !self.graph.leaves().contains(leaf) {
                return Err(MergeError::NotALeaf(*leaf));
            }
        }
        let user = opts.user.unwrap_or_else(UserIdent::anonymous);
        let at = opts.at.unwrap_or_else(now);

        let plan = self.plan_merge(&leaves, &user, at)?;
        for (hidrec, snapshot) in plan.staged {
            self.blobs.entry(hidrec).or_insert(Blob::Record(snapshot));
        }
        let changeset = Changeset::new(leaves.clone(), plan.delta, Audit::new(user, at));
        let (csid, _) = self.graph.insert(changeset)?;
        tracing::debug!(
            csid = %short_hex(&csid.0),
            parents = leaves.len(),
            "merged leaves"
        );
        Ok(MergeOutcome {
            csid,
            parents: leaves,
        })
    }

    fn plan_merge(
        &self,
        leaves: &[Csid],
        user: &UserIdent,
        at: Timestamp,
    ) -> Result<MergePlan, MergeError> {
        let states = leaves
            .iter()
            .map(|leaf| self.state_at(leaf))
            .collect::<Result<Vec<_>, _>>()?;

        let template_hashes: BTreeSet<Hidrec> = states
            .iter()
            .filter_map(|s| s.get(&TEMPLATE_RECID).copied())
            .collect();
        if template_hashes.len() > 1 {
            return Err(MergeError::TemplateDiverged);
        }
        let template = template_hashes.iter().next().and_then(|h| {
            if let Some(Blob::Template(t)) = self.blobs.get(h) {
                Some(t)
            } else {
                None
            }
        });

        let mut planner = Planner {
            store: self,
            leaves,
            states,
            template,
            user,
            at,
            delta: Delta::default(),
            staged: BTreeMap::new(),
            resolved: BTreeMap::new(),
            conflicts: Vec::new(),
            decisions: Vec::new(),
        };
        planner.resolve_existence_and_content()?;
        if planner.conflicts.is_empty() {
            planner.uniqify()?;
        }
        if planner.conflicts.is_empty() {
            planner.write_journals();
        }
        if planner.conflicts.is_empty() {
            Ok(MergePlan {
                delta: planner.delta,
                staged: planner.staged,
            })
        } else {
            Err(MergeError::Unresolved(planner.conflicts))
        }
    }
}

impl Planner<'_> {
    /// Per-recid existence resolution, with field-level content merge where
    /// two or more leaves modified the record divergently.
    fn resolve_existence_and_content(&mut self) -> Result<(), MergeError> {
        let universe: BTreeSet<Recid> = self
            .states
            .iter()
            .flat_map(|s| s.keys().copied())
            .filter(|recid| *recid != TEMPLATE_RECID)
            .collect();

        for recid in universe {
            let present: Vec<(usize, Hidrec)> = self
                .states
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.get(&recid).map(|h| (i, *h)))
                .collect();
            let distinct: BTreeSet<Hidrec> = present.iter().map(|(_, h)| *h).collect();
            let base_live = state::base_version(&self.store.graph, self.leaves, &recid)?
                .and_then(|entry| entry.hidrec);

            // Absence in a leaf is a deletion only when the record predates
            // the divergence; a record born in one leaf is simply unknown to
            // the others.
            if present.len() < self.leaves.len() && base_live.is_some() {
                if distinct.iter().all(|h| Some(*h) == base_live) {
                    self.delta.deletes.insert(recid);
                    tracing::trace!(recid = %short_hex(&recid.0), "merge: delete wins over unmodified");
                } else {
                    self.conflicts.push(MergeConflict {
                        recid,
                        rectype: self.rectype_of(&present),
                        field: None,
                        reason: ConflictReason::DeleteVsModify,
                    });
                }
                continue;
            }

            if distinct.len() <= 1 {
                // Agreement (or one-sided presence): the parent-state union
                // already yields this value.
                if let Some(h) = distinct.iter().next() {
                    self.resolved.insert(recid, *h);
                }
                continue;
            }

            // Modified in exactly one direction: every other leaf still holds
            // the base version.
            if let Some(base) = base_live {
                if distinct.len() == 2 && distinct.contains(&base) {
                    if let Some(winner) = distinct.iter().find(|h| **h != base).copied() {
                        self.delta.writes.insert(recid, winner);
                        self.resolved.insert(recid, winner);
                        continue;
                    }
                }
            }

            self.merge_record_fields(recid, &present, base_live)?;
        }
        Ok(())
    }

    fn rectype_of(&self, present: &[(usize, Hidrec)]) -> Option<String> {
        present
            .first()
            .and_then(|(_, h)| self.store.snapshot(h))
            .map(|s| s.rectype.clone())
    }

    fn merge_record_fields(
        &mut self,
        recid: Recid,
        present: &[(usize, Hidrec)],
        base_live: Option<Hidrec>,
    ) -> Result<(), MergeError> {
        let mut snapshots = Vec::with_capacity(present.len());
        for (_, h) in present {
            let Some(snapshot) = self.store.snapshot(h) else {
                return Err(GraphError::Corrupt("record blob missing during merge").into());
            };
            snapshots.push(snapshot);
        }
        let rectype = snapshots[0].rectype.clone();
        if snapshots.iter().any(|s| s.rectype != rectype) {
            self.conflicts.push(MergeConflict {
                recid,
                rectype: Some(rectype),
                field: None,
                reason: ConflictReason::RectypeDiverged,
            });
            return Ok(());
        }
        let Some(def) = self.template.and_then(|t| t.get(&rectype)) else {
            self.conflicts.push(MergeConflict {
                recid,
                rectype: Some(rectype),
                field: None,
                reason: ConflictReason::NoApplicablePolicy,
            });
            return Ok(());
        };
        let base_snapshot = base_live.and_then(|h| self.store.snapshot(&h));

        let mut field_names: BTreeSet<String> = snapshots
            .iter()
            .flat_map(|s| s.fields.keys().cloned())
            .collect();
        if let Some(base) = base_snapshot {
            field_names.extend(base.fields.keys().cloned());
        }

        let mut merged: BTreeMap<String, FieldValue> = BTreeMap::new();
        for field in &field_names {
            let per_leaf: Vec<Option<&FieldValue>> =
                snapshots.iter().map(|s| s.fields.get(field)).collect();
            let base_value = base_snapshot.and_then(|s| s.fields.get(field));

            let mut distinct_values: Vec<Option<&FieldValue>> = Vec::new();
            for value in &per_leaf {
                if !distinct_values.contains(value) {
                    distinct_values.push(*value);
                }
            }
            if distinct_values.len() == 1 {
                if let Some(value) = distinct_values[0] {
                    merged.insert(field.clone(), value.clone());
                }
                continue;
            }

            // Classic three-way: values differing from base are edits; a
            // single edit wins without consulting any policy.
            let edits: Vec<Option<&FieldValue>> = distinct_values
                .iter()
                .filter(|v| **v != base_value)
                .copied()
                .collect();
            if edits.len() == 1 {
                if let Some(value) = edits[0] {
                    merged.insert(field.clone(), value.clone());
                }
                continue;
            }

            let Some(policy) = def.merge_policy_for(field) else {
                self.conflicts.push(MergeConflict {
                    recid,
                    rectype: Some(rectype.clone()),
                    field: Some(field.clone()),
                    reason: ConflictReason::NoApplicablePolicy,
                });
                continue;
            };
            let mut candidates = Vec::with_capacity(present.len());
            for ((leaf_idx, _), snapshot) in present.iter().zip(&snapshots) {
                candidates.push(self.field_candidate(
                    &self.leaves[*leaf_idx],
                    recid,
                    field,
                    snapshot,
                )?);
            }
            match resolve_policy(policy.ops(), &candidates) {
                Ok((value, op)) => {
                    tracing::debug!(
                        recid = %short_hex(&recid.0),
                        field = %field,
                        op = op.name(),
                        "merge: field auto-resolved"
                    );
                    if let Some(fd) = def.fields.get(field) {
                        if let Some(journal) = &fd.journal {
                            self.decisions.push(AutoDecision {
                                journal: journal.clone(),
                                op: op.name(),
                                field: field.clone(),
                                recid,
                                candidates: candidates.iter().map(display_candidate).collect(),
                                resolved: value
                                    .as_ref()
                                    .map_or_else(|| "unset".to_owned(), ToString::to_string),
                            });
                        }
                    }
                    if let Some(value) = value {
                        merged.insert(field.clone(), value);
                    }
                }
                Err(FieldFailure::Tie(op)) => self.conflicts.push(MergeConflict {
                    recid,
                    rectype: Some(rectype.clone()),
                    field: Some(field.clone()),
                    reason: ConflictReason::Tie { op },
                }),
                Err(FieldFailure::NoApplicable) => self.conflicts.push(MergeConflict {
                    recid,
                    rectype: Some(rectype.clone()),
                    field: Some(field.clone()),
                    reason: ConflictReason::NoApplicablePolicy,
                }),
            }
        }

        let snapshot = RecordSnapshot::new(rectype.clone(), merged);
        if let Some(template) = self.template {
            for cv in
                validate::check_snapshot_values(template, recid, &rectype, &snapshot.fields)
            {
                self.conflicts.push(MergeConflict {
                    recid,
                    rectype: Some(rectype.clone()),
                    field: Some(cv.violation.field.clone()),
                    reason: ConflictReason::Constraint(cv.violation),
                });
            }
        }
        let hidrec = snapshot.hidrec();
        self.staged.insert(hidrec, snapshot);
        self.delta.writes.insert(recid, hidrec);
        self.resolved.insert(recid, hidrec);
        Ok(())
    }

    /// The field's value in one leaf, with the audit timestamp of the edit
    /// that last set it to that value.
    fn field_candidate(
        &self,
        leaf: &Csid,
        recid: Recid,
        field: &str,
        snapshot: &RecordSnapshot,
    ) -> Result<FieldCandidate, GraphError> {
        let chain = state::history_at(&self.store.graph, leaf, &recid)?;
        let current = snapshot.fields.get(field);
        let mut set_at = chain
            .first()
            .map_or_else(|| Timestamp::from_millis(0), |e| e.audit.at);
        for entry in &chain {
            let value = entry
                .hidrec
                .as_ref()
                .and_then(|h| self.store.snapshot(h))
                .and_then(|s| s.fields.get(field));
            if value == current {
                set_at = entry.audit.at;
            } else {
                break;
            }
        }
        Ok(FieldCandidate {
            value: current.cloned(),
            set_at,
        })
    }

    // ── uniqueness repair ───────────────────────────────────────────

    fn uniqify(&mut self) -> Result<(), MergeError> {
        let Some(template) = self.template else {
            return Ok(());
        };
        // Each pass rewrites one colliding record; the rewrite is collision
        // checked against every live value, so each group shrinks by one.
        loop {
            let Some(group) = self.first_repairable_duplicate(template) else {
                break;
            };
            self.repair(template, &group)?;
            if !self.conflicts.is_empty() {
                return Ok(());
            }
        }
        // Whatever still collides has no uniqify policy (or repair failed).
        for group in self.duplicate_groups(template) {
            let spec = template
                .get(&group.rectype)
                .and_then(|def| def.fields.get(&group.field))
                .and_then(|fd| fd.uniqify);
            if spec.is_none() {
                self.conflicts.push(MergeConflict {
                    recid: group.members[0],
                    rectype: Some(group.rectype.clone()),
                    field: Some(group.field.clone()),
                    reason: ConflictReason::Constraint(Violation {
                        field: group.field.clone(),
                        kind: ConstraintKind::Unique,
                        message: format!(
                            "{} records share {} and no uniqify policy is declared",
                            group.members.len(),
                            group.value
                        ),
                    }),
                });
            }
        }
        Ok(())
    }

    fn first_repairable_duplicate(&self, template: &Template) -> Option<DuplicateGroup> {
        self.duplicate_groups(template).into_iter().find(|group| {
            template
                .get(&group.rectype)
                .and_then(|def| def.fields.get(&group.field))
                .and_then(|fd| fd.uniqify)
                .is_some()
        })
    }

    /// All duplicate groups over `unique` fields in the planned state, in
    /// (rectype, field, value) order.
    fn duplicate_groups(&self, template: &Template) -> Vec<DuplicateGroup> {
        let mut groups = Vec::new();
        for (rectype, def) in &template.rectypes {
            for (field, fd) in &def.fields {
                if !fd.constraints.unique {
                    continue;
                }
                let mut by_value: BTreeMap<String, Vec<Recid>> = BTreeMap::new();
                for (recid, snapshot) in self.live_snapshots(rectype) {
                    if let Some(value) = snapshot.fields.get(field) {
                        by_value.entry(value.to_string()).or_default().push(recid);
                    }
                }
                for (value, members) in by_value {
                    if members.len() > 1 {
                        groups.push(DuplicateGroup {
                            rectype: rectype.clone(),
                            field: field.clone(),
                            value,
                            members,
                        });
                    }
                }
            }
        }
        groups
    }

    fn live_snapshots(&self, rectype: &str) -> Vec<(Recid, &RecordSnapshot)> {
        self.resolved
            .iter()
            .filter_map(|(recid, hidrec)| {
                self.planned_snapshot(hidrec)
                    .filter(|s| s.rectype == rectype)
                    .map(|s| (*recid, s))
            })
            .collect()
    }

    fn planned_snapshot(&self, hidrec: &Hidrec) -> Option<&RecordSnapshot> {
        self.staged.get(hidrec).or_else(|| self.store.snapshot(hidrec))
    }

    fn repair(&mut self, template: &Template, group: &DuplicateGroup) -> Result<(), MergeError> {
        let Some(fd) = template
            .get(&group.rectype)
            .and_then(|def| def.fields.get(&group.field))
        else {
            return Ok(());
        };
        let Some(spec) = fd.uniqify else {
            return Ok(());
        };

        let mut metrics = Vec::with_capacity(group.members.len());
        for recid in &group.members {
            metrics.push((*recid, self.record_metric(*recid, &group.field, spec.which)?));
        }
        let victim = pick_victim(spec.which, &metrics);

        let Some(old) = self
            .resolved
            .get(&victim)
            .and_then(|h| self.planned_snapshot(h))
            .cloned()
        else {
            return Err(GraphError::Corrupt("uniqify victim has no snapshot").into());
        };

        let taken: BTreeSet<String> = self
            .live_snapshots(&group.rectype)
            .into_iter()
            .filter_map(|(_, s)| s.fields.get(&group.field).map(ToString::to_string))
            .collect();
        let is_taken = |candidate: &str| taken.contains(candidate);

        let new_value = match spec.op {
            UniqifyOp::AppendUserPrefixUnique => {
                let Some(FieldValue::Str(text)) = old.fields.get(&group.field) else {
                    self.conflicts.push(MergeConflict {
                        recid: victim,
                        rectype: Some(group.rectype.clone()),
                        field: Some(group.field.clone()),
                        reason: ConflictReason::Constraint(Violation {
                            field: group.field.clone(),
                            kind: ConstraintKind::Unique,
                            message: "append_userprefix_unique needs a string value".to_owned(),
                        }),
                    });
                    return Ok(());
                };
                defaults::user_suffixed(text, self.user, &is_taken)
            }
            UniqifyOp::RedoDefaultFunc => {
                let Some(func) = fd.defaultfunc else {
                    // validate() rejects this template shape; stay defensive.
                    self.conflicts.push(MergeConflict {
                        recid: victim,
                        rectype: Some(group.rectype.clone()),
                        field: Some(group.field.clone()),
                        reason: ConflictReason::NoApplicablePolicy,
                    });
                    return Ok(());
                };
                defaults::run(
                    func,
                    self.user,
                    &group.field,
                    self.leaves.first(),
                    &is_taken,
                )
            }
        };

        tracing::debug!(
            recid = %short_hex(&victim.0),
            field = %group.field,
            which = spec.which.name(),
            op = spec.op.name(),
            "uniqify: rewrote colliding value"
        );

        let mut snapshot = old;
        snapshot
            .fields
            .insert(group.field.clone(), FieldValue::Str(new_value.clone()));
        for cv in
            validate::check_snapshot_values(template, victim, &group.rectype, &snapshot.fields)
        {
            self.conflicts.push(MergeConflict {
                recid: victim,
                rectype: Some(group.rectype.clone()),
                field: Some(cv.violation.field.clone()),
                reason: ConflictReason::Constraint(cv.violation),
            });
        }
        let hidrec = snapshot.hidrec();
        self.staged.insert(hidrec, snapshot);
        self.delta.writes.insert(victim, hidrec);
        self.resolved.insert(victim, hidrec);

        if let Some(journal) = &fd.journal {
            self.decisions.push(AutoDecision {
                journal: journal.clone(),
                op: spec.op.name(),
                field: group.field.clone(),
                recid: victim,
                candidates: group
                    .members
                    .iter()
                    .map(|r| short_hex(&r.0))
                    .collect(),
                resolved: new_value,
            });
        }
        Ok(())
    }

    /// Selector metric for one colliding record, maximized over the leaves
    /// where the record is present.
    fn record_metric(
        &self,
        recid: Recid,
        field: &str,
        which: UniqifyWhich,
    ) -> Result<u64, MergeError> {
        let mut metric = 0u64;
        for (i, leaf) in self.leaves.iter().enumerate() {
            let Some(hidrec) = self.states[i].get(&recid) else {
                continue;
            };
            let value = match which {
                UniqifyWhich::LastModified => {
                    let Some(snapshot) = self.store.snapshot(hidrec) else {
                        continue;
                    };
                    self.field_candidate(leaf, recid, field, snapshot)?
                        .set_at
                        .as_millis()
                }
                UniqifyWhich::LastCreated => {
                    let chain = state::history_at(&self.store.graph, leaf, &recid)?;
                    chain.last().map_or(0, |entry| entry.audit.at.as_millis())
                }
                UniqifyWhich::LeastImpact => {
                    state::history_at(&self.store.graph, leaf, &recid)?.len() as u64
                }
            };
            metric = metric.max(value);
        }
        Ok(metric)
    }

    // ── journaling ──────────────────────────────────────────────────

    fn write_journals(&mut self) {
        let Some(template) = self.template else {
            return;
        };
        let decisions = std::mem::take(&mut self.decisions);
        for (seq, decision) in decisions.into_iter().enumerate() {
            let rectype = decision.journal.rectype.clone();
            let mut fields = BTreeMap::new();
            for (name, pattern) in &decision.journal.fields {
                fields.insert(name.clone(), FieldValue::Str(substitute(pattern, &decision)));
            }
            let snapshot = RecordSnapshot::new(rectype.clone(), fields);
            let hidrec = snapshot.hidrec();

            let mut attempt = seq as u64;
            let mut recid = content::derive_recid(
                self.leaves.first(),
                self.user,
                self.at,
                u64::MAX,
                attempt,
            );
            while recid == TEMPLATE_RECID || self.resolved.contains_key(&recid) {
                attempt = attempt.wrapping_add(1);
                recid = content::derive_recid(
                    self.leaves.first(),
                    self.user,
                    self.at,
                    u64::MAX,
                    attempt,
                );
            }

            // Journal records pass through the same checker as everything
            // else; a substituted message can still break a length or
            // allowed-set constraint on the target field.
            let violations =
                validate::check_snapshot_values(template, recid, &rectype, &snapshot.fields);
            if violations.is_empty() {
                self.staged.insert(hidrec, snapshot);
                self.delta.writes.insert(recid, hidrec);
                self.resolved.insert(recid, hidrec);
            } else {
                for cv in violations {
                    self.conflicts.push(MergeConflict {
                        recid,
                        rectype: Some(rectype.clone()),
                        field: Some(cv.violation.field.clone()),
                        reason: ConflictReason::Constraint(cv.violation),
                    });
                }
            }
        }
    }
}

struct DuplicateGroup {
    rectype: String,
    field: String,
    value: String,
    members: Vec<Recid>,
}

/// One leaf's contribution to a field-level decision.
#[derive(Debug, Clone, PartialEq)]
struct FieldCandidate {
    value: Option<FieldValue>,
    set_at: Timestamp,
}

fn display_candidate(candidate: &FieldCandidate) -> String {
    candidate
        .value
        .as_ref()
        .map_or_else(|| "unset".to_owned(), ToString::to_string)
}

enum FieldFailure {
    Tie(MergeOp),
    NoApplicable,
}

enum OpResult {
    Applied(Option<FieldValue>),
    Tied,
    Inapplicable,
}

/// Walks the operator list; first strict resolution wins. A tie is recorded
/// but the walk continues, so a later operator can still decide.
fn resolve_policy(
    ops: &[MergeOp],
    candidates: &[FieldCandidate],
) -> Result<(Option<FieldValue>, MergeOp), FieldFailure> {
    let mut tie = None;
    for &op in ops {
        match apply_op(op, candidates) {
            OpResult::Applied(value) => return Ok((value, op)),
            OpResult::Tied => tie = tie.or(Some(op)),
            OpResult::Inapplicable => {}
        }
    }
    Err(tie.map_or(FieldFailure::NoApplicable, FieldFailure::Tie))
}

fn apply_op(op: MergeOp, candidates: &[FieldCandidate]) -> OpResult {
    match op {
        MergeOp::MostRecent => pick_by_time(candidates, true),
        MergeOp::LeastRecent => pick_by_time(candidates, false),
        MergeOp::Min => pick_by_value(candidates, Ordering::Less),
        MergeOp::Max => pick_by_value(candidates, Ordering::Greater),
        MergeOp::Sum => int_aggregate(candidates, false),
        MergeOp::Average => int_aggregate(candidates, true),
        MergeOp::Longest => pick_by_len(candidates, true),
        MergeOp::Shortest => pick_by_len(candidates, false),
    }
}

/// Timestamp selection works on unset values too: it compares edit times,
/// not values, so it is the only way to resolve a set-vs-cleared divergence.
fn pick_by_time(candidates: &[FieldCandidate], newest: bool) -> OpResult {
    let extreme = candidates.iter().map(|c| c.set_at);
    let Some(extreme) = (if newest { extreme.max() } else { extreme.min() }) else {
        return OpResult::Inapplicable;
    };
    let mut winner: Option<&Option<FieldValue>> = None;
    for candidate in candidates {
        if candidate.set_at != extreme {
            continue;
        }
        match winner {
            None => winner = Some(&candidate.value),
            Some(value) if *value == candidate.value => {}
            Some(_) => return OpResult::Tied,
        }
    }
    winner.map_or(OpResult::Inapplicable, |value| {
        OpResult::Applied(value.clone())
    })
}

fn pick_by_value(candidates: &[FieldCandidate], want: Ordering) -> OpResult {
    let mut values = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Some(value) = &candidate.value else {
            return OpResult::Inapplicable;
        };
        values.push(value);
    }
    let Some((mut best, rest)) = values.split_first() else {
        return OpResult::Inapplicable;
    };
    for value in rest {
        match value.cmp_same_kind(best) {
            None => return OpResult::Inapplicable,
            Some(ordering) if ordering == want => best = value,
            Some(_) => {}
        }
    }
    OpResult::Applied(Some((*best).clone()))
}

fn int_aggregate(candidates: &[FieldCandidate], average: bool) -> OpResult {
    let mut sum = 0i64;
    for candidate in candidates {
        let Some(FieldValue::Int(n)) = candidate.value else {
            return OpResult::Inapplicable;
        };
        let Some(next) = sum.checked_add(n) else {
            return OpResult::Inapplicable;
        };
        sum = next;
    }
    if candidates.is_empty() {
        return OpResult::Inapplicable;
    }
    let out = if average {
        sum / i64::try_from(candidates.len()).unwrap_or(i64::MAX)
    } else {
        sum
    };
    OpResult::Applied(Some(FieldValue::Int(out)))
}

fn pick_by_len(candidates: &[FieldCandidate], longest: bool) -> OpResult {
    let mut texts = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Some(text) = candidate.value.as_ref().and_then(FieldValue::as_text) else {
            return OpResult::Inapplicable;
        };
        texts.push(text);
    }
    let lens = texts.iter().map(|t| t.len());
    let Some(extreme) = (if longest { lens.max() } else { lens.min() }) else {
        return OpResult::Inapplicable;
    };
    let mut winner: Option<&str> = None;
    for text in texts {
        if text.len() != extreme {
            continue;
        }
        match winner {
            None => winner = Some(text),
            Some(w) if w == text => {}
            Some(_) => return OpResult::Tied,
        }
    }
    winner.map_or(OpResult::Inapplicable, |text| {
        OpResult::Applied(Some(FieldValue::Str(text.to_owned())))
    })
}

fn pick_victim(which: UniqifyWhich, metrics: &[(Recid, u64)]) -> Recid {
    match which {
        UniqifyWhich::LastModified | UniqifyWhich::LastCreated => metrics
            .iter()
            .max_by(|(ra, ma), (rb, mb)| ma.cmp(mb).then(ra.0.cmp(&rb.0)))
            .map_or(Recid([0; 32]), |(r, _)| *r),
        // Fewest history entries; ties break toward the larger recid.
        UniqifyWhich::LeastImpact => metrics
            .iter()
            .min_by(|(ra, ma), (rb, mb)| ma.cmp(mb).then(rb.0.cmp(&ra.0)))
            .map_or(Recid([0; 32]), |(r, _)| *r),
    }
}

fn substitute(pattern: &str, decision: &AutoDecision) -> String {
    pattern
        .replace("$candidates", &decision.candidates.join(", "))
        .replace("$resolved", &decision.resolved)
        .replace("$recid", &short_hex(&decision.recid.0))
        .replace("$field", &decision.field)
        .replace("$op", decision.op)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn cand(value: Option<FieldValue>, at: u64) -> FieldCandidate {
        FieldCandidate {
            value,
            set_at: Timestamp::from_millis(at),
        }
    }

    #[test]
    fn most_recent_picks_latest_edit() {
        let cands = [
            cand(Some(FieldValue::Int(35)), 10),
            cand(Some(FieldValue::Int(44)), 20),
        ];
        match apply_op(MergeOp::MostRecent, &cands) {
            OpResult::Applied(v) => assert_eq!(v, Some(FieldValue::Int(44))),
            _ => panic!("expected resolution"),
        }
    }

    #[test]
    fn most_recent_tie_falls_through_to_next_op() {
        let cands = [
            cand(Some(FieldValue::Int(1)), 10),
            cand(Some(FieldValue::Int(2)), 10),
        ];
        assert!(matches!(apply_op(MergeOp::MostRecent, &cands), OpResult::Tied));
        let resolved = resolve_policy(&[MergeOp::MostRecent, MergeOp::Max], &cands);
        match resolved {
            Ok((Some(FieldValue::Int(2)), MergeOp::Max)) => {}
            _ => panic!("expected max to break the tie"),
        }
    }

    #[test]
    fn exhausted_list_reports_the_tie() {
        let cands = [
            cand(Some(FieldValue::Int(1)), 10),
            cand(Some(FieldValue::Int(2)), 10),
        ];
        assert!(matches!(
            resolve_policy(&[MergeOp::MostRecent], &cands),
            Err(FieldFailure::Tie(MergeOp::MostRecent))
        ));
    }

    #[test]
    fn aggregates_cover_all_candidates() {
        let cands = [
            cand(Some(FieldValue::Int(10)), 1),
            cand(Some(FieldValue::Int(20)), 2),
            cand(Some(FieldValue::Int(33)), 3),
        ];
        match apply_op(MergeOp::Sum, &cands) {
            OpResult::Applied(v) => assert_eq!(v, Some(FieldValue::Int(63))),
            _ => panic!("expected sum"),
        }
        match apply_op(MergeOp::Average, &cands) {
            OpResult::Applied(v) => assert_eq!(v, Some(FieldValue::Int(21))),
            _ => panic!("expected average"),
        }
    }

    #[test]
    fn length_ops_need_strictly_distinct_lengths() {
        let cands = [
            cand(Some(FieldValue::Str("abc".to_owned())), 1),
            cand(Some(FieldValue::Str("xyz".to_owned())), 2),
        ];
        assert!(matches!(apply_op(MergeOp::Longest, &cands), OpResult::Tied));
        let longer = [
            cand(Some(FieldValue::Str("abc".to_owned())), 1),
            cand(Some(FieldValue::Str("abcdef".to_owned())), 2),
        ];
        match apply_op(MergeOp::Longest, &longer) {
            OpResult::Applied(v) => assert_eq!(v, Some(FieldValue::Str("abcdef".to_owned()))),
            _ => panic!("expected longest"),
        }
    }

    #[test]
    fn unset_values_only_resolve_by_time() {
        let cands = [cand(None, 20), cand(Some(FieldValue::Int(5)), 10)];
        assert!(matches!(apply_op(MergeOp::Max, &cands), OpResult::Inapplicable));
        match apply_op(MergeOp::MostRecent, &cands) {
            OpResult::Applied(v) => assert_eq!(v, None),
            _ => panic!("expected the clear to win"),
        }
    }

    #[test]
    fn victim_selection_breaks_ties_toward_larger_recid() {
        let a = Recid([1; 32]);
        let b = Recid([2; 32]);
        assert_eq!(pick_victim(UniqifyWhich::LastModified, &[(a, 5), (b, 5)]), b);
        assert_eq!(pick_victim(UniqifyWhich::LeastImpact, &[(a, 5), (b, 5)]), b);
        assert_eq!(pick_victim(UniqifyWhich::LeastImpact, &[(a, 1), (b, 5)]), a);
    }
}
