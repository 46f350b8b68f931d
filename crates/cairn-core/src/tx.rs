// SPDX-License-Identifier: Apache-2.0
//! Transactions: open/create/modify/delete records against a baseline.
//!
//! A transaction is identified by a [`TxId`] and lives inside its [`Store`]
//! (no shared mutable state escapes the handle). Schema errors fail at the
//! point of assignment; constraint violations are collected at commit and
//! returned as values, leaving the transaction open for correction.

use std::collections::{BTreeMap, BTreeSet};

use cairn_schema::{
    Csid, FieldValue, Recid, Template, TemplateError, Timestamp, UserIdent, Violation,
};
use thiserror::Error;

use crate::audit::Audit;
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

/// Thin wrapper around a transaction identifier.
///
/// The store issues monotonically increasing identifiers via
/// [`Store::begin`]. Zero is reserved as invalid; the counter wraps at
/// `u64::MAX` and resumes at `1`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct TxId(u64);

impl TxId {
    /// Constructs a `TxId` from a raw `u64` value.
    ///
    /// Constructing `TxId(0)` is allowed, but store operations treat it as
    /// invalid and return [`TxError::TransactionNotActive`].
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for [`Store::begin`].
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    baseline: Option<Csid>,
    user: Option<UserIdent>,
    at: Option<Timestamp>,
}

impl TxOptions {
    /// Default options: sole-leaf baseline, anonymous user, wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Roots the transaction at an explicit baseline changeset.
    #[must_use]
    pub fn baseline(mut self, csid: Csid) -> Self {
        self.baseline = Some(csid);
        self
    }

    /// Sets the acting user recorded in the commit audit.
    #[must_use]
    pub fn user(mut self, user: UserIdent) -> Self {
        self.user = Some(user);
        self
    }

    /// Pins the commit timestamp (otherwise wall-clock at `begin`).
    #[must_use]
    pub fn at(mut self, at: Timestamp) -> Self {
        self.at = Some(at);
        self
    }
}

/// One constraint violation, qualified by the record it occurred on.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstraintViolation {
    /// Record the violation occurred on.
    pub recid: Recid,
    /// The record's type.
    pub rectype: String,
    /// Field-level detail.
    pub violation: Violation,
}

impl core::fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}[{}].{}",
            self.rectype,
            short_hex(&self.recid.0),
            self.violation
        )
    }
}

/// Result of a [`Store::commit`] that did not hit a programmer error.
#[derive(Clone, PartialEq, Eq, Debug)]
#[must_use]
pub enum CommitOutcome {
    /// The transaction was materialized as (or folded into) this changeset.
    Committed(Csid),
    /// Constraint violations; no state changed and the transaction remains
    /// open for correction or abort.
    Rejected(Vec<ConstraintViolation>),
}

impl CommitOutcome {
    /// The committed changeset id, when the commit succeeded.
    #[must_use]
    pub fn csid(&self) -> Option<Csid> {
        match self {
            Self::Committed(csid) => Some(*csid),
            Self::Rejected(_) => None,
        }
    }
}

/// Programmer-error and schema-error conditions raised by transaction
/// operations. These fail immediately and loudly; they are never collected
/// into a [`CommitOutcome::Rejected`] list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// The transaction was already committed or aborted (or never existed).
    #[error("transaction no longer active")]
    TransactionNotActive,
    /// The store has several leaves and no baseline was specified.
    #[error("ambiguous baseline: store has {leaves} leaves, specify one")]
    AmbiguousBaseline {
        /// Current leaf count.
        leaves: usize,
    },
    /// The requested baseline changeset does not exist.
    #[error("unknown baseline changeset {}", short_hex(&.0.0))]
    UnknownBaseline(Csid),
    /// A trivial (append-only) store only accepts its sole leaf as baseline.
    /// Checked again at commit, so concurrent transactions cannot branch it.
    #[error("trivial store: baseline must be the current leaf")]
    TrivialStoreBranch,
    /// No template is in effect; records cannot be created or validated.
    #[error("store has no template in effect")]
    NoTemplate,
    /// The template in effect does not declare this record type.
    #[error("unknown record type: {0}")]
    UnknownRectype(String),
    /// A `single_rectype` store requires a template with exactly one type.
    #[error("single-rectype store requires a template with exactly one record type")]
    SingleRectypeTemplate,
    /// The record type does not declare this field.
    #[error("unknown field {rectype}.{field}")]
    UnknownField {
        /// Record type consulted.
        rectype: String,
        /// The missing field.
        field: String,
    },
    /// Immediate datatype mismatch on assignment.
    #[error("field {field} expects {expected}, got {got}")]
    WrongDatatype {
        /// Field assigned.
        field: String,
        /// Declared datatype name.
        expected: &'static str,
        /// Supplied value shape.
        got: &'static str,
    },
    /// Clearing a `required` field is rejected at assignment time.
    #[error("field {field} is required and cannot be cleared")]
    RequiredFieldCleared {
        /// Field assigned.
        field: String,
    },
    /// The record does not exist (or has the wrong type) at the baseline.
    #[error("no such record {rectype}[{}]", short_hex(&.recid.0))]
    NoSuchRecord {
        /// Record type requested.
        rectype: String,
        /// Record id requested.
        recid: Recid,
    },
    /// The record was already marked for deletion in this transaction.
    #[error("record {} is marked for deletion in this transaction", short_hex(&.0.0))]
    RecordMarkedDeleted(Recid),
    /// The record has not been created or opened in this transaction.
    #[error("record {} is not open in this transaction", short_hex(&.0.0))]
    RecordNotOpen(Recid),
    /// A structurally invalid template was supplied.
    #[error(transparent)]
    InvalidTemplate(#[from] TemplateError),
    /// DAG bookkeeping failure.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Canonical encoding failed (never expected for well-formed templates).
    #[error("canonical encoding failed: {0}")]
    Encode(&'static str),
}

/// A record being created or edited inside a transaction.
#[derive(Debug, Clone)]
pub(crate) struct PendingRecord {
    pub(crate) rectype: String,
    pub(crate) fields: BTreeMap<String, FieldValue>,
    pub(crate) created: bool,
}

/// Internal state of one live transaction.
#[derive(Debug, Clone)]
pub(crate) struct TxBody {
    pub(crate) baseline: Option<Csid>,
    pub(crate) user: UserIdent,
    pub(crate) at: Timestamp,
    pub(crate) baseline_state: BTreeMap<Recid, Hidrec>,
    pub(crate) pending: BTreeMap<Recid, PendingRecord>,
    pub(crate) deletes: BTreeSet<Recid>,
    pub(crate) new_template: Option<Template>,
    pub(crate) recid_seq: u64,
}

impl Store {
    /// Opens a mutation context rooted at `baseline` (or the sole current
    /// leaf).
    ///
    /// # Errors
    /// - [`TxError::AmbiguousBaseline`] when the store has several leaves and
    ///   none was specified.
    /// - [`TxError::UnknownBaseline`] when the explicit baseline is missing.
    /// - [`TxError::TrivialStoreBranch`] when a trivial store is given a
    ///   baseline other than its current leaf.
    pub fn begin(&mut self, opts: TxOptions) -> Result<TxId, TxError> {
        let baseline = self.resolve_baseline(opts.baseline)?;
        if self.config.trivial {
            if let Some(csid) = &baseline {
                if !self.graph.leaves().contains(csid) {
                    return Err(TxError::TrivialStoreBranch);
                }
            }
        }
        let baseline_state = match &baseline {
            None => BTreeMap::new(),
            Some(csid) => state::state_at(&self.graph, csid)?,
        };

        // Increment with wrap and ensure we never produce 0 (reserved invalid).
        self.tx_counter = self.tx_counter.wrapping_add(1);
        if self.tx_counter == 0 {
            self.tx_counter = 1;
        }
        let id = self.tx_counter;
        self.live_txs.insert(
            id,
            TxBody {
                baseline,
                user: opts.user.unwrap_or_else(UserIdent::anonymous),
                at: opts.at.unwrap_or_else(crate::audit::now),
                baseline_state,
                pending: BTreeMap::new(),
                deletes: BTreeSet::new(),
                new_template: None,
                recid_seq: 0,
            },
        );
        Ok(TxId::from_raw(id))
    }

    /// Allocates a new record of `rectype`, pre-populated with schema
    /// defaults, and returns its stable identifier.
    ///
    /// # Errors
    /// - [`TxError::TransactionNotActive`] for a closed or unknown `tx`.
    /// - [`TxError::NoTemplate`] / [`TxError::UnknownRectype`] when the
    ///   effective template cannot type the record.
    pub fn create(&mut self, tx: TxId, rectype: &str) -> Result<Recid, TxError> {
        let body = self.live_txs.get(&tx.value()).ok_or(TxError::TransactionNotActive)?;
        let template = self.effective_template(body)?;
        let Some(def) = template.get(rectype) else {
            return Err(TxError::UnknownRectype(rectype.to_owned()));
        };

        // Populate defaults against the values visible to this writer:
        // baseline state plus records pending in this transaction.
        let mut fields = BTreeMap::new();
        for (name, fd) in &def.fields {
            if let Some(value) = &fd.defaultvalue {
                fields.insert(name.clone(), value.clone());
            } else if let Some(func) = fd.defaultfunc {
                let taken = self.visible_values(body, rectype, name);
                let token = defaults::run(
                    func,
                    &body.user,
                    name,
                    body.baseline.as_ref(),
                    &|candidate| taken.contains(candidate),
                );
                fields.insert(name.clone(), FieldValue::Str(token));
            }
        }

        let Some(body) = self.live_txs.get_mut(&tx.value()) else {
            return Err(TxError::TransactionNotActive);
        };
        let mut recid = content::derive_recid(
            body.baseline.as_ref(),
            &body.user,
            body.at,
            tx.value(),
            body.recid_seq,
        );
        // Defensive: bump the sequence until the id is globally fresh.
        while recid == TEMPLATE_RECID
            || body.baseline_state.contains_key(&recid)
            || body.pending.contains_key(&recid)
        {
            body.recid_seq = body.recid_seq.wrapping_add(1);
            recid = content::derive_recid(
                body.baseline.as_ref(),
                &body.user,
                body.at,
                tx.value(),
                body.recid_seq,
            );
        }
        body.recid_seq = body.recid_seq.wrapping_add(1);
        body.pending.insert(
            recid,
            PendingRecord {
                rectype: rectype.to_owned(),
                fields,
                created: true,
            },
        );
        Ok(recid)
    }

    /// Loads the record's baseline snapshot into the transaction for editing.
    ///
    /// # Errors
    /// - [`TxError::NoSuchRecord`] when absent (or of a different type) at
    ///   the baseline.
    /// - [`TxError::RecordMarkedDeleted`] when this transaction already
    ///   marked it for deletion.
    pub fn open_record(&mut self, tx: TxId, rectype: &str, recid: Recid) -> Result<(), TxError> {
        let body = self.live_txs.get(&tx.value()).ok_or(TxError::TransactionNotActive)?;
        if body.deletes.contains(&recid) {
            return Err(TxError::RecordMarkedDeleted(recid));
        }
        if body.pending.contains_key(&recid) {
            // Already open (or freshly created): nothing to load.
            return Ok(());
        }
        let snapshot = self.baseline_snapshot(body, rectype, &recid)?;
        let pending = PendingRecord {
            rectype: snapshot.rectype.clone(),
            fields: snapshot.fields.clone(),
            created: false,
        };
        let Some(body) = self.live_txs.get_mut(&tx.value()) else {
            return Err(TxError::TransactionNotActive);
        };
        body.pending.insert(recid, pending);
        Ok(())
    }

    /// Marks a record for removal at commit.
    ///
    /// A record created earlier in the same transaction is simply dropped.
    ///
    /// # Errors
    /// [`TxError::NoSuchRecord`] when the record neither exists at the
    /// baseline nor is pending in this transaction.
    pub fn delete_record(&mut self, tx: TxId, rectype: &str, recid: Recid) -> Result<(), TxError> {
        let body = self.live_txs.get(&tx.value()).ok_or(TxError::TransactionNotActive)?;
        if body.deletes.contains(&recid) {
            return Err(TxError::RecordMarkedDeleted(recid));
        }
        let pending_created = body.pending.get(&recid).is_some_and(|p| p.created);
        let in_baseline = if pending_created {
            false
        } else {
            self.baseline_snapshot(body, rectype, &recid).map(|_| true)?
        };
        let Some(body) = self.live_txs.get_mut(&tx.value()) else {
            return Err(TxError::TransactionNotActive);
        };
        body.pending.remove(&recid);
        if in_baseline {
            body.deletes.insert(recid);
        }
        Ok(())
    }

    /// Assigns (or with `None` clears) a field on an open record.
    ///
    /// Type-checks immediately against the effective template: wrong
    /// datatype, unknown field, and clearing a `required` field all fail at
    /// the point of assignment, not at commit.
    pub fn set_field(
        &mut self,
        tx: TxId,
        recid: Recid,
        field: &str,
        value: Option<FieldValue>,
    ) -> Result<(), TxError> {
        let body = self.live_txs.get(&tx.value()).ok_or(TxError::TransactionNotActive)?;
        let Some(pending) = body.pending.get(&recid) else {
            return Err(TxError::RecordNotOpen(recid));
        };
        let rectype = pending.rectype.clone();
        let template = self.effective_template(body)?;
        let Some(def) = template.get(&rectype) else {
            return Err(TxError::UnknownRectype(rectype));
        };
        let Some(fd) = def.fields.get(field) else {
            return Err(TxError::UnknownField {
                rectype,
                field: field.to_owned(),
            });
        };
        match &value {
            Some(v) => {
                if !fd.datatype.admits(v) {
                    return Err(TxError::WrongDatatype {
                        field: field.to_owned(),
                        expected: fd.datatype.name(),
                        got: v.kind_name(),
                    });
                }
            }
            None => {
                if fd.constraints.required {
                    return Err(TxError::RequiredFieldCleared {
                        field: field.to_owned(),
                    });
                }
            }
        }
        let Some(body) = self.live_txs.get_mut(&tx.value()) else {
            return Err(TxError::TransactionNotActive);
        };
        let Some(pending) = body.pending.get_mut(&recid) else {
            return Err(TxError::RecordNotOpen(recid));
        };
        match value {
            Some(v) => {
                pending.fields.insert(field.to_owned(), v);
            }
            None => {
                pending.fields.remove(field);
            }
        }
        Ok(())
    }

    /// Reads a field's in-progress value from an open record.
    ///
    /// # Errors
    /// [`TxError::RecordNotOpen`] when the record is not part of this
    /// transaction.
    pub fn field(&self, tx: TxId, recid: Recid, field: &str) -> Result<Option<&FieldValue>, TxError> {
        let body = self.live_txs.get(&tx.value()).ok_or(TxError::TransactionNotActive)?;
        let Some(pending) = body.pending.get(&recid) else {
            return Err(TxError::RecordNotOpen(recid));
        };
        Ok(pending.fields.get(field))
    }

    /// Replaces the store's schema effective from the committing changeset.
    ///
    /// Prior changesets continue to be interpreted under the schema active
    /// when they were written.
    ///
    /// # Errors
    /// - [`TxError::InvalidTemplate`] for a structurally defective template.
    /// - [`TxError::SingleRectypeTemplate`] when a single-rectype store is
    ///   given a template with more than one record type.
    pub fn set_template(&mut self, tx: TxId, template: Template) -> Result<(), TxError> {
        template.validate()?;
        if self.config.single_rectype && template.sole_rectype().is_none() {
            return Err(TxError::SingleRectypeTemplate);
        }
        let body = self
            .live_txs
            .get_mut(&tx.value())
            .ok_or(TxError::TransactionNotActive)?;
        body.new_template = Some(template);
        Ok(())
    }

    /// Re-validates every touched record and materializes the changeset.
    ///
    /// Constraint violations are returned as [`CommitOutcome::Rejected`]
    /// with **no** state change; the transaction stays open. On success the
    /// content-addressed delta becomes a new leaf (or folds into an existing
    /// identical changeset) and the transaction closes.
    ///
    /// # Errors
    /// Programmer errors only ([`TxError::TransactionNotActive`],
    /// [`TxError::NoTemplate`], [`TxError::TrivialStoreBranch`] when another
    /// commit superseded a trivial store's leaf meanwhile, encoding
    /// failures); never constraint violations.
    pub fn commit(&mut self, tx: TxId) -> Result<CommitOutcome, TxError> {
        let body = self.live_txs.get(&tx.value()).ok_or(TxError::TransactionNotActive)?;
        // The begin-time leaf check is not enough for append-only stores: a
        // concurrent transaction from the same leaf may have committed since.
        if self.config.trivial {
            if let Some(csid) = &body.baseline {
                if !self.graph.leaves().contains(csid) {
                    return Err(TxError::TrivialStoreBranch);
                }
            }
        }
        let template = if body.pending.is_empty() {
            self.effective_template(body).ok().cloned()
        } else {
            Some(self.effective_template(body)?.clone())
        };

        if let Some(template) = &template {
            let violations = validate::validate_commit(self, body, template);
            if !violations.is_empty() {
                return Ok(CommitOutcome::Rejected(violations));
            }
        }

        // Assemble the delta and the blobs it references.
        let mut delta = Delta::default();
        let mut staged: Vec<(Hidrec, Blob)> = Vec::new();
        for (recid, pending) in &body.pending {
            let snapshot = RecordSnapshot::new(pending.rectype.clone(), pending.fields.clone());
            let hidrec = snapshot.hidrec();
            if body.baseline_state.get(recid) == Some(&hidrec) {
                continue; // opened but unchanged
            }
            staged.push((hidrec, Blob::Record(snapshot)));
            delta.writes.insert(*recid, hidrec);
        }
        for recid in &body.deletes {
            if body.baseline_state.contains_key(recid) {
                delta.deletes.insert(*recid);
            }
        }
        if let Some(new_template) = &body.new_template {
            let mut bytes = Vec::new();
            ciborium::into_writer(new_template, &mut bytes)
                .map_err(|_| TxError::Encode("template encoding failed"))?;
            let hidrec = content::hash_template_bytes(&bytes);
            if body.baseline_state.get(&TEMPLATE_RECID) != Some(&hidrec) {
                staged.push((hidrec, Blob::Template(new_template.clone())));
                delta.writes.insert(TEMPLATE_RECID, hidrec);
            }
        }

        if delta.is_empty() {
            if let Some(baseline) = body.baseline {
                // Nothing changed: the commit folds into its own baseline.
                self.live_txs.remove(&tx.value());
                return Ok(CommitOutcome::Committed(baseline));
            }
        }

        let parents: Vec<Csid> = body.baseline.into_iter().collect();
        let audit = Audit::new(body.user.clone(), body.at);
        let changeset = Changeset::new(parents, delta, audit);
        for (hidrec, blob) in staged {
            self.blobs.entry(hidrec).or_insert(blob);
        }
        let (csid, new_node) = self.graph.insert(changeset)?;
        self.live_txs.remove(&tx.value());
        tracing::debug!(
            csid = %short_hex(&csid.0),
            folded = !new_node,
            "committed changeset"
        );
        Ok(CommitOutcome::Committed(csid))
    }

    /// Discards all pending changes and closes the transaction.
    ///
    /// # Errors
    /// [`TxError::TransactionNotActive`] when called twice or after commit.
    pub fn abort(&mut self, tx: TxId) -> Result<(), TxError> {
        self.live_txs
            .remove(&tx.value())
            .map(|_| ())
            .ok_or(TxError::TransactionNotActive)
    }

    // ── internal helpers ────────────────────────────────────────────

    fn resolve_baseline(&self, explicit: Option<Csid>) -> Result<Option<Csid>, TxError> {
        match explicit {
            Some(csid) => {
                if !self.graph.contains(&csid) {
                    return Err(TxError::UnknownBaseline(csid));
                }
                Ok(Some(csid))
            }
            None => {
                let leaves = self.graph.leaves();
                match leaves.len() {
                    0 => Ok(None),
                    1 => Ok(leaves.iter().next().copied()),
                    n => Err(TxError::AmbiguousBaseline { leaves: n }),
                }
            }
        }
    }

    /// The template this transaction validates against: a pending
    /// `set_template`, else the baseline's.
    pub(crate) fn effective_template<'a>(
        &'a self,
        body: &'a TxBody,
    ) -> Result<&'a Template, TxError> {
        if let Some(t) = &body.new_template {
            return Ok(t);
        }
        let Some(hidrec) = body.baseline_state.get(&TEMPLATE_RECID) else {
            return Err(TxError::NoTemplate);
        };
        match self.blobs.get(hidrec) {
            Some(Blob::Template(t)) => Ok(t),
            _ => Err(TxError::Encode("template blob missing or mistyped")),
        }
    }

    fn baseline_snapshot(
        &self,
        body: &TxBody,
        rectype: &str,
        recid: &Recid,
    ) -> Result<&RecordSnapshot, TxError> {
        let missing = || TxError::NoSuchRecord {
            rectype: rectype.to_owned(),
            recid: *recid,
        };
        if *recid == TEMPLATE_RECID {
            return Err(missing());
        }
        let hidrec = body.baseline_state.get(recid).ok_or_else(missing)?;
        match self.blobs.get(hidrec) {
            Some(Blob::Record(snapshot)) if snapshot.rectype == rectype => Ok(snapshot),
            _ => Err(missing()),
        }
    }

    /// All values of `rectype.field` visible to this writer: the baseline
    /// state plus records pending in the transaction.
    fn visible_values(&self, body: &TxBody, rectype: &str, field: &str) -> BTreeSet<String> {
        let mut taken = BTreeSet::new();
        for (recid, hidrec) in &body.baseline_state {
            if body.pending.contains_key(recid) || body.deletes.contains(recid) {
                continue;
            }
            if let Some(Blob::Record(snapshot)) = self.blobs.get(hidrec) {
                if snapshot.rectype == rectype {
                    if let Some(FieldValue::Str(s)) = snapshot.fields.get(field) {
                        taken.insert(s.clone());
                    }
                }
            }
        }
        for pending in body.pending.values() {
            if pending.rectype == rectype {
                if let Some(FieldValue::Str(s)) = pending.fields.get(field) {
                    taken.insert(s.clone());
                }
            }
        }
        taken
    }
}
