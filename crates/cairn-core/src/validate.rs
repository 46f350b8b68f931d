// SPDX-License-Identifier: Apache-2.0
//! Commit-time validation: constraint checks over every touched record.
//!
//! Pure value-level checks live in `cairn_schema::Constraints`; this module
//! adds the two checks that need resolved store state (`unique` and
//! reference-target existence) and qualifies every violation with the record
//! it occurred on.

use std::collections::BTreeMap;

use cairn_schema::{ConstraintKind, Datatype, FieldValue, Recid, Template, Violation};

use crate::store::{Blob, Store};
use crate::tx::{ConstraintViolation, TxBody};

/// Value-level constraint check of one snapshot, qualified by record.
///
/// Fields the record type does not declare are reported as datatype
/// violations (they can only appear after a mid-transaction template swap).
pub(crate) fn check_snapshot_values(
    template: &Template,
    recid: Recid,
    rectype: &str,
    fields: &BTreeMap<String, FieldValue>,
) -> Vec<ConstraintViolation> {
    let mut out = Vec::new();
    let Some(def) = template.get(rectype) else {
        out.push(qualified(
            recid,
            rectype,
            Violation {
                field: String::new(),
                kind: ConstraintKind::Datatype,
                message: "record type not declared by template".to_owned(),
            },
        ));
        return out;
    };
    for (name, fd) in &def.fields {
        for violation in fd.constraints.check(name, &fd.datatype, fields.get(name)) {
            out.push(qualified(recid, rectype, violation));
        }
    }
    for name in fields.keys() {
        if !def.fields.contains_key(name) {
            out.push(qualified(
                recid,
                rectype,
                Violation {
                    field: name.clone(),
                    kind: ConstraintKind::Datatype,
                    message: "field not declared by template".to_owned(),
                },
            ));
        }
    }
    out
}

/// Full commit validation: value checks plus `unique` and reference targets,
/// evaluated against the state the store would have after this commit.
pub(crate) fn validate_commit(
    store: &Store,
    body: &TxBody,
    template: &Template,
) -> Vec<ConstraintViolation> {
    let mut out = Vec::new();

    for (recid, pending) in &body.pending {
        out.extend(check_snapshot_values(
            template,
            *recid,
            &pending.rectype,
            &pending.fields,
        ));

        let Some(def) = template.get(&pending.rectype) else {
            continue;
        };
        for (name, fd) in &def.fields {
            let Some(value) = pending.fields.get(name) else {
                continue;
            };
            if fd.constraints.unique
                && collides(store, body, *recid, &pending.rectype, name, value)
            {
                out.push(qualified(
                    *recid,
                    &pending.rectype,
                    Violation {
                        field: name.clone(),
                        kind: ConstraintKind::Unique,
                        message: format!("{value} is already in use"),
                    },
                ));
            }
            if let (Datatype::Reference { rectype: target }, FieldValue::Reference(rid)) =
                (&fd.datatype, value)
            {
                if let Some(message) = dangling(store, body, target, rid) {
                    out.push(qualified(
                        *recid,
                        &pending.rectype,
                        Violation {
                            field: name.clone(),
                            kind: ConstraintKind::Reference,
                            message,
                        },
                    ));
                }
            }
        }
    }

    out
}

fn qualified(recid: Recid, rectype: &str, violation: Violation) -> ConstraintViolation {
    ConstraintViolation {
        recid,
        rectype: rectype.to_owned(),
        violation,
    }
}

/// Does any *other* record of `rectype`, live after this commit, hold the
/// same value for `field`?
fn collides(
    store: &Store,
    body: &TxBody,
    recid: Recid,
    rectype: &str,
    field: &str,
    value: &FieldValue,
) -> bool {
    for (other, pending) in &body.pending {
        if *other != recid
            && pending.rectype == rectype
            && pending.fields.get(field) == Some(value)
        {
            return true;
        }
    }
    for (other, hidrec) in &body.baseline_state {
        if *other == recid
            || body.pending.contains_key(other)
            || body.deletes.contains(other)
        {
            continue;
        }
        if let Some(Blob::Record(snapshot)) = store.blobs.get(hidrec) {
            if snapshot.rectype == rectype && snapshot.fields.get(field) == Some(value) {
                return true;
            }
        }
    }
    false
}

/// `Some(reason)` when `rid` would not resolve to a live record of `target`
/// after this commit.
fn dangling(store: &Store, body: &TxBody, target: &str, rid: &Recid) -> Option<String> {
    if body.deletes.contains(rid) {
        return Some("reference target is deleted in this transaction".to_owned());
    }
    if let Some(pending) = body.pending.get(rid) {
        if pending.rectype == target {
            return None;
        }
        return Some(format!(
            "reference target is a {}, expected {target}",
            pending.rectype
        ));
    }
    if let Some(hidrec) = body.baseline_state.get(rid) {
        if let Some(Blob::Record(snapshot)) = store.blobs.get(hidrec) {
            if snapshot.rectype == target {
                return None;
            }
            return Some(format!(
                "reference target is a {}, expected {target}",
                snapshot.rectype
            ));
        }
    }
    Some("reference target does not exist".to_owned())
}
