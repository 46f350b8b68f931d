// SPDX-License-Identifier: Apache-2.0
//! Canonical byte streams and content addressing.
//!
//! Determinism contract
//! - Every identity is a BLAKE3 digest over a domain-separated canonical byte
//!   stream (`b"cs:v1\0"`, `b"rec:v1\0"`, ...). Changing any encoding rule
//!   here is a breaking change to store identity.
//! - All counts and lengths are 8-byte little-endian; ids are raw 32-byte
//!   values; strings are length-prefixed UTF-8 bytes.
//! - Map-shaped content (field maps, delta writes) is encoded in ascending
//!   key order. The in-memory structures are `BTreeMap`s, so iteration order
//!   is already canonical; no explicit sort is needed.

use std::collections::BTreeMap;

use blake3::Hasher;
use cairn_schema::{Csid, FieldValue, Recid, Timestamp, UserIdent};

use crate::changeset::Delta;
use crate::ident::Hidrec;

fn update_len(hasher: &mut Hasher, len: usize) {
    hasher.update(&(len as u64).to_le_bytes());
}

fn update_str(hasher: &mut Hasher, s: &str) {
    update_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

/// Encodes one field value with a one-byte variant tag.
fn update_value(hasher: &mut Hasher, value: &FieldValue) {
    match value {
        FieldValue::Int(n) => {
            hasher.update(&[1u8]);
            hasher.update(&n.to_le_bytes());
        }
        FieldValue::Str(s) => {
            hasher.update(&[2u8]);
            update_str(hasher, s);
        }
        FieldValue::Bool(b) => {
            hasher.update(&[3u8, u8::from(*b)]);
        }
        FieldValue::Datetime(ts) => {
            hasher.update(&[4u8]);
            hasher.update(&ts.as_millis().to_le_bytes());
        }
        FieldValue::Reference(recid) => {
            hasher.update(&[5u8]);
            hasher.update(&recid.0);
        }
        FieldValue::User(user) => {
            hasher.update(&[6u8]);
            update_str(hasher, user.as_str());
        }
        FieldValue::Attachment(handle) => {
            hasher.update(&[7u8]);
            update_str(hasher, handle);
        }
        FieldValue::Dagnode(csid) => {
            hasher.update(&[8u8]);
            hasher.update(&csid.0);
        }
    }
}

/// Content hash of a record snapshot: rectype plus field map.
#[must_use]
pub(crate) fn hash_snapshot(rectype: &str, fields: &BTreeMap<String, FieldValue>) -> Hidrec {
    let mut hasher = Hasher::new();
    hasher.update(b"rec:v1\0");
    update_str(&mut hasher, rectype);
    update_len(&mut hasher, fields.len());
    for (name, value) in fields {
        update_str(&mut hasher, name);
        update_value(&mut hasher, value);
    }
    Hidrec(hasher.finalize().into())
}

/// Content hash of encoded template bytes.
#[must_use]
pub(crate) fn hash_template_bytes(bytes: &[u8]) -> Hidrec {
    let mut hasher = Hasher::new();
    hasher.update(b"tmpl:v1\0");
    update_len(&mut hasher, bytes.len());
    hasher.update(bytes);
    Hidrec(hasher.finalize().into())
}

/// Changeset identity: a pure function of parents and delta.
///
/// Audits are deliberately excluded so that identical edits from different
/// writers produce the same `Csid` and fold into one node. Parents are
/// encoded in ascending id order regardless of the order the caller supplied
/// them in.
#[must_use]
pub(crate) fn hash_changeset(parents: &[Csid], delta: &Delta) -> Csid {
    let mut sorted: Vec<&Csid> = parents.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Hasher::new();
    hasher.update(b"cs:v1\0");
    update_len(&mut hasher, sorted.len());
    for parent in sorted {
        hasher.update(&parent.0);
    }
    update_len(&mut hasher, delta.writes.len());
    for (recid, hidrec) in &delta.writes {
        hasher.update(&recid.0);
        hasher.update(&hidrec.0);
    }
    update_len(&mut hasher, delta.deletes.len());
    for recid in &delta.deletes {
        hasher.update(&recid.0);
    }
    Csid(hasher.finalize().into())
}

/// Allocates a fresh record identifier.
///
/// The seed binds the allocating writer (user, transaction, per-transaction
/// sequence, wall time) and the baseline so that independent writers do not
/// collide; if two writers somehow produce the same seed they are making the
/// same edit and the resulting changesets fold anyway.
#[must_use]
pub(crate) fn derive_recid(
    baseline: Option<&Csid>,
    user: &UserIdent,
    at: Timestamp,
    tx: u64,
    seq: u64,
) -> Recid {
    let mut hasher = Hasher::new();
    hasher.update(b"recid:v1\0");
    match baseline {
        None => {
            hasher.update(&[0u8]);
        }
        Some(csid) => {
            hasher.update(&[1u8]);
            hasher.update(&csid.0);
        }
    }
    update_str(&mut hasher, user.as_str());
    hasher.update(&at.as_millis().to_le_bytes());
    hasher.update(&tx.to_le_bytes());
    hasher.update(&seq.to_le_bytes());
    Recid(hasher.finalize().into())
}

/// Deterministic token stream for generated default values.
///
/// Each `(seed, attempt)` pair yields a short lowercase hex token; callers
/// bump `attempt` until the token passes their collision check.
#[must_use]
pub(crate) fn generated_token(seed: &[&[u8]], attempt: u64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(b"genval:v1\0");
    for part in seed {
        update_len(&mut hasher, part.len());
        hasher.update(part);
    }
    hasher.update(&attempt.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    hex::encode(&digest[..5])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_hash_ignores_insertion_history() {
        let mut a = BTreeMap::new();
        a.insert("x".to_owned(), FieldValue::Int(1));
        a.insert("y".to_owned(), FieldValue::Int(2));
        let mut b = BTreeMap::new();
        b.insert("y".to_owned(), FieldValue::Int(2));
        b.insert("x".to_owned(), FieldValue::Int(1));
        assert_eq!(hash_snapshot("bug", &a), hash_snapshot("bug", &b));
    }

    #[test]
    fn snapshot_hash_binds_rectype() {
        let fields = BTreeMap::new();
        assert_ne!(hash_snapshot("bug", &fields), hash_snapshot("user", &fields));
    }

    #[test]
    fn changeset_hash_is_parent_order_invariant() {
        let p1 = Csid([1; 32]);
        let p2 = Csid([2; 32]);
        let delta = Delta::default();
        assert_eq!(
            hash_changeset(&[p1, p2], &delta),
            hash_changeset(&[p2, p1], &delta)
        );
    }

    #[test]
    fn generated_tokens_vary_by_attempt() {
        let seed: [&[u8]; 1] = [b"field"];
        assert_ne!(generated_token(&seed, 0), generated_token(&seed, 1));
        assert_eq!(generated_token(&seed, 0).len(), 10);
    }
}
