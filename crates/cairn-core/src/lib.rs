// SPDX-License-Identifier: Apache-2.0
//! cairn-core: schema-driven multi-version record store.
//!
//! A [`Store`] holds an append-only DAG of immutable, content-addressed
//! changesets. Writers open transactions against a baseline changeset and
//! commit new leaves; divergent leaves are reconciled by [`Store::merge`]
//! with field-level auto-merge policies and post-merge uniqueness repair.
//! Reads go through the query engine, a pure function of (changeset,
//! effective template).
//!
//! Determinism contract: every identity in the store — changeset ids, record
//! content hashes, generated default values — is a BLAKE3 digest of a
//! domain-separated canonical byte stream. Identical edits from independent
//! writers therefore produce identical changesets and fold into one DAG node.
#![forbid(unsafe_code)]

mod audit;
mod changeset;
mod constants;
mod content;
mod defaults;
mod expr;
mod graph;
mod ident;
mod merge;
mod query;
mod record;
mod state;
mod store;
mod tx;
mod validate;

// Re-exports for stable public API
/// Audit entry attached to a changeset (acting user + timestamp).
pub use audit::{Audit, now};
/// Changeset node and its delta.
pub use changeset::{Changeset, Delta};
/// Reserved identifiers.
pub use constants::TEMPLATE_RECID;
/// Changeset DAG operations and errors.
pub use graph::{ChangesetGraph, GraphError};
/// Canonical digest and id types (schema ids re-exported for convenience).
pub use ident::{Digest, Hidrec, short_hex};
/// Merge engine surface.
pub use merge::{ConflictReason, MergeConflict, MergeError, MergeOptions, MergeOutcome};
/// Query engine surface.
pub use query::{FieldSel, QueryError, QuerySpec, QueryValue, Row, SortKey};
/// Filter-expression parse errors.
pub use expr::ExprError;
/// Record snapshots and history entries.
pub use record::{HistoryEntry, RecordSnapshot};
/// The store facade: configuration, blobs, and the user directory seam.
pub use store::{Blob, Store, StoreConfig, UserDirectory};
/// Transaction surface.
pub use tx::{CommitOutcome, ConstraintViolation, TxError, TxId, TxOptions};

pub use cairn_schema::{
    ConstraintKind, Constraints, Csid, Datatype, DefaultFunc, FieldDef, FieldValue, JournalSpec,
    MergeOp, MergePolicy, Recid, RectypeDef, Template, TemplateError, Timestamp, UniqifyOp,
    UniqifySpec, UniqifyWhich, UserIdent, Violation,
};
