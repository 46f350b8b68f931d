// SPDX-License-Identifier: Apache-2.0
//! cairn-schema: shared schema types for the Cairn versioned record store.
//!
//! A [`Template`] describes the record types a store may hold: for each type,
//! the set of fields, their datatypes, validation constraints, and the
//! policies the merge engine applies when divergent leaves are reconciled.
//! Templates are plain data — they are serialized (canonical CBOR, by the
//! engine) and stored as versioned content in the same changeset graph as the
//! records they govern.
//!
//! Nothing in this crate hashes, performs I/O, or touches a store. Constraint
//! checks that need store state (`unique`, reference-target existence) are
//! declared here but enforced by `cairn-core`.
#![forbid(unsafe_code)]

mod constraint;
mod ident;
mod policy;
mod template;
mod value;

pub use constraint::{ConstraintKind, Constraints, Violation};
pub use ident::{Csid, Digest, Recid, Timestamp, UserIdent};
pub use policy::{DefaultFunc, JournalSpec, MergeOp, MergePolicy, UniqifyOp, UniqifySpec, UniqifyWhich};
pub use template::{FieldDef, RectypeDef, Template, TemplateError};
pub use value::{Datatype, FieldValue};
