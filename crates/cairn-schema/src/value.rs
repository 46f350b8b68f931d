// SPDX-License-Identifier: Apache-2.0
//! Field datatypes and the tagged value union.

use core::cmp::Ordering;

use crate::ident::{Csid, Recid, Timestamp, UserIdent};

/// Declared datatype of a record field.
///
/// `Reference` carries the record type its targets must have; the engine
/// enforces that at commit time against the resolved state, because the
/// schema layer cannot see records.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Datatype {
    /// Signed 64-bit integer.
    Int,
    /// UTF-8 string.
    Str,
    /// Boolean.
    Bool,
    /// Epoch-millisecond datetime.
    Datetime,
    /// Reference to another record's [`Recid`], constrained by record type.
    Reference {
        /// Record type the referenced record must have.
        rectype: String,
    },
    /// Opaque user identity token.
    User,
    /// Opaque handle into an external blob store (attachment mechanics are
    /// out of scope for the record engine; the handle is validated only for
    /// length constraints).
    Attachment,
    /// Opaque reference to a changeset in some store's DAG.
    Dagnode,
}

impl Datatype {
    /// Returns `true` when `value` is an inhabitant of this datatype.
    ///
    /// Reference target *types* are not checked here — only the value shape.
    #[must_use]
    pub fn admits(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (Self::Int, FieldValue::Int(_))
                | (Self::Str, FieldValue::Str(_))
                | (Self::Bool, FieldValue::Bool(_))
                | (Self::Datetime, FieldValue::Datetime(_))
                | (Self::Reference { .. }, FieldValue::Reference(_))
                | (Self::User, FieldValue::User(_))
                | (Self::Attachment, FieldValue::Attachment(_))
                | (Self::Dagnode, FieldValue::Dagnode(_))
        )
    }

    /// Short lowercase name used in error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Str => "string",
            Self::Bool => "bool",
            Self::Datetime => "datetime",
            Self::Reference { .. } => "reference",
            Self::User => "userid",
            Self::Attachment => "attachment",
            Self::Dagnode => "dagnode",
        }
    }
}

/// A single typed field value.
///
/// Records are maps from field name to `FieldValue`; an *absent* entry means
/// the optional field is unset. There is deliberately no `Null` variant —
/// absence is represented at the map level so that snapshots hash canonically.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldValue {
    /// Signed 64-bit integer.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Epoch-millisecond datetime.
    Datetime(Timestamp),
    /// Reference to another record.
    Reference(Recid),
    /// Opaque user identity.
    User(UserIdent),
    /// Opaque attachment handle.
    Attachment(String),
    /// Opaque changeset reference.
    Dagnode(Csid),
}

impl FieldValue {
    /// Short lowercase name of the value's shape, for error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::Datetime(_) => "datetime",
            Self::Reference(_) => "reference",
            Self::User(_) => "userid",
            Self::Attachment(_) => "attachment",
            Self::Dagnode(_) => "dagnode",
        }
    }

    /// Numeric view used by `min`/`max` constraints and aggregate merge ops.
    ///
    /// Datetimes participate as their epoch-millisecond value (lossless for
    /// any realistic timestamp).
    #[must_use]
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            #[allow(clippy::cast_possible_wrap)]
            Self::Datetime(ts) => Some(ts.as_millis() as i64),
            _ => None,
        }
    }

    /// String view used by length constraints and `longest`/`shortest` ops.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Attachment(s) => Some(s),
            Self::User(u) => Some(u.as_str()),
            _ => None,
        }
    }

    /// Total order within one value kind; `None` across kinds.
    ///
    /// This is the natural order the query engine sorts by (unless the field
    /// declares `sort_by_allowed`): numeric for ints and datetimes,
    /// lexicographic for strings, `false < true` for bools, byte order for
    /// opaque ids.
    #[must_use]
    pub fn cmp_same_kind(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) | (Self::Attachment(a), Self::Attachment(b)) => {
                Some(a.cmp(b))
            }
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Datetime(a), Self::Datetime(b)) => Some(a.cmp(b)),
            (Self::Reference(a), Self::Reference(b)) => Some(a.0.cmp(&b.0)),
            (Self::User(a), Self::User(b)) => Some(a.cmp(b)),
            (Self::Dagnode(a), Self::Dagnode(b)) => Some(a.0.cmp(&b.0)),
            _ => None,
        }
    }
}

impl core::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) | Self::Attachment(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Datetime(ts) => write!(f, "{ts}"),
            Self::Reference(r) => write_short_hex(f, &r.0),
            Self::User(u) => f.write_str(u.as_str()),
            Self::Dagnode(c) => write_short_hex(f, &c.0),
        }
    }
}

fn write_short_hex(f: &mut core::fmt::Formatter<'_>, bytes: &[u8; 32]) -> core::fmt::Result {
    for byte in &bytes[..6] {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}
