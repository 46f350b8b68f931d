// SPDX-License-Identifier: Apache-2.0
//! Identifier and timestamp primitives shared by schema values and the engine.

/// Canonical 256-bit digest used for content addressing throughout Cairn.
///
/// `cairn-schema` never computes digests; the engine derives them with BLAKE3
/// over domain-separated canonical byte streams. The alias lives here so that
/// schema values ([`crate::FieldValue::Reference`], [`crate::FieldValue::Dagnode`])
/// can carry ids without depending on the engine crate.
pub type Digest = [u8; 32];

/// Stable logical identifier of a record across all of its versions.
///
/// A `Recid` is allocated once, when the record is created inside a
/// transaction, and never changes — unlike the content hash of any particular
/// snapshot of the record's fields.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Recid(pub Digest);

impl Recid {
    /// Returns the canonical byte representation of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &Digest {
        &self.0
    }
}

/// Content-addressed identifier of a changeset (one immutable DAG node).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Csid(pub Digest);

impl Csid {
    /// Returns the canonical byte representation of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &Digest {
        &self.0
    }
}

/// Acting-user identifier recorded in audits and `user` field values.
///
/// Cairn treats user identity as an opaque token; resolving a `UserIdent` to a
/// display name is the job of whatever user registry the embedding
/// application maintains (see the query engine's username projection).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserIdent(pub String);

impl UserIdent {
    /// Wraps a raw identity token.
    #[must_use]
    pub fn new(ident: impl Into<String>) -> Self {
        Self(ident.into())
    }

    /// The distinguished identity used when a caller supplies no acting user.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    /// Returns the raw identity token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for UserIdent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Audit entries and `datetime` field values share this representation so the
/// merge engine can compare edit times and field values with one ordering.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Constructs a timestamp from raw epoch milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the raw epoch-millisecond value.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
