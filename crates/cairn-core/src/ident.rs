// SPDX-License-Identifier: Apache-2.0
//! Identifier types and hex display helpers.
//!
//! The id newtypes themselves ([`cairn_schema::Recid`], [`cairn_schema::Csid`])
//! live in the schema crate so field values can carry them; this module adds
//! the engine-only [`Hidrec`] content hash and display plumbing.

pub use cairn_schema::Digest;

/// Content hash of one record snapshot (a typed field-value map).
///
/// A record's [`cairn_schema::Recid`] is stable across versions; each distinct
/// snapshot of its fields has a distinct `Hidrec`. Identical field maps hash
/// identically regardless of which writer produced them.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hidrec(pub Digest);

impl Hidrec {
    /// Returns the canonical byte representation of this hash.
    #[must_use]
    pub fn as_bytes(&self) -> &Digest {
        &self.0
    }
}

/// Abbreviated lowercase hex of a digest, for logs and error messages.
#[must_use]
pub fn short_hex(digest: &Digest) -> String {
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hex_is_twelve_chars() {
        let d: Digest = [0xab; 32];
        assert_eq!(short_hex(&d), "abababababab");
    }
}
