// SPDX-License-Identifier: Apache-2.0
//! Audit entries: who committed a changeset, and when.

use cairn_schema::{Timestamp, UserIdent};

/// One audit entry on a changeset.
///
/// A changeset usually carries exactly one audit. It accumulates more when a
/// later commit is recognized as content-identical to an existing node and is
/// folded into it instead of being duplicated; every folded writer leaves an
/// audit behind.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Audit {
    /// Acting user recorded for the commit.
    pub user: UserIdent,
    /// Commit time, epoch milliseconds.
    pub at: Timestamp,
}

impl Audit {
    /// Constructs an audit entry.
    #[must_use]
    pub fn new(user: UserIdent, at: Timestamp) -> Self {
        Self { user, at }
    }
}

/// Current wall-clock time as a [`Timestamp`].
///
/// Callers that need reproducible histories (tests, replays) pass explicit
/// timestamps through [`crate::TxOptions`] and [`crate::MergeOptions`]
/// instead of relying on this.
#[must_use]
pub fn now() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(Timestamp::from_millis(0), |d| {
            Timestamp::from_millis(d.as_millis() as u64)
        })
}
