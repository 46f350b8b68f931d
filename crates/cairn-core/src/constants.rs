// SPDX-License-Identifier: Apache-2.0
//! Reserved identifiers.

use cairn_schema::Recid;

/// Reserved recid under which template content is stored.
///
/// Templates are ordinary versioned content: a schema change writes a new
/// template blob into the committing changeset's delta under this recid, and
/// the template in effect at any changeset is resolved by the same state
/// machinery records use. The all-zero id cannot collide with allocated
/// recids, which are BLAKE3 digests of non-empty seeds.
pub const TEMPLATE_RECID: Recid = Recid([0u8; 32]);
