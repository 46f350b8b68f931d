// SPDX-License-Identifier: Apache-2.0
//! The store: one handle owning the DAG, the blob table, and live
//! transactions.
//!
//! All mutation goes through the transaction surface in `tx` and the merge
//! engine in `merge`; all reading goes through the query engine in `query`.
//! This module holds the shared state and the read plumbing those engines
//! build on.

use std::collections::{BTreeMap, BTreeSet};

use cairn_schema::{Csid, Recid, Template, UserIdent};
use rustc_hash::FxHashMap;

use crate::constants::TEMPLATE_RECID;
use crate::graph::{ChangesetGraph, GraphError};
use crate::ident::Hidrec;
use crate::query::QueryError;
use crate::record::RecordSnapshot;
use crate::state;
use crate::tx::TxBody;

/// Store-wide behavior switches, fixed at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreConfig {
    /// Append-only bookkeeping: commits must extend the current leaf and
    /// `merge` is refused, so the DAG stays a chain.
    pub trivial: bool,
    /// The template must declare exactly one record type.
    pub single_rectype: bool,
}

impl StoreConfig {
    /// Default configuration: branching allowed, any number of rectypes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the store append-only (single chain, no merges).
    #[must_use]
    pub const fn trivial(mut self, yes: bool) -> Self {
        self.trivial = yes;
        self
    }

    /// Restricts templates to exactly one record type.
    #[must_use]
    pub const fn single_rectype(mut self, yes: bool) -> Self {
        self.single_rectype = yes;
        self
    }
}

/// Content stored in the blob table, keyed by [`Hidrec`].
///
/// The template lives in the same table as record snapshots, written under
/// the reserved [`TEMPLATE_RECID`], so schema changes version exactly like
/// record changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Blob {
    /// An ordinary record snapshot.
    Record(RecordSnapshot),
    /// A schema template (kept decoded; its hash covers the CBOR encoding).
    Template(Template),
}

/// Caller-provided mapping from user identifiers to display names.
///
/// Consulted by the query engine's username projection; identities the
/// directory does not know fall back to the raw identifier.
pub trait UserDirectory {
    /// Display name for `ident`, when known.
    fn username(&self, ident: &UserIdent) -> Option<String>;
}

/// A schema-driven, multi-version record store.
///
/// The store owns an append-only DAG of content-addressed changesets, a blob
/// table of record snapshots, and the set of live transactions. It is a plain
/// in-memory value; callers wanting shared access wrap it themselves.
pub struct Store {
    pub(crate) config: StoreConfig,
    pub(crate) graph: ChangesetGraph,
    pub(crate) blobs: BTreeMap<Hidrec, Blob>,
    pub(crate) live_txs: FxHashMap<u64, TxBody>,
    pub(crate) tx_counter: u64,
    pub(crate) user_directory: Option<Box<dyn UserDirectory + Send + Sync>>,
}

impl core::fmt::Debug for Store {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("changesets", &self.graph.len())
            .field("blobs", &self.blobs.len())
            .field("live_txs", &self.live_txs.len())
            .finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    /// An empty store.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            graph: ChangesetGraph::new(),
            blobs: BTreeMap::new(),
            live_txs: FxHashMap::default(),
            tx_counter: 0,
            user_directory: None,
        }
    }

    /// Installs the user directory consulted by username projections.
    pub fn set_user_directory(&mut self, directory: Box<dyn UserDirectory + Send + Sync>) {
        self.user_directory = Some(directory);
    }

    /// The store's configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read access to the changeset DAG.
    #[must_use]
    pub const fn graph(&self) -> &ChangesetGraph {
        &self.graph
    }

    /// Current leaves (heads) in ascending id order.
    #[must_use]
    pub fn get_leaves(&self) -> Vec<Csid> {
        self.graph.leaves().iter().copied().collect()
    }

    /// Changesets a replica holding `frontier` as its leaf set is missing.
    #[must_use]
    pub fn new_nodes_since(&self, frontier: &BTreeSet<Csid>) -> BTreeSet<Csid> {
        self.graph.new_nodes_since(frontier)
    }

    /// The template in effect at `as_of` (or at the sole leaf).
    ///
    /// `Ok(None)` when the store (or that changeset's history) has no
    /// template yet.
    ///
    /// # Errors
    /// [`QueryError::AmbiguousHead`] when no changeset was named and several
    /// leaves exist; [`QueryError::Graph`] for a missing `as_of`.
    pub fn template_at(&self, as_of: Option<&Csid>) -> Result<Option<&Template>, QueryError> {
        let Some(csid) = self.resolve_head(as_of)? else {
            return Ok(None);
        };
        let state = state::state_at(&self.graph, &csid)?;
        Ok(self.template_in_state(&state))
    }

    // ── plumbing shared by tx / merge / query ───────────────────────

    /// `as_of` when given, else the sole leaf; `Ok(None)` for an empty store.
    pub(crate) fn resolve_head(&self, as_of: Option<&Csid>) -> Result<Option<Csid>, QueryError> {
        if let Some(csid) = as_of {
            if !self.graph.contains(csid) {
                return Err(QueryError::Graph(GraphError::UnknownChangeset(*csid)));
            }
            return Ok(Some(*csid));
        }
        let leaves = self.graph.leaves();
        match leaves.len() {
            0 => Ok(None),
            1 => Ok(leaves.iter().next().copied()),
            n => Err(QueryError::AmbiguousHead { leaves: n }),
        }
    }

    /// Resolved state at `csid`.
    pub(crate) fn state_at(&self, csid: &Csid) -> Result<state::ResolvedState, GraphError> {
        state::state_at(&self.graph, csid)
    }

    /// Decoded template found in a resolved state, if any.
    pub(crate) fn template_in_state(
        &self,
        state: &BTreeMap<Recid, Hidrec>,
    ) -> Option<&Template> {
        let hidrec = state.get(&TEMPLATE_RECID)?;
        match self.blobs.get(hidrec) {
            Some(Blob::Template(t)) => Some(t),
            _ => None,
        }
    }

    /// Record snapshot for a blob hash, when it is a record.
    pub(crate) fn snapshot(&self, hidrec: &Hidrec) -> Option<&RecordSnapshot> {
        match self.blobs.get(hidrec) {
            Some(Blob::Record(snapshot)) => Some(snapshot),
            _ => None,
        }
    }
}
