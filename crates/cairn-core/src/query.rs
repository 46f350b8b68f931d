// SPDX-License-Identifier: Apache-2.0
//! The query engine: filter, sort, paginate, project.
//!
//! A query is a pure function of `(changeset, effective template)`: the same
//! spec against the same changeset always yields the same rows in the same
//! order, regardless of insertion history or replica. Historical queries are
//! just queries with an explicit `as_of`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use cairn_schema::{Csid, Datatype, FieldDef, FieldValue, Recid, RectypeDef, Template, Timestamp};
use thiserror::Error;

use crate::constants::TEMPLATE_RECID;
use crate::expr::{self, ExprError};
use crate::graph::GraphError;
use crate::ident::Hidrec;
use crate::record::{HistoryEntry, RecordSnapshot};
use crate::state;
use crate::store::Store;

/// Query errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Several leaves exist and no `as_of` changeset was named.
    #[error("ambiguous head: store has {leaves} leaves, name a changeset")]
    AmbiguousHead {
        /// Current leaf count.
        leaves: usize,
    },
    /// No template is in effect at the queried changeset.
    #[error("no template in effect at the queried changeset")]
    NoTemplate,
    /// The effective template does not declare this record type.
    #[error("unknown record type: {0}")]
    UnknownRectype(String),
    /// No record type was named and the template declares several.
    #[error("record type is ambiguous: the template declares several")]
    AmbiguousRectype,
    /// A projection or sort key names a field the record type lacks.
    #[error("unknown field {rectype}.{field}")]
    UnknownField {
        /// Record type consulted.
        rectype: String,
        /// The missing field.
        field: String,
    },
    /// A username projection on a field that is not of the user datatype.
    #[error("field {0} is not a user field")]
    NotAUserField(String),
    /// A reference traversal on a field that is not a reference.
    #[error("field {0} is not a reference field")]
    NotAReferenceField(String),
    /// Filter expression failed to parse.
    #[error(transparent)]
    Expr(#[from] ExprError),
    /// DAG lookup failure.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// One projected column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSel {
    /// Every declared field, each under its own name.
    All,
    /// One field under its own name.
    Field(String),
    /// One field under a different output name.
    Alias {
        /// Field projected.
        field: String,
        /// Output column name.
        alias: String,
    },
    /// The record's full version chain, newest-first, under `history`.
    History,
    /// Timestamp of the record's newest version, under `last_timestamp`.
    LastTimestamp,
    /// Display name for a user field, resolved through the store's user
    /// directory (raw identifier when unknown or no directory installed).
    Username {
        /// The user-typed field.
        field: String,
    },
    /// Follows a reference field outward, inlining fields of the target
    /// record under the reference field's name.
    FromMe {
        /// The reference field to follow.
        field: String,
        /// Fields of the target to inline.
        select: Vec<String>,
    },
    /// Follows references inward: records of `rectype` whose `field` points
    /// at this record, inlined under `"{rectype}.{field}"`.
    ToMe {
        /// Referring record type.
        rectype: String,
        /// The reference field on the referring type.
        field: String,
        /// Fields of each referrer to inline.
        select: Vec<String>,
    },
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field sorted on.
    pub field: String,
    /// Reverse the order.
    pub descending: bool,
}

impl SortKey {
    /// Ascending sort on `field`.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    /// Descending sort on `field`.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// A query: which records, which columns, in what order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySpec {
    /// Record type queried; may be omitted for single-rectype templates.
    pub rectype: Option<String>,
    /// Projections; empty means [`FieldSel::All`].
    pub select: Vec<FieldSel>,
    /// Filter expression (see the `expr` grammar); `None` keeps everything.
    pub filter: Option<String>,
    /// Sort keys, applied in order. No keys: ascending record id.
    pub sort: Vec<SortKey>,
    /// Rows to drop after filter+sort.
    pub skip: usize,
    /// Maximum rows to return after `skip`.
    pub limit: Option<usize>,
    /// Changeset to query at; defaults to the sole leaf.
    pub as_of: Option<Csid>,
}

impl QuerySpec {
    /// A query over every record of `rectype`.
    #[must_use]
    pub fn rectype(rectype: impl Into<String>) -> Self {
        Self {
            rectype: Some(rectype.into()),
            ..Self::default()
        }
    }

    /// Adds a projection.
    #[must_use]
    pub fn select(mut self, sel: FieldSel) -> Self {
        self.select.push(sel);
        self
    }

    /// Sets the filter expression.
    #[must_use]
    pub fn filter(mut self, expr: impl Into<String>) -> Self {
        self.filter = Some(expr.into());
        self
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    /// Drops the first `n` rows.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Caps the result at `n` rows.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Queries at an explicit changeset instead of the sole leaf.
    #[must_use]
    pub fn as_of(mut self, csid: Csid) -> Self {
        self.as_of = Some(csid);
        self
    }
}

/// One projected cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// A plain field value.
    Value(FieldValue),
    /// Resolved text (username projection).
    Text(String),
    /// A timestamp (`last_timestamp` projection).
    Timestamp(Timestamp),
    /// A version chain (`history` projection), newest-first.
    History(Vec<HistoryEntry>),
    /// Inlined rows from a reference traversal.
    Rows(Vec<Row>),
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// The record's stable identifier.
    pub recid: Recid,
    /// The record's type.
    pub rectype: String,
    /// Projected cells by output name. Absent optional fields are absent
    /// entries.
    pub cells: BTreeMap<String, QueryValue>,
}

impl Store {
    /// Runs a query.
    ///
    /// # Errors
    /// See [`QueryError`]; an empty store yields an empty result rather than
    /// an error.
    pub fn query(&self, spec: &QuerySpec) -> Result<Vec<Row>, QueryError> {
        let Some(head) = self.resolve_head(spec.as_of.as_ref())? else {
            return Ok(Vec::new());
        };
        let resolved = self.state_at(&head)?;
        let template = self.template_in_state(&resolved).ok_or(QueryError::NoTemplate)?;
        let rectype = match &spec.rectype {
            Some(name) => {
                if template.get(name).is_none() {
                    return Err(QueryError::UnknownRectype(name.clone()));
                }
                name.clone()
            }
            None => template
                .sole_rectype()
                .ok_or(QueryError::AmbiguousRectype)?
                .to_owned(),
        };
        let Some(def) = template.get(&rectype) else {
            return Err(QueryError::UnknownRectype(rectype));
        };
        check_projections(template, &rectype, def, &spec.select)?;
        for key in &spec.sort {
            if !def.fields.contains_key(&key.field) {
                return Err(QueryError::UnknownField {
                    rectype: rectype.clone(),
                    field: key.field.clone(),
                });
            }
        }
        let filter = spec.filter.as_deref().map(expr::parse).transpose()?;

        // Gather, filter.
        let mut matched: Vec<(Recid, &RecordSnapshot)> = Vec::new();
        for (recid, snapshot) in live_records(self, &resolved, &rectype) {
            if filter
                .as_ref()
                .is_none_or(|f| expr::eval(f, &snapshot.fields))
            {
                matched.push((recid, snapshot));
            }
        }

        // Sort: requested keys first, record id as the final tie-break so
        // the order is total and replica-independent.
        matched.sort_by(|(a_id, a), (b_id, b)| {
            for key in &spec.sort {
                let Some(fd) = def.fields.get(&key.field) else {
                    continue;
                };
                let ord = cmp_field(fd, a.fields.get(&key.field), b.fields.get(&key.field));
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a_id.0.cmp(&b_id.0)
        });

        // Paginate, then project (projection can be the expensive part).
        matched
            .into_iter()
            .skip(spec.skip)
            .take(spec.limit.unwrap_or(usize::MAX))
            .map(|(recid, snapshot)| {
                self.project(&head, &resolved, recid, snapshot, &spec.select)
            })
            .collect()
    }

    /// Fetches one record's snapshot as of a changeset (default: sole leaf).
    ///
    /// `Ok(None)` when the record does not exist there or has a different
    /// type.
    ///
    /// # Errors
    /// [`QueryError::AmbiguousHead`] / [`QueryError::Graph`] on head
    /// resolution.
    pub fn get_record(
        &self,
        rectype: &str,
        recid: Recid,
        as_of: Option<&Csid>,
    ) -> Result<Option<&RecordSnapshot>, QueryError> {
        let Some(head) = self.resolve_head(as_of)? else {
            return Ok(None);
        };
        if recid == TEMPLATE_RECID {
            return Ok(None);
        }
        let resolved = self.state_at(&head)?;
        let snapshot = resolved
            .get(&recid)
            .and_then(|h| self.snapshot(h))
            .filter(|s| s.rectype == rectype);
        Ok(snapshot)
    }

    /// Reconstructs one record's version chain, newest-first, as seen from a
    /// changeset (default: sole leaf). Empty when the record never existed
    /// there or has a different type, mirroring [`Store::get_record`].
    ///
    /// # Errors
    /// [`QueryError::AmbiguousHead`] / [`QueryError::Graph`] on head
    /// resolution.
    pub fn get_history(
        &self,
        rectype: &str,
        recid: Recid,
        as_of: Option<&Csid>,
    ) -> Result<Vec<HistoryEntry>, QueryError> {
        let Some(head) = self.resolve_head(as_of)? else {
            return Ok(Vec::new());
        };
        if recid == TEMPLATE_RECID {
            return Ok(Vec::new());
        }
        let chain = state::history_at(&self.graph, &head, &recid)?;
        // The newest non-deletion entry carries the record's type.
        let type_matches = chain
            .iter()
            .find_map(|entry| entry.hidrec.as_ref())
            .and_then(|h| self.snapshot(h))
            .is_some_and(|s| s.rectype == rectype);
        if type_matches {
            Ok(chain)
        } else {
            Ok(Vec::new())
        }
    }

    fn project(
        &self,
        head: &Csid,
        resolved: &BTreeMap<Recid, Hidrec>,
        recid: Recid,
        snapshot: &RecordSnapshot,
        select: &[FieldSel],
    ) -> Result<Row, QueryError> {
        let mut cells = BTreeMap::new();
        let put_all = |cells: &mut BTreeMap<String, QueryValue>| {
            for (name, value) in &snapshot.fields {
                cells.insert(name.clone(), QueryValue::Value(value.clone()));
            }
        };
        if select.is_empty() {
            put_all(&mut cells);
        }
        for sel in select {
            match sel {
                FieldSel::All => put_all(&mut cells),
                FieldSel::Field(name) => {
                    if let Some(value) = snapshot.fields.get(name) {
                        cells.insert(name.clone(), QueryValue::Value(value.clone()));
                    }
                }
                FieldSel::Alias { field, alias } => {
                    if let Some(value) = snapshot.fields.get(field) {
                        cells.insert(alias.clone(), QueryValue::Value(value.clone()));
                    }
                }
                FieldSel::History => {
                    let chain = state::history_at(&self.graph, head, &recid)?;
                    cells.insert("history".to_owned(), QueryValue::History(chain));
                }
                FieldSel::LastTimestamp => {
                    let chain = state::history_at(&self.graph, head, &recid)?;
                    if let Some(newest) = chain.first() {
                        cells.insert(
                            "last_timestamp".to_owned(),
                            QueryValue::Timestamp(newest.audit.at),
                        );
                    }
                }
                FieldSel::Username { field } => {
                    if let Some(FieldValue::User(ident)) = snapshot.fields.get(field) {
                        let name = self
                            .user_directory
                            .as_ref()
                            .and_then(|d| d.username(ident))
                            .unwrap_or_else(|| ident.as_str().to_owned());
                        cells.insert(field.clone(), QueryValue::Text(name));
                    }
                }
                FieldSel::FromMe { field, select } => {
                    if let Some(FieldValue::Reference(target)) = snapshot.fields.get(field) {
                        let rows = resolved
                            .get(target)
                            .and_then(|h| self.snapshot(h))
                            .map(|s| vec![inline_row(*target, s, select)])
                            .unwrap_or_default();
                        cells.insert(field.clone(), QueryValue::Rows(rows));
                    }
                }
                FieldSel::ToMe {
                    rectype,
                    field,
                    select,
                } => {
                    let mut rows = Vec::new();
                    for (other, referrer) in live_records(self, resolved, rectype) {
                        if referrer.fields.get(field)
                            == Some(&FieldValue::Reference(recid))
                        {
                            rows.push(inline_row(other, referrer, select));
                        }
                    }
                    cells.insert(format!("{rectype}.{field}"), QueryValue::Rows(rows));
                }
            }
        }
        Ok(Row {
            recid,
            rectype: snapshot.rectype.clone(),
            cells,
        })
    }
}

/// Live records of one type in a resolved state, in ascending recid order.
fn live_records<'a>(
    store: &'a Store,
    resolved: &'a BTreeMap<Recid, Hidrec>,
    rectype: &'a str,
) -> impl Iterator<Item = (Recid, &'a RecordSnapshot)> {
    resolved.iter().filter_map(move |(recid, hidrec)| {
        if *recid == TEMPLATE_RECID {
            return None;
        }
        store
            .snapshot(hidrec)
            .filter(|s| s.rectype == rectype)
            .map(|s| (*recid, s))
    })
}

fn inline_row(recid: Recid, snapshot: &RecordSnapshot, select: &[String]) -> Row {
    let mut cells = BTreeMap::new();
    if select.is_empty() {
        for (name, value) in &snapshot.fields {
            cells.insert(name.clone(), QueryValue::Value(value.clone()));
        }
    }
    for name in select {
        if let Some(value) = snapshot.fields.get(name) {
            cells.insert(name.clone(), QueryValue::Value(value.clone()));
        }
    }
    Row {
        recid,
        rectype: snapshot.rectype.clone(),
        cells,
    }
}

/// Validates every projection against the effective template.
fn check_projections(
    template: &Template,
    rectype: &str,
    def: &RectypeDef,
    select: &[FieldSel],
) -> Result<(), QueryError> {
    let known = |field: &str| -> Result<&FieldDef, QueryError> {
        def.fields.get(field).ok_or_else(|| QueryError::UnknownField {
            rectype: rectype.to_owned(),
            field: field.to_owned(),
        })
    };
    for sel in select {
        match sel {
            FieldSel::All | FieldSel::History | FieldSel::LastTimestamp => {}
            FieldSel::Field(field) | FieldSel::Alias { field, .. } => {
                known(field)?;
            }
            FieldSel::Username { field } => {
                if known(field)?.datatype != Datatype::User {
                    return Err(QueryError::NotAUserField(field.clone()));
                }
            }
            FieldSel::FromMe { field, select } => {
                let Datatype::Reference { rectype: target } = &known(field)?.datatype else {
                    return Err(QueryError::NotAReferenceField(field.clone()));
                };
                let Some(target_def) = template.get(target) else {
                    return Err(QueryError::UnknownRectype(target.clone()));
                };
                for name in select {
                    if !target_def.fields.contains_key(name) {
                        return Err(QueryError::UnknownField {
                            rectype: target.clone(),
                            field: name.clone(),
                        });
                    }
                }
            }
            FieldSel::ToMe {
                rectype: referrer,
                field,
                select,
            } => {
                let Some(ref_def) = template.get(referrer) else {
                    return Err(QueryError::UnknownRectype(referrer.clone()));
                };
                let Some(fd) = ref_def.fields.get(field) else {
                    return Err(QueryError::UnknownField {
                        rectype: referrer.clone(),
                        field: field.clone(),
                    });
                };
                let Datatype::Reference { rectype: target } = &fd.datatype else {
                    return Err(QueryError::NotAReferenceField(field.clone()));
                };
                if target != rectype {
                    return Err(QueryError::NotAReferenceField(field.clone()));
                }
                for name in select {
                    if !ref_def.fields.contains_key(name) {
                        return Err(QueryError::UnknownField {
                            rectype: referrer.clone(),
                            field: name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Field ordering for sort keys. Absent values sort last (ascending);
/// `sort_by_allowed` fields order by position in the `allowed` list.
fn cmp_field(fd: &FieldDef, a: Option<&FieldValue>, b: Option<&FieldValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            if fd.constraints.sort_by_allowed {
                if let Some(allowed) = &fd.constraints.allowed {
                    let rank = |v: &FieldValue| allowed.iter().position(|x| x == v);
                    return match (rank(a), rank(b)) {
                        (None, None) => Ordering::Equal,
                        (None, Some(_)) => Ordering::Greater,
                        (Some(_), None) => Ordering::Less,
                        (Some(ia), Some(ib)) => ia.cmp(&ib),
                    };
                }
            }
            a.cmp_same_kind(b).unwrap_or(Ordering::Equal)
        }
    }
}
