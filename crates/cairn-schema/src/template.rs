// SPDX-License-Identifier: Apache-2.0
//! The versioned schema object: record types, fields, and their policies.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::constraint::Constraints;
use crate::policy::{DefaultFunc, JournalSpec, MergePolicy, UniqifyOp, UniqifySpec};
use crate::value::{Datatype, FieldValue};

/// Structural problems detected by [`Template::validate`].
///
/// A template with any of these defects is rejected before it can be
/// committed; the engine never interprets an ill-formed schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A template must declare at least one record type.
    #[error("template declares no record types")]
    Empty,
    /// A reference field names a record type the template does not declare.
    #[error("field {rectype}.{field} references unknown rectype {target}")]
    UnknownReferenceTarget {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
        /// The missing target record type.
        target: String,
    },
    /// `defaultfunc` generators produce strings; the field must be `Str`.
    #[error("field {rectype}.{field} declares a defaultfunc but is not a string field")]
    DefaultFuncOnNonString {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
    },
    /// `defaultvalue` must be an inhabitant of the field's datatype.
    #[error("field {rectype}.{field} has a defaultvalue of the wrong datatype")]
    DefaultValueShape {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
    },
    /// `sort_by_allowed` is meaningless without an `allowed` list.
    #[error("field {rectype}.{field} sets sort_by_allowed without an allowed list")]
    SortByAllowedWithoutAllowed {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
    },
    /// Uniqify policy on a field that is not declared `unique`.
    #[error("field {rectype}.{field} has a uniqify policy but is not unique")]
    UniqifyWithoutUnique {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
    },
    /// `redo_defaultfunc` needs a generator to re-run.
    #[error("field {rectype}.{field} uniqifies via redo_defaultfunc but has no defaultfunc")]
    RedoWithoutDefaultFunc {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
    },
    /// A journal declaration targets a record type the template lacks.
    #[error("field {rectype}.{field} journals to unknown rectype {target}")]
    UnknownJournalTarget {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
        /// The missing journal record type.
        target: String,
    },
    /// A journal pattern fills a field the target rectype lacks, or one that
    /// is not a string. Substituted messages are always strings.
    #[error("field {rectype}.{field} journals into {target}.{journal_field}, which is not a string field")]
    JournalFieldNotString {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
        /// Journal record type.
        target: String,
        /// The offending journal field.
        journal_field: String,
    },
    /// The journal rectype requires a field the pattern map never fills, so
    /// every journal record would violate its own schema.
    #[error("field {rectype}.{field} journals to {target} but never fills required field {journal_field}")]
    JournalMissingRequired {
        /// Declaring record type.
        rectype: String,
        /// Declaring field.
        field: String,
        /// Journal record type.
        target: String,
        /// The uncovered required field.
        journal_field: String,
    },
}

/// Schema of one field: datatype, constraints, and reconciliation policy.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldDef {
    /// Declared datatype.
    pub datatype: Datatype,
    /// Validation constraints.
    pub constraints: Constraints,
    /// Static default applied at record creation.
    pub defaultvalue: Option<FieldValue>,
    /// Generated default applied at record creation.
    pub defaultfunc: Option<DefaultFunc>,
    /// Ordered auto-merge operators; falls back to the rectype default.
    pub merge: Option<MergePolicy>,
    /// Post-merge uniqueness repair policy.
    pub uniqify: Option<UniqifySpec>,
    /// Journal target for automatic merge/uniqify decisions on this field.
    pub journal: Option<JournalSpec>,
}

impl FieldDef {
    /// A field of `datatype` with no constraints or policies.
    #[must_use]
    pub fn new(datatype: Datatype) -> Self {
        Self {
            datatype,
            constraints: Constraints::default(),
            defaultvalue: None,
            defaultfunc: None,
            merge: None,
            uniqify: None,
            journal: None,
        }
    }

    /// Marks the field `required`.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.constraints.required = true;
        self
    }

    /// Marks the field `unique`.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.constraints.unique = true;
        self
    }

    /// Sets inclusive numeric/datetime bounds (either side optional).
    #[must_use]
    pub fn bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.constraints.min = min;
        self.constraints.max = max;
        self
    }

    /// Sets string/attachment length bounds (either side optional).
    #[must_use]
    pub fn length(mut self, minlength: Option<usize>, maxlength: Option<usize>) -> Self {
        self.constraints.minlength = minlength;
        self.constraints.maxlength = maxlength;
        self
    }

    /// Restricts the field to a closed value set.
    #[must_use]
    pub fn allowed(mut self, values: Vec<FieldValue>) -> Self {
        self.constraints.allowed = Some(values);
        self
    }

    /// Rejects specific values.
    #[must_use]
    pub fn prohibited(mut self, values: Vec<FieldValue>) -> Self {
        self.constraints.prohibited = Some(values);
        self
    }

    /// Sorts by position in the `allowed` list instead of natural order.
    #[must_use]
    pub fn sort_by_allowed(mut self) -> Self {
        self.constraints.sort_by_allowed = true;
        self
    }

    /// Sets a static creation default.
    #[must_use]
    pub fn defaultvalue(mut self, value: FieldValue) -> Self {
        self.defaultvalue = Some(value);
        self
    }

    /// Sets a generated creation default.
    #[must_use]
    pub fn defaultfunc(mut self, func: DefaultFunc) -> Self {
        self.defaultfunc = Some(func);
        self
    }

    /// Sets the auto-merge operator list.
    #[must_use]
    pub fn merge(mut self, policy: impl Into<MergePolicy>) -> Self {
        self.merge = Some(policy.into());
        self
    }

    /// Sets the uniqueness-repair policy.
    #[must_use]
    pub fn uniqify(mut self, spec: UniqifySpec) -> Self {
        self.uniqify = Some(spec);
        self
    }

    /// Declares journaling of automatic decisions on this field.
    #[must_use]
    pub fn journal(mut self, spec: JournalSpec) -> Self {
        self.journal = Some(spec);
        self
    }
}

/// Schema of one record type.
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RectypeDef {
    /// Field name to definition.
    pub fields: BTreeMap<String, FieldDef>,
    /// Merge operators applied to fields that declare none of their own.
    pub default_merge: Option<MergePolicy>,
}

impl RectypeDef {
    /// An empty record type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field definition.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    /// Sets the per-type fallback merge policy.
    #[must_use]
    pub fn default_merge(mut self, policy: impl Into<MergePolicy>) -> Self {
        self.default_merge = Some(policy.into());
        self
    }

    /// Effective merge operator list for `field`, if any.
    #[must_use]
    pub fn merge_policy_for(&self, field: &str) -> Option<&MergePolicy> {
        self.fields
            .get(field)
            .and_then(|def| def.merge.as_ref())
            .or(self.default_merge.as_ref())
    }
}

/// Versioned schema for a whole store.
///
/// A template changes by being committed as new content in the store's
/// changeset graph; queries as of a changeset interpret records under the
/// template in effect at or before that changeset.
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Template {
    /// Record type name to definition.
    pub rectypes: BTreeMap<String, RectypeDef>,
}

impl Template {
    /// An empty template; populate with [`Template::rectype`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record type.
    #[must_use]
    pub fn rectype(mut self, name: impl Into<String>, def: RectypeDef) -> Self {
        self.rectypes.insert(name.into(), def);
        self
    }

    /// Looks up a record type definition.
    #[must_use]
    pub fn get(&self, rectype: &str) -> Option<&RectypeDef> {
        self.rectypes.get(rectype)
    }

    /// When the template declares exactly one record type, returns its name.
    #[must_use]
    pub fn sole_rectype(&self) -> Option<&str> {
        let mut names = self.rectypes.keys();
        match (names.next(), names.next()) {
            (Some(name), None) => Some(name),
            _ => None,
        }
    }

    /// Checks the template for structural defects.
    ///
    /// # Errors
    /// Returns the first [`TemplateError`] found, walking record types and
    /// fields in name order so the report is deterministic.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.rectypes.is_empty() {
            return Err(TemplateError::Empty);
        }
        for (rectype, def) in &self.rectypes {
            for (field, fd) in &def.fields {
                if let Datatype::Reference { rectype: target } = &fd.datatype {
                    if !self.rectypes.contains_key(target) {
                        return Err(TemplateError::UnknownReferenceTarget {
                            rectype: rectype.clone(),
                            field: field.clone(),
                            target: target.clone(),
                        });
                    }
                }
                if fd.defaultfunc.is_some() && fd.datatype != Datatype::Str {
                    return Err(TemplateError::DefaultFuncOnNonString {
                        rectype: rectype.clone(),
                        field: field.clone(),
                    });
                }
                if let Some(dv) = &fd.defaultvalue {
                    if !fd.datatype.admits(dv) {
                        return Err(TemplateError::DefaultValueShape {
                            rectype: rectype.clone(),
                            field: field.clone(),
                        });
                    }
                }
                if fd.constraints.sort_by_allowed && fd.constraints.allowed.is_none() {
                    return Err(TemplateError::SortByAllowedWithoutAllowed {
                        rectype: rectype.clone(),
                        field: field.clone(),
                    });
                }
                if let Some(uniqify) = &fd.uniqify {
                    if !fd.constraints.unique {
                        return Err(TemplateError::UniqifyWithoutUnique {
                            rectype: rectype.clone(),
                            field: field.clone(),
                        });
                    }
                    if uniqify.op == UniqifyOp::RedoDefaultFunc && fd.defaultfunc.is_none() {
                        return Err(TemplateError::RedoWithoutDefaultFunc {
                            rectype: rectype.clone(),
                            field: field.clone(),
                        });
                    }
                }
                if let Some(journal) = &fd.journal {
                    let Some(target) = self.rectypes.get(&journal.rectype) else {
                        return Err(TemplateError::UnknownJournalTarget {
                            rectype: rectype.clone(),
                            field: field.clone(),
                            target: journal.rectype.clone(),
                        });
                    };
                    for journal_field in journal.fields.keys() {
                        let jf = target.fields.get(journal_field);
                        if !matches!(jf, Some(jf) if jf.datatype == Datatype::Str) {
                            return Err(TemplateError::JournalFieldNotString {
                                rectype: rectype.clone(),
                                field: field.clone(),
                                target: journal.rectype.clone(),
                                journal_field: journal_field.clone(),
                            });
                        }
                    }
                    // Journal records carry only pattern-filled fields, so
                    // every required field of the target must be covered.
                    for (name, jf) in &target.fields {
                        if jf.constraints.required && !journal.fields.contains_key(name) {
                            return Err(TemplateError::JournalMissingRequired {
                                rectype: rectype.clone(),
                                field: field.clone(),
                                target: journal.rectype.clone(),
                                journal_field: name.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
