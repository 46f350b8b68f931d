// SPDX-License-Identifier: Apache-2.0
//! Field constraints and their value-level checks.

use crate::value::{Datatype, FieldValue};

/// Which constraint a value failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConstraintKind {
    /// Value shape does not match the declared datatype.
    Datatype,
    /// A `required` field is unset.
    Required,
    /// Numeric/datetime value below `min`.
    Min,
    /// Numeric/datetime value above `max`.
    Max,
    /// String/attachment shorter than `minlength`.
    MinLength,
    /// String/attachment longer than `maxlength`.
    MaxLength,
    /// Value not in the `allowed` set.
    Allowed,
    /// Value in the `prohibited` set.
    Prohibited,
    /// Value collides with another live record (checked by the engine).
    Unique,
    /// Reference target missing or of the wrong record type (checked by the
    /// engine).
    Reference,
}

impl ConstraintKind {
    /// Constraint name used in violation messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Datatype => "datatype",
            Self::Required => "required",
            Self::Min => "min",
            Self::Max => "max",
            Self::MinLength => "minlength",
            Self::MaxLength => "maxlength",
            Self::Allowed => "allowed",
            Self::Prohibited => "prohibited",
            Self::Unique => "unique",
            Self::Reference => "reference",
        }
    }
}

/// One constraint violation on one field.
///
/// Violations are values, not errors: `commit()` collects every violation
/// across every touched record and returns the structured list, leaving the
/// transaction open for correction.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Violation {
    /// Field that failed.
    pub field: String,
    /// Which constraint failed.
    pub kind: ConstraintKind,
    /// Human-readable detail (offending value, bound, ...).
    pub message: String,
}

impl Violation {
    pub(crate) fn new(field: &str, kind: ConstraintKind, message: impl Into<String>) -> Self {
        Self {
            field: field.to_owned(),
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.kind.name(), self.message)
    }
}

/// Declarative constraint set for one field.
///
/// The schema layer checks everything that is a pure function of the value;
/// `unique` and reference-target existence need the resolved store state and
/// are enforced by `cairn-core` at commit time with the same taxonomy.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Constraints {
    /// The field must be set in every committed snapshot.
    pub required: bool,
    /// No two live records may share this field's value.
    pub unique: bool,
    /// Inclusive numeric/datetime lower bound.
    pub min: Option<i64>,
    /// Inclusive numeric/datetime upper bound.
    pub max: Option<i64>,
    /// Minimum string/attachment length in bytes.
    pub minlength: Option<usize>,
    /// Maximum string/attachment length in bytes.
    pub maxlength: Option<usize>,
    /// Closed set of permitted values.
    pub allowed: Option<Vec<FieldValue>>,
    /// Values that are always rejected.
    pub prohibited: Option<Vec<FieldValue>>,
    /// Sort order follows position in `allowed` rather than natural order.
    pub sort_by_allowed: bool,
}

impl Constraints {
    /// Checks `value` against every constraint that is a pure function of the
    /// value. Returns all violations, not just the first.
    ///
    /// `value == None` means the field is unset; only `required` can fail.
    #[must_use]
    pub fn check(
        &self,
        field: &str,
        datatype: &Datatype,
        value: Option<&FieldValue>,
    ) -> Vec<Violation> {
        let mut out = Vec::new();
        let Some(value) = value else {
            if self.required {
                out.push(Violation::new(field, ConstraintKind::Required, "field is unset"));
            }
            return out;
        };

        if !datatype.admits(value) {
            out.push(Violation::new(
                field,
                ConstraintKind::Datatype,
                format!("expected {}, got {}", datatype.name(), value.kind_name()),
            ));
            // Shape is wrong; the remaining checks would be noise.
            return out;
        }

        if let Some(n) = value.as_number() {
            if let Some(min) = self.min {
                if n < min {
                    out.push(Violation::new(
                        field,
                        ConstraintKind::Min,
                        format!("{n} < {min}"),
                    ));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    out.push(Violation::new(
                        field,
                        ConstraintKind::Max,
                        format!("{n} > {max}"),
                    ));
                }
            }
        }

        if let Some(text) = value.as_text() {
            if let Some(minlength) = self.minlength {
                if text.len() < minlength {
                    out.push(Violation::new(
                        field,
                        ConstraintKind::MinLength,
                        format!("length {} < {minlength}", text.len()),
                    ));
                }
            }
            if let Some(maxlength) = self.maxlength {
                if text.len() > maxlength {
                    out.push(Violation::new(
                        field,
                        ConstraintKind::MaxLength,
                        format!("length {} > {maxlength}", text.len()),
                    ));
                }
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                out.push(Violation::new(
                    field,
                    ConstraintKind::Allowed,
                    format!("{value} is not an allowed value"),
                ));
            }
        }
        if let Some(prohibited) = &self.prohibited {
            if prohibited.contains(value) {
                out.push(Violation::new(
                    field,
                    ConstraintKind::Prohibited,
                    format!("{value} is prohibited"),
                ));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded() -> Constraints {
        Constraints {
            min: Some(10),
            max: Some(20),
            ..Constraints::default()
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let c = bounded();
        assert!(c.check("n", &Datatype::Int, Some(&FieldValue::Int(10))).is_empty());
        assert!(c.check("n", &Datatype::Int, Some(&FieldValue::Int(20))).is_empty());
        let low = c.check("n", &Datatype::Int, Some(&FieldValue::Int(9)));
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].kind, ConstraintKind::Min);
    }

    #[test]
    fn unset_optional_field_is_fine() {
        assert!(bounded().check("n", &Datatype::Int, None).is_empty());
    }

    #[test]
    fn unset_required_field_fails() {
        let c = Constraints {
            required: true,
            ..Constraints::default()
        };
        let v = c.check("n", &Datatype::Int, None);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ConstraintKind::Required);
    }

    #[test]
    fn wrong_shape_short_circuits() {
        let c = bounded();
        let v = c.check("n", &Datatype::Int, Some(&FieldValue::Str("9".to_owned())));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ConstraintKind::Datatype);
    }

    #[test]
    fn allowed_and_prohibited_sets() {
        let c = Constraints {
            allowed: Some(vec![
                FieldValue::Str("open".to_owned()),
                FieldValue::Str("closed".to_owned()),
            ]),
            prohibited: Some(vec![FieldValue::Str("open".to_owned())]),
            ..Constraints::default()
        };
        let v = c.check("s", &Datatype::Str, Some(&FieldValue::Str("open".to_owned())));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ConstraintKind::Prohibited);
        let v = c.check("s", &Datatype::Str, Some(&FieldValue::Str("other".to_owned())));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ConstraintKind::Allowed);
    }
}
