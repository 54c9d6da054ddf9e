//! Structured filters for list endpoints
//!
//! A [`FilterSpec`] is sent with every list request so the backend only
//! returns matching records. The same expressions can be evaluated locally
//! against a record's JSON with [`FilterExpression::matches`], which the
//! agent uses to re-check candidates and which in-process backends use to
//! answer listings.
//!
//! Field names are dotted paths into the record (`docker_image.cpu`).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::version::Version;

/// A conjunction of filter expressions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub expressions: Vec<FilterExpression>,
}

impl FilterSpec {
    pub fn new(expressions: Vec<FilterExpression>) -> Self {
        Self { expressions }
    }

    /// True when every expression matches the record
    pub fn matches(&self, record: &Value) -> bool {
        self.expressions.iter().all(|expression| expression.matches(record))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }

    fn negated(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Ge => CompareOp::Lt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterExpression {
    Exact {
        field: String,
        value: Value,
        #[serde(default)]
        invert: bool,
    },
    Contains {
        field: String,
        value: String,
        #[serde(default)]
        invert: bool,
    },
    #[serde(rename = "isnull")]
    IsNull {
        field: String,
        #[serde(default)]
        invert: bool,
    },
    Compare {
        field: String,
        operator: CompareOp,
        value: Value,
    },
    And {
        sub_expressions: Vec<FilterExpression>,
    },
    Or {
        sub_expressions: Vec<FilterExpression>,
    },
}

impl FilterExpression {
    pub fn exact(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpression::Exact {
            field: field.into(),
            value: value.into(),
            invert: false,
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        FilterExpression::Contains {
            field: field.into(),
            value: value.into(),
            invert: false,
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        FilterExpression::IsNull {
            field: field.into(),
            invert: false,
        }
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self::is_null(field).negate()
    }

    pub fn compare(field: impl Into<String>, operator: CompareOp, value: impl Into<Value>) -> Self {
        FilterExpression::Compare {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn and(sub_expressions: Vec<FilterExpression>) -> Self {
        FilterExpression::And { sub_expressions }
    }

    pub fn or(sub_expressions: Vec<FilterExpression>) -> Self {
        FilterExpression::Or { sub_expressions }
    }

    /// Logical negation
    ///
    /// Leaf expressions flip their `invert` flag; conjunctions and
    /// disjunctions are rewritten with De Morgan. A comparison has no
    /// `invert` on the wire, so it becomes "field is null or the opposite
    /// comparison", which also matches records missing the field. Values
    /// of a type that cannot be compared with the operand, such as a
    /// string against a number, match neither form.
    pub fn negate(self) -> Self {
        match self {
            FilterExpression::Exact { field, value, invert } => FilterExpression::Exact {
                field,
                value,
                invert: !invert,
            },
            FilterExpression::Contains { field, value, invert } => FilterExpression::Contains {
                field,
                value,
                invert: !invert,
            },
            FilterExpression::IsNull { field, invert } => FilterExpression::IsNull {
                field,
                invert: !invert,
            },
            FilterExpression::Compare { field, operator, value } => FilterExpression::or(vec![
                FilterExpression::is_null(field.clone()),
                FilterExpression::Compare {
                    field,
                    operator: operator.negated(),
                    value,
                },
            ]),
            FilterExpression::And { sub_expressions } => FilterExpression::Or {
                sub_expressions: sub_expressions.into_iter().map(Self::negate).collect(),
            },
            FilterExpression::Or { sub_expressions } => FilterExpression::And {
                sub_expressions: sub_expressions.into_iter().map(Self::negate).collect(),
            },
        }
    }

    /// Evaluates the expression against a JSON record
    ///
    /// A missing field behaves like `null`. Comparisons against a missing
    /// field never match.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            FilterExpression::Exact { field, value, invert } => {
                let found = lookup(record, field).is_some_and(|actual| values_equal(actual, value));
                found != *invert
            }
            FilterExpression::Contains { field, value, invert } => {
                let found = lookup(record, field)
                    .and_then(Value::as_str)
                    .is_some_and(|actual| actual.contains(value.as_str()));
                found != *invert
            }
            FilterExpression::IsNull { field, invert } => {
                let null = lookup(record, field).is_none_or(Value::is_null);
                null != *invert
            }
            FilterExpression::Compare { field, operator, value } => lookup(record, field)
                .and_then(|actual| compare_values(actual, value))
                .is_some_and(|ordering| operator.accepts(ordering)),
            FilterExpression::And { sub_expressions } => {
                sub_expressions.iter().all(|expression| expression.matches(record))
            }
            FilterExpression::Or { sub_expressions } => {
                sub_expressions.iter().any(|expression| expression.matches(record))
            }
        }
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

/// Numbers compare numerically, strings as versions when both parse,
/// otherwise lexically
fn compare_values(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }

    let (a, b) = (actual.as_str()?, expected.as_str()?);
    match (a.parse::<Version>(), b.parse::<Version>()) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => Some(a.cmp(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_wire_format() {
        let spec = FilterSpec::new(vec![
            FilterExpression::is_null("node"),
            FilterExpression::compare("docker_image.cuda_version.version", CompareOp::Le, "10.0"),
        ]);
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            value,
            json!({
                "expressions": [
                    {"type": "isnull", "field": "node", "invert": false},
                    {
                        "type": "compare",
                        "field": "docker_image.cuda_version.version",
                        "operator": "<=",
                        "value": "10.0"
                    }
                ]
            })
        );
    }

    #[test]
    fn test_deserialize_nested() {
        let json = r#"{"type": "or", "sub_expressions": [
            {"type": "exact", "field": "docker_image.cpu", "value": true},
            {"type": "contains", "field": "template.type", "value": "Train", "invert": true}
        ]}"#;
        let expression: FilterExpression = serde_json::from_str(json).unwrap();
        assert_eq!(
            expression,
            FilterExpression::or(vec![
                FilterExpression::exact("docker_image.cpu", true),
                FilterExpression::contains("template.type", "Train").negate(),
            ])
        );
    }

    #[test]
    fn test_matches_null_and_missing() {
        let record = json!({"node": null, "start_time": "2024-01-01T00:00:00Z"});
        assert!(FilterExpression::is_null("node").matches(&record));
        assert!(FilterExpression::is_null("error_reason").matches(&record));
        assert!(!FilterExpression::is_null("start_time").matches(&record));
        assert!(FilterExpression::not_null("start_time").matches(&record));
    }

    #[test]
    fn test_matches_nested_fields() {
        let record = json!({
            "template": {"type": "Train<Domain>"},
            "docker_image": {"cpu": false, "cuda_version": {"version": "9.0"}}
        });
        assert!(FilterExpression::contains("template.type", "Train").matches(&record));
        assert!(!FilterExpression::exact("docker_image.cpu", true).matches(&record));
        assert!(
            FilterExpression::compare("docker_image.cuda_version.version", CompareOp::Le, "10.0")
                .matches(&record)
        );
        assert!(
            !FilterExpression::compare("docker_image.missing", CompareOp::Le, "10.0").matches(&record)
        );
    }

    #[test]
    fn test_compare_numbers() {
        let record = json!({"compute": 7.5});
        assert!(FilterExpression::compare("compute", CompareOp::Ge, 7).matches(&record));
        assert!(!FilterExpression::compare("compute", CompareOp::Lt, 7.5).matches(&record));
        assert!(FilterExpression::exact("compute", 7.5).matches(&record));
    }

    #[test]
    fn test_negate_is_complement() {
        let record = json!({"a": 1, "b": "x"});
        let expressions = vec![
            FilterExpression::exact("a", 1),
            FilterExpression::compare("a", CompareOp::Gt, 0),
            FilterExpression::and(vec![
                FilterExpression::exact("a", 1),
                FilterExpression::contains("b", "y"),
            ]),
            FilterExpression::or(vec![
                FilterExpression::is_null("c"),
                FilterExpression::exact("b", "z"),
            ]),
        ];
        for expression in expressions {
            let matched = expression.matches(&record);
            assert_eq!(expression.negate().matches(&record), !matched);
        }
    }

    #[test]
    fn test_negated_compare_matches_missing_field() {
        let comparison =
            FilterExpression::compare("docker_image.cuda_version.version", CompareOp::Le, "10.0");
        let records = [
            json!({"docker_image": {"cuda_version": {"version": "9.0"}}}),
            json!({"docker_image": {"cuda_version": {"version": "11.2"}}}),
            json!({"docker_image": {"cuda_version": null}}),
            json!({"docker_image": null}),
            json!({}),
        ];
        for record in &records {
            let matched = comparison.matches(record);
            assert_eq!(comparison.clone().negate().matches(record), !matched, "{}", record);
        }
        assert!(comparison.negate().matches(&json!({})));
    }
}
