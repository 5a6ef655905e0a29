//! Label and field selectors, validated once and rendered to the query syntax
//! accepted by the apiserver.

use std::{collections::BTreeSet, fmt, str::FromStr};

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// A validated label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

/// A single `key <op> values` term of a [`LabelSelector`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct LabelRequirement {
    key: String,
    op: LabelOperator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelOperator {
    Equals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    /// Whether the selector matches every object.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl TryFrom<&metav1::LabelSelector> for LabelSelector {
    type Error = SelectorError;

    fn try_from(selector: &metav1::LabelSelector) -> Result<Self, Self::Error> {
        let mut requirements = Vec::new();

        for (key, value) in selector.match_labels.iter().flatten() {
            validate_key(key)?;
            validate_value(key, value)?;
            requirements.push(LabelRequirement {
                key: key.clone(),
                op: LabelOperator::Equals(value.clone()),
            });
        }

        for expr in selector.match_expressions.iter().flatten() {
            validate_key(&expr.key)?;
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            for value in &values {
                validate_value(&expr.key, value)?;
            }

            let op = match expr.operator.as_str() {
                "In" | "NotIn" if values.is_empty() => {
                    return Err(SelectorError::MissingValues {
                        key: expr.key.clone(),
                        operator: expr.operator.clone(),
                    })
                }
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    return Err(SelectorError::UnexpectedValues {
                        key: expr.key.clone(),
                        operator: expr.operator.clone(),
                    })
                }
                "In" => LabelOperator::In(values),
                "NotIn" => LabelOperator::NotIn(values),
                "Exists" => LabelOperator::Exists,
                "DoesNotExist" => LabelOperator::DoesNotExist,
                _ => {
                    return Err(SelectorError::UnknownOperator {
                        key: expr.key.clone(),
                        operator: expr.operator.clone(),
                    })
                }
            };
            requirements.push(LabelRequirement {
                key: expr.key.clone(),
                op,
            });
        }

        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let key = &req.key;
            match &req.op {
                LabelOperator::Equals(value) => write!(f, "{key}={value}")?,
                LabelOperator::In(values) => write!(f, "{key} in ({})", join(values))?,
                LabelOperator::NotIn(values) => write!(f, "{key} notin ({})", join(values))?,
                LabelOperator::Exists => write!(f, "{key}")?,
                LabelOperator::DoesNotExist => write!(f, "!{key}")?,
            }
        }
        Ok(())
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// A validated field selector, e.g. `metadata.name=foo,status.phase!=Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldRequirement {
    field: String,
    op: FieldOperator,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldOperator {
    Equals,
    NotEquals,
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for term in s.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(SelectorError::EmptyTerm {
                    selector: s.to_owned(),
                });
            }

            let (field, op, value) = if let Some((field, value)) = term.split_once("!=") {
                (field, FieldOperator::NotEquals, value)
            } else if let Some((field, value)) = term.split_once("==") {
                (field, FieldOperator::Equals, value)
            } else if let Some((field, value)) = term.split_once('=') {
                (field, FieldOperator::Equals, value)
            } else {
                return Err(SelectorError::MissingOperator {
                    term: term.to_owned(),
                });
            };

            let field = field.trim();
            if field.is_empty() || field.chars().any(char::is_whitespace) {
                return Err(SelectorError::InvalidField {
                    term: term.to_owned(),
                });
            }
            let value = value.trim();
            if value.contains(['=', '!']) {
                return Err(SelectorError::InvalidValue {
                    key: field.to_owned(),
                    value: value.to_owned(),
                });
            }

            requirements.push(FieldRequirement {
                field: field.to_owned(),
                op,
                value: value.to_owned(),
            });
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let op = match req.op {
                FieldOperator::Equals => "=",
                FieldOperator::NotEquals => "!=",
            };
            write!(f, "{}{op}{}", req.field, req.value)?;
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason| SelectorError::InvalidKey {
        key: key.to_owned(),
        reason,
    };

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
                return Err(invalid("prefix must be 1-253 characters"));
            }
            let dns_ok = prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
            if !dns_ok || !alnum_edges(prefix) {
                return Err(invalid("prefix must be a DNS subdomain"));
            }
            name
        }
        None => key,
    };

    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid("name must be 1-63 characters"));
    }
    if !name_chars(name) {
        return Err(invalid(
            "name must be alphanumeric with '-', '_' or '.' inside",
        ));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LEN || !name_chars(value) {
        return Err(SelectorError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn name_chars(s: &str) -> bool {
    alnum_edges(s)
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn alnum_edges(s: &str) -> bool {
    let first = s.chars().next();
    let last = s.chars().last();
    first.is_some_and(|c| c.is_ascii_alphanumeric()) && last.is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Errors from parsing or validating a selector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("invalid value {value:?} for {key:?}")]
    InvalidValue { key: String, value: String },
    #[error("operator {operator} on {key:?} requires at least one value")]
    MissingValues { key: String, operator: String },
    #[error("operator {operator} on {key:?} does not take values")]
    UnexpectedValues { key: String, operator: String },
    #[error("unknown operator {operator:?} on {key:?}")]
    UnknownOperator { key: String, operator: String },
    #[error("empty term in field selector {selector:?}")]
    EmptyTerm { selector: String },
    #[error("field selector term {term:?} has no '=', '==' or '!=' operator")]
    MissingOperator { term: String },
    #[error("field selector term {term:?} has an invalid field path")]
    InvalidField { term: String },
}
