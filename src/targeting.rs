//! Targeting rules: a boolean expression tree over named context fields.
//!
//! The wire representation (`TargetingWire`) is compiled into [`Targeting`] at parse time, so
//! regular expressions and version bounds are validated once per snapshot rather than on every
//! decision.
use derive_more::From;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{AttributeValue, DecisionContext};

/// A literal in the definitions file: the right-hand side of comparisons and override values.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum Value {
    /// A boolean literal.
    Boolean(bool),
    /// A numeric literal.
    Number(f64),
    /// A string literal.
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl Value {
    /// Typed equality against a context field. Values of different types never match.
    pub(crate) fn matches(&self, attribute: &AttributeValue) -> bool {
        match (self, attribute) {
            (Value::Boolean(a), AttributeValue::Boolean(b)) => a == b,
            (Value::Number(a), AttributeValue::Number(b)) => a == b,
            (Value::String(a), AttributeValue::String(b)) => a == b,
            _ => false,
        }
    }
}

/// Targeting rule as written in the definitions file.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TargetingWire {
    All(Vec<TargetingWire>),
    Any(Vec<TargetingWire>),
    Not(Box<TargetingWire>),
    Equals {
        field: String,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Range {
        field: String,
        #[serde(default)]
        min: Option<Value>,
        #[serde(default)]
        max: Option<Value>,
    },
    Exists {
        field: String,
    },
    Matches {
        field: String,
        pattern: String,
    },
}

/// Reasons a targeting rule fails to compile.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TargetingError {
    /// `any` needs at least one operand.
    #[error("`any` requires at least one rule")]
    EmptyAny,
    /// `range` needs at least one bound.
    #[error("range on {field:?} has neither min nor max")]
    UnboundedRange {
        /// Compared field.
        field: String,
    },
    /// Range bounds must be both numbers or both semver strings.
    #[error("range on {field:?} has invalid bounds")]
    InvalidBound {
        /// Compared field.
        field: String,
    },
    /// `min` must be strictly below `max`.
    #[error("range on {field:?} is empty (min >= max)")]
    EmptyRange {
        /// Compared field.
        field: String,
    },
    /// The regular expression failed to compile.
    #[error("invalid pattern for {field:?}: {message}")]
    InvalidPattern {
        /// Compared field.
        field: String,
        /// Error reported by the regex compiler.
        message: String,
    },
}

/// Compiled targeting rule.
#[derive(Debug, Clone)]
pub enum Targeting {
    /// True if every operand is true. An empty list is true.
    All(Box<[Targeting]>),
    /// True if any operand is true.
    Any(Box<[Targeting]>),
    /// Negation.
    Not(Box<Targeting>),
    /// Field equals the literal.
    Equals {
        /// Compared field.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Field equals one of the literals.
    In {
        /// Compared field.
        field: String,
        /// Accepted values.
        values: Box<[Value]>,
    },
    /// Field falls in `[min, max)`.
    Range {
        /// Compared field.
        field: String,
        /// Bounds of the range.
        bounds: RangeBounds,
    },
    /// Field is present and not null.
    Exists {
        /// Checked field.
        field: String,
    },
    /// String field matches the regular expression.
    Matches {
        /// Compared field.
        field: String,
        /// Compiled pattern.
        regex: Regex,
    },
}

/// Bounds of a [`Targeting::Range`]. `min` is inclusive, `max` is exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeBounds {
    /// Numeric comparison.
    Numeric {
        #[allow(missing_docs)]
        min: Option<f64>,
        #[allow(missing_docs)]
        max: Option<f64>,
    },
    /// Semantic version comparison.
    Version {
        #[allow(missing_docs)]
        min: Option<Version>,
        #[allow(missing_docs)]
        max: Option<Version>,
    },
}

impl Targeting {
    /// Compile the wire representation, validating patterns and range bounds.
    pub(crate) fn compile(wire: TargetingWire) -> Result<Targeting, TargetingError> {
        Ok(match wire {
            TargetingWire::All(rules) => Targeting::All(compile_all(rules)?),
            TargetingWire::Any(rules) => {
                if rules.is_empty() {
                    return Err(TargetingError::EmptyAny);
                }
                Targeting::Any(compile_all(rules)?)
            }
            TargetingWire::Not(rule) => Targeting::Not(Box::new(Targeting::compile(*rule)?)),
            TargetingWire::Equals { field, value } => Targeting::Equals { field, value },
            TargetingWire::In { field, values } => Targeting::In {
                field,
                values: values.into_boxed_slice(),
            },
            TargetingWire::Range { field, min, max } => {
                let bounds = compile_bounds(&field, min, max)?;
                Targeting::Range { field, bounds }
            }
            TargetingWire::Exists { field } => Targeting::Exists { field },
            TargetingWire::Matches { field, pattern } => match Regex::new(&pattern) {
                Ok(regex) => Targeting::Matches { field, regex },
                Err(err) => {
                    return Err(TargetingError::InvalidPattern {
                        field,
                        message: err.to_string(),
                    })
                }
            },
        })
    }
}

fn compile_all(rules: Vec<TargetingWire>) -> Result<Box<[Targeting]>, TargetingError> {
    rules.into_iter().map(Targeting::compile).collect()
}

fn compile_bounds(
    field: &str,
    min: Option<Value>,
    max: Option<Value>,
) -> Result<RangeBounds, TargetingError> {
    let invalid = || TargetingError::InvalidBound {
        field: field.to_owned(),
    };

    if min.is_none() && max.is_none() {
        return Err(TargetingError::UnboundedRange {
            field: field.to_owned(),
        });
    }
    let is_version =
        matches!(min, Some(Value::String(_))) || matches!(max, Some(Value::String(_)));

    let bounds = if is_version {
        let parse = |value: Option<Value>| -> Result<Option<Version>, TargetingError> {
            match value {
                None => Ok(None),
                Some(Value::String(s)) => Version::parse(&s).map(Some).map_err(|_| invalid()),
                Some(_) => Err(invalid()),
            }
        };
        RangeBounds::Version {
            min: parse(min)?,
            max: parse(max)?,
        }
    } else {
        let parse = |value: Option<Value>| -> Result<Option<f64>, TargetingError> {
            match value {
                None => Ok(None),
                Some(Value::Number(n)) if n.is_finite() => Ok(Some(n)),
                Some(_) => Err(invalid()),
            }
        };
        RangeBounds::Numeric {
            min: parse(min)?,
            max: parse(max)?,
        }
    };

    let empty = match &bounds {
        RangeBounds::Numeric {
            min: Some(min),
            max: Some(max),
        } => min >= max,
        RangeBounds::Version {
            min: Some(min),
            max: Some(max),
        } => min >= max,
        _ => false,
    };
    if empty {
        return Err(TargetingError::EmptyRange {
            field: field.to_owned(),
        });
    }

    Ok(bounds)
}

impl Targeting {
    /// Evaluate the rule against `context`. Missing fields and type mismatches make the enclosing
    /// comparison false; evaluation never fails.
    pub fn eval(&self, context: &DecisionContext) -> bool {
        match self {
            Targeting::All(rules) => rules.iter().all(|rule| rule.eval(context)),
            Targeting::Any(rules) => rules.iter().any(|rule| rule.eval(context)),
            Targeting::Not(rule) => !rule.eval(context),
            Targeting::Equals { field, value } => {
                context.get(field).is_some_and(|v| value.matches(v))
            }
            Targeting::In { field, values } => context
                .get(field)
                .is_some_and(|v| values.iter().any(|value| value.matches(v))),
            Targeting::Range { field, bounds } => context
                .get(field)
                .and_then(|v| bounds.contains(v))
                .unwrap_or(false),
            Targeting::Exists { field } => {
                matches!(context.get(field), Some(v) if v != &AttributeValue::Null)
            }
            Targeting::Matches { field, regex } => context
                .get(field)
                .and_then(AttributeValue::as_str)
                .is_some_and(|s| regex.is_match(s)),
        }
    }
}

impl RangeBounds {
    /// Returns `None` if the attribute cannot be compared against these bounds.
    fn contains(&self, attribute: &AttributeValue) -> Option<bool> {
        match self {
            RangeBounds::Numeric { min, max } => {
                let value = match attribute {
                    AttributeValue::Number(n) => *n,
                    AttributeValue::String(s) => s.parse().ok()?,
                    _ => return None,
                };
                Some(min.map_or(true, |min| value >= min) && max.map_or(true, |max| value < max))
            }
            RangeBounds::Version { min, max } => {
                let value = Version::parse(attribute.as_str()?).ok()?;
                Some(
                    min.as_ref().map_or(true, |min| &value >= min)
                        && max.as_ref().map_or(true, |max| &value < max),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::DecisionContext;

    use super::{Targeting, TargetingError, TargetingWire};

    fn rule(json: &str) -> Result<Targeting, TargetingError> {
        let wire: TargetingWire = serde_json::from_str(json).unwrap();
        Targeting::compile(wire)
    }

    fn context() -> DecisionContext {
        DecisionContext::new()
            .with("user_id", "t2_abc")
            .with("country_code", "US")
            .with("age", 30.0)
            .with("logged_in", true)
            .with("app_version", "2.10.0")
            .with("email", "test@example.com")
    }

    #[test]
    fn equals() {
        let r = rule(r#"{"equals": {"field": "country_code", "value": "US"}}"#).unwrap();
        assert!(r.eval(&context()));
        let r = rule(r#"{"equals": {"field": "country_code", "value": "CA"}}"#).unwrap();
        assert!(!r.eval(&context()));
    }

    #[test]
    fn equals_is_typed() {
        let r = rule(r#"{"equals": {"field": "logged_in", "value": "true"}}"#).unwrap();
        assert!(!r.eval(&context()));
        let r = rule(r#"{"equals": {"field": "logged_in", "value": true}}"#).unwrap();
        assert!(r.eval(&context()));
    }

    #[test]
    fn in_set() {
        let r = rule(r#"{"in": {"field": "country_code", "values": ["CA", "US"]}}"#).unwrap();
        assert!(r.eval(&context()));
        let r = rule(r#"{"in": {"field": "country_code", "values": ["CA", "MX"]}}"#).unwrap();
        assert!(!r.eval(&context()));
        let r = rule(r#"{"in": {"field": "country_code", "values": []}}"#).unwrap();
        assert!(!r.eval(&context()));
    }

    #[test]
    fn numeric_range_is_half_open() {
        let r = rule(r#"{"range": {"field": "age", "min": 18, "max": 30}}"#).unwrap();
        assert!(!r.eval(&context()));
        let r = rule(r#"{"range": {"field": "age", "min": 30, "max": 65}}"#).unwrap();
        assert!(r.eval(&context()));
        let r = rule(r#"{"range": {"field": "age", "min": 18}}"#).unwrap();
        assert!(r.eval(&context()));
    }

    #[test]
    fn version_range() {
        let r = rule(r#"{"range": {"field": "app_version", "min": "2.2.0"}}"#).unwrap();
        assert!(r.eval(&context()));
        let r = rule(r#"{"range": {"field": "app_version", "max": "2.9.0"}}"#).unwrap();
        assert!(!r.eval(&context()));
        // not a version
        let r = rule(r#"{"range": {"field": "country_code", "min": "1.0.0"}}"#).unwrap();
        assert!(!r.eval(&context()));
    }

    #[test]
    fn exists() {
        let r = rule(r#"{"exists": {"field": "user_id"}}"#).unwrap();
        assert!(r.eval(&context()));
        let r = rule(r#"{"exists": {"field": "device_id"}}"#).unwrap();
        assert!(!r.eval(&context()));
        let null = DecisionContext::new().with("device_id", crate::AttributeValue::Null);
        assert!(!r.eval(&null));
    }

    #[test]
    fn matches_regex() {
        let r = rule(r#"{"matches": {"field": "email", "pattern": "^test.*"}}"#).unwrap();
        assert!(r.eval(&context()));
        let r = rule(r#"{"matches": {"field": "age", "pattern": ".*"}}"#).unwrap();
        assert!(!r.eval(&context()));
    }

    #[test]
    fn composition() {
        let r = rule(
            r#"{"all": [
                {"equals": {"field": "country_code", "value": "US"}},
                {"any": [
                    {"exists": {"field": "device_id"}},
                    {"not": {"range": {"field": "age", "max": 21}}}
                ]}
            ]}"#,
        )
        .unwrap();
        assert!(r.eval(&context()));
        assert!(!r.eval(&context().with("age", 20.0)));
        assert!(r.eval(&context().with("age", 20.0).with("device_id", "d1")));
    }

    #[test]
    fn empty_all_is_true() {
        assert!(rule(r#"{"all": []}"#).unwrap().eval(&DecisionContext::new()));
    }

    #[test]
    fn missing_field_is_false_even_under_comparison() {
        let empty = DecisionContext::new();
        for json in [
            r#"{"equals": {"field": "x", "value": 1}}"#,
            r#"{"in": {"field": "x", "values": [1]}}"#,
            r#"{"range": {"field": "x", "min": 0}}"#,
            r#"{"matches": {"field": "x", "pattern": ""}}"#,
        ] {
            assert!(!rule(json).unwrap().eval(&empty), "{json}");
        }
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert_eq!(rule(r#"{"any": []}"#).unwrap_err(), TargetingError::EmptyAny);
        assert!(matches!(
            rule(r#"{"range": {"field": "age"}}"#),
            Err(TargetingError::UnboundedRange { .. })
        ));
        assert!(matches!(
            rule(r#"{"range": {"field": "age", "min": 10, "max": 5}}"#),
            Err(TargetingError::EmptyRange { .. })
        ));
        assert!(matches!(
            rule(r#"{"range": {"field": "age", "min": "1.0.0", "max": 5}}"#),
            Err(TargetingError::InvalidBound { .. })
        ));
        assert!(matches!(
            rule(r#"{"range": {"field": "age", "min": true}}"#),
            Err(TargetingError::InvalidBound { .. })
        ));
        assert!(matches!(
            rule(r#"{"matches": {"field": "email", "pattern": "("}}"#),
            Err(TargetingError::InvalidPattern { .. })
        ));
        assert!(matches!(
            rule(r#"{"not": {"any": []}}"#),
            Err(TargetingError::EmptyAny)
        ));
    }
}
