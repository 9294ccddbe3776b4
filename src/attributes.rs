use std::{collections::HashMap, sync::Arc};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap of named context fields.
///
/// # Examples
/// ```
/// # use decider::{Attributes, AttributeValue};
/// let attributes = [
///     ("user_id".to_owned(), "t2_abc".into()),
///     ("country_code".to_owned(), "US".into()),
///     ("logged_in".to_owned(), true.into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a single context field.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `i64` and `bool`.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Return the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Render the value as a bucketing identity. Integral numbers render without a fractional
    /// part so that `1234` and `"1234"` bucket identically.
    pub(crate) fn to_identity(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) if !s.is_empty() => Some(s.clone()),
            AttributeValue::String(_) | AttributeValue::Null => None,
            AttributeValue::Number(n) if n.fract() == 0.0 => Some(format!("{n:.0}")),
            AttributeValue::Number(n) => Some(n.to_string()),
            AttributeValue::Boolean(b) => Some(b.to_string()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// Per-request input to decisions: identity fields (e.g., `user_id`, `device_id`) and arbitrary
/// targeting fields, all stored as named [`Attributes`].
///
/// Which field acts as the bucketing identity is decided per experiment by its `bucket_val`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionContext {
    attributes: Arc<Attributes>,
}

impl DecisionContext {
    /// Create an empty context.
    pub fn new() -> DecisionContext {
        DecisionContext::default()
    }

    /// Add or replace a field.
    ///
    /// ```
    /// # use decider::DecisionContext;
    /// let context = DecisionContext::new()
    ///     .with("user_id", "t2_abc")
    ///     .with("country_code", "US");
    /// assert_eq!(context.get("country_code").and_then(|v| v.as_str()), Some("US"));
    /// ```
    pub fn with(mut self, field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Arc::make_mut(&mut self.attributes).insert(field.into(), value.into());
        self
    }

    /// Get the value of a field.
    pub fn get(&self, field: &str) -> Option<&AttributeValue> {
        self.attributes.get(field)
    }

    /// All fields of the context.
    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.attributes
    }

    /// Identity for bucketing under `field`. Missing, null and empty values have no identity.
    pub(crate) fn identity(&self, field: &str) -> Option<String> {
        self.get(field)?.to_identity()
    }
}

impl From<Attributes> for DecisionContext {
    fn from(attributes: Attributes) -> Self {
        DecisionContext {
            attributes: Arc::new(attributes),
        }
    }
}
