//! Validated experiment definitions as held by a [`Snapshot`](crate::Snapshot).
use serde::{Deserialize, Serialize};

use crate::{
    targeting::{Targeting, Value},
    DecisionContext,
};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// A single named entry of the definitions file (except mutex groups, see [`MutexGroup`]).
#[derive(Debug, Clone)]
pub struct ExperimentDefinition {
    /// Unique name of the entry.
    pub name: String,
    /// Numeric id of the experiment, reported on exposure events.
    pub id: Option<u64>,
    /// Version of the experiment, reported on exposure events.
    pub version: Option<String>,
    /// Owner of the experiment.
    pub owner: Option<String>,
    /// What kind of entry this is.
    pub kind: ExperimentKind,
    /// Disabled entries resolve to no variant (or no value).
    pub enabled: bool,
    /// Hash seed for bucketing. Defaults to the name.
    pub bucket_seed: String,
    /// Context field used as the bucketing identity. Defaults to `user_id`.
    pub bucket_val: String,
    /// Variants in declaration order. Variants declared by size are laid out back to back, so
    /// reordering them re-buckets identities.
    pub variants: Vec<Variant>,
    /// Targeting rule. `None` targets everyone.
    pub targeting: Option<Targeting>,
    /// Holdout group this experiment belongs to.
    pub holdout_group: Option<String>,
    /// Mutually exclusive group this experiment belongs to.
    pub mutex_group: Option<String>,
    /// Overrides evaluated in order before targeting and bucketing.
    pub overrides: Vec<Override>,
    /// The experiment is inactive before this instant.
    pub start_ts: Option<Timestamp>,
    /// The experiment is inactive from this instant on.
    pub stop_ts: Option<Timestamp>,
    /// Whether decisions for this experiment produce exposure events.
    pub emit_event: bool,
}

/// Kind of a definition entry.
#[derive(Debug, Clone)]
pub enum ExperimentKind {
    /// A/B experiment.
    Simple,
    /// Feature rollout. Same bucketing as `Simple`, but does not emit exposures by default.
    Rollout,
    /// A member of a [`MutexGroup`].
    MutexMember,
    /// A holdout group.
    Holdout(HoldoutGroup),
    /// A typed dynamic configuration value.
    DynamicConfig(DynamicValue),
}

impl ExperimentKind {
    /// Name of the kind as written in the definitions file.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::Simple => "simple",
            ExperimentKind::Rollout => "rollout",
            ExperimentKind::MutexMember => "mutex_member",
            ExperimentKind::Holdout(_) => "holdout",
            ExperimentKind::DynamicConfig(_) => "dynamic_config",
        }
    }

    /// Return `true` for kinds that resolve to variants.
    pub fn has_variants(&self) -> bool {
        matches!(
            self,
            ExperimentKind::Simple | ExperimentKind::Rollout | ExperimentKind::MutexMember
        )
    }
}

/// A named treatment arm, owning `[range_start, range_start + size)` of the hash space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    /// Variant name.
    pub name: String,
    /// Fraction of the hash space assigned to this variant.
    pub size: f64,
    /// Where the variant's share of the hash space starts.
    pub range_start: f64,
}

impl Variant {
    /// Return `true` if `bucket` falls in the variant's range.
    pub fn contains(&self, bucket: f64) -> bool {
        self.range_start <= bucket && bucket < self.range_start + self.size
    }
}

/// Forces `variant` for requests whose `field` equals one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    /// Context field to match.
    pub field: String,
    /// Literal values that trigger the override.
    pub values: Vec<Value>,
    /// Forced variant.
    pub variant: String,
}

impl Override {
    pub(crate) fn matches(&self, context: &DecisionContext) -> bool {
        context
            .get(&self.field)
            .is_some_and(|attribute| self.values.iter().any(|v| v.matches(attribute)))
    }
}

/// A pool of traffic excluded from all member experiments.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldoutGroup {
    /// Fraction of traffic held out.
    pub size: f64,
}

impl HoldoutGroup {
    /// Variant reported for identities inside the holdout when the holdout is evaluated directly.
    pub const HOLDOUT_VARIANT: &'static str = "holdout";
}

/// A set of experiments partitioning the same traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct MutexGroup {
    /// Name of the group.
    pub name: String,
    /// Hash seed for the group. Defaults to the name.
    pub bucket_seed: String,
    /// Members in declaration order, each owning a sub-range of the group's hash space.
    pub members: Vec<MutexMember>,
}

/// Allocation of one experiment inside a [`MutexGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutexMember {
    /// Member experiment name.
    pub experiment: String,
    /// Fraction of the group's hash space owned by the member.
    pub size: f64,
}

impl MutexGroup {
    /// Return the member owning `bucket`, if any.
    pub fn owner_of(&self, bucket: f64) -> Option<&str> {
        let mut upper = 0.0;
        for member in &self.members {
            upper += member.size;
            if bucket < upper {
                return Some(&member.experiment);
            }
        }
        None
    }

    /// Return `true` if `experiment` is listed as a member.
    pub fn contains(&self, experiment: &str) -> bool {
        self.members.iter().any(|m| m.experiment == experiment)
    }
}

impl ExperimentDefinition {
    /// Return the variant whose range contains `bucket`.
    pub fn variant_for(&self, bucket: f64) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.contains(bucket))
    }

    /// Return `true` if `now` falls in the `[start_ts, stop_ts)` activity window.
    pub fn is_active(&self, now: Timestamp) -> bool {
        let forbidden = matches!(self.start_ts, Some(t) if now < t)
            || matches!(self.stop_ts, Some(t) if now >= t);
        !forbidden
    }

    /// Return `true` if `variant` is one of the declared variants.
    pub fn has_variant(&self, variant: &str) -> bool {
        self.variants.iter().any(|v| v.name == variant)
    }
}

/// Type tag of a [`DynamicValue`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DynamicValueType {
    #[serde(alias = "Boolean")]
    Boolean,
    #[serde(alias = "Integer")]
    Integer,
    #[serde(alias = "Float")]
    Float,
    #[serde(alias = "String", alias = "Text", alias = "text")]
    String,
    #[serde(alias = "Map")]
    Map,
}

/// Value of a dynamic configuration entry.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum DynamicValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl DynamicValue {
    /// Type tag of the value.
    pub fn value_type(&self) -> DynamicValueType {
        match self {
            DynamicValue::Boolean(_) => DynamicValueType::Boolean,
            DynamicValue::Integer(_) => DynamicValueType::Integer,
            DynamicValue::Float(_) => DynamicValueType::Float,
            DynamicValue::String(_) => DynamicValueType::String,
            DynamicValue::Map(_) => DynamicValueType::Map,
        }
    }

    /// Return the boolean value, if this is a boolean.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            DynamicValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Return the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the integer value, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DynamicValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Both integer and float values are numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DynamicValue::Integer(i) => Some(*i as f64),
            DynamicValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Return the map value, if this is a map.
    pub fn as_map(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            DynamicValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Build a value from JSON, checking it against `ty` when given. Without a type tag the type
    /// is inferred from the JSON value; `null` and arrays are never valid.
    pub(crate) fn from_json(
        value: serde_json::Value,
        ty: Option<DynamicValueType>,
    ) -> Option<DynamicValue> {
        use serde_json::Value as Json;

        let ty = match ty {
            Some(ty) => ty,
            None => match &value {
                Json::Bool(_) => DynamicValueType::Boolean,
                Json::Number(n) if n.is_i64() => DynamicValueType::Integer,
                Json::Number(_) => DynamicValueType::Float,
                Json::String(_) => DynamicValueType::String,
                Json::Object(_) => DynamicValueType::Map,
                Json::Null | Json::Array(_) => return None,
            },
        };

        Some(match (ty, value) {
            (DynamicValueType::Boolean, Json::Bool(b)) => DynamicValue::Boolean(b),
            (DynamicValueType::Integer, Json::Number(n)) => DynamicValue::Integer(n.as_i64()?),
            (DynamicValueType::Float, Json::Number(n)) => DynamicValue::Float(n.as_f64()?),
            (DynamicValueType::String, Json::String(s)) => DynamicValue::String(s),
            (DynamicValueType::Map, Json::Object(m)) => DynamicValue::Map(m),
            _ => return None,
        })
    }
}

/// Public description of an experiment, as returned by
/// [`RequestDecider::get_experiment`](crate::RequestDecider::get_experiment).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ExperimentInfo {
    pub id: Option<u64>,
    pub name: String,
    pub version: Option<String>,
    pub owner: Option<String>,
    pub kind: &'static str,
    pub bucket_val: String,
    pub start_ts: Option<Timestamp>,
    pub stop_ts: Option<Timestamp>,
    pub emit_event: bool,
}

impl From<&ExperimentDefinition> for ExperimentInfo {
    fn from(definition: &ExperimentDefinition) -> Self {
        ExperimentInfo {
            id: definition.id,
            name: definition.name.clone(),
            version: definition.version.clone(),
            owner: definition.owner.clone(),
            kind: definition.kind.as_str(),
            bucket_val: definition.bucket_val.clone(),
            start_ts: definition.start_ts,
            stop_ts: definition.stop_ts,
            emit_event: definition.emit_event,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DynamicValue, DynamicValueType, MutexGroup, MutexMember};

    #[test]
    fn dynamic_value_inference() {
        assert_eq!(
            DynamicValue::from_json(json!(true), None),
            Some(DynamicValue::Boolean(true))
        );
        assert_eq!(
            DynamicValue::from_json(json!(7), None),
            Some(DynamicValue::Integer(7))
        );
        assert_eq!(
            DynamicValue::from_json(json!(4.2), None),
            Some(DynamicValue::Float(4.2))
        );
        assert_eq!(DynamicValue::from_json(json!(null), None), None);
        assert_eq!(DynamicValue::from_json(json!([1]), None), None);
    }

    #[test]
    fn dynamic_value_type_is_checked() {
        assert_eq!(
            DynamicValue::from_json(json!("x"), Some(DynamicValueType::Boolean)),
            None
        );
        assert_eq!(
            DynamicValue::from_json(json!(1.5), Some(DynamicValueType::Integer)),
            None
        );
        assert_eq!(
            DynamicValue::from_json(json!(2), Some(DynamicValueType::Float)),
            Some(DynamicValue::Float(2.0))
        );
    }

    #[test]
    fn integers_are_numbers() {
        assert_eq!(DynamicValue::Integer(3).as_number(), Some(3.0));
        assert_eq!(DynamicValue::Float(3.5).as_integer(), None);
    }

    #[test]
    fn mutex_owner_walks_members_in_order() {
        let group = MutexGroup {
            name: "mg".into(),
            bucket_seed: "mg".into(),
            members: vec![
                MutexMember {
                    experiment: "a".into(),
                    size: 0.25,
                },
                MutexMember {
                    experiment: "b".into(),
                    size: 0.5,
                },
            ],
        };
        assert_eq!(group.owner_of(0.0), Some("a"));
        assert_eq!(group.owner_of(0.25), Some("b"));
        assert_eq!(group.owner_of(0.74), Some("b"));
        assert_eq!(group.owner_of(0.75), None);
    }
}
