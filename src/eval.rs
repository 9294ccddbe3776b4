//! Decision engine: resolves an experiment and a [`DecisionContext`] to a variant.
use serde::Serialize;

use crate::{
    bucketer::Bucketer,
    definitions::{DynamicValue, ExperimentDefinition, ExperimentKind, HoldoutGroup, Timestamp},
    DecisionContext, Snapshot,
};

/// Result of a successful decision.
///
/// A decision with `variant == None` is still a decision: the request was evaluated and landed in
/// the control group (or outside every variant). Such decisions are exposed like any other.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Name of the evaluated experiment.
    pub experiment: String,
    /// Experiment id from the definitions file.
    pub id: Option<u64>,
    /// Experiment version from the definitions file.
    pub version: Option<String>,
    /// Experiment owner from the definitions file.
    pub owner: Option<String>,
    /// Assigned variant, or `None` for control.
    pub variant: Option<String>,
    /// Why this variant was assigned.
    pub reason: DecisionReason,
    /// The identity that was bucketed.
    pub identity: String,
    /// Name of the context field the identity was read from.
    pub identity_field: String,
    /// Whether this decision should produce an exposure event.
    pub emit_event: bool,
    /// Decision of the holdout group when the identity is held out of this experiment. It is
    /// exposed by every call that evaluates the experiment, including the `_without_expose`
    /// variants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holdout: Option<Box<Decision>>,
}

impl Decision {
    fn new(
        definition: &ExperimentDefinition,
        variant: Option<String>,
        reason: DecisionReason,
        identity: String,
        identity_field: String,
    ) -> Decision {
        Decision {
            experiment: definition.name.clone(),
            id: definition.id,
            version: definition.version.clone(),
            owner: definition.owner.clone(),
            variant,
            reason,
            identity,
            identity_field,
            emit_event: definition.emit_event,
            holdout: None,
        }
    }
}

/// Why a [`Decision`] resolved the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionReason {
    /// Assigned by bucketing into a variant range.
    Bucketed,
    /// Forced by an override.
    Override,
    /// Held out by the experiment's holdout group.
    Holdout {
        /// Name of the holdout.
        group: String,
    },
    /// Another member (or no member) of the mutex group owns this identity.
    MutexGroup {
        /// Name of the mutex group.
        group: String,
    },
    /// Targeting rule did not match.
    Targeting,
    /// Bucket value fell beyond the sum of variant sizes.
    Unbucketed,
}

/// Reasons a decision produced no result at all.
///
/// None of these reach callers of [`RequestDecider`](crate::RequestDecider): they are logged and
/// resolved to "no variant".
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecisionError {
    /// No entry with this name in the current snapshot.
    #[error("experiment not found")]
    NotFound,

    /// The entry is disabled.
    #[error("experiment is disabled")]
    Disabled,

    /// The current time is outside of the `start_ts`/`stop_ts` window.
    #[error("experiment is not active")]
    OutsideWindow,

    /// The entry is of a different kind than requested (e.g., a variant was requested from a
    /// dynamic config).
    #[error("experiment is a {found}, not a {expected}")]
    KindMismatch {
        /// Kind the operation works on.
        expected: &'static str,
        /// Kind of the entry.
        found: &'static str,
    },

    /// The context has no usable value in the experiment's identity field.
    #[error("context has no identity in field {field:?}")]
    MissingIdentity {
        /// The `bucket_val` of the experiment.
        field: String,
    },
}

impl DecisionError {
    /// Return `true` if the error is a normal running condition and no result should be returned
    /// silently.
    pub fn is_normal(&self) -> bool {
        match self {
            DecisionError::NotFound | DecisionError::Disabled | DecisionError::OutsideWindow => {
                true
            }
            DecisionError::KindMismatch { .. } | DecisionError::MissingIdentity { .. } => false,
        }
    }
}

impl Snapshot {
    /// Decide the variant of experiment `name` for `context`.
    ///
    /// Steps, in order: holdout exclusion, mutex group ownership, overrides, targeting, bucketing.
    /// A holdout evaluated directly resolves to [`HoldoutGroup::HOLDOUT_VARIANT`] for identities
    /// inside it.
    pub fn decide(
        &self,
        name: &str,
        context: &DecisionContext,
        now: Timestamp,
        bucketer: &impl Bucketer,
    ) -> Result<Decision, DecisionError> {
        let definition = self.experiment(name, now)?;

        let identity =
            context
                .identity(&definition.bucket_val)
                .ok_or_else(|| DecisionError::MissingIdentity {
                    field: definition.bucket_val.clone(),
                })?;

        let (variant, reason) = self.resolve(definition, context, &identity, now, bucketer);

        let holdout = match &reason {
            DecisionReason::Holdout { group } => self.get(group).map(|holdout| {
                Box::new(Decision::new(
                    holdout,
                    Some(HoldoutGroup::HOLDOUT_VARIANT.to_owned()),
                    DecisionReason::Bucketed,
                    identity.clone(),
                    definition.bucket_val.clone(),
                ))
            }),
            _ => None,
        };

        Ok(Decision {
            holdout,
            ..Decision::new(
                definition,
                variant,
                reason,
                identity,
                definition.bucket_val.clone(),
            )
        })
    }

    /// Look up experiment `name` and check that it can be decided at `now`.
    ///
    /// # Errors
    ///
    /// - [`DecisionError::NotFound`], [`DecisionError::Disabled`] and
    ///   [`DecisionError::OutsideWindow`] for entries that resolve to no variant.
    /// - [`DecisionError::KindMismatch`] if `name` is a dynamic config.
    pub fn experiment(
        &self,
        name: &str,
        now: Timestamp,
    ) -> Result<&ExperimentDefinition, DecisionError> {
        let definition = self.get(name).ok_or(DecisionError::NotFound)?;
        if !definition.enabled {
            return Err(DecisionError::Disabled);
        }
        if !definition.is_active(now) {
            return Err(DecisionError::OutsideWindow);
        }
        if let ExperimentKind::DynamicConfig(_) = definition.kind {
            return Err(DecisionError::KindMismatch {
                expected: "experiment",
                found: definition.kind.as_str(),
            });
        }
        Ok(definition)
    }

    fn resolve(
        &self,
        definition: &ExperimentDefinition,
        context: &DecisionContext,
        identity: &str,
        now: Timestamp,
        bucketer: &impl Bucketer,
    ) -> (Option<String>, DecisionReason) {
        if let ExperimentKind::Holdout(holdout) = &definition.kind {
            let bucket = bucketer.bucket(&definition.bucket_seed, identity);
            return if bucket < holdout.size {
                (
                    Some(HoldoutGroup::HOLDOUT_VARIANT.to_owned()),
                    DecisionReason::Bucketed,
                )
            } else {
                (None, DecisionReason::Unbucketed)
            };
        }

        if let Some(group) = &definition.holdout_group {
            if self.is_held_out(group, context, identity, now, bucketer) {
                return (
                    None,
                    DecisionReason::Holdout {
                        group: group.clone(),
                    },
                );
            }
        }

        if let Some(group_name) = &definition.mutex_group {
            let owns = self.mutex_group(group_name).is_some_and(|group| {
                group.owner_of(bucketer.bucket(&group.bucket_seed, identity))
                    == Some(definition.name.as_str())
            });
            if !owns {
                return (
                    None,
                    DecisionReason::MutexGroup {
                        group: group_name.clone(),
                    },
                );
            }
        }

        if let Some(o) = definition.overrides.iter().find(|o| o.matches(context)) {
            return (Some(o.variant.clone()), DecisionReason::Override);
        }

        if let Some(targeting) = &definition.targeting {
            if !targeting.eval(context) {
                return (None, DecisionReason::Targeting);
            }
        }

        let bucket = bucketer.bucket(&definition.bucket_seed, identity);
        match definition.variant_for(bucket) {
            Some(variant) => (Some(variant.name.clone()), DecisionReason::Bucketed),
            None => (None, DecisionReason::Unbucketed),
        }
    }

    /// The holdout buckets the member's identity under its own seed. A holdout written as an
    /// experiment holds out the identities it assigns [`HoldoutGroup::HOLDOUT_VARIANT`]. Holdouts
    /// never nest.
    fn is_held_out(
        &self,
        group: &str,
        context: &DecisionContext,
        identity: &str,
        now: Timestamp,
        bucketer: &impl Bucketer,
    ) -> bool {
        let Some(holdout) = self.get(group) else {
            return false;
        };
        if !holdout.enabled || !holdout.is_active(now) || holdout.holdout_group.is_some() {
            return false;
        }
        let (variant, _) = self.resolve(holdout, context, identity, now, bucketer);
        variant.as_deref() == Some(HoldoutGroup::HOLDOUT_VARIANT)
    }

    /// Read the value of dynamic config `name`.
    pub fn get_value(&self, name: &str, now: Timestamp) -> Result<&DynamicValue, DecisionError> {
        let definition = self.get(name).ok_or(DecisionError::NotFound)?;
        let ExperimentKind::DynamicConfig(value) = &definition.kind else {
            return Err(DecisionError::KindMismatch {
                expected: "dynamic_config",
                found: definition.kind.as_str(),
            });
        };
        if !definition.enabled {
            return Err(DecisionError::Disabled);
        }
        if !definition.is_active(now) {
            return Err(DecisionError::OutsideWindow);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{DecisionError, DecisionReason};
    use crate::{
        bucketer::{Bucketer, Md5Bucketer},
        definitions::{DynamicValue, Timestamp},
        DecisionContext, Snapshot,
    };

    /// Returns a fixed bucket for every seed.
    struct FixedBucketer(f64);

    impl Bucketer for FixedBucketer {
        fn bucket(&self, _seed: &str, _identity: &str) -> f64 {
            self.0
        }
    }

    /// Returns a fixed bucket per seed.
    struct SeedBucketer(&'static [(&'static str, f64)]);

    impl Bucketer for SeedBucketer {
        fn bucket(&self, seed: &str, _identity: &str) -> f64 {
            self.0
                .iter()
                .find(|(s, _)| *s == seed)
                .map(|(_, b)| *b)
                .unwrap_or(0.0)
        }
    }

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn user(id: &str) -> DecisionContext {
        DecisionContext::new().with("user_id", id)
    }

    fn snapshot(json: &str) -> Snapshot {
        let snapshot = Snapshot::from_json(json.as_bytes()).unwrap();
        assert!(snapshot.warnings().is_empty(), "{:?}", snapshot.warnings());
        snapshot
    }

    const FOO: &str = r#"{"foo": {
        "type": "simple",
        "variants": [{"name": "bar", "size": 0.5}, {"name": "baz", "size": 0.5}],
        "overrides": [{"field": "user_id", "values": ["t2_special"], "variant": "bar"}]
    }}"#;

    #[test]
    fn buckets_into_declared_ranges() {
        let snapshot = snapshot(FOO);
        let decide = |bucket| {
            snapshot
                .decide("foo", &user("t2_abc"), now(), &FixedBucketer(bucket))
                .unwrap()
        };

        let decision = decide(0.3);
        assert_eq!(decision.variant.as_deref(), Some("bar"));
        assert_eq!(decision.reason, DecisionReason::Bucketed);
        assert_eq!(decision.identity, "t2_abc");

        assert_eq!(decide(0.0).variant.as_deref(), Some("bar"));
        assert_eq!(decide(0.5).variant.as_deref(), Some("baz"));
        assert_eq!(decide(0.999).variant.as_deref(), Some("baz"));
    }

    #[test]
    fn remainder_is_control() {
        let snapshot = snapshot(r#"{"foo": {"type": "simple", "variants": [{"name": "bar", "size": 0.25}]}}"#);
        let decision = snapshot
            .decide("foo", &user("t2_abc"), now(), &FixedBucketer(0.25))
            .unwrap();
        assert_eq!(decision.variant, None);
        assert_eq!(decision.reason, DecisionReason::Unbucketed);
    }

    #[test]
    fn override_wins_over_bucketing() {
        let snapshot = snapshot(FOO);
        for bucket in [0.0, 0.3, 0.7, 0.99] {
            let decision = snapshot
                .decide("foo", &user("t2_special"), now(), &FixedBucketer(bucket))
                .unwrap();
            assert_eq!(decision.variant.as_deref(), Some("bar"));
            assert_eq!(decision.reason, DecisionReason::Override);
        }
    }

    #[test]
    fn disabled_and_unknown_resolve_to_errors() {
        let snapshot = snapshot(
            r#"{"foo": {"type": "simple", "enabled": false, "variants": [{"name": "bar", "size": 1.0}]}}"#,
        );
        assert_eq!(
            snapshot.decide("foo", &user("t2_abc"), now(), &Md5Bucketer),
            Err(DecisionError::Disabled)
        );
        assert_eq!(
            snapshot.decide("nope", &user("t2_abc"), now(), &Md5Bucketer),
            Err(DecisionError::NotFound)
        );
    }

    #[test]
    fn missing_identity_is_an_error() {
        let snapshot = snapshot(FOO);
        let result = snapshot.decide("foo", &DecisionContext::new(), now(), &Md5Bucketer);
        assert_eq!(
            result,
            Err(DecisionError::MissingIdentity {
                field: "user_id".into()
            })
        );
        assert!(!result.unwrap_err().is_normal());
    }

    #[test]
    fn dynamic_config_is_not_an_experiment() {
        let snapshot = snapshot(r#"{"foo": {"type": "dynamic_config", "value": true}}"#);
        assert!(matches!(
            snapshot.decide("foo", &user("t2_abc"), now(), &Md5Bucketer),
            Err(DecisionError::KindMismatch { .. })
        ));
        assert_eq!(
            snapshot.get_value("foo", now()),
            Ok(&DynamicValue::Boolean(true))
        );
    }

    #[test]
    fn value_of_experiment_is_kind_mismatch() {
        let snapshot = snapshot(FOO);
        assert!(matches!(
            snapshot.get_value("foo", now()),
            Err(DecisionError::KindMismatch { .. })
        ));
    }

    #[test]
    fn activity_window() {
        let snapshot = snapshot(
            r#"{"foo": {"type": "simple", "start_ts": 1717000000, "stop_ts": 1718000000,
                        "variants": [{"name": "bar", "size": 1.0}]}}"#,
        );
        let at = |ts| Utc.timestamp_opt(ts, 0).unwrap();

        assert_eq!(
            snapshot.decide("foo", &user("a"), at(1716999999), &Md5Bucketer),
            Err(DecisionError::OutsideWindow)
        );
        assert!(snapshot
            .decide("foo", &user("a"), at(1717000000), &Md5Bucketer)
            .is_ok());
        assert_eq!(
            snapshot.decide("foo", &user("a"), at(1718000000), &Md5Bucketer),
            Err(DecisionError::OutsideWindow)
        );
    }

    #[test]
    fn targeting_failure_is_control() {
        let snapshot = snapshot(
            r#"{"foo": {"type": "simple", "variants": [{"name": "bar", "size": 1.0}],
                        "targeting": {"equals": {"field": "country_code", "value": "US"}}}}"#,
        );
        let us = user("a").with("country_code", "US");
        let de = user("a").with("country_code", "DE");

        assert_eq!(
            snapshot
                .decide("foo", &us, now(), &Md5Bucketer)
                .unwrap()
                .variant
                .as_deref(),
            Some("bar")
        );
        let decision = snapshot.decide("foo", &de, now(), &Md5Bucketer).unwrap();
        assert_eq!(decision.variant, None);
        assert_eq!(decision.reason, DecisionReason::Targeting);
    }

    #[test]
    fn custom_bucket_val() {
        let snapshot = snapshot(
            r#"{"foo": {"type": "simple", "bucket_val": "device_id", "variants": [{"name": "bar", "size": 1.0}]}}"#,
        );
        assert!(matches!(
            snapshot.decide("foo", &user("a"), now(), &Md5Bucketer),
            Err(DecisionError::MissingIdentity { .. })
        ));
        let decision = snapshot
            .decide(
                "foo",
                &DecisionContext::new().with("device_id", "d1"),
                now(),
                &Md5Bucketer,
            )
            .unwrap();
        assert_eq!(decision.identity_field, "device_id");
        assert_eq!(decision.variant.as_deref(), Some("bar"));
    }

    const HOLDOUT: &str = r#"{
        "hg": {"type": "holdout", "size": 0.1},
        "foo": {"type": "simple", "holdout_group": "hg",
                "variants": [{"name": "bar", "size": 1.0}],
                "overrides": [{"field": "user_id", "values": ["t2_special"], "variant": "bar"}]}
    }"#;

    #[test]
    fn holdout_wins_over_everything() {
        let snapshot = snapshot(HOLDOUT);
        let bucketer = SeedBucketer(&[("hg", 0.05), ("foo", 0.5)]);

        for identity in ["t2_abc", "t2_special"] {
            let decision = snapshot
                .decide("foo", &user(identity), now(), &bucketer)
                .unwrap();
            assert_eq!(decision.variant, None);
            assert_eq!(
                decision.reason,
                DecisionReason::Holdout { group: "hg".into() }
            );
        }

        let outside = SeedBucketer(&[("hg", 0.1), ("foo", 0.5)]);
        assert_eq!(
            snapshot
                .decide("foo", &user("t2_abc"), now(), &outside)
                .unwrap()
                .variant
                .as_deref(),
            Some("bar")
        );
    }

    #[test]
    fn held_out_decision_carries_the_holdout() {
        let snapshot = snapshot(HOLDOUT);
        let decision = snapshot
            .decide("foo", &user("t2_abc"), now(), &SeedBucketer(&[("hg", 0.05)]))
            .unwrap();

        let holdout = decision.holdout.expect("held out");
        assert_eq!(holdout.experiment, "hg");
        assert_eq!(holdout.variant.as_deref(), Some("holdout"));
        assert_eq!(holdout.identity, "t2_abc");
        assert!(holdout.emit_event);
        assert!(holdout.holdout.is_none());

        let outside = snapshot
            .decide("foo", &user("t2_abc"), now(), &SeedBucketer(&[("hg", 0.5)]))
            .unwrap();
        assert!(outside.holdout.is_none());
    }

    #[test]
    fn holdout_declared_as_experiment() {
        let snapshot = snapshot(
            r#"{
              "hg": {"type": "range_variant", "version": "5", "variants": [
                  {"name": "holdout", "range_start": 0.0, "range_end": 0.3},
                  {"name": "control_1", "range_start": 0.3, "range_end": 0.3}
              ]},
              "exp": {"type": "range_variant", "parent_hg_name": "hg",
                      "variants": [{"name": "on", "size": 1.0}]}
            }"#,
        );

        let inside = snapshot
            .decide("exp", &user("a"), now(), &SeedBucketer(&[("hg", 0.1), ("exp", 0.5)]))
            .unwrap();
        assert_eq!(inside.variant, None);
        assert_eq!(inside.reason, DecisionReason::Holdout { group: "hg".into() });
        let holdout = inside.holdout.unwrap();
        assert_eq!(holdout.experiment, "hg");
        assert_eq!(holdout.version.as_deref(), Some("5"));

        let outside = snapshot
            .decide("exp", &user("a"), now(), &SeedBucketer(&[("hg", 0.3), ("exp", 0.5)]))
            .unwrap();
        assert_eq!(outside.variant.as_deref(), Some("on"));
        assert!(outside.holdout.is_none());
    }

    #[test]
    fn inactive_holdout_holds_nobody() {
        let snapshot = snapshot(
            r#"{
              "hg": {"type": "holdout", "size": 1.0, "stop_ts": 1700000000},
              "foo": {"type": "simple", "holdout_group": "hg", "variants": [{"name": "bar", "size": 1.0}]}
            }"#,
        );
        let decision = snapshot
            .decide("foo", &user("a"), now(), &Md5Bucketer)
            .unwrap();
        assert_eq!(decision.variant.as_deref(), Some("bar"));
    }

    #[test]
    fn holdout_evaluated_directly() {
        let snapshot = snapshot(HOLDOUT);
        let inside = snapshot
            .decide("hg", &user("t2_abc"), now(), &FixedBucketer(0.05))
            .unwrap();
        assert_eq!(inside.variant.as_deref(), Some("holdout"));
        let outside = snapshot
            .decide("hg", &user("t2_abc"), now(), &FixedBucketer(0.5))
            .unwrap();
        assert_eq!(outside.variant, None);
    }

    #[test]
    fn mutex_members_are_exclusive() {
        let snapshot = snapshot(
            r#"{
              "mg": {"type": "mutex_group", "members": [
                  {"experiment": "a", "size": 0.3},
                  {"experiment": "b", "size": 0.3}
              ]},
              "a": {"type": "mutex_member", "mutex_group": "mg", "variants": [{"name": "on", "size": 1.0}]},
              "b": {"type": "mutex_member", "mutex_group": "mg", "variants": [{"name": "on", "size": 1.0}]}
            }"#,
        );

        for i in 0..2000 {
            let context = user(&format!("t2_{i}"));
            let assigned = ["a", "b"]
                .iter()
                .filter(|name| {
                    snapshot
                        .decide(name, &context, now(), &Md5Bucketer)
                        .unwrap()
                        .variant
                        .is_some()
                })
                .count();
            assert!(assigned <= 1, "t2_{i} assigned to {assigned} members");
        }

        let decision = snapshot
            .decide("b", &user("x"), now(), &SeedBucketer(&[("mg", 0.1)]))
            .unwrap();
        assert_eq!(decision.reason, DecisionReason::MutexGroup { group: "mg".into() });
    }
}
