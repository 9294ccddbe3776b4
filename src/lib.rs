//! An in-process decision engine for controlled experiments.
//!
//! # Overview
//!
//! The crate revolves around a [`Decider`] that serves experiment definitions from a JSON file
//! maintained by an external sidecar. The file is loaded once at startup (optionally waiting for
//! it to appear) and re-checked in the background; every change is published as a new immutable
//! [`Snapshot`].
//!
//! Each request creates a [`RequestDecider`] from a [`DecisionContext`] holding the request's
//! identity fields (e.g., `user_id`) and targeting fields. [`RequestDecider::get_variant`]
//! deterministically buckets the identity into a variant, honoring holdout groups, mutually
//! exclusive groups, overrides and targeting rules. Dynamic configuration values are read through
//! the typed getters such as [`RequestDecider::get_bool`].
//!
//! An [`ExposureLogger`] should be provided to forward [`ExposureEvent`]s to your event pipeline.
//! Exposures are deduplicated per request.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only constructing a [`Decider`] can fail:
//! decisions resolve unknown experiments, invalid contexts and similar conditions to "no variant"
//! and log the cause. Invalid entries of the definitions file are dropped individually and
//! reported in [`Snapshot::warnings`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `decider` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into decider operations.
//!
//! # Metrics
//!
//! Refresh, publish and exposure outcomes are counted through the
//! [`metrics`](https://docs.rs/metrics/latest/metrics/) facade as [`CLIENT_COUNTER`], labelled by
//! `operation`, `success`, `error_type` and `pkg_version`. Install a recorder such as
//! `metrics-exporter-prometheus` to export them. [`Decider::stats`] reads the same counts locally.
//!
//! # Examples
//!
//! ```
//! # use decider::{Decider, DecisionContext, DeliveryError, ExposureEvent, Snapshot};
//! let snapshot = Snapshot::from_json(br#"{
//!     "foo": {
//!         "type": "simple",
//!         "variants": [{"name": "bar", "size": 0.5}, {"name": "baz", "size": 0.5}]
//!     },
//!     "dark_mode": {"type": "dynamic_config", "value_type": "boolean", "value": true}
//! }"#).unwrap();
//!
//! let decider = Decider::from_snapshot(snapshot, |event: ExposureEvent| -> Result<(), DeliveryError> {
//!     println!("{:?}", event);
//!     Ok(())
//! });
//!
//! let request = decider.with_context(DecisionContext::new().with("user_id", "t2_abc"));
//! assert!(request.get_variant("foo", None).is_some());
//! assert_eq!(request.get_bool("dark_mode"), Some(true));
//! ```
//!
//! A runnable demo can be found in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod bucketer;
mod config;
mod config_source;
mod decider;
mod definitions;
mod error;
mod eval;
mod exposure;
mod parser;
mod refresh_thread;
mod shutdown;
mod snapshot;
mod snapshot_store;
mod stats;
mod targeting;

pub use attributes::{AttributeValue, Attributes, DecisionContext};
pub use bucketer::{Bucketer, Md5Bucketer};
pub use config::{DeciderConfig, DeciderSettings};
pub use decider::{ContextExtractor, Decider, RequestDecider, IDENTIFIER_TYPES};
pub use definitions::{
    DynamicValue, DynamicValueType, ExperimentDefinition, ExperimentInfo, ExperimentKind,
    HoldoutGroup, MutexGroup, MutexMember, Override, Timestamp, Variant,
};
pub use error::{Error, Result};
pub use eval::{Decision, DecisionError, DecisionReason};
pub use exposure::{DeliveryError, ExposureEvent, ExposureLogger};
pub use parser::{DefinitionError, DefinitionWarning};
pub use refresh_thread::RefreshThreadConfig;
pub use shutdown::ShutdownSignal;
pub use snapshot::Snapshot;
pub use stats::{DeciderStats, StatsSnapshot, CLIENT_COUNTER, DEFINITION_WARNINGS_COUNTER};
pub use targeting::{RangeBounds, Targeting, TargetingError, Value};
