//! Exposure events and the per-request tracker that deduplicates them.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use serde::Serialize;

use crate::{
    eval::{Decision, DecisionReason},
    Attributes, DeciderStats,
};

/// A record that an identity was shown (or explicitly excluded from) a variant of an experiment.
///
/// Exposure events need to be forwarded to analytics storage for downstream analysis.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureEvent {
    /// Name of the experiment.
    pub experiment: String,
    /// Experiment id from the definitions file.
    pub id: Option<u64>,
    /// Experiment version from the definitions file.
    pub version: Option<String>,
    /// Experiment owner from the definitions file.
    pub owner: Option<String>,
    /// Exposed variant. `None` means the identity was evaluated but not assigned to a variant.
    pub variant: Option<String>,
    /// The exposed identity.
    pub identity: String,
    /// Context field the identity was read from (e.g., `user_id`).
    pub identity_field: String,
    /// Why the variant was assigned. `None` for manual exposures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecisionReason>,
    /// Context of the request at the time of the decision.
    pub context: Arc<Attributes>,
    /// Additional fields passed by the caller.
    pub extra: Attributes,
    /// When the exposure happened.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExposureEvent {
    pub(crate) fn from_decision(
        decision: &Decision,
        context: &Arc<Attributes>,
        extra: Option<&Attributes>,
    ) -> ExposureEvent {
        ExposureEvent {
            experiment: decision.experiment.clone(),
            id: decision.id,
            version: decision.version.clone(),
            owner: decision.owner.clone(),
            variant: decision.variant.clone(),
            identity: decision.identity.clone(),
            identity_field: decision.identity_field.clone(),
            reason: Some(decision.reason.clone()),
            context: Arc::clone(context),
            extra: extra.cloned().unwrap_or_default(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// The exposure logger failed to deliver an event.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to deliver exposure event: {0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    /// Create a delivery error with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> DeliveryError {
        DeliveryError(reason.into())
    }
}

/// Sink for exposure events, implemented by the host application.
///
/// Closures taking an [`ExposureEvent`] and returning `Result<(), DeliveryError>` implement this
/// trait.
///
/// ```
/// # use decider::{DeliveryError, ExposureEvent, ExposureLogger};
/// let logger = |event: ExposureEvent| -> Result<(), DeliveryError> {
///     let json = serde_json::to_string(&event).map_err(|err| DeliveryError::new(err.to_string()))?;
///     println!("{json}");
///     Ok(())
/// };
/// # fn check(_: impl ExposureLogger) {}
/// # check(logger);
/// ```
pub trait ExposureLogger {
    /// Forward `event`. Errors are logged and counted by the decider, never returned to the
    /// caller of the decision.
    fn log_exposure(&self, event: ExposureEvent) -> Result<(), DeliveryError>;
}

/// Discards all events.
pub(crate) struct NoopExposureLogger;

impl ExposureLogger for NoopExposureLogger {
    fn log_exposure(&self, _event: ExposureEvent) -> Result<(), DeliveryError> {
        Ok(())
    }
}

impl<T: Fn(ExposureEvent) -> Result<(), DeliveryError>> ExposureLogger for T {
    fn log_exposure(&self, event: ExposureEvent) -> Result<(), DeliveryError> {
        self(event)
    }
}

impl From<String> for DeliveryError {
    fn from(reason: String) -> Self {
        DeliveryError(reason)
    }
}

/// Forwards exposure events at most once per `(experiment, identity)` for the lifetime of one
/// request.
pub(crate) struct ExposureTracker {
    seen: Mutex<HashSet<(String, String)>>,
}

impl ExposureTracker {
    pub(crate) fn new() -> ExposureTracker {
        ExposureTracker {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Forward `event` unless this tracker already forwarded an event for the same experiment and
    /// identity. Delivery failures are logged and counted.
    ///
    /// Returns `true` if the event was handed to the logger.
    pub(crate) fn expose(
        &self,
        event: ExposureEvent,
        logger: &dyn ExposureLogger,
        stats: &DeciderStats,
    ) -> bool {
        let first = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((event.experiment.clone(), event.identity.clone()));
        if !first {
            log::trace!(target: "decider",
                        experiment = event.experiment.as_str(),
                        identity = event.identity.as_str();
                        "exposure already logged for this request");
            stats.record_deduplicated();
            return false;
        }

        log::trace!(target: "decider", event:serde; "logging exposure");
        let experiment = event.experiment.clone();
        let delivered = logger.log_exposure(event);
        stats.record_exposure(delivered.is_ok());
        if let Err(err) = delivered {
            log::warn!(target: "decider",
                       experiment = experiment.as_str();
                       "{err}");
        }
        true
    }
}
