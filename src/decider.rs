use std::{borrow::Cow, collections::HashMap, sync::Arc};

use chrono::Utc;

use crate::{
    bucketer::Md5Bucketer,
    config_source::ConfigSource,
    definitions::{DynamicValue, ExperimentInfo, ExperimentKind},
    eval::Decision,
    exposure::{ExposureEvent, ExposureTracker, NoopExposureLogger},
    refresh_thread::RefreshThread,
    snapshot_store::SnapshotStore,
    Attributes, DeciderConfig, DeciderStats, DecisionContext, ExposureLogger, Result, Snapshot,
    StatsSnapshot,
};

/// Identifier types accepted by [`RequestDecider::get_variant_for_identifier`].
pub const IDENTIFIER_TYPES: &[&str] = &[
    "user_id",
    "device_id",
    "canonical_url",
    "subreddit_id",
    "ad_account_id",
    "business_id",
];

/// Builds the [`Attributes`] of a [`DecisionContext`] from the host application's request type.
///
/// Closures taking `&R` and returning [`Attributes`] implement this trait.
pub trait ContextExtractor<R: ?Sized> {
    /// Extract identity and targeting fields from `request`.
    fn extract(&self, request: &R) -> Attributes;
}

impl<R: ?Sized, F: Fn(&R) -> Attributes> ContextExtractor<R> for F {
    fn extract(&self, request: &R) -> Attributes {
        self(request)
    }
}

/// Process-wide experiment decider.
///
/// `Decider` owns the served [`Snapshot`] and the background thread that keeps it up to date. It
/// is shared between request handlers; every request creates its own [`RequestDecider`].
///
/// # Examples
/// ```no_run
/// # use decider::{DeciderConfig, DecisionContext};
/// let decider = DeciderConfig::new().to_decider().unwrap();
///
/// let request = decider.with_context(DecisionContext::new().with("user_id", "t2_abc"));
/// if request.get_variant("new_checkout", None).as_deref() == Some("enabled") {
///     // ...
/// }
/// ```
pub struct Decider {
    store: Arc<SnapshotStore>,
    exposure_logger: Arc<dyn ExposureLogger + Send + Sync>,
    stats: Arc<DeciderStats>,
    refresh_thread: Option<RefreshThread>,
}

impl Decider {
    /// Load the definitions file and start the refresh thread.
    ///
    /// This blocks for up to the configured timeout while the definitions file is missing.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigUnavailable`](crate::Error::ConfigUnavailable) if the file does not
    ///   appear in time.
    /// - [`Error::ConfigParse`](crate::Error::ConfigParse) if the file is not a JSON object.
    /// - [`Error::Cancelled`](crate::Error::Cancelled) if the shutdown signal fires while
    ///   waiting.
    /// - [`Error::Io`](crate::Error::Io) if the file cannot be read or the refresh thread cannot
    ///   be started.
    pub fn new(config: DeciderConfig) -> Result<Decider> {
        let mut source = ConfigSource::new(config.path, config.timeout, config.backoff);
        let snapshot = source.load(&config.shutdown)?;

        let mut decider = Decider::with_store(snapshot, config.exposure_logger);
        decider.refresh_thread = Some(RefreshThread::start(
            source,
            decider.store.clone(),
            decider.stats.clone(),
            config.shutdown,
            config.refresh,
        )?);

        Ok(decider)
    }

    /// Create a decider serving a fixed snapshot, without a definitions file or refresh thread.
    pub fn from_snapshot(
        snapshot: Snapshot,
        exposure_logger: impl ExposureLogger + Send + Sync + 'static,
    ) -> Decider {
        Decider::with_store(snapshot, Arc::new(exposure_logger))
    }

    fn with_store(
        snapshot: Snapshot,
        exposure_logger: Arc<dyn ExposureLogger + Send + Sync>,
    ) -> Decider {
        let stats = Arc::new(DeciderStats::default());
        stats.record_published(snapshot.warnings().len());

        let store = Arc::new(SnapshotStore::new());
        store.publish(snapshot);

        Decider {
            store,
            exposure_logger,
            stats,
            refresh_thread: None,
        }
    }

    /// The currently served snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.get_snapshot()
    }

    /// Current values of the operational counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Create a per-request decider for `context`.
    pub fn with_context(&self, context: DecisionContext) -> RequestDecider<'_> {
        RequestDecider {
            decider: self,
            context,
            exposures: ExposureTracker::new(),
        }
    }

    /// Create a per-request decider with the context extracted from `request`.
    ///
    /// ```
    /// # use decider::{Attributes, Decider};
    /// struct Request {
    ///     user_id: String,
    /// }
    ///
    /// let extractor = |request: &Request| -> Attributes {
    ///     [("user_id".to_owned(), request.user_id.as_str().into())].into_iter().collect()
    /// };
    ///
    /// let decider = Decider::default();
    /// let request = Request { user_id: "t2_abc".to_owned() };
    /// let request_decider = decider.from_request(&request, &extractor);
    /// assert_eq!(
    ///     request_decider.context().get("user_id").and_then(|v| v.as_str()),
    ///     Some("t2_abc")
    /// );
    /// ```
    pub fn from_request<R: ?Sized>(
        &self,
        request: &R,
        extractor: &impl ContextExtractor<R>,
    ) -> RequestDecider<'_> {
        self.with_context(DecisionContext::from(extractor.extract(request)))
    }

    /// Stop the refresh thread and wait for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`](crate::Error::RefreshThreadPanicked) if the refresh
    ///   thread panicked.
    pub fn shutdown(mut self) -> Result<()> {
        match self.refresh_thread.take() {
            Some(thread) => thread.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for Decider {
    fn drop(&mut self) {
        if let Some(thread) = &self.refresh_thread {
            thread.stop();
        }
    }
}

impl Default for Decider {
    /// A decider without any definitions that discards exposures.
    fn default() -> Self {
        Decider::from_snapshot(Snapshot::empty(), NoopExposureLogger)
    }
}

/// Decisions for a single request.
///
/// Exposures are deduplicated per `(experiment, identity)` for the lifetime of the
/// `RequestDecider`, so calling [`RequestDecider::get_variant`] repeatedly for the same experiment
/// emits a single exposure event.
pub struct RequestDecider<'a> {
    decider: &'a Decider,
    context: DecisionContext,
    exposures: ExposureTracker,
}

impl RequestDecider<'_> {
    /// Context of this request.
    pub fn context(&self) -> &DecisionContext {
        &self.context
    }

    /// Get the variant of experiment `name` and emit an exposure event.
    ///
    /// `extra` fields are added to the context for this decision and attached to the exposure
    /// event. Returns `None` when the request is not assigned to any variant, including when the
    /// experiment does not exist or is disabled.
    pub fn get_variant(&self, name: &str, extra: Option<&Attributes>) -> Option<String> {
        self.get_variant_in(name, &self.context_with(extra), extra)
    }

    /// Get the variant of experiment `name` without emitting an exposure event.
    ///
    /// If the request is held out of the experiment, the holdout group is still exposed.
    pub fn get_variant_without_expose(
        &self,
        name: &str,
        extra: Option<&Attributes>,
    ) -> Option<String> {
        let snapshot = self.decider.store.get_snapshot();
        self.decide(&snapshot, name, &self.context_with(extra), extra)?
            .variant
    }

    /// Emit an exposure event for `variant` of experiment `name`.
    ///
    /// Use this after [`RequestDecider::get_variant_without_expose`] once the variant is actually
    /// shown. Nothing is emitted for an empty or missing variant, for dynamic configs, for
    /// experiments that are unknown, disabled or inactive, or for experiments with `emit_event`
    /// turned off. Exposures already emitted by this request for the same experiment and identity
    /// are skipped.
    pub fn expose(&self, name: &str, variant: Option<&str>, extra: Option<&Attributes>) {
        let Some(variant) = variant.filter(|variant| !variant.is_empty()) else {
            log::debug!(target: "decider", experiment = name; "no variant to expose");
            return;
        };

        let snapshot = self.decider.store.get_snapshot();
        let definition = match snapshot.experiment(name, Utc::now()) {
            Ok(definition) => definition,
            Err(err) if err.is_normal() => {
                log::debug!(target: "decider",
                            experiment = name;
                            "not exposing because of: {err}");
                return;
            }
            Err(err) => {
                log::warn!(target: "decider",
                           experiment = name;
                           "error occurred while exposing an experiment: {err}");
                return;
            }
        };
        if !definition.emit_event {
            log::debug!(target: "decider", experiment = name; "exposure events are turned off");
            return;
        }

        let context = self.context_with(extra);
        let Some(identity) = context.identity(&definition.bucket_val) else {
            log::warn!(target: "decider",
                       experiment = name,
                       field = definition.bucket_val.as_str();
                       "cannot expose without identity");
            return;
        };

        let event = ExposureEvent {
            experiment: definition.name.clone(),
            id: definition.id,
            version: definition.version.clone(),
            owner: definition.owner.clone(),
            variant: Some(variant.to_owned()),
            identity,
            identity_field: definition.bucket_val.clone(),
            reason: None,
            context: context.attributes().clone(),
            extra: extra.cloned().unwrap_or_default(),
            timestamp: Utc::now(),
        };
        self.emit(event);
    }

    /// Get the variant of `name` with `identifier_type` set to `identifier` in the context, and
    /// emit an exposure event.
    ///
    /// `identifier_type` must be one of [`IDENTIFIER_TYPES`] and must match the `bucket_val` of
    /// the experiment; otherwise no variant is returned and nothing is exposed.
    pub fn get_variant_for_identifier(
        &self,
        name: &str,
        identifier: &str,
        identifier_type: &str,
    ) -> Option<String> {
        let (decision, context) = self.decide_for_identifier(name, identifier, identifier_type)?;
        self.expose_decision(&decision, &context, None);
        decision.variant
    }

    /// Like [`RequestDecider::get_variant_for_identifier`], without emitting an exposure event
    /// (except for the holdout group of a held out identifier).
    pub fn get_variant_for_identifier_without_expose(
        &self,
        name: &str,
        identifier: &str,
        identifier_type: &str,
    ) -> Option<String> {
        self.decide_for_identifier(name, identifier, identifier_type)?
            .0
            .variant
    }

    /// Decisions for every experiment and holdout that assigns this request a variant. Exposure
    /// events are only emitted for the holdout groups the request is held out by.
    pub fn get_all_variants_without_expose(&self) -> Vec<Decision> {
        self.all_decisions(&self.context, None)
    }

    /// Decisions for every experiment bucketing on `identifier_type` that assigns `identifier` a
    /// variant. Like [`RequestDecider::get_all_variants_without_expose`], only holdout groups are
    /// exposed.
    pub fn get_all_variants_for_identifier_without_expose(
        &self,
        identifier: &str,
        identifier_type: &str,
    ) -> Vec<Decision> {
        match self.identifier_context(identifier, identifier_type) {
            Some(context) => self.all_decisions(&context, Some(identifier_type)),
            None => Vec::new(),
        }
    }

    /// Get the boolean value of dynamic config `name`.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_value(name)?.as_boolean()
    }

    /// Get the string value of dynamic config `name`.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get_value(name)?.as_str().map(str::to_owned)
    }

    /// Get the numeric value of dynamic config `name`. Both integer and float configs are
    /// numbers.
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.get_value(name)?.as_number()
    }

    /// Get the integer value of dynamic config `name`.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get_value(name)?.as_integer()
    }

    /// Get the float value of dynamic config `name`.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get_value(name)? {
            DynamicValue::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Get the map value of dynamic config `name`.
    pub fn get_map(&self, name: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
        match self.get_value(name)? {
            DynamicValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Values of all enabled and active dynamic configs.
    pub fn get_all_dynamic_configs(&self) -> HashMap<String, DynamicValue> {
        let snapshot = self.decider.store.get_snapshot();
        let now = Utc::now();
        snapshot
            .experiments()
            .filter_map(|definition| {
                let value = snapshot.get_value(&definition.name, now).ok()?;
                Some((definition.name.clone(), value.clone()))
            })
            .collect()
    }

    /// Metadata of experiment `name`.
    pub fn get_experiment(&self, name: &str) -> Option<ExperimentInfo> {
        self.decider
            .store
            .get_snapshot()
            .get(name)
            .map(ExperimentInfo::from)
    }

    fn get_value(&self, name: &str) -> Option<DynamicValue> {
        let snapshot = self.decider.store.get_snapshot();
        match snapshot.get_value(name, Utc::now()) {
            Ok(value) => Some(value.clone()),
            Err(err) if err.is_normal() => {
                log::debug!(target: "decider",
                            experiment = name;
                            "returning no value because of: {err}");
                None
            }
            Err(err) => {
                log::warn!(target: "decider",
                           experiment = name;
                           "error occurred while reading a dynamic config: {err}");
                None
            }
        }
    }

    fn get_variant_in(
        &self,
        name: &str,
        context: &DecisionContext,
        extra: Option<&Attributes>,
    ) -> Option<String> {
        let snapshot = self.decider.store.get_snapshot();
        let decision = self.decide(&snapshot, name, context, extra)?;
        self.expose_decision(&decision, context, extra);
        decision.variant
    }

    /// Decide experiment `name` in `snapshot` and expose the holdout group if the request is held
    /// out. Errors are logged and resolve to `None`.
    fn decide(
        &self,
        snapshot: &Snapshot,
        name: &str,
        context: &DecisionContext,
        extra: Option<&Attributes>,
    ) -> Option<Decision> {
        match snapshot.decide(name, context, Utc::now(), &Md5Bucketer) {
            Ok(decision) => {
                log::trace!(target: "decider",
                            experiment = name,
                            identity = decision.identity.as_str(),
                            decision:serde;
                            "evaluated an experiment");
                self.expose_holdout(&decision, context, extra);
                Some(decision)
            }
            Err(err) if err.is_normal() => {
                log::debug!(target: "decider",
                            experiment = name;
                            "returning no variant because of: {err}");
                None
            }
            Err(err) => {
                log::warn!(target: "decider",
                           experiment = name;
                           "error occurred while evaluating an experiment: {err}");
                None
            }
        }
    }

    fn decide_for_identifier(
        &self,
        name: &str,
        identifier: &str,
        identifier_type: &str,
    ) -> Option<(Decision, DecisionContext)> {
        let context = self.identifier_context(identifier, identifier_type)?;
        let snapshot = self.decider.store.get_snapshot();

        if let Some(definition) = snapshot.get(name) {
            let decidable = !matches!(definition.kind, ExperimentKind::DynamicConfig(_));
            if decidable && definition.bucket_val != identifier_type {
                log::warn!(target: "decider",
                           experiment = name,
                           identifier_type = identifier_type,
                           bucket_val = definition.bucket_val.as_str();
                           "requested identifier_type {identifier_type:?} is incompatible with experiment's bucket_val {:?}",
                           definition.bucket_val);
                return None;
            }
        }

        let decision = self.decide(&snapshot, name, &context, None)?;
        Some((decision, context))
    }

    fn all_decisions(
        &self,
        context: &DecisionContext,
        bucket_val: Option<&str>,
    ) -> Vec<Decision> {
        let snapshot = self.decider.store.get_snapshot();
        let now = Utc::now();
        let mut decisions: Vec<Decision> = snapshot
            .experiments()
            .filter(|definition| !matches!(definition.kind, ExperimentKind::DynamicConfig(_)))
            .filter(|definition| bucket_val.map_or(true, |field| definition.bucket_val == field))
            .filter_map(|definition| {
                snapshot
                    .decide(&definition.name, context, now, &Md5Bucketer)
                    .ok()
            })
            .inspect(|decision| self.expose_holdout(decision, context, None))
            .filter(|decision| decision.variant.is_some())
            .collect();
        decisions.sort_by(|a, b| a.experiment.cmp(&b.experiment));
        decisions
    }

    fn expose_decision(
        &self,
        decision: &Decision,
        context: &DecisionContext,
        extra: Option<&Attributes>,
    ) {
        if decision.emit_event {
            self.emit(ExposureEvent::from_decision(
                decision,
                context.attributes(),
                extra,
            ));
        }
    }

    fn expose_holdout(
        &self,
        decision: &Decision,
        context: &DecisionContext,
        extra: Option<&Attributes>,
    ) {
        if let Some(holdout) = &decision.holdout {
            self.expose_decision(holdout, context, extra);
        }
    }

    fn emit(&self, event: ExposureEvent) {
        self.exposures.expose(
            event,
            &*self.decider.exposure_logger,
            &self.decider.stats,
        );
    }

    fn context_with(&self, extra: Option<&Attributes>) -> Cow<'_, DecisionContext> {
        match extra {
            None => Cow::Borrowed(&self.context),
            Some(extra) => {
                let mut context = self.context.clone();
                for (field, value) in extra {
                    context = context.with(field.clone(), value.clone());
                }
                Cow::Owned(context)
            }
        }
    }

    fn identifier_context(
        &self,
        identifier: &str,
        identifier_type: &str,
    ) -> Option<DecisionContext> {
        if !IDENTIFIER_TYPES.contains(&identifier_type) {
            log::warn!(target: "decider",
                       identifier_type;
                       "unsupported identifier type, expected one of {IDENTIFIER_TYPES:?}");
            return None;
        }
        Some(self.context.clone().with(identifier_type, identifier))
    }
}
