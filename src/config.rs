use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::{
    exposure::NoopExposureLogger, refresh_thread::RefreshThreadConfig, Decider, Error,
    ExposureLogger, Result, ShutdownSignal,
};

/// Configuration for [`Decider`].
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use decider::{DeciderConfig, DeliveryError, ExposureEvent};
/// let decider = DeciderConfig::new()
///     .path("/var/local/experiments.json")
///     .timeout(Duration::from_secs(10))
///     .backoff(Duration::from_millis(100))
///     .exposure_logger(|event: ExposureEvent| -> Result<(), DeliveryError> {
///         println!("{:?}", event);
///         Ok(())
///     })
///     .to_decider()
///     .unwrap();
/// ```
pub struct DeciderConfig {
    pub(crate) path: PathBuf,
    pub(crate) timeout: Option<Duration>,
    pub(crate) backoff: Option<Duration>,
    pub(crate) refresh: RefreshThreadConfig,
    pub(crate) exposure_logger: Arc<dyn ExposureLogger + Send + Sync>,
    pub(crate) shutdown: ShutdownSignal,
}

impl DeciderConfig {
    /// Default path of the definitions file.
    pub const DEFAULT_PATH: &'static str = "/var/local/experiments.json";

    /// Create a default configuration: definitions at [`DeciderConfig::DEFAULT_PATH`], no
    /// waiting for the file, exposures discarded.
    pub fn new() -> Self {
        DeciderConfig {
            path: PathBuf::from(DeciderConfig::DEFAULT_PATH),
            timeout: None,
            backoff: None,
            refresh: RefreshThreadConfig::default(),
            exposure_logger: Arc::new(NoopExposureLogger),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Override the path of the definitions file.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// How long the initial load waits for the definitions file to appear. Without a timeout (the
    /// default) a missing file fails construction immediately.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Initial delay between checks for the definitions file. The delay doubles after every
    /// attempt. Without a backoff (the default) the file is re-checked every few milliseconds.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Interval between checks of the definitions file for changes.
    ///
    /// Defaults to [`RefreshThreadConfig::DEFAULT_REFRESH_INTERVAL`].
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh.interval = interval;
        self
    }

    /// Randomized duration subtracted from every refresh interval.
    ///
    /// Defaults to [`RefreshThreadConfig::DEFAULT_REFRESH_JITTER`].
    pub fn refresh_jitter(mut self, jitter: Duration) -> Self {
        self.refresh.jitter = jitter;
        self
    }

    /// Set exposure logger to forward exposure events to your event pipeline.
    pub fn exposure_logger(
        mut self,
        exposure_logger: impl ExposureLogger + Send + Sync + 'static,
    ) -> Self {
        self.exposure_logger = Arc::new(exposure_logger);
        self
    }

    /// Share the application's shutdown signal. Cancelling it aborts a pending initial load and
    /// stops the refresh thread.
    pub fn shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Apply file-based `settings` on top of this configuration.
    pub fn settings(mut self, settings: DeciderSettings) -> Self {
        if let Some(path) = settings.path {
            self.path = path;
        }
        self.timeout = settings.timeout.or(self.timeout);
        self.backoff = settings.backoff.or(self.backoff);
        self
    }

    /// Load the definitions and create a new [`Decider`].
    ///
    /// # Errors
    ///
    /// See [`Decider::new`].
    pub fn to_decider(self) -> Result<Decider> {
        Decider::new(self)
    }
}

impl Default for DeciderConfig {
    fn default() -> Self {
        DeciderConfig::new()
    }
}

/// Settings read from the application's configuration file.
///
/// Keys are looked up under a prefix (conventionally `experiments.`):
///
/// - `path`: path of the definitions file.
/// - `timeout`: how long to wait for the file, as a timespan (e.g., `"2 seconds"`).
/// - `backoff`: initial delay between checks, as a timespan.
///
/// ```
/// # use std::{collections::HashMap, time::Duration};
/// # use decider::DeciderSettings;
/// let app_config: HashMap<String, String> = [
///     ("experiments.path", "/tmp/experiments.json"),
///     ("experiments.timeout", "2 seconds"),
///     ("other.key", "ignored"),
/// ]
/// .into_iter()
/// .map(|(k, v)| (k.to_owned(), v.to_owned()))
/// .collect();
///
/// let settings = DeciderSettings::from_app_config(&app_config, "experiments.").unwrap();
/// assert_eq!(settings.timeout, Some(Duration::from_secs(2)));
/// assert_eq!(settings.backoff, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeciderSettings {
    /// Path of the definitions file.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Initial load timeout.
    #[serde(default, deserialize_with = "deserialize_timespan")]
    pub timeout: Option<Duration>,
    /// Initial retry delay.
    #[serde(default, deserialize_with = "deserialize_timespan")]
    pub backoff: Option<Duration>,
}

impl DeciderSettings {
    /// Default key prefix.
    pub const DEFAULT_PREFIX: &'static str = "experiments.";

    /// Extract settings from a flat key-value application config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] if `prefix` does not end with `.`, if a key under the
    /// prefix is unknown, or if a timespan cannot be parsed.
    pub fn from_app_config(
        app_config: &HashMap<String, String>,
        prefix: &str,
    ) -> Result<DeciderSettings> {
        if !prefix.ends_with('.') {
            return Err(Error::InvalidSettings(format!(
                "prefix {prefix:?} must end with '.'"
            )));
        }

        let settings = app_config
            .iter()
            .filter_map(|(key, value)| {
                let key = key.strip_prefix(prefix)?;
                Some((key.to_owned(), serde_json::Value::String(value.clone())))
            })
            .collect::<serde_json::Map<_, _>>();

        serde_json::from_value(serde_json::Value::Object(settings))
            .map_err(|err| Error::InvalidSettings(err.to_string()))
    }
}

fn deserialize_timespan<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let Some(s) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    parse_timespan(&s).map(Some).map_err(serde::de::Error::custom)
}

/// Parse a human timespan such as `"500 milliseconds"`, `"2 seconds"` or `"1 minute"`.
pub(crate) fn parse_timespan(s: &str) -> std::result::Result<Duration, String> {
    let mut parts = s.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("invalid timespan {s:?}: expected \"<count> <unit>\""));
    };
    let count: f64 = count
        .parse()
        .map_err(|_| format!("invalid timespan count {count:?}"))?;

    let unit_seconds = match unit.trim_end_matches('s') {
        "millisecond" => 0.001,
        "second" => 1.0,
        "minute" => 60.0,
        "hour" => 3600.0,
        "day" => 86400.0,
        _ => return Err(format!("unknown timespan unit {unit:?}")),
    };

    Duration::try_from_secs_f64(count * unit_seconds)
        .map_err(|_| format!("timespan {s:?} out of range"))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf, time::Duration};

    use super::{parse_timespan, DeciderConfig, DeciderSettings};
    use crate::Error;

    #[test]
    fn timespans() {
        assert_eq!(parse_timespan("2 seconds"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_timespan("1 second"), Ok(Duration::from_secs(1)));
        assert_eq!(
            parse_timespan("500 milliseconds"),
            Ok(Duration::from_millis(500))
        );
        assert_eq!(parse_timespan("1.5 minutes"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_timespan("1 hour"), Ok(Duration::from_secs(3600)));
        assert!(parse_timespan("2").is_err());
        assert!(parse_timespan("two seconds").is_err());
        assert!(parse_timespan("2 fortnights").is_err());
        assert!(parse_timespan("-1 seconds").is_err());
    }

    fn app_config(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn settings_use_prefix() {
        let settings = DeciderSettings::from_app_config(
            &app_config(&[
                ("experiments.path", "/tmp/e.json"),
                ("experiments.backoff", "100 milliseconds"),
                ("other.timeout", "5 seconds"),
            ]),
            DeciderSettings::DEFAULT_PREFIX,
        )
        .unwrap();

        assert_eq!(
            settings,
            DeciderSettings {
                path: Some(PathBuf::from("/tmp/e.json")),
                timeout: None,
                backoff: Some(Duration::from_millis(100)),
            }
        );
    }

    #[test]
    fn settings_reject_bad_input() {
        assert!(matches!(
            DeciderSettings::from_app_config(&app_config(&[]), "experiments"),
            Err(Error::InvalidSettings(_))
        ));
        assert!(matches!(
            DeciderSettings::from_app_config(
                &app_config(&[("experiments.timeout", "soon")]),
                "experiments."
            ),
            Err(Error::InvalidSettings(_))
        ));
        assert!(matches!(
            DeciderSettings::from_app_config(
                &app_config(&[("experiments.typo", "x")]),
                "experiments."
            ),
            Err(Error::InvalidSettings(_))
        ));
    }

    #[test]
    fn settings_override_config() {
        let config = DeciderConfig::new()
            .timeout(Duration::from_secs(1))
            .settings(DeciderSettings {
                path: Some(PathBuf::from("/tmp/e.json")),
                timeout: None,
                backoff: Some(Duration::from_secs(2)),
            });
        assert_eq!(config.path, PathBuf::from("/tmp/e.json"));
        assert_eq!(config.timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.backoff, Some(Duration::from_secs(2)));
    }
}
