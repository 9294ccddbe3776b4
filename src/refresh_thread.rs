//! A background thread that periodically re-checks the definitions file and publishes new
//! snapshots to the snapshot store.
use std::{sync::Arc, time::Duration};

use rand::{thread_rng, Rng};

use crate::{
    config_source::ConfigSource, snapshot_store::SnapshotStore, DeciderStats, Error, Result,
    ShutdownSignal,
};

/// Configuration for [`RefreshThread`].
#[derive(Debug, Clone)]
pub struct RefreshThreadConfig {
    /// Interval to wait between checks of the definitions file.
    ///
    /// Defaults to [`RefreshThreadConfig::DEFAULT_REFRESH_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between checks. This keeps processes started
    /// together from re-reading the file in lockstep.
    ///
    /// Defaults to [`RefreshThreadConfig::DEFAULT_REFRESH_JITTER`].
    pub jitter: Duration,
}

impl RefreshThreadConfig {
    /// Default value for [`RefreshThreadConfig::interval`].
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`RefreshThreadConfig::jitter`].
    pub const DEFAULT_REFRESH_JITTER: Duration = Duration::from_millis(500);

    /// How long to sleep before the next check: `interval` shortened by a random amount of at
    /// most `jitter`, never below zero.
    pub fn next_wait(&self) -> Duration {
        let shortened_by = thread_rng().gen_range(Duration::ZERO..=self.jitter);
        self.interval.saturating_sub(shortened_by)
    }
}

impl Default for RefreshThreadConfig {
    fn default() -> RefreshThreadConfig {
        RefreshThreadConfig {
            interval: RefreshThreadConfig::DEFAULT_REFRESH_INTERVAL,
            jitter: RefreshThreadConfig::DEFAULT_REFRESH_JITTER,
        }
    }
}

/// The definitions refresh thread.
///
/// Failures to read or parse the file are logged and counted; the previously published snapshot
/// keeps being served.
pub struct RefreshThread {
    join_handle: std::thread::JoinHandle<()>,
    /// Private to the thread, so that stopping one decider does not cancel the application's
    /// shutdown signal.
    stop: ShutdownSignal,
}

impl RefreshThread {
    /// Starts the refresh thread.
    ///
    /// The thread exits when [`RefreshThread::stop`] is called or when `shutdown` is cancelled,
    /// whichever happens first.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(
        mut source: ConfigSource,
        store: Arc<SnapshotStore>,
        stats: Arc<DeciderStats>,
        shutdown: ShutdownSignal,
        config: RefreshThreadConfig,
    ) -> std::io::Result<RefreshThread> {
        let stop = ShutdownSignal::new();

        let join_handle = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("decider-refresh".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        if stop.wait_timeout(config.next_wait()) || shutdown.is_cancelled() {
                            log::debug!(target: "decider", "refresh thread received stop command");
                            return;
                        }

                        stats.record_refresh();
                        match source.refresh() {
                            Ok(Some(snapshot)) => {
                                stats.record_published(snapshot.warnings().len());
                                store.publish(snapshot);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                stats.record_refresh_failure(&err);
                                log::warn!(target: "decider",
                                           path:? = source.path();
                                           "failed to refresh experiment config, keeping previous snapshot: {err}");
                            }
                        }
                    }));

                    if let Err(panic) = result {
                        log::error!(target: "decider", "refresh thread panicked");
                        std::panic::resume_unwind(panic);
                    }
                })?
        };

        Ok(RefreshThread { join_handle, stop })
    }

    /// Stop the refresh thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop the refresh thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::RefreshThreadPanicked)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{RefreshThread, RefreshThreadConfig};
    use crate::{
        config_source::ConfigSource, snapshot_store::SnapshotStore, DeciderStats, ShutdownSignal,
    };

    fn fast() -> RefreshThreadConfig {
        RefreshThreadConfig {
            interval: Duration::from_millis(10),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn publishes_changes_and_survives_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        std::fs::write(&path, "{}").unwrap();

        let mut source = ConfigSource::new(&path, None, None);
        let store = Arc::new(SnapshotStore::new());
        let stats = Arc::new(DeciderStats::default());
        store.publish(source.load(&ShutdownSignal::new()).unwrap());

        let thread = RefreshThread::start(
            source,
            store.clone(),
            stats.clone(),
            ShutdownSignal::new(),
            fast(),
        )
        .unwrap();

        std::fs::write(&path, "broken").unwrap();
        wait_until(|| stats.snapshot().refresh_failures > 0);
        assert_eq!(store.get_snapshot().version(), 1);

        std::fs::write(&path, r#"{"a": {"type": "simple"}}"#).unwrap();
        wait_until(|| store.get_snapshot().get("a").is_some());
        assert_eq!(store.get_snapshot().version(), 2);

        thread.shutdown().unwrap();
    }

    #[test]
    fn application_shutdown_stops_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        std::fs::write(&path, "{}").unwrap();

        let shutdown = ShutdownSignal::new();
        let thread = RefreshThread::start(
            ConfigSource::new(&path, None, None),
            Arc::new(SnapshotStore::new()),
            Arc::new(DeciderStats::default()),
            shutdown.clone(),
            fast(),
        )
        .unwrap();

        shutdown.cancel();
        thread.shutdown().unwrap();
    }

    #[test]
    fn waits_stay_within_the_jitter_window() {
        let config = RefreshThreadConfig {
            interval: Duration::from_millis(100),
            jitter: Duration::from_millis(20),
        };
        for _ in 0..1000 {
            let wait = config.next_wait();
            assert!(
                (Duration::from_millis(80)..=Duration::from_millis(100)).contains(&wait),
                "{wait:?}"
            );
        }
    }

    #[test]
    fn jitter_larger_than_interval_never_underflows() {
        let config = RefreshThreadConfig {
            interval: Duration::from_millis(5),
            jitter: Duration::from_secs(60),
        };
        for _ in 0..1000 {
            assert!(config.next_wait() <= Duration::from_millis(5));
        }
    }

    #[test]
    fn default_wait_is_close_to_the_interval() {
        let wait = RefreshThreadConfig::default().next_wait();
        assert!(wait <= RefreshThreadConfig::DEFAULT_REFRESH_INTERVAL);
        assert!(wait >= Duration::from_millis(4500));
        assert_eq!(fast().next_wait(), Duration::from_millis(10));
    }

    fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }
}
