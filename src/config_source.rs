//! Reads the definitions file written by the sidecar.
use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use crate::{Error, Result, ShutdownSignal, Snapshot};

/// Retry delay used while waiting for the file when no backoff is configured.
pub(crate) const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Every this many refreshes the file is read and hashed even when its stamp is unchanged.
/// Filesystems with coarse modification times can hide a same-length rewrite from the stamp.
pub(crate) const FORCED_RECHECK_EVERY: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Source of definition snapshots backed by a file on the local filesystem.
#[derive(Debug)]
pub struct ConfigSource {
    path: PathBuf,
    timeout: Option<Duration>,
    backoff: Option<Duration>,
    /// Stamp of the file the last successful or failed parse was attempted on.
    last_stamp: Option<FileStamp>,
    /// Hash of the document behind the served snapshot.
    last_hash: Option<[u8; 16]>,
    /// Refreshes skipped on an unchanged stamp since the file was last read.
    unchanged_refreshes: u32,
}

impl ConfigSource {
    /// Create a source reading `path`.
    ///
    /// `timeout` bounds how long [`ConfigSource::load`] waits for the file to appear. `backoff` is
    /// the initial delay between checks; it doubles after every attempt.
    pub fn new(
        path: impl Into<PathBuf>,
        timeout: Option<Duration>,
        backoff: Option<Duration>,
    ) -> ConfigSource {
        ConfigSource {
            path: path.into(),
            timeout,
            backoff,
            last_stamp: None,
            last_hash: None,
            unchanged_refreshes: 0,
        }
    }

    /// Path of the definitions file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the definitions file and parse it.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigUnavailable`] if the file does not appear before the timeout.
    /// - [`Error::Cancelled`] if `shutdown` fires while waiting.
    /// - [`Error::ConfigParse`] if the file is not a JSON object.
    /// - [`Error::Io`] if the file exists but cannot be read.
    pub fn load(&mut self, shutdown: &ShutdownSignal) -> Result<Snapshot> {
        self.wait_for_file(shutdown)?;

        let stamp = self.stamp()?;
        let bytes = std::fs::read(&self.path)?;
        self.last_stamp = Some(stamp);
        let snapshot = Snapshot::from_json(&bytes)?;
        self.last_hash = Some(*snapshot.source_hash());

        log::info!(target: "decider",
                   path:? = self.path,
                   experiments = snapshot.len(),
                   warnings = snapshot.warnings().len();
                   "loaded experiment definitions");
        Ok(snapshot)
    }

    /// Re-read the file if it changed since the last call.
    ///
    /// Returns `Ok(None)` when the modification time and length are unchanged, or when the content
    /// hashes to the same value as the served snapshot's source. An unchanged stamp is only trusted
    /// for a limited number of consecutive calls, after which the content is hashed anyway.
    pub fn refresh(&mut self) -> Result<Option<Snapshot>> {
        let stamp = self.stamp()?;
        if self.last_stamp == Some(stamp) && self.unchanged_refreshes + 1 < FORCED_RECHECK_EVERY {
            self.unchanged_refreshes += 1;
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)?;
        self.last_stamp = Some(stamp);
        self.unchanged_refreshes = 0;

        let hash = md5::compute(&bytes).0;
        if self.last_hash == Some(hash) {
            log::trace!(target: "decider", path:? = self.path; "definitions touched but unchanged");
            return Ok(None);
        }

        let snapshot = Snapshot::from_json(&bytes)?;
        self.last_hash = Some(hash);
        Ok(Some(snapshot))
    }

    fn stamp(&self) -> Result<FileStamp> {
        let metadata = std::fs::metadata(&self.path)?;
        Ok(FileStamp {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }

    fn wait_for_file(&self, shutdown: &ShutdownSignal) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }

        let unavailable = || Error::ConfigUnavailable {
            path: self.path.clone(),
        };

        // A timeout too large to represent waits until the file appears or `shutdown` fires.
        let deadline = match self.timeout {
            Some(timeout) if !timeout.is_zero() => Instant::now().checked_add(timeout),
            _ => return Err(unavailable()),
        };

        let mut delay = self
            .backoff
            .filter(|backoff| !backoff.is_zero())
            .unwrap_or(MIN_RETRY_DELAY);

        loop {
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                log::warn!(target: "decider", path:? = self.path; "experiment config did not appear in time");
                return Err(unavailable());
            }

            log::debug!(target: "decider",
                        path:? = self.path,
                        delay:? = delay;
                        "waiting for experiment config");
            let wait = match deadline {
                Some(deadline) => delay.min(deadline - now),
                None => delay,
            };
            if shutdown.wait_timeout(wait) {
                return Err(Error::Cancelled);
            }

            if self.path.exists() {
                return Ok(());
            }

            if self.backoff.is_some() {
                delay = delay.saturating_mul(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{ConfigSource, FORCED_RECHECK_EVERY};
    use crate::{Error, ShutdownSignal};

    const DOC: &str = r#"{"foo": {"type": "simple", "variants": [{"name": "bar", "size": 0.5}]}}"#;

    #[test]
    fn missing_file_without_timeout_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ConfigSource::new(dir.path().join("experiments.json"), None, None);

        let start = Instant::now();
        let result = source.load(&ShutdownSignal::new());

        assert!(matches!(result, Err(Error::ConfigUnavailable { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn missing_file_fails_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ConfigSource::new(
            dir.path().join("experiments.json"),
            Some(Duration::from_millis(100)),
            Some(Duration::from_millis(10)),
        );

        let start = Instant::now();
        let result = source.load(&ShutdownSignal::new());

        assert!(matches!(result, Err(Error::ConfigUnavailable { .. })));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn waits_for_file_to_appear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        let mut source = ConfigSource::new(&path, Some(Duration::from_secs(10)), None);

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let staging = path.with_extension("tmp");
            std::fs::write(&staging, DOC).unwrap();
            std::fs::rename(staging, path).unwrap();
        });

        let snapshot = source.load(&ShutdownSignal::new()).unwrap();
        writer.join().unwrap();
        assert!(snapshot.get("foo").is_some());
    }

    #[test]
    fn shutdown_cancels_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ConfigSource::new(
            dir.path().join("experiments.json"),
            Some(Duration::from_secs(60)),
            Some(Duration::from_secs(1)),
        );
        let shutdown = ShutdownSignal::new();

        {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                shutdown.cancel();
            });
        }

        let start = Instant::now();
        assert!(matches!(source.load(&shutdown), Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn unbounded_timeout_waits_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        let mut source = ConfigSource::new(&path, Some(Duration::MAX), None);

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::write(path, DOC).unwrap();
        });

        let snapshot = source.load(&ShutdownSignal::new()).unwrap();
        writer.join().unwrap();
        assert!(snapshot.get("foo").is_some());
    }

    #[test]
    fn unbounded_timeout_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ConfigSource::new(
            dir.path().join("experiments.json"),
            Some(Duration::MAX),
            Some(Duration::from_secs(1)),
        );
        let shutdown = ShutdownSignal::new();

        {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                shutdown.cancel();
            });
        }

        assert!(matches!(source.load(&shutdown), Err(Error::Cancelled)));
    }

    #[test]
    fn unparseable_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        std::fs::write(&path, "not json").unwrap();

        let mut source = ConfigSource::new(&path, None, None);
        assert!(matches!(
            source.load(&ShutdownSignal::new()),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn refresh_skips_unchanged_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        std::fs::write(&path, DOC).unwrap();

        let mut source = ConfigSource::new(&path, None, None);
        source.load(&ShutdownSignal::new()).unwrap();
        assert!(source.refresh().unwrap().is_none());

        // Same content rewritten: the stamp may change but the hash does not.
        std::fs::write(&path, DOC).unwrap();
        assert!(source.refresh().unwrap().is_none());

        std::fs::write(&path, r#"{"other": {"type": "simple"}}"#).unwrap();
        let snapshot = source.refresh().unwrap().unwrap();
        assert!(snapshot.get("other").is_some());
    }

    #[test]
    fn same_stamp_rewrite_is_picked_up_eventually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        std::fs::write(&path, DOC).unwrap();

        let mut source = ConfigSource::new(&path, None, None);
        source.load(&ShutdownSignal::new()).unwrap();

        // Same length, and the modification time is put back to hide the rewrite from the stamp.
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let changed = DOC.replace("bar", "baz");
        assert_eq!(changed.len(), DOC.len());
        std::fs::write(&path, &changed).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();

        let mut refreshed = None;
        for _ in 0..FORCED_RECHECK_EVERY {
            if let Some(snapshot) = source.refresh().unwrap() {
                refreshed = Some(snapshot);
                break;
            }
        }

        let snapshot = refreshed.expect("rewrite was never detected");
        assert!(snapshot.get("foo").unwrap().has_variant("baz"));
        assert!(source.refresh().unwrap().is_none());
    }

    #[test]
    fn refresh_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.json");
        std::fs::write(&path, DOC).unwrap();

        let mut source = ConfigSource::new(&path, None, None);
        source.load(&ShutdownSignal::new()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(source.refresh(), Err(Error::Io(_))));
    }
}
