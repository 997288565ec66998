//! Persisted throttling, snooze and cached-release state.
//!
//! The policy lives in [`UpdateStateStore`]; where the record is kept is a
//! [`StateBackend`] detail (a JSON file in the app directory, or memory in
//! tests). The record is loaded lazily on first access and written through on
//! every mutation. One process owns it; the last writer wins.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ReleaseInfo;
use crate::atomic_file;

/// File name of the persisted record inside the app directory.
pub const STATE_FILE_NAME: &str = "update_state.json";

/// Errors raised while persisting the update state record.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read update state {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write update state {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid update state at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize update state: {0}")]
    Serialize(serde_json::Error),
    #[error("App dir error: {0}")]
    AppDir(#[from] crate::app_dirs::AppDirError),
}

/// Durable key/value record. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThrottleRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snooze_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tag_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_artifact_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_release_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_artifact_size: Option<i64>,
}

impl ThrottleRecord {
    fn cached_release(&self) -> Option<ReleaseInfo> {
        Some(ReleaseInfo {
            version_name: self.cached_version.clone()?,
            tag_name: self.cached_tag_name.clone()?,
            artifact_url: self.cached_artifact_url.clone()?,
            release_notes: self.cached_release_notes.clone().unwrap_or_default(),
            artifact_size_bytes: self
                .cached_artifact_size
                .and_then(|size| u64::try_from(size).ok())
                .unwrap_or(0),
        })
    }

    fn set_cached_release(&mut self, info: Option<&ReleaseInfo>) {
        self.cached_version = info.map(|i| i.version_name.clone());
        self.cached_tag_name = info.map(|i| i.tag_name.clone());
        self.cached_artifact_url = info.map(|i| i.artifact_url.clone());
        self.cached_release_notes = info.map(|i| i.release_notes.clone());
        self.cached_artifact_size =
            info.map(|i| i64::try_from(i.artifact_size_bytes).unwrap_or(i64::MAX));
    }
}

/// Narrow storage interface for [`ThrottleRecord`].
pub trait StateBackend: Send + Sync {
    fn load(&self) -> Result<ThrottleRecord, StateError>;
    fn save(&self, record: &ThrottleRecord) -> Result<(), StateError>;
}

/// Stores the record as pretty JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backend at `update_state.json` in the `.uplift` app directory.
    pub fn in_app_dir() -> Result<Self, StateError> {
        Ok(Self::new(
            crate::app_dirs::app_root_dir()?.join(STATE_FILE_NAME),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<ThrottleRecord, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ThrottleRecord::default());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, record: &ThrottleRecord) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_vec_pretty(record).map_err(StateError::Serialize)?;
        atomic_file::write(&self.path, &json).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Keeps the record in memory; cloned handles share one record.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    record: Arc<Mutex<ThrottleRecord>>,
}

impl MemoryBackend {
    pub fn snapshot(&self) -> ThrottleRecord {
        lock(&self.record).clone()
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<ThrottleRecord, StateError> {
        Ok(self.snapshot())
    }

    fn save(&self, record: &ThrottleRecord) -> Result<(), StateError> {
        *lock(&self.record) = record.clone();
        Ok(())
    }
}

/// Source of the current time in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn starting_at(millis: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Snooze, cooldown and cached-release policy over a [`StateBackend`].
pub struct UpdateStateStore {
    backend: Box<dyn StateBackend>,
    clock: Arc<dyn Clock>,
    snooze_duration: Duration,
    check_cooldown: Duration,
    record: Mutex<Option<ThrottleRecord>>,
}

impl UpdateStateStore {
    pub const DEFAULT_SNOOZE: Duration = Duration::from_secs(60 * 60);
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

    pub fn new(backend: impl StateBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            clock: Arc::new(SystemClock),
            snooze_duration: Self::DEFAULT_SNOOZE,
            check_cooldown: Self::DEFAULT_COOLDOWN,
            record: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_durations(mut self, snooze: Duration, cooldown: Duration) -> Self {
        self.snooze_duration = snooze;
        self.check_cooldown = cooldown;
        self
    }

    /// Whether update prompts are currently suppressed.
    pub fn is_snoozed(&self) -> bool {
        let now = self.clock.now_millis();
        let Some(until) = self.read(|record| record.snooze_until) else {
            return false;
        };
        let snoozed = now < until;
        if snoozed {
            tracing::debug!(
                "Update is snoozed for {} more minutes",
                (until - now) / 60_000
            );
        }
        snoozed
    }

    /// Suppress prompts until `now + snooze duration`.
    pub fn snooze(&self) -> Result<(), StateError> {
        let until = self
            .clock
            .now_millis()
            .saturating_add(duration_millis(self.snooze_duration));
        self.update(|record| record.snooze_until = Some(until))?;
        tracing::info!(
            "Update snoozed for {} minutes",
            self.snooze_duration.as_secs() / 60
        );
        Ok(())
    }

    pub fn clear_snooze(&self) -> Result<(), StateError> {
        self.update(|record| record.snooze_until = None)?;
        tracing::debug!("Snooze cleared");
        Ok(())
    }

    /// Whether the cooldown since the last network check has elapsed.
    pub fn should_check_network(&self) -> bool {
        let Some(last) = self.read(|record| record.last_check_timestamp) else {
            return true;
        };
        let elapsed = self.clock.now_millis().saturating_sub(last);
        let cooldown = duration_millis(self.check_cooldown);
        let due = elapsed > cooldown;
        if !due {
            let wait_minutes = cooldown.saturating_sub(elapsed) / 60_000;
            tracing::debug!("Skipping update check, next check in {wait_minutes} minutes");
        }
        due
    }

    /// Stamp the last network check with the current time.
    pub fn record_check_performed(&self) -> Result<(), StateError> {
        let now = self.clock.now_millis();
        self.update(|record| record.last_check_timestamp = Some(now))
    }

    pub fn cache_release(&self, info: &ReleaseInfo) -> Result<(), StateError> {
        self.update(|record| record.set_cached_release(Some(info)))?;
        tracing::debug!("Cached release {}", info.version_name);
        Ok(())
    }

    pub fn cached_release(&self) -> Option<ReleaseInfo> {
        self.read(ThrottleRecord::cached_release)
    }

    pub fn clear_cached_release(&self) -> Result<(), StateError> {
        self.update(|record| record.set_cached_release(None))?;
        tracing::debug!("Cleared cached release");
        Ok(())
    }

    /// Forget everything: snooze, last check and cached release.
    pub fn clear_all(&self) -> Result<(), StateError> {
        self.update(|record| *record = ThrottleRecord::default())?;
        tracing::info!("Cleared all update state");
        Ok(())
    }

    /// Snooze deadline, if one is set (it may already have passed).
    pub fn snoozed_until(&self) -> Option<i64> {
        self.read(|record| record.snooze_until)
    }

    pub fn last_check_at(&self) -> Option<i64> {
        self.read(|record| record.last_check_timestamp)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    fn read<T>(&self, f: impl FnOnce(&ThrottleRecord) -> T) -> T {
        let mut guard = lock(&self.record);
        f(self.loaded(&mut guard))
    }

    fn update(&self, f: impl FnOnce(&mut ThrottleRecord)) -> Result<(), StateError> {
        let mut guard = lock(&self.record);
        let record = self.loaded(&mut guard);
        f(&mut *record);
        self.backend.save(record)
    }

    fn loaded<'a>(&self, slot: &'a mut Option<ThrottleRecord>) -> &'a mut ThrottleRecord {
        slot.get_or_insert_with(|| {
            self.backend.load().unwrap_or_else(|err| {
                tracing::warn!("Ignoring unreadable update state: {err}");
                ThrottleRecord::default()
            })
        })
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
