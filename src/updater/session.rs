use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::app_dirs::{self, AppDirError};
use crate::config::UpdaterConfig;

use super::{
    ArtifactDownloader, CheckResult, DesktopPlatform, DownloadProgress, DownloadState,
    InstallLauncher, JsonFileBackend, ReleaseFetcher, ReleaseInfo, RepositoryId, StateError,
    UpdateError, UpdateEvent, UpdatePhase, UpdateStateStore,
};

/// Why [`UpdateSession::check_for_updates`] did or did not reach the network.
#[derive(Debug)]
pub enum CheckOutcome {
    /// Prompts are snoozed; nothing was checked.
    Snoozed,
    /// A release found earlier is still pending; returned without a request.
    Cached(ReleaseInfo),
    /// The last check is too recent.
    CooldownActive,
    /// The feed was queried.
    Checked(CheckResult),
}

impl CheckOutcome {
    /// The release to offer, if any.
    pub fn release(&self) -> Option<&ReleaseInfo> {
        match self {
            CheckOutcome::Cached(info) | CheckOutcome::Checked(CheckResult::UpdateAvailable(info)) => {
                Some(info)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Repository(#[from] UpdateError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    AppDir(#[from] AppDirError),
    #[error("Failed to start background worker: {0}")]
    Worker(#[from] io::Error),
}

/// Read-only view for status displays.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub repository: RepositoryId,
    pub local_version: String,
    pub phase: UpdatePhase,
    /// Epoch milliseconds; may lie in the past.
    pub snoozed_until: Option<i64>,
    pub last_check_at: Option<i64>,
    pub cached_release: Option<ReleaseInfo>,
    /// Present when an artifact is sitting at the download destination.
    pub downloaded_artifact: Option<PathBuf>,
}

/// The update flow for one repository: throttled checks, download and
/// installer hand-off, with the whole-flow phase tracked alongside.
pub struct UpdateSession {
    repository: RepositoryId,
    store: Arc<UpdateStateStore>,
    fetcher: ReleaseFetcher,
    downloader: ArtifactDownloader,
    launcher: InstallLauncher,
    phase: Arc<Mutex<UpdatePhase>>,
}

impl UpdateSession {
    pub fn new(
        repository: RepositoryId,
        store: UpdateStateStore,
        fetcher: ReleaseFetcher,
        downloader: ArtifactDownloader,
        launcher: InstallLauncher,
    ) -> Self {
        Self {
            repository,
            store: Arc::new(store),
            fetcher,
            downloader,
            launcher,
            phase: Arc::new(Mutex::new(UpdatePhase::Idle)),
        }
    }

    /// Build a session persisting to the app directory and installing
    /// through the desktop platform.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, SessionError> {
        let repository = config.repository()?;
        let store = UpdateStateStore::new(JsonFileBackend::in_app_dir()?)
            .with_durations(config.snooze_duration(), config.check_cooldown());
        let fetcher = ReleaseFetcher::with_options(
            config.release.api_base.clone(),
            config.release.artifact_suffix.clone(),
            config.local_version(),
            config.network.user_agent.clone(),
            config.feed_timeouts(),
        )?;
        let destination = app_dirs::downloads_dir()?.join(&config.install.download_file_name);
        let downloader = ArtifactDownloader::with_options(
            destination,
            config.network.user_agent.clone(),
            config.download_timeouts(),
        )?;
        let launcher = InstallLauncher::new(DesktopPlatform::new(
            config.install.permission_settings_url.clone(),
        ))
        .with_mime_type(config.install.mime_type.clone())
        .with_provider_authority(config.install.provider_authority.clone());
        Ok(Self::new(repository, store, fetcher, downloader, launcher))
    }

    pub fn repository(&self) -> &RepositoryId {
        &self.repository
    }

    pub fn phase(&self) -> UpdatePhase {
        lock(&self.phase).clone()
    }

    pub fn state_store(&self) -> Arc<UpdateStateStore> {
        Arc::clone(&self.store)
    }

    pub fn downloader(&self) -> &ArtifactDownloader {
        &self.downloader
    }

    pub fn launcher(&self) -> &InstallLauncher {
        &self.launcher
    }

    /// Throttled check. Snooze, a pending cached release and the cooldown
    /// answer on the calling thread; otherwise the feed is queried on the
    /// fetcher's worker and `on_outcome` runs there after the check time has
    /// been recorded.
    pub fn check_for_updates(&self, on_outcome: impl FnOnce(CheckOutcome) + Send + 'static) {
        match self.gate() {
            Some(outcome) => on_outcome(outcome),
            None => self.query_feed(on_outcome),
        }
    }

    pub fn check_for_updates_blocking(&self) -> CheckOutcome {
        match self.gate() {
            Some(outcome) => outcome,
            None => self.query_feed_blocking(),
        }
    }

    /// Manual "check now": ignores snooze, cache and cooldown.
    pub fn check_now(&self, on_outcome: impl FnOnce(CheckOutcome) + Send + 'static) {
        self.prepare_check();
        self.query_feed(on_outcome);
    }

    pub fn check_now_blocking(&self) -> CheckOutcome {
        self.prepare_check();
        self.query_feed_blocking()
    }

    /// Hide update prompts for the snooze duration.
    pub fn snooze(&self) -> Result<(), StateError> {
        self.store.snooze()?;
        transition(&self.phase, UpdateEvent::Snoozed);
        Ok(())
    }

    pub fn clear_snooze(&self) -> Result<(), StateError> {
        self.store.clear_snooze()?;
        transition(&self.phase, UpdateEvent::SnoozeLapsed);
        Ok(())
    }

    /// Download `release` on the downloader's worker. Callbacks run there.
    pub fn download(
        &self,
        release: &ReleaseInfo,
        mut on_progress: impl FnMut(DownloadProgress) + Send + 'static,
        on_terminal: impl FnOnce(DownloadState) + Send + 'static,
    ) {
        tracing::info!("Downloading {} from {}", release.version_name, release.artifact_url);
        transition(&self.phase, UpdateEvent::DownloadStarted);
        let progress_phase = Arc::clone(&self.phase);
        let terminal_phase = Arc::clone(&self.phase);
        self.downloader.download(
            release.artifact_url.clone(),
            move |progress| {
                transition(&progress_phase, UpdateEvent::DownloadProgressed(progress));
                on_progress(progress);
            },
            move |terminal| {
                record_download_terminal(&terminal_phase, &terminal);
                on_terminal(terminal);
            },
        );
    }

    pub fn download_blocking(
        &self,
        release: &ReleaseInfo,
        mut on_progress: impl FnMut(DownloadProgress),
    ) -> DownloadState {
        tracing::info!("Downloading {} from {}", release.version_name, release.artifact_url);
        transition(&self.phase, UpdateEvent::DownloadStarted);
        let terminal = self
            .downloader
            .download_blocking(&release.artifact_url, |progress| {
                transition(&self.phase, UpdateEvent::DownloadProgressed(progress));
                on_progress(progress);
            });
        record_download_terminal(&self.phase, &terminal);
        terminal
    }

    pub fn can_install(&self) -> bool {
        self.launcher.can_install()
    }

    pub fn request_install_permission(&self) {
        self.launcher.request_install_permission();
    }

    /// Hand `artifact` to the installer; the cached release is forgotten once
    /// the hand-off succeeds.
    pub fn try_install(&self, artifact: &Path) -> Result<(), UpdateError> {
        self.launcher.try_install(artifact)?;
        if let Err(err) = self.store.clear_cached_release() {
            tracing::warn!("Installer launched but cached release was kept: {err}");
        }
        transition(&self.phase, UpdateEvent::InstallRequested);
        Ok(())
    }

    pub fn install(&self, artifact: &Path) -> bool {
        match self.try_install(artifact) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Install of {} not started: {err}", artifact.display());
                false
            }
        }
    }

    /// Install whatever sits at the download destination.
    pub fn install_downloaded(&self) -> bool {
        self.install(self.downloader.destination())
    }

    /// Remove a leftover artifact. Returns whether one existed.
    pub fn clean(&self) -> io::Result<bool> {
        let removed = self.downloader.delete_downloaded_artifact()?;
        if removed {
            tracing::info!("Removed {}", self.downloader.destination().display());
        }
        Ok(removed)
    }

    /// Forget snooze, check history and cached release; back to `Idle`.
    pub fn reset(&self) -> Result<(), StateError> {
        self.store.clear_all()?;
        *lock(&self.phase) = UpdatePhase::Idle;
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            repository: self.repository.clone(),
            local_version: self.fetcher.local_version().to_string(),
            phase: self.phase(),
            snoozed_until: self.store.snoozed_until(),
            last_check_at: self.store.last_check_at(),
            cached_release: self.store.cached_release(),
            downloaded_artifact: self
                .downloader
                .has_downloaded_artifact()
                .then(|| self.downloader.destination().to_path_buf()),
        }
    }

    fn gate(&self) -> Option<CheckOutcome> {
        if self.store.is_snoozed() {
            tracing::debug!("Update check skipped: snoozed");
            transition(&self.phase, UpdateEvent::Snoozed);
            return Some(CheckOutcome::Snoozed);
        }
        self.prepare_check();
        if let Some(info) = self.store.cached_release() {
            tracing::debug!("Using cached release {}", info.version_name);
            transition(&self.phase, UpdateEvent::CheckStarted);
            transition(&self.phase, UpdateEvent::FoundUpdate(info.clone()));
            return Some(CheckOutcome::Cached(info));
        }
        if !self.store.should_check_network() {
            return Some(CheckOutcome::CooldownActive);
        }
        None
    }

    /// Bring resting phases back to `Idle` so a new check can start.
    fn prepare_check(&self) {
        let mut phase = lock(&self.phase);
        let event = match &*phase {
            // A forced check while snoozed keeps the stored snooze.
            UpdatePhase::Snoozed if self.store.is_snoozed() => None,
            UpdatePhase::Snoozed => Some(UpdateEvent::SnoozeLapsed),
            UpdatePhase::UpToDate | UpdatePhase::CheckFailed(_) | UpdatePhase::DownloadFailed(_) => {
                Some(UpdateEvent::Reset)
            }
            _ => return,
        };
        let next = match event {
            Some(event) => phase.clone().advance(event).ok(),
            None => Some(UpdatePhase::Idle),
        };
        if let Some(next) = next {
            *phase = next;
        }
    }

    fn query_feed(&self, on_outcome: impl FnOnce(CheckOutcome) + Send + 'static) {
        transition(&self.phase, UpdateEvent::CheckStarted);
        let store = Arc::clone(&self.store);
        let phase = Arc::clone(&self.phase);
        self.fetcher
            .check_latest_with(&self.repository, move |result| {
                record_check(&store, &phase, &result);
                on_outcome(CheckOutcome::Checked(result));
            });
    }

    fn query_feed_blocking(&self) -> CheckOutcome {
        transition(&self.phase, UpdateEvent::CheckStarted);
        let result = self.fetcher.check_latest_blocking(&self.repository);
        record_check(&self.store, &self.phase, &result);
        CheckOutcome::Checked(result)
    }
}

/// Runs before the caller sees `result`.
fn record_check(store: &UpdateStateStore, phase: &Mutex<UpdatePhase>, result: &CheckResult) {
    if let Err(err) = store.record_check_performed() {
        tracing::warn!("Could not record update check time: {err}");
    }
    let (saved, event) = match result {
        CheckResult::UpdateAvailable(info) => {
            (store.cache_release(info), UpdateEvent::FoundUpdate(info.clone()))
        }
        CheckResult::NoUpdateAvailable => {
            (store.clear_cached_release(), UpdateEvent::FoundUpToDate)
        }
        CheckResult::Error { message, .. } => {
            tracing::warn!("Update check failed: {message}");
            (Ok(()), UpdateEvent::CheckFailed(message.clone()))
        }
    };
    if let Err(err) = saved {
        tracing::warn!("Could not update cached release: {err}");
    }
    transition(phase, event);
}

fn record_download_terminal(phase: &Mutex<UpdatePhase>, terminal: &DownloadState) {
    match terminal {
        DownloadState::Completed(path) => {
            transition(phase, UpdateEvent::DownloadCompleted(path.clone()))
        }
        DownloadState::Failed { message, .. } => {
            transition(phase, UpdateEvent::DownloadFailed(message.clone()))
        }
        DownloadState::Idle | DownloadState::Downloading(_) => {}
    }
}

/// Advance `phase`; a rejected event leaves it unchanged.
fn transition(phase: &Mutex<UpdatePhase>, event: UpdateEvent) {
    let mut phase = lock(phase);
    match phase.clone().advance(event) {
        Ok(next) => *phase = next,
        Err(err) => tracing::debug!("{err}"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_server::{ok_with_length, serve_once, serve_sequence};
    use crate::updater::{InstallPlatform, InstallRequest, ManualClock, MemoryBackend, ThrottleRecord};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const START: i64 = 1_700_000_000_000;

    #[derive(Clone, Default)]
    struct RecordingPlatform {
        requests: Arc<Mutex<Vec<InstallRequest>>>,
    }

    impl InstallPlatform for RecordingPlatform {
        fn can_install(&self) -> bool {
            true
        }

        fn open_permission_settings(&self) -> io::Result<()> {
            Ok(())
        }

        fn dispatch(&self, request: &InstallRequest) -> io::Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Harness {
        session: UpdateSession,
        clock: ManualClock,
        backend: MemoryBackend,
        platform: RecordingPlatform,
        _dir: TempDir,
    }

    fn harness(api_base: &str) -> Harness {
        let dir = tempdir().unwrap();
        let clock = ManualClock::starting_at(START);
        let backend = MemoryBackend::default();
        let platform = RecordingPlatform::default();
        let store = UpdateStateStore::new(backend.clone()).with_clock(clock.clone());
        let session = UpdateSession::new(
            "owner/app".parse().unwrap(),
            store,
            ReleaseFetcher::new(api_base, ".apk", "1.0.0").unwrap(),
            ArtifactDownloader::new(dir.path().join("update.apk")).unwrap(),
            InstallLauncher::new(platform.clone()),
        );
        Harness {
            session,
            clock,
            backend,
            platform,
            _dir: dir,
        }
    }

    /// A base URL nothing listens on; any request fails.
    fn dead_base() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        base
    }

    fn feed(version: &str, artifact_url: &str) -> Vec<u8> {
        let json = format!(
            r#"{{"tag_name":"v{version}","body":"notes","assets":[
                {{"name":"app.apk","browser_download_url":"{artifact_url}","size":3}}]}}"#
        );
        ok_with_length("application/json", json.as_bytes())
    }

    fn release(version: &str) -> ReleaseInfo {
        ReleaseInfo {
            version_name: version.into(),
            tag_name: format!("v{version}"),
            release_notes: "notes".into(),
            artifact_url: "https://example.invalid/app.apk".into(),
            artifact_size_bytes: 3,
        }
    }

    #[test]
    fn snoozed_session_skips_network() {
        let h = harness(&dead_base());
        h.session.snooze().unwrap();
        let outcome = h.session.check_for_updates_blocking();
        assert!(matches!(outcome, CheckOutcome::Snoozed), "{outcome:?}");
        assert_eq!(h.backend.snapshot().last_check_timestamp, None);
        assert_eq!(h.session.phase(), UpdatePhase::Snoozed);
    }

    #[test]
    fn cached_release_is_returned_without_network() {
        let h = harness(&dead_base());
        h.session.state_store().cache_release(&release("1.5.0")).unwrap();
        let outcome = h.session.check_for_updates_blocking();
        let CheckOutcome::Cached(info) = outcome else {
            panic!("expected cached, got {outcome:?}");
        };
        assert_eq!(info.version_name, "1.5.0");
        assert_eq!(h.backend.snapshot().last_check_timestamp, None);
        assert!(matches!(h.session.phase(), UpdatePhase::UpdateAvailable(_)));
    }

    #[test]
    fn cooldown_skips_network() {
        let h = harness(&dead_base());
        h.session.state_store().record_check_performed().unwrap();
        h.clock.advance(Duration::from_secs(60));
        let outcome = h.session.check_for_updates_blocking();
        assert!(matches!(outcome, CheckOutcome::CooldownActive), "{outcome:?}");
        assert_eq!(h.session.phase(), UpdatePhase::Idle);
    }

    #[test]
    fn fresh_update_is_cached_and_recorded() {
        let base = serve_once(feed("1.2.0", "https://example.invalid/app.apk"));
        let h = harness(&base);
        let outcome = h.session.check_for_updates_blocking();
        assert_eq!(outcome.release().unwrap().version_name, "1.2.0");
        let record = h.backend.snapshot();
        assert_eq!(record.last_check_timestamp, Some(START));
        assert_eq!(record.cached_version.as_deref(), Some("1.2.0"));
        assert!(matches!(h.session.phase(), UpdatePhase::UpdateAvailable(_)));
    }

    #[test]
    fn failed_check_records_time_and_keeps_cache() {
        let h = harness(&dead_base());
        h.session.state_store().cache_release(&release("1.5.0")).unwrap();
        let outcome = h.session.check_now_blocking();
        assert!(
            matches!(outcome, CheckOutcome::Checked(CheckResult::Error { .. })),
            "{outcome:?}"
        );
        let record = h.backend.snapshot();
        assert_eq!(record.last_check_timestamp, Some(START));
        assert_eq!(record.cached_version.as_deref(), Some("1.5.0"));
        assert!(matches!(h.session.phase(), UpdatePhase::CheckFailed(_)));
    }

    #[test]
    fn up_to_date_check_clears_cache() {
        let base = serve_once(feed("1.0.0", "https://example.invalid/app.apk"));
        let h = harness(&base);
        h.session.state_store().cache_release(&release("1.5.0")).unwrap();
        let outcome = h.session.check_now_blocking();
        assert!(matches!(
            outcome,
            CheckOutcome::Checked(CheckResult::NoUpdateAvailable)
        ));
        assert_eq!(h.session.state_store().cached_release(), None);
        assert_eq!(h.session.phase(), UpdatePhase::UpToDate);
    }

    #[test]
    fn check_now_ignores_snooze_and_cooldown() {
        let base = serve_once(feed("2.0.0", "https://example.invalid/app.apk"));
        let h = harness(&base);
        h.session.snooze().unwrap();
        h.session.state_store().record_check_performed().unwrap();
        let outcome = h.session.check_now_blocking();
        assert_eq!(outcome.release().unwrap().version_name, "2.0.0");
    }

    #[test]
    fn async_check_records_before_delivery() {
        let base = serve_once(feed("1.2.0", "https://example.invalid/app.apk"));
        let h = harness(&base);
        let store = h.session.state_store();
        let (tx, rx) = mpsc::channel();
        h.session.check_for_updates(move |outcome| {
            tx.send((outcome.release().cloned(), store.last_check_at()))
                .unwrap();
        });
        let (release, recorded) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(release.unwrap().version_name, "1.2.0");
        assert_eq!(recorded, Some(START));
    }

    #[test]
    fn full_flow_downloads_installs_and_clears_cache() {
        let payload = b"apk".to_vec();
        let artifact_base = serve_once(ok_with_length("application/octet-stream", &payload));
        let feed_base = serve_once(feed("1.2.0", &format!("{artifact_base}/app.apk")));
        let h = harness(&feed_base);

        let outcome = h.session.check_for_updates_blocking();
        let info = outcome.release().unwrap().clone();
        let terminal = h.session.download_blocking(&info, |_| {});
        let DownloadState::Completed(path) = terminal else {
            panic!("expected completed, got {terminal:?}");
        };
        assert!(matches!(h.session.phase(), UpdatePhase::Completed(_)));
        assert_eq!(std::fs::read(&path).unwrap(), payload);

        assert!(h.session.install(&path));
        assert_eq!(h.session.phase(), UpdatePhase::InstallRequested);
        assert_eq!(h.session.state_store().cached_release(), None);
        assert_eq!(h.platform.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn async_download_reports_failure_and_phase() {
        let artifact_base = serve_sequence(vec![
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ]);
        let h = harness(&dead_base());
        h.session.state_store().cache_release(&release("1.5.0")).unwrap();
        let info = h.session.check_for_updates_blocking().release().cloned().unwrap();
        let info = ReleaseInfo {
            artifact_url: format!("{artifact_base}/app.apk"),
            ..info
        };
        let (tx, rx) = mpsc::channel();
        h.session.download(&info, |_| {}, move |terminal| {
            tx.send(terminal).unwrap();
        });
        let terminal = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let DownloadState::Failed { message, .. } = terminal else {
            panic!("expected failure, got {terminal:?}");
        };
        assert_eq!(message, "server error: 500");
        assert_eq!(
            h.session.phase(),
            UpdatePhase::DownloadFailed("server error: 500".into())
        );
    }

    #[test]
    fn missing_artifact_install_keeps_cache() {
        let h = harness(&dead_base());
        h.session.state_store().cache_release(&release("1.5.0")).unwrap();
        assert!(!h.session.install_downloaded());
        assert!(h.session.state_store().cached_release().is_some());
    }

    #[test]
    fn reset_and_clean_wipe_state() {
        let h = harness(&dead_base());
        h.session.snooze().unwrap();
        h.session.state_store().cache_release(&release("1.5.0")).unwrap();
        std::fs::write(h.session.downloader().destination(), b"x").unwrap();
        let status = h.session.status();
        assert_eq!(status.snoozed_until, Some(START + 3_600_000));
        assert!(status.downloaded_artifact.is_some());
        assert_eq!(status.local_version, "1.0.0");

        assert!(h.session.clean().unwrap());
        assert!(!h.session.clean().unwrap());
        h.session.reset().unwrap();
        assert_eq!(h.backend.snapshot(), ThrottleRecord::default());
        assert_eq!(h.session.phase(), UpdatePhase::Idle);
        assert!(h.session.status().downloaded_artifact.is_none());
    }

    #[test]
    fn snooze_lapses_back_to_checks() {
        let base = serve_once(feed("1.2.0", "https://example.invalid/app.apk"));
        let h = harness(&base);
        h.session.snooze().unwrap();
        h.clock.advance(Duration::from_secs(3601));
        let outcome = h.session.check_for_updates_blocking();
        assert!(outcome.release().is_some(), "{outcome:?}");
    }
}
