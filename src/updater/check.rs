use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::http_client::{self, Timeouts};
use crate::worker::{BackgroundWorker, Handoff};

use super::{
    CheckResult, DEFAULT_USER_AGENT, FALLBACK_VERSION, ReleaseInfo, UpdateError, github, is_newer,
};

/// `OWNER/REPO` identifying the repository whose releases are checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryId {
    owner: String,
    name: String,
}

impl RepositoryId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, UpdateError> {
        let owner = owner.into();
        let name = name.into();
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(&owner) || !valid(&name) {
            return Err(UpdateError::Invalid(format!(
                "Repository must be OWNER/REPO, got '{owner}/{name}'"
            )));
        }
        Ok(Self { owner, name })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepositoryId {
    type Err = UpdateError;

    fn from_str(slug: &str) -> Result<Self, Self::Err> {
        let Some((owner, name)) = slug.trim().split_once('/') else {
            return Err(UpdateError::Invalid(format!(
                "Repository must be OWNER/REPO, got '{slug}'"
            )));
        };
        Self::new(owner, name)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Pending result of [`ReleaseFetcher::check_latest`]; yields exactly one
/// [`CheckResult`].
#[derive(Debug)]
pub struct CheckTicket {
    rx: Receiver<CheckResult>,
}

impl CheckTicket {
    /// Block until the check finishes.
    pub fn wait(self) -> CheckResult {
        self.rx.recv().unwrap_or_else(|_| worker_lost())
    }

    /// Block for at most `timeout`; `None` if the check is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CheckResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(worker_lost()),
        }
    }

    /// Non-blocking poll for UI loops.
    pub fn try_result(&self) -> Option<CheckResult> {
        self.rx.try_recv().ok()
    }
}

fn worker_lost() -> CheckResult {
    CheckResult::Error {
        message: "Release check worker stopped before producing a result".into(),
        cause: None,
    }
}

struct FetcherInner {
    agent: ureq::Agent,
    api_base: String,
    user_agent: String,
    artifact_suffix: String,
    local_version: String,
}

/// Queries the release feed on its own background worker.
pub struct ReleaseFetcher {
    inner: Arc<FetcherInner>,
    worker: BackgroundWorker,
}

impl ReleaseFetcher {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

    /// Create a fetcher comparing against `local_version` and matching assets
    /// whose name ends with `artifact_suffix`.
    pub fn new(
        api_base: impl Into<String>,
        artifact_suffix: impl Into<String>,
        local_version: impl Into<String>,
    ) -> std::io::Result<Self> {
        Self::with_options(
            api_base,
            artifact_suffix,
            local_version,
            DEFAULT_USER_AGENT,
            Timeouts {
                connect: Self::DEFAULT_CONNECT_TIMEOUT,
                read: Self::DEFAULT_READ_TIMEOUT,
            },
        )
    }

    pub(crate) fn with_options(
        api_base: impl Into<String>,
        artifact_suffix: impl Into<String>,
        local_version: impl Into<String>,
        user_agent: impl Into<String>,
        timeouts: Timeouts,
    ) -> std::io::Result<Self> {
        let local_version = local_version.into();
        let local_version = if local_version.trim().is_empty() {
            FALLBACK_VERSION.to_string()
        } else {
            local_version.trim().to_string()
        };
        let inner = FetcherInner {
            agent: http_client::build_agent(timeouts, true),
            api_base: api_base.into(),
            user_agent: user_agent.into(),
            artifact_suffix: artifact_suffix.into(),
            local_version,
        };
        Ok(Self {
            inner: Arc::new(inner),
            worker: BackgroundWorker::spawn("uplift-release-check")?,
        })
    }

    /// Version the remote release is compared against.
    pub fn local_version(&self) -> &str {
        &self.inner.local_version
    }

    /// Check the latest release on the background worker.
    pub fn check_latest(&self, repo: &RepositoryId) -> CheckTicket {
        let (tx, rx) = mpsc::channel();
        self.check_latest_with(repo, move |result| {
            let _ = tx.send(result);
        });
        CheckTicket { rx }
    }

    /// Check the latest release on the background worker and hand the result
    /// to `on_result` there.
    pub fn check_latest_with(
        &self,
        repo: &RepositoryId,
        on_result: impl FnOnce(CheckResult) + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        let repo = repo.clone();
        let on_result = Handoff::new(on_result);
        let queued_result = on_result.clone();
        let queued = self.worker.submit(move || {
            let result = inner.check(&repo);
            if let Some(on_result) = queued_result.take() {
                on_result(result);
            }
        });
        if !queued && let Some(on_result) = on_result.take() {
            on_result(worker_lost());
        }
    }

    /// Run the check on the calling thread. Do not call from a UI thread.
    pub fn check_latest_blocking(&self, repo: &RepositoryId) -> CheckResult {
        self.inner.check(repo)
    }
}

impl FetcherInner {
    fn check(&self, repo: &RepositoryId) -> CheckResult {
        tracing::debug!("Checking {repo} for releases newer than {}", self.local_version);
        let release = match github::fetch_latest_release(
            &self.agent,
            &self.api_base,
            repo,
            &self.user_agent,
        ) {
            Ok(release) => release,
            Err(err) => {
                tracing::warn!("Release check for {repo} failed: {err}");
                return CheckResult::from_error("Could not fetch latest release", err);
            }
        };
        let Some(asset) = release.find_artifact(&self.artifact_suffix) else {
            let err = UpdateError::NoArtifact {
                tag: release.tag_name.clone(),
                suffix: self.artifact_suffix.clone(),
            };
            tracing::warn!("{err}");
            return CheckResult::from_error("No artifact found in release", err);
        };
        let remote = release.version_name();
        tracing::debug!("Local version {}, remote version {remote}", self.local_version);
        if !is_newer(remote, &self.local_version) {
            tracing::info!("{repo} is up to date at {}", self.local_version);
            return CheckResult::NoUpdateAvailable;
        }
        let info = ReleaseInfo {
            version_name: remote.to_string(),
            tag_name: release.tag_name.clone(),
            release_notes: release.notes(),
            artifact_url: asset.browser_download_url.clone(),
            artifact_size_bytes: asset.size,
        };
        tracing::info!("Update available: {} -> {}", self.local_version, info.version_name);
        CheckResult::UpdateAvailable(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_server::{ok_with_length, serve_once, serve_sequence};
    use crate::updater::ErrorKind;

    const FEED: &str = r#"{
        "tag_name": "v1.3.0",
        "body": "Faster startup",
        "assets": [
            { "name": "checksums.txt", "browser_download_url": "https://example.invalid/sums", "size": 10 },
            { "name": "launcher-1.3.0.apk", "browser_download_url": "https://example.invalid/app.apk", "size": 4096 }
        ]
    }"#;

    fn repo() -> RepositoryId {
        "owner/app".parse().unwrap()
    }

    fn fetcher(base: String, local: &str) -> ReleaseFetcher {
        ReleaseFetcher::new(base, ".apk", local).unwrap()
    }

    #[test]
    fn newer_release_is_update_available() {
        let base = serve_once(ok_with_length("application/json", FEED.as_bytes()));
        let result = fetcher(base, "1.2.0").check_latest(&repo()).wait();
        let CheckResult::UpdateAvailable(info) = result else {
            panic!("expected update, got {result:?}");
        };
        assert_eq!(info.version_name, "1.3.0");
        assert_eq!(info.tag_name, "v1.3.0");
        assert_eq!(info.release_notes, "Faster startup");
        assert_eq!(info.artifact_url, "https://example.invalid/app.apk");
        assert_eq!(info.artifact_size_bytes, 4096);
    }

    #[test]
    fn same_version_is_no_update() {
        let base = serve_once(ok_with_length("application/json", FEED.as_bytes()));
        let result = fetcher(base, "1.3.0").check_latest_blocking(&repo());
        assert!(matches!(result, CheckResult::NoUpdateAvailable), "{result:?}");
    }

    #[test]
    fn release_without_matching_asset_is_error() {
        let feed = r#"{"tag_name":"v9.0.0","assets":[
            {"name":"app.zip","browser_download_url":"https://x/app.zip","size":1}]}"#;
        let base = serve_once(ok_with_length("application/json", feed.as_bytes()));
        let result = fetcher(base, "1.0.0").check_latest_blocking(&repo());
        let CheckResult::Error { message, cause } = result else {
            panic!("expected error, got {result:?}");
        };
        assert!(message.contains("No artifact found"));
        assert_eq!(cause.unwrap().kind(), ErrorKind::NoArtifact);
    }

    #[test]
    fn non_success_status_is_network_error() {
        let base = serve_once("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n");
        let result = fetcher(base, "1.0.0").check_latest_blocking(&repo());
        let CheckResult::Error { cause, .. } = result else {
            panic!("expected error, got {result:?}");
        };
        let cause = cause.unwrap();
        assert_eq!(cause.kind(), ErrorKind::Network);
        assert!(matches!(cause, UpdateError::Status { status: 403, .. }));
    }

    #[test]
    fn malformed_body_is_parse_error() {
        let base = serve_once(ok_with_length("application/json", b"{\"tag_name\":"));
        let result = fetcher(base, "1.0.0").check_latest_blocking(&repo());
        let CheckResult::Error { cause, .. } = result else {
            panic!("expected error, got {result:?}");
        };
        assert_eq!(cause.unwrap().kind(), ErrorKind::Parse);
    }

    #[test]
    fn unreachable_feed_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let result = fetcher(base, "1.0.0").check_latest_blocking(&repo());
        let CheckResult::Error { cause, .. } = result else {
            panic!("expected error, got {result:?}");
        };
        assert_eq!(cause.unwrap().kind(), ErrorKind::Network);
    }

    #[test]
    fn callback_runs_on_worker_thread() {
        let base = serve_once(ok_with_length("application/json", FEED.as_bytes()));
        let (tx, rx) = mpsc::channel();
        fetcher(base, "1.2.0").check_latest_with(&repo(), move |result| {
            let thread = std::thread::current().name().map(str::to_string);
            tx.send((thread, matches!(result, CheckResult::UpdateAvailable(_))))
                .unwrap();
        });
        let (thread, available) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(thread.as_deref(), Some("uplift-release-check"));
        assert!(available);
    }

    #[test]
    fn panicking_result_handler_leaves_worker_usable() {
        let base = serve_sequence(vec![
            ok_with_length("application/json", FEED.as_bytes()),
            ok_with_length("application/json", FEED.as_bytes()),
        ]);
        let fetcher = fetcher(base, "1.2.0");
        fetcher.check_latest_with(&repo(), |_| panic!("result handler failed"));
        let result = fetcher
            .check_latest(&repo())
            .wait_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(matches!(result, CheckResult::UpdateAvailable(_)), "{result:?}");
    }

    #[test]
    fn stopped_worker_reports_error_to_handler() {
        let running = fetcher("http://127.0.0.1:9".into(), "1.0.0");
        let stopped = ReleaseFetcher {
            inner: Arc::clone(&running.inner),
            worker: BackgroundWorker::stopped("uplift-release-check"),
        };
        let (tx, rx) = mpsc::channel();
        stopped.check_latest_with(&repo(), move |result| tx.send(result).unwrap());
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, CheckResult::Error { cause: None, .. }), "{result:?}");
    }

    #[test]
    fn empty_local_version_falls_back() {
        let fetcher = ReleaseFetcher::new("http://127.0.0.1:9", ".apk", " ").unwrap();
        assert_eq!(fetcher.local_version(), FALLBACK_VERSION);
    }

    #[test]
    fn repository_slug_validation() {
        let repo: RepositoryId = "octo-org/launcher.tv".parse().unwrap();
        assert_eq!(repo.owner(), "octo-org");
        assert_eq!(repo.name(), "launcher.tv");
        assert_eq!(repo.to_string(), "octo-org/launcher.tv");
        assert!("no-slash".parse::<RepositoryId>().is_err());
        assert!("/repo".parse::<RepositoryId>().is_err());
        assert!("a/b/c".parse::<RepositoryId>().is_err());
    }
}
