//! Self-update core: release checks, throttling state, artifact download and
//! installer hand-off.
//!
//! [`UpdateSession`] wires the pieces together with the check policy; the
//! components are also usable on their own.

mod check;
mod download;
mod github;
mod install;
mod phase;
mod session;
mod state;
mod version;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use check::{CheckTicket, ReleaseFetcher, RepositoryId};
pub use download::{ArtifactDownloader, DownloadHandle};
pub use install::{
    DEFAULT_INSTALLER_MIME, DesktopPlatform, InstallLauncher, InstallPlatform, InstallRequest,
};
pub use phase::{InvalidTransition, UpdateEvent, UpdatePhase};
pub use session::{CheckOutcome, SessionError, SessionStatus, UpdateSession};
pub use state::{
    Clock, JsonFileBackend, ManualClock, MemoryBackend, STATE_FILE_NAME, StateBackend, StateError,
    SystemClock, ThrottleRecord, UpdateStateStore,
};
pub use version::is_newer;

/// Fixed `User-Agent` sent with every request; release APIs reject requests
/// without one.
pub const DEFAULT_USER_AGENT: &str = concat!("uplift/", env!("CARGO_PKG_VERSION"));
/// Version reported when the running build has none.
pub const FALLBACK_VERSION: &str = "0.0.0";

/// A published release that is newer than the running build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Normalized version, e.g. `1.2.0`.
    pub version_name: String,
    /// Raw tag as published, e.g. `v1.2.0`.
    pub tag_name: String,
    /// Release notes; may be empty.
    pub release_notes: String,
    /// Absolute download URL of the matched artifact.
    pub artifact_url: String,
    /// Artifact size in bytes, `0` when unknown.
    pub artifact_size_bytes: u64,
}

/// Outcome of a single release check.
#[derive(Debug)]
pub enum CheckResult {
    UpdateAvailable(ReleaseInfo),
    NoUpdateAvailable,
    Error {
        message: String,
        cause: Option<UpdateError>,
    },
}

impl CheckResult {
    pub(crate) fn from_error(context: &str, err: UpdateError) -> Self {
        CheckResult::Error {
            message: format!("{context}: {err}"),
            cause: Some(err),
        }
    }
}

/// Snapshot of an in-flight download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// `0..=100`, or `-1` when the total size is unknown.
    pub progress_percent: i32,
    pub downloaded_bytes: u64,
    /// `None` when the server did not advertise a length.
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    pub(crate) fn new(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        let progress_percent = match total_bytes {
            Some(total) if total > 0 => {
                let percent = downloaded_bytes.saturating_mul(100) / total;
                percent.min(100) as i32
            }
            _ => -1,
        };
        Self {
            progress_percent,
            downloaded_bytes,
            total_bytes,
        }
    }

    /// Whether the total size is known.
    pub fn is_determinate(&self) -> bool {
        self.progress_percent >= 0
    }
}

/// Download lifecycle: `Idle`, any number of `Downloading`, then exactly one
/// of `Completed` or `Failed`.
#[derive(Debug)]
pub enum DownloadState {
    Idle,
    Downloading(DownloadProgress),
    Completed(PathBuf),
    Failed {
        message: String,
        cause: Option<UpdateError>,
    },
}

impl DownloadState {
    /// `Completed` and `Failed` end a download.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed(_) | DownloadState::Failed { .. })
    }
}

/// Coarse classification of [`UpdateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failure, timeout, or non-success status.
    Network,
    /// Malformed or incomplete feed JSON.
    Parse,
    /// The release has no asset with the expected suffix.
    NoArtifact,
    /// Installing is blocked until the user grants permission.
    InstallPermission,
    /// The platform refused to open the installer.
    InstallDispatch,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value: {0}")]
    Invalid(String),
    #[error("No artifact ending in '{suffix}' found in release {tag}")]
    NoArtifact { tag: String, suffix: String },
    #[error("Install permission has not been granted")]
    InstallPermission,
    #[error("Could not launch installer: {0}")]
    InstallDispatch(String),
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Http(_) | UpdateError::Status { .. } | UpdateError::Io(_) => {
                ErrorKind::Network
            }
            UpdateError::Json(_) | UpdateError::Invalid(_) => ErrorKind::Parse,
            UpdateError::NoArtifact { .. } => ErrorKind::NoArtifact,
            UpdateError::InstallPermission => ErrorKind::InstallPermission,
            UpdateError::InstallDispatch(_) => ErrorKind::InstallDispatch,
        }
    }
}

impl From<ureq::Error> for UpdateError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => UpdateError::Status {
                status,
                url: response.get_url().to_string(),
            },
            ureq::Error::Transport(transport) => UpdateError::Http(transport.to_string()),
        }
    }
}
