use std::fmt;
use std::path::PathBuf;

use super::{DownloadProgress, ReleaseInfo};

/// Where the update flow as a whole currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable(ReleaseInfo),
    CheckFailed(String),
    Downloading(DownloadProgress),
    Completed(PathBuf),
    DownloadFailed(String),
    /// The installer was launched. Nothing follows.
    InstallRequested,
    Snoozed,
}

impl UpdatePhase {
    pub fn name(&self) -> &'static str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Checking => "checking",
            UpdatePhase::UpToDate => "up-to-date",
            UpdatePhase::UpdateAvailable(_) => "update-available",
            UpdatePhase::CheckFailed(_) => "check-failed",
            UpdatePhase::Downloading(_) => "downloading",
            UpdatePhase::Completed(_) => "completed",
            UpdatePhase::DownloadFailed(_) => "download-failed",
            UpdatePhase::InstallRequested => "install-requested",
            UpdatePhase::Snoozed => "snoozed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdatePhase::InstallRequested)
    }

    /// Apply `event`, returning the next phase or the rejected pair.
    pub fn advance(self, event: UpdateEvent) -> Result<UpdatePhase, InvalidTransition> {
        use UpdateEvent as E;
        use UpdatePhase as P;
        match (self, event) {
            (P::Idle, E::CheckStarted) => Ok(P::Checking),
            (P::Checking, E::FoundUpToDate) => Ok(P::UpToDate),
            (P::Checking, E::FoundUpdate(info)) => Ok(P::UpdateAvailable(info)),
            (P::Checking, E::CheckFailed(message)) => Ok(P::CheckFailed(message)),
            (P::UpdateAvailable(_), E::DownloadStarted) => {
                Ok(P::Downloading(DownloadProgress::new(0, None)))
            }
            (P::Downloading(_), E::DownloadProgressed(progress)) => Ok(P::Downloading(progress)),
            (P::Downloading(_), E::DownloadCompleted(path)) => Ok(P::Completed(path)),
            (P::Downloading(_), E::DownloadFailed(message)) => Ok(P::DownloadFailed(message)),
            (P::Completed(_), E::InstallRequested) => Ok(P::InstallRequested),
            (P::Idle, E::Snoozed) | (P::UpdateAvailable(_), E::Snoozed) => Ok(P::Snoozed),
            (P::Snoozed, E::SnoozeLapsed) => Ok(P::Idle),
            (P::DownloadFailed(_), E::Reset)
            | (P::UpToDate, E::Reset)
            | (P::CheckFailed(_), E::Reset) => Ok(P::Idle),
            (from, event) => Err(InvalidTransition {
                from: from.name(),
                event: event.name(),
            }),
        }
    }
}

/// Inputs to [`UpdatePhase::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    CheckStarted,
    FoundUpToDate,
    FoundUpdate(ReleaseInfo),
    CheckFailed(String),
    DownloadStarted,
    DownloadProgressed(DownloadProgress),
    DownloadCompleted(PathBuf),
    DownloadFailed(String),
    InstallRequested,
    Snoozed,
    SnoozeLapsed,
    Reset,
}

impl UpdateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::CheckStarted => "check-started",
            UpdateEvent::FoundUpToDate => "found-up-to-date",
            UpdateEvent::FoundUpdate(_) => "found-update",
            UpdateEvent::CheckFailed(_) => "check-failed",
            UpdateEvent::DownloadStarted => "download-started",
            UpdateEvent::DownloadProgressed(_) => "download-progressed",
            UpdateEvent::DownloadCompleted(_) => "download-completed",
            UpdateEvent::DownloadFailed(_) => "download-failed",
            UpdateEvent::InstallRequested => "install-requested",
            UpdateEvent::Snoozed => "snoozed",
            UpdateEvent::SnoozeLapsed => "snooze-lapsed",
            UpdateEvent::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Event '{event}' is not valid in phase '{from}'")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::UpdateAvailable(info) => write!(f, "update available ({})", info.version_name),
            UpdatePhase::CheckFailed(message) | UpdatePhase::DownloadFailed(message) => {
                write!(f, "{}: {message}", self.name())
            }
            UpdatePhase::Downloading(progress) if progress.is_determinate() => {
                write!(f, "downloading ({}%)", progress.progress_percent)
            }
            UpdatePhase::Downloading(progress) => {
                write!(f, "downloading ({} bytes)", progress.downloaded_bytes)
            }
            UpdatePhase::Completed(path) => write!(f, "downloaded to {}", path.display()),
            other => f.write_str(other.name()),
        }
    }
}
