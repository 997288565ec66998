use crate::updater::{DEFAULT_INSTALLER_MIME, DEFAULT_USER_AGENT};

/// Artifact streams get at least this long between bytes.
pub(super) const MIN_DOWNLOAD_READ_TIMEOUT_SECS: u64 = 60;

pub(super) fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

pub(super) fn default_artifact_suffix() -> String {
    ".apk".to_string()
}

pub(super) fn default_check_cooldown_secs() -> u64 {
    60 * 60
}

pub(super) fn default_snooze_secs() -> u64 {
    60 * 60
}

pub(super) fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

pub(super) fn default_feed_connect_timeout_secs() -> u64 {
    10
}

pub(super) fn default_feed_read_timeout_secs() -> u64 {
    15
}

pub(super) fn default_download_connect_timeout_secs() -> u64 {
    15
}

pub(super) fn default_download_read_timeout_secs() -> u64 {
    MIN_DOWNLOAD_READ_TIMEOUT_SECS
}

pub(super) fn default_mime_type() -> String {
    DEFAULT_INSTALLER_MIME.to_string()
}

pub(super) fn default_download_file_name() -> String {
    "update.apk".to_string()
}
