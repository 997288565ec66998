use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http_client::Timeouts;
use crate::updater::{RepositoryId, UpdateError};

use super::defaults::*;

/// Everything the updater reads from `config.toml`.
///
/// Every section and key is optional; missing values take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub release: ReleaseSettings,
    #[serde(default)]
    pub throttle: ThrottleSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub install: InstallSettings,
}

/// Where releases come from and what counts as the running version.
///
/// Config keys: `repo`, `api_base`, `artifact_suffix`, `current_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSettings {
    /// `OWNER/REPO`; empty until configured.
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Assets are matched by name suffix, e.g. `.apk`.
    #[serde(default = "default_artifact_suffix")]
    pub artifact_suffix: String,
    /// Overrides the crate version as the local version.
    #[serde(default)]
    pub current_version: Option<String>,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            repo: String::new(),
            api_base: default_api_base(),
            artifact_suffix: default_artifact_suffix(),
            current_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleSettings {
    #[serde(default = "default_check_cooldown_secs")]
    pub check_cooldown_secs: u64,
    #[serde(default = "default_snooze_secs")]
    pub snooze_secs: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            check_cooldown_secs: default_check_cooldown_secs(),
            snooze_secs: default_snooze_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_feed_connect_timeout_secs")]
    pub feed_connect_timeout_secs: u64,
    #[serde(default = "default_feed_read_timeout_secs")]
    pub feed_read_timeout_secs: u64,
    #[serde(default = "default_download_connect_timeout_secs")]
    pub download_connect_timeout_secs: u64,
    #[serde(default = "default_download_read_timeout_secs")]
    pub download_read_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            feed_connect_timeout_secs: default_feed_connect_timeout_secs(),
            feed_read_timeout_secs: default_feed_read_timeout_secs(),
            download_connect_timeout_secs: default_download_connect_timeout_secs(),
            download_read_timeout_secs: default_download_read_timeout_secs(),
        }
    }
}

/// Installer hand-off settings.
///
/// Config keys: `mime_type`, `provider_authority`, `permission_settings_url`,
/// `download_file_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSettings {
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    /// When set, artifacts are shared as `content://{authority}/{file}`.
    #[serde(default)]
    pub provider_authority: Option<String>,
    #[serde(default)]
    pub permission_settings_url: Option<String>,
    /// Bare file name inside the downloads directory.
    #[serde(default = "default_download_file_name")]
    pub download_file_name: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            mime_type: default_mime_type(),
            provider_authority: None,
            permission_settings_url: None,
            download_file_name: default_download_file_name(),
        }
    }
}

impl UpdaterConfig {
    /// Trim strings, drop blank optionals, and replace unusable values with
    /// defaults.
    pub fn normalized(mut self) -> Self {
        let release = &mut self.release;
        release.repo = release.repo.trim().to_string();
        release.api_base = non_blank_or(&release.api_base, default_api_base);
        release.artifact_suffix = non_blank_or(&release.artifact_suffix, default_artifact_suffix);
        release.current_version = blank_to_none(release.current_version.take());

        let network = &mut self.network;
        network.user_agent = non_blank_or(&network.user_agent, default_user_agent);
        network.feed_connect_timeout_secs = non_zero_or(
            network.feed_connect_timeout_secs,
            default_feed_connect_timeout_secs,
        );
        network.feed_read_timeout_secs =
            non_zero_or(network.feed_read_timeout_secs, default_feed_read_timeout_secs);
        network.download_connect_timeout_secs = non_zero_or(
            network.download_connect_timeout_secs,
            default_download_connect_timeout_secs,
        );
        network.download_read_timeout_secs = network
            .download_read_timeout_secs
            .max(MIN_DOWNLOAD_READ_TIMEOUT_SECS);

        let install = &mut self.install;
        install.mime_type = non_blank_or(&install.mime_type, default_mime_type);
        install.provider_authority = blank_to_none(install.provider_authority.take());
        install.permission_settings_url = blank_to_none(install.permission_settings_url.take());
        let file_name = install.download_file_name.trim();
        if file_name.is_empty()
            || file_name == "."
            || file_name == ".."
            || file_name.contains(['/', '\\'])
        {
            install.download_file_name = default_download_file_name();
        } else {
            install.download_file_name = file_name.to_string();
        }
        self
    }

    /// Repository to check, validated.
    pub fn repository(&self) -> Result<RepositoryId, UpdateError> {
        if self.release.repo.is_empty() {
            return Err(UpdateError::Invalid(
                "No repository configured; set [release] repo or pass --repo OWNER/REPO".into(),
            ));
        }
        self.release.repo.parse()
    }

    /// Configured version override, else the version this crate was built as.
    pub fn local_version(&self) -> String {
        self.release
            .current_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    pub fn snooze_duration(&self) -> Duration {
        Duration::from_secs(self.throttle.snooze_secs)
    }

    pub fn check_cooldown(&self) -> Duration {
        Duration::from_secs(self.throttle.check_cooldown_secs)
    }

    pub(crate) fn feed_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.network.feed_connect_timeout_secs),
            read: Duration::from_secs(self.network.feed_read_timeout_secs),
        }
    }

    pub(crate) fn download_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.network.download_connect_timeout_secs),
            read: Duration::from_secs(
                self.network
                    .download_read_timeout_secs
                    .max(MIN_DOWNLOAD_READ_TIMEOUT_SECS),
            ),
        }
    }
}

fn non_blank_or(value: &str, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_string()
    }
}

fn non_zero_or(value: u64, default: fn() -> u64) -> u64 {
    if value == 0 { default() } else { value }
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = UpdaterConfig::default();
        assert_eq!(config.release.api_base, "https://api.github.com");
        assert_eq!(config.release.artifact_suffix, ".apk");
        assert_eq!(config.check_cooldown(), Duration::from_secs(3600));
        assert_eq!(config.snooze_duration(), Duration::from_secs(3600));
        assert_eq!(config.feed_timeouts().connect, Duration::from_secs(10));
        assert_eq!(config.feed_timeouts().read, Duration::from_secs(15));
        assert_eq!(config.download_timeouts().connect, Duration::from_secs(15));
        assert_eq!(config.download_timeouts().read, Duration::from_secs(60));
        assert_eq!(
            config.install.mime_type,
            "application/vnd.android.package-archive"
        );
        assert!(config.network.user_agent.starts_with("uplift/"));
    }

    #[test]
    fn normalization_repairs_unusable_values() {
        let mut config = UpdaterConfig::default();
        config.release.repo = "  owner/app ".into();
        config.release.api_base = " ".into();
        config.release.current_version = Some("  ".into());
        config.network.user_agent = String::new();
        config.network.feed_read_timeout_secs = 0;
        config.network.download_read_timeout_secs = 5;
        config.install.provider_authority = Some(" ".into());
        config.install.download_file_name = "../evil.apk".into();

        let config = config.normalized();
        assert_eq!(config.release.repo, "owner/app");
        assert_eq!(config.release.api_base, "https://api.github.com");
        assert_eq!(config.release.current_version, None);
        assert!(!config.network.user_agent.is_empty());
        assert_eq!(config.network.feed_read_timeout_secs, 15);
        assert_eq!(config.network.download_read_timeout_secs, 60);
        assert_eq!(config.install.provider_authority, None);
        assert_eq!(config.install.download_file_name, "update.apk");
    }

    #[test]
    fn longer_download_read_timeout_is_kept() {
        let mut config = UpdaterConfig::default();
        config.network.download_read_timeout_secs = 300;
        let config = config.normalized();
        assert_eq!(config.download_timeouts().read, Duration::from_secs(300));
    }

    #[test]
    fn repository_requires_configuration() {
        let mut config = UpdaterConfig::default();
        assert!(config.repository().is_err());
        config.release.repo = "owner/app".into();
        assert_eq!(config.repository().unwrap().to_string(), "owner/app");
        config.release.repo = "not a slug".into();
        assert!(config.repository().is_err());
    }

    #[test]
    fn local_version_prefers_override() {
        let mut config = UpdaterConfig::default();
        assert_eq!(config.local_version(), env!("CARGO_PKG_VERSION"));
        config.release.current_version = Some("2.4.1".into());
        assert_eq!(config.local_version(), "2.4.1");
    }
}
