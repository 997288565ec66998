use std::io;
use std::path::{Path, PathBuf};

use super::UpdateError;

/// MIME type the platform installer is asked to open.
pub const DEFAULT_INSTALLER_MIME: &str = "application/vnd.android.package-archive";

/// What gets handed to the platform: open `uri` as `mime_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub uri: String,
    pub mime_type: String,
    /// Launch the installer outside the caller's task stack.
    pub new_task: bool,
    /// Let the installer read `uri` even though the caller owns the file.
    pub grant_read_uri: bool,
}

/// OS integration used by [`InstallLauncher`].
pub trait InstallPlatform: Send + Sync {
    /// Whether this process may open installers right now.
    fn can_install(&self) -> bool;

    /// Show the screen where the user grants install permission.
    fn open_permission_settings(&self) -> io::Result<()>;

    /// Open the installer. Success means the hand-off happened, not that the
    /// install did.
    fn dispatch(&self, request: &InstallRequest) -> io::Result<()>;
}

/// Opens artifacts with the OS default handler.
#[derive(Debug, Clone, Default)]
pub struct DesktopPlatform {
    settings_url: Option<String>,
}

impl DesktopPlatform {
    pub fn new(settings_url: Option<String>) -> Self {
        Self { settings_url }
    }
}

impl InstallPlatform for DesktopPlatform {
    fn can_install(&self) -> bool {
        true
    }

    fn open_permission_settings(&self) -> io::Result<()> {
        match &self.settings_url {
            Some(url) => open::that(url),
            None => {
                tracing::debug!("No install permission settings configured");
                Ok(())
            }
        }
    }

    fn dispatch(&self, request: &InstallRequest) -> io::Result<()> {
        open::that(&request.uri)
    }
}

/// Hands downloaded artifacts to the platform installer.
pub struct InstallLauncher {
    platform: Box<dyn InstallPlatform>,
    mime_type: String,
    provider_authority: Option<String>,
}

impl InstallLauncher {
    pub fn new(platform: impl InstallPlatform + 'static) -> Self {
        Self {
            platform: Box::new(platform),
            mime_type: DEFAULT_INSTALLER_MIME.to_string(),
            provider_authority: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Share artifacts as `content://{authority}/{file}` instead of `file://`.
    pub fn with_provider_authority(mut self, authority: Option<String>) -> Self {
        self.provider_authority = authority.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn can_install(&self) -> bool {
        self.platform.can_install()
    }

    /// Open the permission screen. Failures are only logged.
    pub fn request_install_permission(&self) {
        match self.platform.open_permission_settings() {
            Ok(()) => tracing::info!("Opened install permission settings"),
            Err(err) => tracing::warn!("Could not open install permission settings: {err}"),
        }
    }

    /// Hand `artifact` to the installer. `false` if the file is missing, the
    /// permission is not granted, or the platform refused the request.
    pub fn install(&self, artifact: &Path) -> bool {
        match self.try_install(artifact) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("Install of {} not started: {err}", artifact.display());
                false
            }
        }
    }

    pub fn try_install(&self, artifact: &Path) -> Result<(), UpdateError> {
        if !artifact.is_file() {
            return Err(UpdateError::InstallDispatch(format!(
                "artifact {} does not exist",
                artifact.display()
            )));
        }
        if !self.platform.can_install() {
            return Err(UpdateError::InstallPermission);
        }
        let request = InstallRequest {
            uri: self.artifact_uri(artifact)?,
            mime_type: self.mime_type.clone(),
            new_task: true,
            grant_read_uri: true,
        };
        tracing::debug!("Dispatching install request {request:?}");
        self.platform
            .dispatch(&request)
            .map_err(|err| UpdateError::InstallDispatch(err.to_string()))?;
        tracing::info!("Installer launched for {}", artifact.display());
        Ok(())
    }

    fn artifact_uri(&self, artifact: &Path) -> Result<String, UpdateError> {
        if let Some(authority) = &self.provider_authority {
            let file_name = artifact
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    UpdateError::InstallDispatch(format!(
                        "artifact path {} has no usable file name",
                        artifact.display()
                    ))
                })?;
            return Ok(format!("content://{authority}/{file_name}"));
        }
        let absolute: PathBuf = std::path::absolute(artifact).map_err(|err| {
            UpdateError::InstallDispatch(format!(
                "cannot resolve artifact path {}: {err}",
                artifact.display()
            ))
        })?;
        url::Url::from_file_path(&absolute)
            .map(String::from)
            .map_err(|()| {
                UpdateError::InstallDispatch(format!(
                    "cannot express {} as a file URL",
                    absolute.display()
                ))
            })
    }
}
