//! `config.toml` in the app directory: release source, throttling, network
//! and installer settings.

mod defaults;
mod errors;
mod io;
mod types;

/// Default filename used to store the updater configuration.
pub const CONFIG_FILE_NAME: &str = "config.toml";

pub use errors::ConfigError;
pub use io::{config_path, load_from_path, load_or_default, save, save_to_path};
pub use types::{InstallSettings, NetworkSettings, ReleaseSettings, ThrottleSettings, UpdaterConfig};
