//! Self-update subsystem: release checks against a GitHub-style feed,
//! throttled by persisted snooze/cooldown state, artifact download with
//! progress, and installer hand-off.
/// Application directory helpers.
pub mod app_dirs;
/// Temp-file-and-rename writes.
pub(crate) mod atomic_file;
/// `config.toml` loading and saving.
pub mod config;
/// HTTP agent and bounded response helpers.
pub(crate) mod http_client;
/// Tracing subscriber setup.
pub mod logging;
/// Release checks, state, download and install.
pub mod updater;
/// Single-thread background job queue.
pub mod worker;
