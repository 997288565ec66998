use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::http_client::{self, Timeouts};
use crate::worker::{BackgroundWorker, Handoff};

use super::{DEFAULT_USER_AGENT, DownloadProgress, DownloadState, UpdateError};

/// Bytes read and written per progress step.
const CHUNK_SIZE: usize = 8 * 1024;

/// Receiving end of [`ArtifactDownloader::start`].
///
/// Yields `Downloading` states in order and then exactly one terminal state.
#[derive(Debug)]
pub struct DownloadHandle {
    rx: Receiver<DownloadState>,
}

impl DownloadHandle {
    /// Next state, blocking. `None` once the terminal state has been taken.
    pub fn next_state(&self) -> Option<DownloadState> {
        self.rx.recv().ok()
    }

    /// Next state, waiting at most `timeout`.
    pub fn next_state_timeout(&self, timeout: Duration) -> Option<DownloadState> {
        match self.rx.recv_timeout(timeout) {
            Ok(state) => Some(state),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking poll for UI loops.
    pub fn try_next_state(&self) -> Option<DownloadState> {
        self.rx.try_recv().ok()
    }

    /// Drain progress into `on_progress` and return the terminal state.
    pub fn wait_with(self, mut on_progress: impl FnMut(DownloadProgress)) -> DownloadState {
        for state in self.rx.iter() {
            match state {
                DownloadState::Downloading(progress) => on_progress(progress),
                DownloadState::Idle => {}
                terminal => return terminal,
            }
        }
        DownloadState::Failed {
            message: "Download worker stopped before finishing".into(),
            cause: None,
        }
    }

    pub fn wait(self) -> DownloadState {
        self.wait_with(|_| {})
    }
}

struct DownloaderInner {
    agent: ureq::Agent,
    destination: PathBuf,
    user_agent: String,
}

/// Streams a release artifact to one fixed local path on its own worker.
///
/// Downloads queue behind each other; the destination is overwritten by
/// every new download.
pub struct ArtifactDownloader {
    inner: Arc<DownloaderInner>,
    worker: BackgroundWorker,
}

impl ArtifactDownloader {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(destination: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_options(
            destination,
            DEFAULT_USER_AGENT,
            Timeouts {
                connect: Self::DEFAULT_CONNECT_TIMEOUT,
                read: Self::DEFAULT_READ_TIMEOUT,
            },
        )
    }

    pub(crate) fn with_options(
        destination: impl Into<PathBuf>,
        user_agent: impl Into<String>,
        timeouts: Timeouts,
    ) -> io::Result<Self> {
        let inner = DownloaderInner {
            agent: http_client::build_agent(timeouts, true),
            destination: destination.into(),
            user_agent: user_agent.into(),
        };
        Ok(Self {
            inner: Arc::new(inner),
            worker: BackgroundWorker::spawn("uplift-download")?,
        })
    }

    /// Where artifacts are written.
    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub fn has_downloaded_artifact(&self) -> bool {
        self.inner.destination.is_file()
    }

    /// Remove the artifact left by a previous download, if any.
    pub fn delete_downloaded_artifact(&self) -> io::Result<bool> {
        remove_if_present(&self.inner.destination)
    }

    /// Download on the worker, reporting progress and then exactly one
    /// terminal state through the callbacks (both called on the worker).
    pub fn download(
        &self,
        url: impl Into<String>,
        mut on_progress: impl FnMut(DownloadProgress) + Send + 'static,
        on_terminal: impl FnOnce(DownloadState) + Send + 'static,
    ) {
        let inner = Arc::clone(&self.inner);
        let url = url.into();
        let on_terminal = Handoff::new(on_terminal);
        let queued_terminal = on_terminal.clone();
        let queued = self.worker.submit(move || {
            let terminal = panic::catch_unwind(AssertUnwindSafe(|| {
                inner.run(&url, &mut on_progress)
            }))
            .unwrap_or_else(|_| {
                tracing::error!("Download from {url} aborted by a panicking progress callback");
                DownloadState::Failed {
                    message: "Download aborted: progress callback panicked".into(),
                    cause: None,
                }
            });
            if let Some(on_terminal) = queued_terminal.take() {
                on_terminal(terminal);
            }
        });
        if !queued && let Some(on_terminal) = on_terminal.take() {
            tracing::warn!("Download of {} was not started", self.inner.destination.display());
            on_terminal(DownloadState::Failed {
                message: "Download failed: download worker is not running".into(),
                cause: None,
            });
        }
    }

    /// Download on the worker and receive the states through a handle.
    pub fn start(&self, url: impl Into<String>) -> DownloadHandle {
        let (tx, rx) = mpsc::channel();
        let progress_tx = tx.clone();
        self.download(
            url,
            move |progress| {
                let _ = progress_tx.send(DownloadState::Downloading(progress));
            },
            move |terminal| {
                let _ = tx.send(terminal);
            },
        );
        DownloadHandle { rx }
    }

    /// Download on the calling thread. Do not call from a UI thread.
    pub fn download_blocking(
        &self,
        url: &str,
        mut on_progress: impl FnMut(DownloadProgress),
    ) -> DownloadState {
        self.inner.run(url, &mut on_progress)
    }
}

impl DownloaderInner {
    fn run(&self, url: &str, on_progress: &mut dyn FnMut(DownloadProgress)) -> DownloadState {
        match self.fetch_to_destination(url, on_progress) {
            Ok(bytes) => {
                tracing::info!(
                    "Downloaded {bytes} bytes to {}",
                    self.destination.display()
                );
                DownloadState::Completed(self.destination.clone())
            }
            Err(err) => {
                let message = match &err {
                    UpdateError::Status { status, .. } => format!("server error: {status}"),
                    other => format!("Download failed: {other}"),
                };
                tracing::warn!("Download from {url} failed: {err}");
                DownloadState::Failed {
                    message,
                    cause: Some(err),
                }
            }
        }
    }

    fn fetch_to_destination(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<u64, UpdateError> {
        if remove_if_present(&self.destination)? {
            tracing::debug!("Removed stale artifact {}", self.destination.display());
        }
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent)?;
        }
        tracing::debug!("Downloading {url}");
        let response = self
            .agent
            .get(url)
            .set("User-Agent", &self.user_agent)
            .call()?;
        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(UpdateError::Status {
                status,
                url: response.get_url().to_string(),
            });
        }
        let total = http_client::content_length(&response);
        tracing::debug!("Artifact length {total:?}");
        let file = File::create(&self.destination)?;
        let mut reader = response.into_reader();
        Ok(stream_to_file(&mut reader, file, total, on_progress)?)
    }
}

/// Copy `reader` into `file` chunk by chunk, reporting progress after each
/// chunk. Returns the byte count. A partial file is left behind on error.
fn stream_to_file(
    reader: &mut dyn Read,
    file: File,
    total: Option<u64>,
    on_progress: &mut dyn FnMut(DownloadProgress),
) -> io::Result<u64> {
    let mut writer = BufWriter::new(file);
    let mut buf = [0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        writer.write_all(&buf[..read])?;
        downloaded += read as u64;
        on_progress(DownloadProgress::new(downloaded, total));
    }
    writer.flush()?;
    Ok(downloaded)
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
