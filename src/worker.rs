//! Single-thread job queue used to keep blocking network I/O off the caller.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A dedicated background thread that runs submitted jobs one at a time, in
/// submission order.
///
/// A panicking job is logged and skipped; later jobs still run. The thread
/// exits once the worker is dropped and the queue drains.
#[derive(Debug)]
pub struct BackgroundWorker {
    name: String,
    jobs: Sender<Job>,
}

impl BackgroundWorker {
    /// Spawn the worker thread.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (jobs, queue) = mpsc::channel::<Job>();
        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            for job in queue {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!(
                        "Job on background worker '{thread_name}' panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        })?;
        Ok(Self { name, jobs })
    }

    /// A worker whose thread is already gone; every `submit` fails.
    #[cfg(test)]
    pub(crate) fn stopped(name: impl Into<String>) -> Self {
        let (jobs, _) = mpsc::channel::<Job>();
        Self {
            name: name.into(),
            jobs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Returns `false` if the worker thread has died.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let sent = self.jobs.send(Box::new(job)).is_ok();
        if !sent {
            tracing::warn!("Background worker '{}' is gone; job dropped", self.name);
        }
        sent
    }
}

/// A callback shared by a queued job and its submitter. Whichever side takes
/// it first runs it, so it fires at most once even if the job never runs.
pub(crate) struct Handoff<T>(Arc<Mutex<Option<T>>>);

impl<T> Handoff<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(Some(value))))
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
