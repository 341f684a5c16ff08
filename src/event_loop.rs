//! Dedicated reactor threads for connection work.
//!
//! Each `EventLoop` owns one OS thread running a single-threaded runtime
//! and a `LocalSet`, so everything a connection touches stays on its owning
//! thread and needs no locks. Other threads reach a loop only through
//! [`LoopHandle::post`], which queues a closure; posted work runs strictly
//! in submission order, interleaved with the loop's own socket readiness.

use std::{io, thread};

use log::{debug, error};
use thiserror::Error;
use tokio::{runtime, sync::mpsc, task::LocalSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

type Job = Box<dyn FnOnce() + Send>;

/// Errors from posting work to a loop.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PostError {
    /// The loop thread has exited; the closure was dropped unrun.
    #[error("event loop is no longer running")]
    LoopGone,
}

/// Cross-thread handle for posting work to one event loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Job>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl LoopHandle {
    /// Queue `job` to run on the loop thread after everything posted
    /// before it.
    ///
    /// # Errors
    /// [`PostError::LoopGone`] when the loop has already stopped.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PostError> {
        self.tx.send(Box::new(job)).map_err(|_| PostError::LoopGone)
    }

    /// Token cancelled when the loop shuts down. Connection teardown tokens
    /// are children of this one, so a loop-wide cancel reaches every
    /// connection on the loop.
    pub(crate) fn shutdown_token(&self) -> &CancellationToken { &self.shutdown }

    /// Tracker for tasks the loop drains before its thread exits.
    pub(crate) fn tracker(&self) -> &TaskTracker { &self.tracker }
}

/// One reactor thread plus the means to stop it.
pub struct EventLoop {
    handle: LoopHandle,
    shutdown: CancellationToken,
    thread: thread::JoinHandle<()>,
}

impl EventLoop {
    /// Start a named loop thread.
    ///
    /// # Errors
    /// Runtime construction or thread spawning may fail with an
    /// [`io::Error`].
    pub fn spawn(name: &str) -> io::Result<Self> {
        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let token = shutdown.clone();
        let tasks = tracker.clone();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_loop(&runtime, rx, &token, &tasks))?;
        Ok(Self {
            handle: LoopHandle {
                tx,
                shutdown: shutdown.clone(),
                tracker,
            },
            shutdown,
            thread,
        })
    }

    /// Handle for posting work from any thread.
    #[must_use]
    pub fn handle(&self) -> LoopHandle { self.handle.clone() }

    /// Stop accepting posted work and let in-flight tasks wind down.
    pub fn shutdown(&self) { self.shutdown.cancel(); }

    /// Wait for the loop thread to finish.
    pub fn join(self) {
        let name = self.thread.thread().name().unwrap_or("event-loop").to_owned();
        drop(self.handle);
        if self.thread.join().is_err() {
            error!("event loop thread panicked: name={name}");
        }
    }
}

/// Body of the loop thread: execute posted jobs until told to stop, then
/// keep polling local tasks until every connection has wound down.
fn run_loop(
    runtime: &runtime::Runtime,
    mut rx: mpsc::UnboundedReceiver<Job>,
    token: &CancellationToken,
    tracker: &TaskTracker,
) {
    let local = LocalSet::new();
    runtime.block_on(local.run_until(async {
        loop {
            let job = tokio::select! {
                biased;
                () = token.cancelled() => break,
                job = rx.recv() => job,
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        debug!("event loop stopped taking work");
    }));
    // Connection tasks hold child tokens of `token` and are unwinding;
    // wait for the tracked ones, then any remaining local tasks.
    tracker.close();
    runtime.block_on(local.run_until(tracker.wait()));
    runtime.block_on(local);
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;

    #[test]
    fn posted_jobs_run_in_submission_order() {
        let event_loop = EventLoop::spawn("test-loop-order").unwrap();
        let handle = event_loop.handle();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            handle.post(move || tx.send(i).unwrap()).unwrap();
        }
        let seen: Vec<i32> = (0..32).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        event_loop.shutdown();
        event_loop.join();
    }

    #[test]
    fn jobs_run_inside_a_local_set() {
        let event_loop = EventLoop::spawn("test-loop-local").unwrap();
        let (tx, rx) = std_mpsc::channel();
        event_loop
            .handle()
            .post(move || {
                // spawn_local panics outside a LocalSet, so arrival proves
                // the context.
                tokio::task::spawn_local(async move {
                    tx.send(thread::current().name().map(str::to_owned)).unwrap();
                });
            })
            .unwrap();
        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("test-loop-local"));
        event_loop.shutdown();
        event_loop.join();
    }

    #[test]
    fn post_after_join_reports_the_loop_gone() {
        let event_loop = EventLoop::spawn("test-loop-gone").unwrap();
        let handle = event_loop.handle();
        event_loop.shutdown();
        event_loop.join();
        assert_eq!(handle.post(|| {}), Err(PostError::LoopGone));
    }
}
