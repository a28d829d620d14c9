//! Background loop runner.
//!
//! Every long-lived loop in the crate (listener, read loop, write loop,
//! client connect, event bridge) runs on its own named OS thread, never
//! on a shared pool slot. A completion callback receives the loop's
//! result exactly once when it returns; components use that single exit
//! point to drive their disconnect and error reporting.

use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

/// Handle to one background loop.
///
/// Dropping the handle detaches the thread; [`Worker::join`] waits for
/// it. The completion callback has already run by the time `join`
/// returns.
pub(crate) struct Worker {
    handle: JoinHandle<()>,
}

impl Worker {
    /// Run `job` on a new named thread and hand its result to
    /// `on_done`. Exactly one `on_done` call happens per worker.
    pub(crate) fn spawn<F, D>(name: &str, job: F, on_done: D) -> Result<Worker>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
        D: FnOnce(Result<()>) + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || on_done(job()))
            .map_err(Error::Transport)?;
        Ok(Worker { handle })
    }

    /// Block until the loop has exited and its callback has run.
    pub(crate) fn join(self) {
        let _ = self.handle.join();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("thread", &self.handle.thread().name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn success_reaches_the_callback_once() {
        let (tx, rx) = mpsc::channel();
        let worker = Worker::spawn("test-ok", || Ok(()), move |res| {
            tx.send(res.is_ok()).unwrap();
        })
        .unwrap();
        worker.join();
        assert!(rx.recv().unwrap());
        assert!(rx.try_recv().is_err(), "callback must fire exactly once");
    }

    #[test]
    fn failure_reaches_the_callback_with_the_error() {
        let (tx, rx) = mpsc::channel();
        let worker = Worker::spawn(
            "test-err",
            || Err(Error::Lifecycle("boom")),
            move |res| {
                tx.send(res).unwrap();
            },
        )
        .unwrap();
        worker.join();
        assert!(matches!(rx.recv().unwrap(), Err(Error::Lifecycle("boom"))));
    }

    #[test]
    fn thread_carries_the_given_name() {
        let (tx, rx) = mpsc::channel();
        let worker = Worker::spawn(
            "named-loop",
            move || {
                tx.send(thread::current().name().map(str::to_owned)).unwrap();
                Ok(())
            },
            |_| {},
        )
        .unwrap();
        worker.join();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-loop"));
    }
}
