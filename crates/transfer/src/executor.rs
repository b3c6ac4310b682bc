//! Parallel task execution on native threads.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::TransferError;

/// Unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Runs tasks in parallel and lets the dispatcher observe them.
pub trait TaskExecutor {
    fn spawn(&mut self, task: Task) -> Result<(), TransferError>;

    /// Number of tasks still running; finished ones are reaped.
    fn running(&mut self) -> usize;

    /// Blocks until some running task finishes or a short interval passes.
    fn wait_any(&mut self);

    /// Blocks until every spawned task has finished.
    fn join(&mut self);

    /// Signals that no further work should start.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Sends on the completion channel when the task's thread ends, even by panic.
struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// Executor spawning one OS thread per task.
pub struct ThreadExecutor {
    name: String,
    spawned: usize,
    handles: Vec<JoinHandle<()>>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    cancel: CancellationToken,
}

impl ThreadExecutor {
    /// `name` prefixes the worker thread names.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    /// An executor whose cancellation follows `cancel`.
    pub fn with_token(name: impl Into<String>, cancel: CancellationToken) -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            name: name.into(),
            spawned: 0,
            handles: Vec::new(),
            done_tx,
            done_rx,
            cancel,
        }
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.handles.drain(..).partition(|h| h.is_finished());
        self.handles = running;
        for handle in finished {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "worker panicked");
            }
        }
    }
}

impl TaskExecutor for ThreadExecutor {
    fn spawn(&mut self, task: Task) -> Result<(), TransferError> {
        self.spawned += 1;
        let guard = DoneGuard(self.done_tx.clone());
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, self.spawned))
            .spawn(move || {
                let _guard = guard;
                task();
            })?;
        self.handles.push(handle);
        Ok(())
    }

    fn running(&mut self) -> usize {
        self.reap();
        self.handles.len()
    }

    fn wait_any(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        // Timeouts are fine: the sender half is held by `self`, so the
        // channel never disconnects.
        let _ = self.done_rx.recv_timeout(REAP_INTERVAL);
        // Drain extra notifications so the next wait blocks again.
        while self.done_rx.try_recv().is_ok() {}
        self.reap();
    }

    fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "worker panicked");
            }
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut executor = ThreadExecutor::new("test");
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            executor
                .spawn(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        executor.join();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(executor.running(), 0);
    }

    #[test]
    fn wait_any_observes_completion() {
        let mut executor = ThreadExecutor::new("test");
        executor
            .spawn(Box::new(|| thread::sleep(Duration::from_millis(20))))
            .unwrap();
        while executor.running() > 0 {
            executor.wait_any();
        }
        assert_eq!(executor.running(), 0);
    }

    #[test]
    fn panicking_task_is_reaped() {
        let mut executor = ThreadExecutor::new("test");
        executor.spawn(Box::new(|| panic!("boom"))).unwrap();
        executor.join();
        assert_eq!(executor.running(), 0);
    }

    #[test]
    fn cancellation_follows_token() {
        let token = CancellationToken::new();
        let executor = ThreadExecutor::with_token("test", token.clone());
        assert!(!executor.is_cancelled());
        token.cancel();
        assert!(executor.is_cancelled());

        let other = ThreadExecutor::new("test");
        other.cancel();
        assert!(other.is_cancelled());
    }
}
