//! One-shot deferred work on a background thread.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

struct CancelFlag {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Handle to work scheduled with [`schedule`]. Dropping the handle leaves
/// the work armed; call [`ScheduledTask::cancel`] to disarm it.
pub struct ScheduledTask {
    name: String,
    flag: Arc<CancelFlag>,
    handle: Option<JoinHandle<()>>,
}

/// Run `work` on a named thread after `delay`, unless cancelled first.
pub fn schedule<F>(name: &str, delay: Duration, work: F) -> std::io::Result<ScheduledTask>
where
    F: FnOnce() + Send + 'static,
{
    let flag = Arc::new(CancelFlag {
        cancelled: Mutex::new(false),
        wake: Condvar::new(),
    });
    let thread_flag = Arc::clone(&flag);
    let thread_name = name.to_string();

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let guard = thread_flag
                .cancelled
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (guard, _) = thread_flag
                .wake
                .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
                .unwrap_or_else(PoisonError::into_inner);
            let cancelled = *guard;
            drop(guard);

            if cancelled {
                debug!(task = %thread_name, "Deferred work cancelled");
                return;
            }
            debug!(task = %thread_name, "Running deferred work");
            work();
        })?;

    Ok(ScheduledTask {
        name: name.to_string(),
        flag,
        handle: Some(handle),
    })
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Disarm the task. Has no effect once the work has started.
    pub fn cancel(&self) {
        let mut cancelled = self
            .flag
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.flag.wake.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the task thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_runs_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let start = Instant::now();
        let task = schedule("test-run", Duration::from_millis(20), move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        task.join();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_before_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let task = schedule("test-cancel", Duration::from_secs(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        task.cancel();
        let start = Instant::now();
        task.join();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
