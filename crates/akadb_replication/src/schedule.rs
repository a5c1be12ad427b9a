//! Periodic background tasks with cancellation handles.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawns periodic work on the current tokio runtime.
pub struct ScheduledTask;

impl ScheduledTask {
    /// Runs `work` every `period`, starting one period from now.
    ///
    /// Must be called from inside a tokio runtime. The task stops when the
    /// returned handle is cancelled or dropped.
    pub fn every<F>(name: &'static str, period: Duration, mut work: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(task = name, period_ms = period.as_millis() as u64, "scheduled task started");
            loop {
                timer.tick().await;
                work();
            }
        });
        TaskHandle {
            name,
            handle: Some(handle),
        }
    }
}

/// Cancels a scheduled task on [`cancel`](TaskHandle::cancel) or drop.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Stops the task. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(task = self.name, "scheduled task cancelled");
        }
    }

    /// Returns true once the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_none()
    }

    /// Name given at scheduling time.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut task = ScheduledTask::every("count", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.cancel();
        assert!(task.is_cancelled());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = ScheduledTask::every("drop", Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.name(), "drop");
        drop(task);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
