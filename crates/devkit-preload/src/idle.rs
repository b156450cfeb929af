//! Idle-time scheduling capability

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs work when the host is idle
pub trait IdleScheduler: Send + Sync {
    /// Schedule a task; must be called within a tokio runtime
    fn schedule(&self, task: BoxFuture<'static, ()>) -> JoinHandle<()>;
}

/// Fallback for hosts without an idle callback: run after a fixed delay
#[derive(Debug, Clone, Copy)]
pub struct TimerIdle {
    delay: Duration,
}

impl TimerIdle {
    /// Create with the given delay
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Configured delay
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for TimerIdle {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl IdleScheduler for TimerIdle {
    fn schedule(&self, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }
}

/// Runs once the runtime gets back to the task after a yield
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldIdle;

impl IdleScheduler for YieldIdle {
    fn schedule(&self, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            task.await;
        })
    }
}
