// ABOUTME: Repeating background tasks with an explicit stop handle.
// ABOUTME: Drives the recording clock and the periodic sync drain.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A running periodic task. Stopped explicitly or when dropped.
#[derive(Debug)]
pub struct IntervalHandle {
    task: JoinHandle<()>,
}

impl IntervalHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for IntervalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Call `f` every `period`, starting one period from now. Each call is
/// awaited before the next is scheduled; missed periods are not replayed.
pub fn every_interval<F, Fut>(period: Duration, mut f: F) -> IntervalHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            f().await;
        }
    });
    IntervalHandle { task }
}
