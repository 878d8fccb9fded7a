//! In-flight request accounting for the producer

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Counts requests between `produce` and their result callback
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until nothing is in flight
    ///
    /// Returns the number of requests still in flight when `timeout` elapses.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> Result<(), usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let count = self.count();
            if count == 0 {
                return Ok(());
            }
            debug!(in_flight = count, "Waiting for in-flight requests");
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let count = self.count();
                return if count == 0 { Ok(()) } else { Err(count) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_idle_returns_when_drained() {
        let in_flight = Arc::new(InFlight::default());
        in_flight.add();
        in_flight.add();

        let background = in_flight.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            background.remove();
            background.remove();
        });

        assert_eq!(in_flight.wait_idle(Duration::from_secs(5)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_idle_times_out_with_count() {
        let in_flight = InFlight::default();
        in_flight.add();
        assert_eq!(in_flight.wait_idle(Duration::from_millis(20)).await, Err(1));
    }
}
