#![forbid(unsafe_code)]

// Waiting primitives built for the run's cooperative scheduler

use crate::error::HarnessResult;
use futures_util::future::try_join_all;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Shortest polling period; a zero interval is raised to this.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Resolves after `delay` without blocking other tasks.
pub async fn after_delay(delay: Duration) {
    sleep(delay).await;
}

/// Checks `predicate` immediately and then once per `poll_interval` until it
/// returns true. An error from the predicate ends the wait.
pub async fn until_condition<F>(mut predicate: F, poll_interval: Duration) -> HarnessResult<()>
where
    F: FnMut() -> HarnessResult<bool>,
{
    let mut ticker = interval(poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if predicate()? {
            return Ok(());
        }
    }
}

/// Waits for every future; the first failure wins and the rest are dropped.
pub async fn await_all_of<I, F, T>(futures: I) -> HarnessResult<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = HarnessResult<T>>,
{
    try_join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::signal::{Signal, SignalBus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_after_delay_waits() {
        let start = Instant::now();
        after_delay(Duration::from_secs(1)).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_condition_polls_on_interval() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);
        let start = Instant::now();

        until_condition(
            move || Ok(counter.fetch_add(1, Ordering::SeqCst) >= 3),
            Duration::from_millis(1000),
        )
        .await
        .unwrap();

        assert_eq!(checks.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_condition_zero_interval() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);

        until_condition(move || Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_until_condition_propagates_errors() {
        let result = until_condition(
            || Err(HarnessError::CaptureUnsupported { index: 0 }),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(HarnessError::CaptureUnsupported { index: 0 })));
    }

    #[tokio::test]
    async fn test_await_all_of_fails_fast() {
        let bus = SignalBus::new();
        let waits = vec![
            bus.wait_for(Signal::open_local(0), [Signal::closed_local(0)]),
            bus.wait_for(Signal::open_local(1), [Signal::closed_local(1)]),
        ];

        // Channel 0 never opens; channel 1 closes early
        bus.emit(Signal::closed_local(1));

        let result = await_all_of(waits).await;
        assert!(matches!(result, Err(HarnessError::ClosedPrematurely { .. })));
    }

    #[tokio::test]
    async fn test_await_all_of_collects() {
        let bus = SignalBus::new();
        let waits: Vec<_> = (0..5).map(|i| bus.wait_for(Signal::data_local(i), [])).collect();
        for i in (0..5).rev() {
            bus.emit(Signal::data_local(i));
        }
        assert_eq!(await_all_of(waits).await.unwrap().len(), 5);
    }
}
