//! Bounded worker pool for bulk operations.
//!
//! A fixed number of workers drain one shared FIFO queue. A failing task
//! does not stop its siblings: every failure is collected and handed back
//! together with the item that caused it.

use std::collections::VecDeque;
use std::future::Future;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Error;

/// Run `work` over every item with at most `parallelism` tasks in flight.
///
/// `parallelism` is clamped to at least one worker and never spawns more
/// workers than there are items. Returns the items that failed, in the
/// order their failures were observed.
pub async fn run_bounded<T, I, F, Fut>(parallelism: usize, items: I, work: F) -> Vec<(T, Error)>
where
    T: Clone,
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let queue: VecDeque<T> = items.into_iter().collect();
    let total = queue.len();
    let workers = parallelism.max(1).min(total);
    if workers == 0 {
        return Vec::new();
    }

    let queue = Mutex::new(queue);
    let failures = Mutex::new(Vec::new());

    let queue_ref = &queue;
    let failures_ref = &failures;
    let work_ref = &work;

    join_all((0..workers).map(move |worker| async move {
        let mut done = 0usize;
        loop {
            let next = queue_ref.lock().await.pop_front();
            let Some(item) = next else { break };
            if let Err(e) = work_ref(item.clone()).await {
                failures_ref.lock().await.push((item, e));
            }
            done += 1;
        }
        debug!(worker, done, "Worker drained queue");
    }))
    .await;

    let failures = failures.into_inner();
    debug!(total, workers, failed = failures.len(), "Bounded run complete");
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_every_item() {
        let seen = AtomicUsize::new(0);
        let counter = &seen;
        let failures = run_bounded(3, 0..10u32, move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        })
        .await;

        assert!(failures.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let seen = AtomicUsize::new(0);
        let counter = &seen;
        let mut failures = run_bounded(2, 0..6u32, move |n| {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err(Error::Config(format!("task {n}")))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(seen.load(Ordering::SeqCst), 6);
        failures.sort_by_key(|(n, _)| *n);
        let failed: Vec<u32> = failures.iter().map(|(n, _)| *n).collect();
        assert_eq!(failed, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_parallelism() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (current, max) = (&in_flight, &peak);

        run_bounded(2, 0..8u32, move |_| async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_zero_parallelism_still_runs() {
        let seen = AtomicUsize::new(0);
        let counter = &seen;
        run_bounded(0, 0..3u32, move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        })
        .await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
