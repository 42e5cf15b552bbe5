// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded-parallelism fan-out.
//!
//! The single place that issues multi-task work. Everything else in the
//! crate is sequential within one logical unit (one artifact, one cluster).

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run `work` over every item with at most `max_parallelism` tasks in
/// flight. Results come back in input order; completion order is
/// unspecified. A `max_parallelism` of zero is treated as one.
pub async fn for_each<T, R, F, Fut>(items: Vec<T>, max_parallelism: usize, work: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1)));
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let work = work.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("fan-out semaphore closed");
            (index, work(item).await)
        });
    }

    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(tasks.len()).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => unreachable!("fan-out tasks are never aborted"),
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.expect("fan-out slot never filled"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_preserve_input_order() {
        let items: Vec<u64> = vec![30, 10, 20];
        let results = for_each(items, 3, |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay * 2
        })
        .await;
        assert_eq!(results, vec![60, 20, 40]);
    }

    #[tokio::test]
    async fn respects_parallelism_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..16).collect();
        let (in_flight_ref, peak_ref) = (in_flight.clone(), peak.clone());
        for_each(items, 2, move |_| {
            let in_flight = in_flight_ref.clone();
            let peak = peak_ref.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_parallelism_still_runs() {
        let results = for_each(vec![1, 2, 3], 0, |n| async move { n + 1 }).await;
        assert_eq!(results, vec![2, 3, 4]);
    }
}
