//! Bounded fan-out of registry calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

use crate::registry::{RegistryError, RegistryResult};

/// Run `jobs` concurrently, at most `limit` at a time, each under `timeout`.
///
/// Results come back keyed by the index given with each job, in completion
/// order. A job that panics is logged and produces no result.
pub(crate) async fn run_bounded<T, F>(
    limit: usize,
    timeout: Duration,
    jobs: Vec<(usize, F)>,
) -> Vec<(usize, RegistryResult<T>)>
where
    T: Send + 'static,
    F: Future<Output = RegistryResult<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for (index, job) in jobs {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = match tokio::time::timeout(timeout, job).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout(timeout)),
            };
            (index, result)
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "registry call task failed"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..12)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let job = async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, RegistryError>(i * 2)
                };
                (i, job)
            })
            .collect();

        let mut results = run_bounded(3, Duration::from_secs(5), jobs).await;
        results.sort_by_key(|(i, _)| *i);

        assert_eq!(results.len(), 12);
        assert_eq!(results[5], (5, Ok(10)));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn slow_jobs_time_out() {
        let jobs = vec![
            (0, Box::pin(async { Ok::<_, RegistryError>(()) })
                as std::pin::Pin<Box<dyn Future<Output = RegistryResult<()>> + Send>>),
            (1, Box::pin(std::future::pending())),
        ];
        let mut results = run_bounded(2, Duration::from_millis(20), jobs).await;
        results.sort_by_key(|(i, _)| *i);

        assert_eq!(results[0], (0, Ok(())));
        assert!(matches!(results[1], (1, Err(RegistryError::Timeout(_)))));
    }
}
