//! Bounded per-artifact fan-out for the build, scan and push stages.

use std::future::Future;
use std::sync::Arc;

use drydock_core::{Attempted, DrydockError};
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::runner::AbortSignal;

/// Result for one artifact of a fanned-out stage.
#[derive(Debug)]
pub struct ArtifactResult<T> {
    pub artifact: String,
    pub outcome: Attempted<T>,
}

/// Run `work` once per item, at most `max_parallel` at a time.
///
/// Items are independent; a failure of one never affects another. When
/// `abort` fires, in-flight work is dropped and the affected artifacts are
/// simply absent from the returned results. Results are sorted by artifact.
pub async fn fan_out<I, T, F, Fut>(
    items: Vec<(String, I)>,
    max_parallel: usize,
    abort: &AbortSignal,
    work: F,
) -> Vec<ArtifactResult<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Attempted<T>> + Send + 'static,
{
    let work = Arc::new(work);
    let results: Arc<Mutex<Vec<ArtifactResult<T>>>> = Arc::new(Mutex::new(Vec::new()));
    let sem = Arc::new(Semaphore::new(max_parallel.max(1)));

    let mut tasks = Vec::new();
    for (artifact, item) in items {
        let work = Arc::clone(&work);
        let results = Arc::clone(&results);
        let sem = Arc::clone(&sem);
        let abort = abort.clone();
        let name = artifact.clone();

        let task = tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            if abort.is_aborted() {
                return;
            }
            tokio::select! {
                biased;
                _ = abort.cancelled() => {}
                outcome = work(item) => {
                    results.lock().await.push(ArtifactResult { artifact, outcome });
                }
            }
        });
        tasks.push((name, task));
    }

    for (artifact, task) in tasks {
        if let Err(e) = task.await {
            warn!(artifact = %artifact, error = %e, "stage task did not complete");
            results.lock().await.push(ArtifactResult {
                artifact,
                outcome: Attempted {
                    result: Err(DrydockError::Internal(format!("stage task failed: {e}"))),
                    attempts: 1,
                },
            });
        }
    }

    let mut collected = std::mem::take(&mut *results.lock().await);
    collected.sort_by(|a, b| a.artifact.cmp(&b.artifact));
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::AbortHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn items(names: &[&str]) -> Vec<(String, String)> {
        names.iter().map(|n| (n.to_string(), n.to_string())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_max_parallel() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));

        let results = fan_out(
            items(&["a", "b", "c", "d", "e"]),
            2,
            &AbortSignal::never(),
            move |name: String| {
                let (c, p) = (Arc::clone(&c), Arc::clone(&p));
                async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                    Attempted {
                        result: Ok(name.len()),
                        attempts: 1,
                    }
                }
            },
        )
        .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[0].artifact, "a");
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let results = fan_out(items(&["ok", "bad"]), 4, &AbortSignal::never(), |name: String| async move {
            let result = if name == "bad" {
                Err(DrydockError::transient("boom"))
            } else {
                Ok(())
            };
            Attempted { result, attempts: 1 }
        })
        .await;

        assert!(results[0].outcome.result.is_err());
        assert_eq!(results[0].artifact, "bad");
        assert!(results[1].outcome.result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_drops_in_flight_work() {
        let handle = AbortHandle::new();
        let signal = handle.signal();
        let aborter = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            aborter.abort();
        });

        let results = fan_out(items(&["fast", "slow"]), 4, &signal, |name: String| async move {
            if name == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Attempted {
                result: Ok(()),
                attempts: 1,
            }
        })
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].artifact, "fast");
    }
}
