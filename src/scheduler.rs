//! Bounded worker pool that runs one batch of jobs and returns results in
//! submission order.
//! Workers are Tokio tasks pulling from a shared queue; each result lands in
//! the slot of its submission position. The first job error trips the
//! shutdown latch: nothing new is claimed, in-flight jobs finish.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cancellation::ShutdownLatch;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError<E> {
    #[error("job {position} failed: {source}")]
    JobFailed {
        position: usize,
        #[source]
        source: E,
    },
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("batch cancelled")]
    Cancelled,
}

pub struct WorkScheduler {
    concurrency: usize,
    parent: Option<CancellationToken>,
}

impl WorkScheduler {
    /// A concurrency of 0 is treated as 1.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            parent: None,
        }
    }

    /// Stop dispatching when `token` is cancelled.
    pub fn with_parent(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every job through `worker` on `min(concurrency, jobs.len())`
    /// workers. `worker` receives the submission position and the job.
    pub async fn run<J, R, E, F, Fut>(&self, jobs: Vec<J>, worker: F) -> Result<Vec<R>, SchedulerError<E>>
    where
        J: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(usize, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let total = jobs.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let queue: Arc<Mutex<VecDeque<(usize, J)>>> =
            Arc::new(Mutex::new(jobs.into_iter().enumerate().collect()));
        let slots: Arc<Mutex<Vec<Option<R>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let latch: Arc<ShutdownLatch<E>> = Arc::new(match &self.parent {
            Some(parent) => ShutdownLatch::child_of(parent),
            None => ShutdownLatch::new(),
        });
        let worker = Arc::new(worker);

        let pool = self.concurrency.min(total);
        debug!(jobs = total, workers = pool, "scheduler starting");

        let mut set = JoinSet::new();
        for worker_id in 0..pool {
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            let latch = Arc::clone(&latch);
            let worker = Arc::clone(&worker);

            set.spawn(async move {
                loop {
                    if latch.is_tripped() {
                        break;
                    }
                    let next = queue.lock().pop_front();
                    let Some((position, job)) = next else {
                        break;
                    };
                    match worker(position, job).await {
                        Ok(result) => {
                            slots.lock()[position] = Some(result);
                        }
                        Err(e) => {
                            if latch.trip(position, e) {
                                warn!(worker_id, position, "job failed, stopping dispatch");
                            }
                            break;
                        }
                    }
                }
            });
        }

        let mut panicked: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                latch.cancel();
                if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    error!(panic = %message, "scheduler worker panicked");
                    panicked.get_or_insert(message);
                } else {
                    panicked.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some((position, source)) = latch.take_error() {
            return Err(SchedulerError::JobFailed { position, source });
        }
        if let Some(message) = panicked {
            return Err(SchedulerError::WorkerPanicked(message));
        }

        let filled = std::mem::take(&mut *slots.lock());
        match filled.into_iter().collect::<Option<Vec<R>>>() {
            Some(results) => Ok(results),
            None => {
                debug!("scheduler cancelled before all jobs ran");
                Err(SchedulerError::Cancelled)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn results_follow_submission_order() {
        let jobs: Vec<usize> = (0..50).collect();
        let results = WorkScheduler::new(8)
            .run(jobs, |_, n| {
                let delay = rand::thread_rng().gen_range(0..8);
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, ()>(n * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(results, (0..50).map(|n| n * 10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_job_runs_exactly_once() {
        let seen = Arc::new(Mutex::new(vec![0u32; 40]));
        let counter = Arc::clone(&seen);
        WorkScheduler::new(5)
            .run((0..40).collect::<Vec<usize>>(), move |position, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.lock()[position] += 1;
                    tokio::task::yield_now().await;
                    Ok::<_, ()>(())
                }
            })
            .await
            .unwrap();

        assert!(seen.lock().iter().all(|&n| n == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (flight, high) = (Arc::clone(&in_flight), Arc::clone(&peak));

        WorkScheduler::new(3)
            .run(vec![(); 30], move |_, _| {
                let (flight, high) = (Arc::clone(&flight), Arc::clone(&high));
                async move {
                    let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ()>(())
                }
            })
            .await
            .unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3 && peak >= 1, "peak {peak}");
    }

    #[tokio::test]
    async fn single_worker_runs_sequentially() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        WorkScheduler::new(1)
            .run((0..5).collect::<Vec<usize>>(), move |position, _| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(position);
                    Ok::<_, ()>(())
                }
            })
            .await
            .unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_failure_stops_new_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = WorkScheduler::new(2)
            .run((0..20).collect::<Vec<usize>>(), move |position, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if position == 3 {
                        return Err(format!("job {position} broke"));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(position)
                }
            })
            .await;

        match result {
            Err(SchedulerError::JobFailed { position, source }) => {
                assert_eq!(position, 3);
                assert_eq!(source, "job 3 broke");
            }
            other => panic!("unexpected {other:?}"),
        }
        // jobs 0..=3 plus at most one already claimed by the other worker
        assert!(calls.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn panicking_worker_is_reported() {
        let result = WorkScheduler::new(2)
            .run(vec![0usize, 1, 2], |position, _| async move {
                if position == 1 {
                    panic!("worker blew up");
                }
                Ok::<_, ()>(position)
            })
            .await;

        match result {
            Err(SchedulerError::WorkerPanicked(message)) => assert_eq!(message, "worker blew up"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_batch_returns_empty() {
        let results = WorkScheduler::new(4)
            .run(Vec::<u8>::new(), |_, _| async { Ok::<u8, ()>(0) })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn cancelled_parent_dispatches_nothing() {
        let parent = CancellationToken::new();
        parent.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = WorkScheduler::new(2)
            .with_parent(parent)
            .run(vec![(); 4], move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ()>(()) }
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_concurrency_is_raised_to_one() {
        assert_eq!(WorkScheduler::new(0).concurrency(), 1);
    }
}
