//! Bounded worker pool for independent jobs.
//!
//! Reports of a repository and combinations of a feature do not depend on
//! each other, so they are spread over a fixed number of named threads.
//! Jobs are fed through a bounded `crossbeam-channel` queue and results are
//! returned in submission order regardless of completion order.

use std::num::NonZeroUsize;
use std::thread;

use crossbeam_channel::{bounded, unbounded};

/// Number of workers used when none is configured.
#[must_use]
pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// A pool of `workers` threads named `simetl-<name>-<n>`.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    workers: usize,
}

impl WorkerPool {
    /// Pool of `workers` threads, named after `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Applies `job` to every item, returning results in item order.
    ///
    /// Runs inline when there is a single worker or a single item. A panic
    /// in a job propagates to the caller once all workers have stopped.
    pub fn map<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        if self.workers == 1 || items.len() <= 1 {
            return items.into_iter().map(job).collect();
        }

        let total = items.len();
        let workers = self.workers.min(total);
        let (job_tx, job_rx) = bounded::<(usize, T)>(workers);
        let (result_tx, result_rx) = unbounded::<(usize, R)>();
        let job = &job;

        thread::scope(|scope| {
            for idx in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("simetl-{}-{idx}", self.name))
                    .spawn_scoped(scope, move || {
                        for (pos, item) in job_rx {
                            if result_tx.send((pos, job(item))).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("failed to spawn simetl worker");
            }
            drop(job_rx);
            drop(result_tx);

            for item in items.into_iter().enumerate() {
                // Only fails if every worker has exited, i.e. panicked.
                if job_tx.send(item).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        for (pos, result) in result_rx.try_iter() {
            slots[pos] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new("pool", default_workers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_results_keep_submission_order() {
        let pool = WorkerPool::new("test", 4);
        let items: Vec<u64> = (0..32).collect();
        let out = pool.map(items, |n| {
            // Later items finish first.
            thread::sleep(Duration::from_millis(32 - n));
            n * 2
        });
        assert_eq!(out, (0..32).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_item_runs_once() {
        let pool = WorkerPool::new("test", 3);
        let calls = AtomicUsize::new(0);
        let out = pool.map((0..100).collect(), |n: usize| {
            calls.fetch_add(1, Ordering::SeqCst);
            n
        });
        assert_eq!(out.len(), 100);
        assert_eq!(calls.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_threads_are_named() {
        let pool = WorkerPool::new("names", 2);
        let names = pool.map(vec![(), ()], |()| thread::current().name().map(str::to_string));
        for name in names {
            assert!(name.unwrap().starts_with("simetl-names-"));
        }
    }

    #[test]
    fn test_single_worker_runs_inline() {
        let pool = WorkerPool::new("inline", 0);
        assert_eq!(pool.workers(), 1);
        let caller = thread::current().id();
        let ids = pool.map(vec![1, 2], |_| thread::current().id());
        assert!(ids.iter().all(|id| *id == caller));
    }
}
