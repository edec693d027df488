// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-queue worker pools.
//!
//! Each named queue owns one pool with an independently configurable
//! concurrency cap.  Pools are *reserved* while handlers register and only
//! begin dispatching at [`PoolSet::start_all`], once configuration is
//! complete; work submitted earlier queues up.  A job whose start is delayed
//! past the 24-hour misfire grace is dropped and logged instead of run.
//!
//! Pool activity is optionally appended to a JSON-lines log, one object per
//! scheduler event.  The log is advisory; only the CLI reads it back.

use std::{
    collections::HashMap,
    future::Future,
    io::Write,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{wiredate, EngineError};

/// How long past its scheduled start a job may still run.
const MISFIRE_GRACE: Duration = Duration::from_secs(24 * 3600);

/// Concurrency cap for queues with no explicit `max_threads`.
pub const DEFAULT_MAX_THREADS: usize = 4;

type JobFuture = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'static>>;

struct PoolJob {
    /// Short name of the work, for the activity log.
    func: &'static str,
    scheduled_at: Instant,
    fut: JobFuture,
}

// ── Activity log ──────────────────────────────────────────────────────────────

/// Append-only JSON-lines record of scheduler events.
pub struct ActivityLog {
    file: Mutex<std::fs::File>,
}

impl ActivityLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn record(&self, activity: Value) {
        let line = json!({
            "time": wiredate::encode(&Utc::now()),
            "activity": activity,
        });
        let mut file = self.file.lock().expect("activity log mutex poisoned");
        if let Err(e) = writeln!(file, "{line}") {
            warn!("activity log write failed: {e}");
        }
    }
}

fn record(log: &Option<Arc<ActivityLog>>, activity: Value) {
    if let Some(log) = log {
        log.record(activity);
    }
}

// ── Pools ─────────────────────────────────────────────────────────────────────

struct QueuePool {
    name: String,
    tx: mpsc::UnboundedSender<PoolJob>,
    /// Taken by the dispatcher when the pool starts.
    rx: Mutex<Option<mpsc::UnboundedReceiver<PoolJob>>>,
}

/// All pools of one engine.
#[derive(Clone)]
pub struct PoolSet {
    inner: Arc<PoolSetInner>,
}

struct PoolSetInner {
    pools: RwLock<HashMap<String, Arc<QueuePool>>>,
    started: RwLock<bool>,
    activity: Option<Arc<ActivityLog>>,
}

impl PoolSet {
    pub fn new(activity: Option<ActivityLog>) -> Self {
        Self {
            inner: Arc::new(PoolSetInner {
                pools: RwLock::new(HashMap::new()),
                started: RwLock::new(false),
                activity: activity.map(Arc::new),
            }),
        }
    }

    /// Ensure a pool exists for `queue`.  Called for every queue a task
    /// handler registers on, before the node starts serving.
    pub fn reserve(&self, queue: &str) {
        self.get_or_create(queue);
    }

    fn get_or_create(&self, queue: &str) -> Arc<QueuePool> {
        if let Some(pool) = self.inner.pools.read().expect("pool lock").get(queue) {
            return pool.clone();
        }
        let mut pools = self.inner.pools.write().expect("pool lock");
        if let Some(pool) = pools.get(queue) {
            return pool.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(QueuePool {
            name: queue.to_string(),
            tx,
            rx: Mutex::new(Some(rx)),
        });
        pools.insert(queue.to_string(), pool.clone());
        record(&self.inner.activity, json!({"action": "CREATE_QUEUE", "queue": queue}));

        // a pool created after startup dispatches immediately at the default cap
        if *self.inner.started.read().expect("started lock") {
            self.start_pool(&pool, DEFAULT_MAX_THREADS);
        }
        pool
    }

    /// Schedule a unit of work for immediate execution on `queue`.
    pub fn submit_now<F>(&self, queue: &str, func: &'static str, fut: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let pool = self.get_or_create(queue);
        debug!(queue = %queue, func, "submitting job");
        let job = PoolJob {
            func,
            scheduled_at: Instant::now(),
            fut: Box::pin(fut),
        };
        // receiver lives as long as the pool, so this cannot fail
        let _ = pool.tx.send(job);
    }

    /// Schedule a unit of work at a wall-clock instant.  Used only for
    /// reservation timeouts.
    pub fn submit_at<F>(&self, queue: &str, func: &'static str, when: DateTime<Utc>, fut: F)
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let pool = self.get_or_create(queue);
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let target = Instant::now() + delay;
        debug!(queue = %queue, func, delay_secs = delay.as_secs(), "scheduling job");
        tokio::spawn(async move {
            tokio::time::sleep_until(target).await;
            let job = PoolJob {
                func,
                scheduled_at: target,
                fut: Box::pin(fut),
            };
            let _ = pool.tx.send(job);
        });
    }

    /// Begin dispatching on every reserved pool.  `max_threads` comes from
    /// configuration, keyed by queue name; concurrency caps cannot be
    /// applied earlier because configuration is not guaranteed complete
    /// until this point.
    pub fn start_all(&self, max_threads: &HashMap<String, usize>) {
        record(&self.inner.activity, json!({"action": "START"}));
        *self.inner.started.write().expect("started lock") = true;

        let pools: Vec<Arc<QueuePool>> = self
            .inner
            .pools
            .read()
            .expect("pool lock")
            .values()
            .cloned()
            .collect();
        for pool in pools {
            let max = max_threads
                .get(&pool.name)
                .copied()
                .unwrap_or(DEFAULT_MAX_THREADS);
            if max_threads.contains_key(&pool.name) {
                info!(queue = %pool.name, max, "queue concurrency configured");
                record(
                    &self.inner.activity,
                    json!({"action": "SET_QUEUE_MAX", "queue": pool.name, "max": max}),
                );
            }
            self.start_pool(&pool, max);
        }
    }

    fn start_pool(&self, pool: &Arc<QueuePool>, max: usize) {
        let Some(mut rx) = pool.rx.lock().expect("pool rx lock").take() else {
            return; // already dispatching
        };
        info!(queue = %pool.name, max, "starting queue pool");
        let semaphore = Arc::new(Semaphore::new(max));
        let activity = self.inner.activity.clone();
        let queue = pool.name.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("pool semaphore closed");

                if job.scheduled_at.elapsed() > MISFIRE_GRACE {
                    warn!(queue = %queue, func = job.func, "job missed its misfire grace, dropping");
                    record(
                        &activity,
                        json!({"action": "EVENT_JOB_MISSED", "queue": queue, "func_name": job.func}),
                    );
                    continue;
                }

                record(
                    &activity,
                    json!({"action": "EVENT_JOB_LAUNCHING", "queue": queue, "func_name": job.func}),
                );
                let activity = activity.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match job.fut.await {
                        Ok(()) => record(
                            &activity,
                            json!({"action": "EVENT_JOB_EXECUTED", "queue": queue, "func_name": job.func}),
                        ),
                        Err(e) => {
                            error!(queue = %queue, func = job.func, "job failed: {e}");
                            record(
                                &activity,
                                json!({"action": "EVENT_JOB_ERROR", "queue": queue, "func_name": job.func, "error": e.to_string()}),
                            );
                        }
                    }
                });
            }
        });
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started_pools(max: usize) -> PoolSet {
        let pools = PoolSet::new(None);
        pools.reserve("q");
        pools.start_all(&HashMap::from([("q".to_string(), max)]));
        pools
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn jobs_submitted_before_start_run_after_start() {
        let pools = PoolSet::new(None);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pools.submit_now("q", "early", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "must not run before start_all");

        pools.start_all(&HashMap::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_capped_per_queue() {
        let pools = started_pools(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
            pools.submit_now("q", "probe", async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2, "cap of 2 exceeded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_jobs_do_not_poison_the_pool() {
        let pools = started_pools(1);
        let ran = Arc::new(AtomicUsize::new(0));
        pools.submit_now("q", "bad", async move {
            Err(EngineError::Handler("boom".into()))
        });
        let r = ran.clone();
        pools.submit_now("q", "good", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_at_waits_for_the_instant() {
        let pools = started_pools(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        pools.submit_at(
            "q",
            "later",
            Utc::now() + chrono::Duration::milliseconds(150),
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn activity_log_records_lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json.log");
        let pools = PoolSet::new(Some(ActivityLog::open(&path).unwrap()));
        pools.reserve("q");
        pools.start_all(&HashMap::from([("q".to_string(), 1)]));
        pools.submit_now("q", "noop", async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let text = std::fs::read_to_string(&path).unwrap();
        let actions: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["activity"]["action"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert!(actions.contains(&"CREATE_QUEUE".to_string()));
        assert!(actions.contains(&"START".to_string()));
        assert!(actions.contains(&"SET_QUEUE_MAX".to_string()));
        assert!(actions.contains(&"EVENT_JOB_LAUNCHING".to_string()));
        assert!(actions.contains(&"EVENT_JOB_EXECUTED".to_string()));
    }
}
