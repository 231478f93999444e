//! Worker pool draining the kit work queue.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kiln_core::ObjectKey;
use kiln_kubehub::WorkQueue;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reconcile::{KitReconciler, Next};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub workers: usize,
    /// Deadline for a single pass; an expired pass is dropped, which also
    /// kills any build it was running.
    pub pass_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pass_timeout: Duration::from_secs(900),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Per-key exponential backoff for failed passes.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut m = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let n = m.entry(key.clone()).or_insert(0);
        let delay = self.base.saturating_mul(1u32 << (*n).min(16)).min(self.max);
        *n = n.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &ObjectKey) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }
}

/// Spawn `cfg.workers` tasks that reconcile keys until the queue shuts down.
/// Aborting the handles drops any pass in progress.
pub fn spawn_workers(reconciler: Arc<KitReconciler>, queue: Arc<WorkQueue>, cfg: RuntimeConfig) -> Vec<JoinHandle<()>> {
    let backoff = Arc::new(Backoff::new(cfg.backoff_base, cfg.backoff_max));
    (0..cfg.workers.max(1))
        .map(|id| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue);
            let backoff = Arc::clone(&backoff);
            let pass_timeout = cfg.pass_timeout;
            tokio::spawn(async move {
                debug!(worker = id, "worker started");
                while let Some(key) = queue.next().await {
                    run_pass(&reconciler, &queue, &backoff, pass_timeout, &key).await;
                    queue.done(&key);
                }
                debug!(worker = id, "worker stopped");
            })
        })
        .collect()
}

/// One pass for `key`, then schedule its follow-up: a fixed delay when the
/// pass asked for one, backoff when it failed, nothing otherwise.
pub async fn run_pass(
    reconciler: &KitReconciler,
    queue: &Arc<WorkQueue>,
    backoff: &Backoff,
    pass_timeout: Duration,
    key: &ObjectKey,
) {
    let started = Instant::now();
    let res = tokio::time::timeout(pass_timeout, reconciler.reconcile(key)).await;
    histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("reconcile_total", 1u64);

    let err = match res {
        Ok(Ok(Next::Done)) => {
            backoff.reset(key);
            return;
        }
        Ok(Ok(Next::RequeueAfter(delay))) => {
            backoff.reset(key);
            debug!(kit = %key, delay_ms = delay.as_millis() as u64, "requeue requested");
            queue.add_after(key.clone(), delay);
            return;
        }
        Ok(Err(e)) => format!("{:#}", anyhow::Error::from(e)),
        Err(_) => format!("pass exceeded {}s", pass_timeout.as_secs()),
    };
    counter!("reconcile_errors_total", 1u64);
    let delay = backoff.next_delay(key);
    if delay >= backoff.max {
        warn!(kit = %key, error = %err, retry_in_secs = delay.as_secs(), "reconcile failed, retrying at max backoff");
    } else {
        info!(kit = %key, error = %err, retry_in_ms = delay.as_millis() as u64, "reconcile failed, retrying");
    }
    queue.add_after(key.clone(), delay);
}
