use crate::errors::{AppError, AppResult};
use crate::models::ImportSource;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

/// Imports of one source never overlap; the ledger rejects a second running run anyway.
const PER_SOURCE_LIMIT: usize = 1;

#[derive(Debug, Clone)]
pub struct ScheduledImport {
    pub job_id: String,
    pub source: ImportSource,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
}

impl ScheduledImport {
    pub fn now(job_id: &str, source: ImportSource, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            source,
            priority,
            queued_at: now,
            not_before: now,
        }
    }

    /// The same job, held back until `delay` has passed. Keeps its original queue time for aging.
    pub fn retry_after(self, delay: Duration) -> Self {
        let now = Utc::now();
        let not_before = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { not_before, ..self }
    }
}

/// What one executor pass over a job ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Requeue the job; it becomes runnable again after the delay.
    RetryAfter(Duration),
}

type ExecutorFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;
pub type Executor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<Mutex<Vec<ScheduledImport>>>,
    running_global: Arc<Mutex<usize>>,
    running_source: Arc<Mutex<HashMap<ImportSource, usize>>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    global_limit: usize,
    max_queue_size: usize,
}

impl Scheduler {
    pub fn new(global_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            running_global: Arc::new(Mutex::new(0)),
            running_source: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            global_limit: global_limit.max(1),
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = self
            .executor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *writer = Some(executor);
    }

    pub async fn enqueue(&self, job: ScheduledImport) -> AppResult<()> {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued.job_id == job.job_id) {
                return Ok(());
            }
            if queue.len() >= self.max_queue_size {
                return Err(AppError::Validation(format!(
                    "import queue capacity exceeded (max {})",
                    self.max_queue_size
                )));
            }
            queue.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Puts an already admitted job back. Not bounded by the queue size.
    async fn requeue(&self, job: ScheduledImport) {
        self.queue.lock().await.push(job);
        self.notify.notify_one();
    }

    pub async fn has_capacity(&self) -> bool {
        let queue = self.queue.lock().await;
        queue.len() < self.max_queue_size
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            let mut blocked_attempts = 0usize;
            loop {
                let (maybe_job, next_delay) = self.pick_next_job().await;
                let Some(job) = maybe_job else {
                    if let Some(delay) = next_delay {
                        let notify = self.notify.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            notify.notify_one();
                        });
                    }
                    break;
                };

                if !self.try_reserve_slot(job.source).await {
                    let mut queue = self.queue.lock().await;
                    queue.push(job);
                    blocked_attempts += 1;
                    if blocked_attempts >= queue.len() {
                        break;
                    }
                    continue;
                }
                blocked_attempts = 0;

                let scheduler = self.clone();
                tokio::spawn(async move {
                    let outcome = scheduler.execute(job.job_id.clone()).await;
                    scheduler.release_slot(job.source).await;
                    match outcome {
                        JobOutcome::Completed => {}
                        JobOutcome::Failed => {
                            tracing::warn!(job_id = %job.job_id, source = job.source.as_str(), "import job finished in failed state");
                        }
                        JobOutcome::RetryAfter(delay) => {
                            tracing::debug!(job_id = %job.job_id, delay_ms = delay.as_millis() as u64, "import job requeued");
                            scheduler.requeue(job.retry_after(delay)).await;
                        }
                    }
                    scheduler.notify.notify_one();
                });
            }
        }
    }

    /// Runs the executor on its own task so a panic cannot leak the reserved slot.
    async fn execute(&self, job_id: String) -> JobOutcome {
        let executor = self
            .executor
            .read()
            .map(|reader| reader.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        let Some(executor) = executor else {
            return JobOutcome::Failed;
        };
        match tokio::spawn(executor(job_id.clone())).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(job_id = %job_id, error = %error, "import job executor panicked");
                JobOutcome::Failed
            }
        }
    }

    async fn pick_next_job(&self) -> (Option<ScheduledImport>, Option<Duration>) {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return (None, None);
        }

        let now = Utc::now();
        let best_index = queue
            .iter()
            .enumerate()
            .filter(|(_, job)| job.not_before <= now)
            .max_by_key(|(_, job)| effective_priority(job, now))
            .map(|(index, _)| index);

        let Some(best_index) = best_index else {
            let delay = queue.iter().map(|job| job.not_before).min().map(|at| {
                let diff = at.signed_duration_since(now).num_milliseconds();
                Duration::from_millis(diff.max(0) as u64)
            });
            return (None, delay);
        };

        (Some(queue.remove(best_index)), None)
    }

    async fn try_reserve_slot(&self, source: ImportSource) -> bool {
        let mut global = self.running_global.lock().await;
        if *global >= self.global_limit {
            return false;
        }

        let mut source_map = self.running_source.lock().await;
        let entry = source_map.entry(source).or_insert(0);
        if *entry >= PER_SOURCE_LIMIT {
            return false;
        }

        *global += 1;
        *entry += 1;
        true
    }

    async fn release_slot(&self, source: ImportSource) {
        let mut global = self.running_global.lock().await;
        if *global > 0 {
            *global -= 1;
        }

        let mut source_map = self.running_source.lock().await;
        if let Some(entry) = source_map.get_mut(&source) {
            if *entry > 0 {
                *entry -= 1;
            }
        }
    }
}

fn effective_priority(job: &ScheduledImport, now: DateTime<Utc>) -> i64 {
    let waited = (now - job.queued_at).num_seconds().max(0);
    i64::from(job.priority) * 100 + waited / 15
}

#[cfg(test)]
mod tests {
    use super::{effective_priority, JobOutcome, ScheduledImport, Scheduler};
    use crate::models::ImportSource;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn aging_increases_priority() {
        let now = Utc::now();
        let old = ScheduledImport {
            queued_at: now - Duration::seconds(120),
            not_before: now - Duration::seconds(120),
            ..ScheduledImport::now("a", ImportSource::BookingSync, 0)
        };
        let fresh = ScheduledImport::now("b", ImportSource::BookingSync, 0);
        assert!(effective_priority(&old, now) > effective_priority(&fresh, now));
    }

    #[tokio::test]
    async fn queue_capacity_is_enforced() {
        let scheduler = Scheduler::new(1, 1);
        scheduler
            .enqueue(ScheduledImport::now("first", ImportSource::BookingSync, 0))
            .await
            .expect("first enqueue");
        scheduler
            .enqueue(ScheduledImport::now("first", ImportSource::BookingSync, 0))
            .await
            .expect("same job is a no-op");
        let err = scheduler
            .enqueue(ScheduledImport::now("second", ImportSource::ManualSheet, 0))
            .await
            .expect_err("second enqueue should fail");
        assert_eq!(err.code(), "VALIDATION");
        assert!(!scheduler.has_capacity().await);
    }

    #[tokio::test]
    async fn one_running_job_per_source() {
        let scheduler = Scheduler::new(4, 8);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            scheduler.set_executor(Arc::new(move |_job_id: String| {
                let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Completed
                })
            }));
        }
        scheduler.start();
        for id in ["a", "b", "c"] {
            scheduler
                .enqueue(ScheduledImport::now(id, ImportSource::BookingSync, 0))
                .await
                .expect("enqueue");
        }

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.queued().await, 0);
    }

    #[tokio::test]
    async fn retry_waits_in_queue_without_holding_the_source() {
        let scheduler = Scheduler::new(4, 8);
        let runs: Arc<std::sync::Mutex<Vec<(String, std::time::Instant)>>> = Arc::default();
        {
            let runs = runs.clone();
            scheduler.set_executor(Arc::new(move |job_id: String| {
                let runs = runs.clone();
                Box::pin(async move {
                    let mut runs = runs.lock().expect("runs");
                    let first_pass = !runs.iter().any(|(id, _)| *id == job_id);
                    runs.push((job_id.clone(), std::time::Instant::now()));
                    if job_id == "flaky" && first_pass {
                        JobOutcome::RetryAfter(std::time::Duration::from_millis(150))
                    } else {
                        JobOutcome::Completed
                    }
                })
            }));
        }
        scheduler.start();
        scheduler
            .enqueue(ScheduledImport::now("flaky", ImportSource::BookingSync, 0))
            .await
            .expect("enqueue");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(scheduler.queued().await, 1);

        // The same source is free while the retry waits.
        scheduler
            .enqueue(ScheduledImport::now("steady", ImportSource::BookingSync, 0))
            .await
            .expect("enqueue");
        for _ in 0..100 {
            if runs.lock().expect("runs").len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let runs = runs.lock().expect("runs").clone();
        let order: Vec<&str> = runs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["flaky", "steady", "flaky"]);
        assert!(runs[2].1 - runs[0].1 >= std::time::Duration::from_millis(140));
        assert_eq!(scheduler.queued().await, 0);
    }

    #[test]
    fn retry_after_delays_but_keeps_queue_time() {
        let job = ScheduledImport::now("a", ImportSource::ManualSheet, 1);
        let queued_at = job.queued_at;
        let delayed = job.retry_after(std::time::Duration::from_secs(60));
        assert_eq!(delayed.queued_at, queued_at);
        assert!(delayed.not_before >= queued_at + Duration::seconds(59));
    }
}
