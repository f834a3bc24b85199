//! Queued imports whose payload comes from an external fetch.

use crate::config::EngineSettings;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::ingest;
use crate::models::{ImportCounters, ImportJob, ImportSource, ImportStatus};
use crate::scheduler::{JobOutcome, ScheduledImport, Scheduler};
use crate::sources::sheet::SheetOptions;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_BACKOFF_SHIFT: u32 = 16;

pub type FetchFuture = Pin<Box<dyn Future<Output = AppResult<Vec<u8>>> + Send>>;
/// Produces the payload for one attempt. Called again on every retry.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

#[derive(Clone)]
pub struct JobQueue {
    runner: JobRunner,
    scheduler: Scheduler,
}

/// The executor side. Kept apart from the scheduler so the executor closure does not own it.
#[derive(Clone)]
struct JobRunner {
    db: Arc<Database>,
    settings: Arc<EngineSettings>,
    fetchers: Arc<Mutex<HashMap<String, Fetcher>>>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>, settings: Arc<EngineSettings>) -> Self {
        let scheduler = Scheduler::new(settings.scheduler.global_limit, settings.scheduler.max_queue_size);
        let runner = JobRunner {
            db,
            settings,
            fetchers: Arc::new(Mutex::new(HashMap::new())),
        };
        let executor_runner = runner.clone();
        scheduler.set_executor(Arc::new(move |job_id: String| {
            let runner = executor_runner.clone();
            Box::pin(async move { runner.run(job_id).await })
        }));
        Self { runner, scheduler }
    }

    /// Spawns the scheduler loop. Needs a running tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn submit(&self, source: ImportSource, file_id: &str, priority: i32, fetcher: Fetcher) -> AppResult<ImportJob> {
        if file_id.trim().is_empty() {
            return Err(AppError::Validation("file id is required".to_string()));
        }
        if !self.scheduler.has_capacity().await {
            return Err(AppError::Validation(format!(
                "import queue is full (max {})",
                self.runner.settings.scheduler.max_queue_size
            )));
        }

        let job = self
            .runner
            .db
            .insert_import_job(source, file_id, priority, &self.runner.settings.imports)?;
        self.runner.fetchers()?.insert(job.id.clone(), fetcher);

        if let Err(error) = self
            .scheduler
            .enqueue(ScheduledImport::now(&job.id, source, priority))
            .await
        {
            self.runner.fetchers()?.remove(&job.id);
            self.runner
                .db
                .mark_job_finished(&job.id, true, None, Some(&error.to_string()))?;
            return Err(error);
        }

        tracing::info!(job_id = %job.id, source = source.as_str(), file_id, priority, "import job queued");
        Ok(job)
    }

    pub fn status(&self, job_id: &str) -> AppResult<ImportJob> {
        job_status(&self.runner.db, job_id)
    }

    /// Polls until the job is terminal or `timeout` elapses, returning the last snapshot.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> AppResult<ImportJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.status(job_id)?;
            if job.state.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

pub fn job_status(db: &Database, job_id: &str) -> AppResult<ImportJob> {
    db.get_import_job(job_id)?
        .ok_or_else(|| AppError::NotFound(format!("import job {}", job_id)))
}

/// Delay before the retry that follows `attempt` (1-based).
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

impl JobRunner {
    fn fetchers(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<String, Fetcher>>> {
        self.fetchers
            .lock()
            .map_err(|_| AppError::Internal("fetcher registry poisoned".to_string()))
    }

    async fn run(self, job_id: String) -> JobOutcome {
        match self.attempt(&job_id).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(job_id = %job_id, error = %error, "import job bookkeeping failed");
                if let Err(close_error) = self.close(&job_id, None, Some(&error)) {
                    tracing::error!(job_id = %job_id, error = %close_error, "failed to close import job");
                }
                JobOutcome::Failed
            }
        }
    }

    /// One fetch attempt. A failed attempt with retries left goes back to the
    /// scheduler with its backoff delay instead of waiting here.
    async fn attempt(&self, job_id: &str) -> AppResult<JobOutcome> {
        let job = job_status(&self.db, job_id)?;
        let fetcher = self.fetchers()?.get(job_id).cloned();
        let Some(fetcher) = fetcher else {
            let error = AppError::Internal("no fetcher registered for job".to_string());
            self.close(job_id, None, Some(&error))?;
            return Ok(JobOutcome::Failed);
        };
        self.db.mark_job_running(job_id)?;

        let attempt = job.attempts.saturating_add(1);
        let mut fetch = tokio::spawn(fetcher());
        let error = match tokio::time::timeout(Duration::from_millis(job.timeout_ms), &mut fetch).await {
            Ok(Ok(Ok(payload))) => {
                self.db.record_job_attempt(job_id, None)?;
                self.fetchers()?.remove(job_id);
                return self.ingest(&job, payload).await;
            }
            Ok(Ok(Err(error))) => error.to_string(),
            Ok(Err(join_error)) => format!("fetch task failed: {}", join_error),
            Err(_) => {
                fetch.abort();
                format!("fetch timed out after {} ms", job.timeout_ms)
            }
        };
        self.db.record_job_attempt(job_id, Some(&error))?;

        if attempt <= job.max_retries {
            let delay = backoff_delay(job.retry_backoff_ms, attempt);
            tracing::warn!(
                job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "fetch attempt failed; retry scheduled"
            );
            return Ok(JobOutcome::RetryAfter(delay));
        }

        let exhausted = AppError::ExternalTimeout(format!(
            "{} fetch attempts failed; last error: {}",
            attempt, error
        ));
        self.close(job_id, None, Some(&exhausted))?;
        tracing::warn!(job_id, error = %exhausted, "import job failed");
        Ok(JobOutcome::Failed)
    }

    /// Opens the ledger run here and processes on a blocking thread. If that
    /// thread dies, the run and the job are both failed.
    async fn ingest(&self, job: &ImportJob, payload: Vec<u8>) -> AppResult<JobOutcome> {
        let run = match ingest::begin(&self.db, job.source, &job.file_id, &payload) {
            Ok(run) => run,
            Err(error) => {
                self.close(&job.id, error.rejected_run_id(), Some(&error))?;
                tracing::warn!(job_id = %job.id, error = %error, "import job rejected");
                return Ok(JobOutcome::Failed);
            }
        };
        let run_id = run.id.clone();

        let (db, settings, source) = (self.db.clone(), self.settings.clone(), job.source);
        let processed = tokio::task::spawn_blocking(move || {
            ingest::process(&db, &settings, run, source, &payload, &SheetOptions::default()).map(|_| ())
        })
        .await
        .unwrap_or_else(|join_error| {
            let error = AppError::Internal(format!("import task failed: {}", join_error));
            let message = error.to_string();
            if let Err(complete_error) =
                self.db
                    .complete_import(&run_id, ImportStatus::Failed, Some(&message), &ImportCounters::default())
            {
                tracing::error!(run_id = %run_id, error = %complete_error, "failed to close import run");
            }
            Err(error)
        });

        match processed {
            Ok(()) => {
                self.db.mark_job_finished(&job.id, false, Some(&run_id), None)?;
                tracing::info!(job_id = %job.id, run_id = %run_id, "import job completed");
                Ok(JobOutcome::Completed)
            }
            Err(error) => {
                self.close(&job.id, Some(&run_id), Some(&error))?;
                tracing::warn!(job_id = %job.id, run_id = %run_id, error = %error, "import job failed");
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Fails the job and drops its fetcher.
    fn close(&self, job_id: &str, run_id: Option<&str>, error: Option<&AppError>) -> AppResult<()> {
        self.fetchers()?.remove(job_id);
        let message = error.map(ToString::to_string);
        self.db.mark_job_finished(job_id, true, run_id, message.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::{backoff_delay, FetchFuture, Fetcher, JobQueue};
    use crate::config::EngineSettings;
    use crate::db::test_support;
    use crate::errors::AppError;
    use crate::models::{ImportSource, ImportStatus, JobState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const PAYLOAD: &str = r#"{"facts": [{"branchCode": "B1", "metricCode": "visits", "date": "2025-03-03", "value": 5}]}"#;
    const WAIT: Duration = Duration::from_secs(5);

    fn queue(dir: &tempfile::TempDir) -> JobQueue {
        let mut settings = EngineSettings {
            reference: test_support::reference(),
            ..EngineSettings::default()
        };
        settings.imports.fetch_timeout_ms = 50;
        settings.imports.max_retries = 2;
        settings.imports.retry_backoff_ms = 1;
        let queue = JobQueue::new(Arc::new(test_support::database(dir)), Arc::new(settings));
        queue.start();
        queue
    }

    fn fixed(payload: &'static str) -> Fetcher {
        Arc::new(move || -> FetchFuture { Box::pin(async move { Ok::<_, AppError>(payload.as_bytes().to_vec()) }) })
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(100, 0), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn fetched_payload_is_imported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir);

        let job = queue
            .submit(ImportSource::BookingSync, "sync-1", 0, fixed(PAYLOAD))
            .await
            .expect("submit");
        let done = queue.wait(&job.id, WAIT).await.expect("wait");
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 1);

        let run_id = done.import_run_id.expect("run id");
        let run = queue.runner.db.get_import_run(&run_id).expect("get").expect("run");
        assert_eq!(run.status, ImportStatus::Success);
        assert_eq!(run.rows_written, 1);
    }

    #[tokio::test]
    async fn slow_fetch_fails_after_bounded_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let slow: Fetcher = Arc::new(move || -> FetchFuture {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, AppError>(Vec::new())
            })
        });

        let job = queue
            .submit(ImportSource::BookingSync, "sync-slow", 0, slow)
            .await
            .expect("submit");
        let done = queue.wait(&job.id, WAIT).await.expect("wait");
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(done.import_run_id.is_none());
        assert!(done
            .last_error
            .as_deref()
            .is_some_and(|error| error.starts_with("EXTERNAL_TIMEOUT")));
    }

    #[tokio::test]
    async fn flaky_fetch_recovers_on_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky: Fetcher = Arc::new(move || -> FetchFuture {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if call == 0 {
                    Err(AppError::Io("connection reset".to_string()))
                } else {
                    Ok(PAYLOAD.as_bytes().to_vec())
                }
            })
        });

        let job = queue
            .submit(ImportSource::BookingSync, "sync-flaky", 0, flaky)
            .await
            .expect("submit");
        let done = queue.wait(&job.id, WAIT).await.expect("wait");
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn duplicate_payload_job_links_rejected_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir);

        let first = queue
            .submit(ImportSource::BookingSync, "sync-a", 0, fixed(PAYLOAD))
            .await
            .expect("submit");
        queue.wait(&first.id, WAIT).await.expect("wait");
        let second = queue
            .submit(ImportSource::BookingSync, "sync-b", 0, fixed(PAYLOAD))
            .await
            .expect("submit");
        let done = queue.wait(&second.id, WAIT).await.expect("wait");

        assert_eq!(done.state, JobState::Failed);
        assert!(done
            .last_error
            .as_deref()
            .is_some_and(|error| error.starts_with("DUPLICATE_IMPORT")));
        let rejected = done.import_run_id.expect("rejected run");
        let run = queue.runner.db.get_import_run(&rejected).expect("get").expect("run");
        assert_eq!(run.status, ImportStatus::Failed);

        let missing = queue.status("nope").expect_err("missing");
        assert_eq!(missing.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn panicking_fetch_fails_the_job_and_frees_the_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir);
        let exploding: Fetcher = Arc::new(|| -> FetchFuture {
            Box::pin(async {
                let payload: Option<Vec<u8>> = None;
                Ok::<_, AppError>(payload.expect("fetch exploded"))
            })
        });

        let job = queue
            .submit(ImportSource::BookingSync, "sync-panic", 0, exploding)
            .await
            .expect("submit");
        let done = queue.wait(&job.id, WAIT).await.expect("wait");
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.attempts, 3);

        let next = queue
            .submit(ImportSource::BookingSync, "sync-after", 0, fixed(PAYLOAD))
            .await
            .expect("submit");
        let next = queue.wait(&next.id, WAIT).await.expect("wait");
        assert_eq!(next.state, JobState::Completed);
    }

    #[tokio::test]
    async fn out_of_range_booking_does_not_wedge_the_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir);
        const HUGE: &str = r#"{"bookings": [{"id": 1, "staffId": "S1", "branchCode": "B1",
            "datetime": "2025-03-03T09:00:00", "seanceLength": 9000000000000000, "attendance": 1}]}"#;

        let job = queue
            .submit(ImportSource::BookingSync, "sync-huge", 0, fixed(HUGE))
            .await
            .expect("submit");
        let done = queue.wait(&job.id, WAIT).await.expect("wait");
        assert_eq!(done.state, JobState::Completed);
        let run_id = done.import_run_id.expect("run id");
        let run = queue.runner.db.get_import_run(&run_id).expect("get").expect("run");
        assert_eq!(run.status, ImportStatus::Success);
        assert_eq!(run.rows_skipped, 1);

        let next = queue
            .submit(ImportSource::BookingSync, "sync-next", 0, fixed(PAYLOAD))
            .await
            .expect("submit");
        assert_eq!(queue.wait(&next.id, WAIT).await.expect("wait").state, JobState::Completed);
    }
}
