//! Turning fetched descriptions into structured job details.
//!
//! Pending postings go into one shared FIFO queue. A fixed number of workers
//! pull small batches from it until it is empty, so a worker stuck on slow
//! responses simply takes fewer batches. Every job is independent: it gets
//! its own transaction, and a failure is written to the failure log and left
//! for a later run.

pub mod llm;
pub mod normalize;
pub mod prompt;
pub mod salvage;

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db;
use crate::progress::Progress;
use llm::{Completion, LlmError};
use normalize::DetailError;
use salvage::SalvageError;

/// (site, posting id)
pub type Job = (String, i64);

pub struct WorkQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl WorkQueue {
    pub fn new(grouped: Vec<(String, Vec<i64>)>) -> Self {
        let jobs = grouped
            .into_iter()
            .flat_map(|(site, ids)| ids.into_iter().map(move |id| (site.clone(), id)))
            .collect();
        Self {
            jobs: Mutex::new(jobs),
        }
    }

    /// Take up to `n` jobs from the front. Empty once the queue is drained.
    pub fn next_batch(&self, n: usize) -> Vec<Job> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let take = n.max(1).min(jobs.len());
        jobs.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Single job ──

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("posting not found")]
    NotFound,
    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),
    #[error("JSON parse failed: {0}")]
    Parse(#[from] SalvageError),
    #[error("{0}")]
    Detail(#[from] DetailError),
    #[error("database error: {0:#}")]
    Db(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct JobFailure {
    pub error: JobError,
    /// Raw model output or extracted data, for the failure log.
    pub details: Option<String>,
}

impl From<JobError> for JobFailure {
    fn from(error: JobError) -> Self {
        JobFailure {
            error,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Structured,
    AlreadyStructured,
    NoDescription,
}

pub async fn process_job(
    conn: &mut Connection,
    llm: &dyn Completion,
    posting_id: i64,
    max_chars: usize,
) -> Result<JobOutcome, JobFailure> {
    let posting = db::load_posting(conn, posting_id)
        .map_err(JobError::Db)?
        .ok_or(JobError::NotFound)?;

    if normalize::detail_exists(conn, posting_id).map_err(|e| JobError::Db(e.into()))? {
        return Ok(JobOutcome::AlreadyStructured);
    }
    if !posting.has_description() {
        return Ok(JobOutcome::NoDescription);
    }

    let user = prompt::user_message(&posting, max_chars);
    let raw = llm
        .complete(prompt::SYSTEM, &user)
        .await
        .map_err(JobError::from)?;

    let data = salvage::salvage(&raw).map_err(|e| JobFailure {
        error: JobError::Parse(e),
        details: Some(format!("LLM response:\n{}", raw)),
    })?;

    match normalize::insert_detail(conn, posting_id, &data) {
        Ok(_) => Ok(JobOutcome::Structured),
        Err(DetailError::AlreadyExists(_)) => Ok(JobOutcome::AlreadyStructured),
        Err(e) => Err(JobFailure {
            error: JobError::Detail(e),
            details: Some(format!(
                "Extracted data:\n{}",
                serde_json::to_string_pretty(&data).unwrap_or_default()
            )),
        }),
    }
}

// ── Failure log ──

/// Append-only log of failed jobs; the file is created on the first failure.
pub struct FailureLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FailureLog {
    pub fn new(dir: &Path) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        Self {
            path: dir.join(format!("llm_errors_{}.log", stamp)),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, worker: usize, job: &Job, failure: &JobFailure) {
        let mut entry = format!(
            "\n{rule}\nWorker {worker} | Posting {id} | Site {site}\nError: {err}\n",
            rule = "=".repeat(100),
            id = job.1,
            site = job.0,
            err = failure.error,
        );
        if let Some(details) = &failure.details {
            entry.push_str(&format!("\n{}\nDETAILS:\n{}\n", "-".repeat(100), details));
        }
        entry.push_str(&format!("{}\n", "=".repeat(100)));

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.append(&mut guard, &entry) {
            warn!("Cannot write failure log {}: {}", self.path.display(), e);
        }
    }

    pub fn written(&self) -> bool {
        self.file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn append(&self, file: &mut Option<File>, entry: &str) -> std::io::Result<()> {
        if file.is_none() {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        match file.as_mut() {
            Some(f) => f.write_all(entry.as_bytes()),
            None => Ok(()),
        }
    }
}

// ── Orchestration ──

#[derive(Debug, Clone)]
pub struct StructureOptions {
    pub workers: usize,
    pub batch_size: usize,
    pub per_site_limit: Option<usize>,
    pub max_chars: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Site of the job most recently taken.
    pub site: Option<String>,
    pub structured: usize,
    pub skipped_existing: usize,
    pub skipped_missing: usize,
    pub failed: usize,
}

impl WorkerStats {
    pub fn done(&self) -> usize {
        self.structured + self.skipped_existing + self.skipped_missing + self.failed
    }
}

#[derive(Debug)]
pub struct StructureSummary {
    pub total: usize,
    pub structured: usize,
    pub skipped_existing: usize,
    pub skipped_missing: usize,
    pub failed: usize,
    pub per_site: Vec<(String, usize)>,
    pub per_worker: Vec<WorkerStats>,
    pub log_path: Option<PathBuf>,
}

pub async fn run(
    db_path: &Path,
    llm: Arc<dyn Completion>,
    opts: &StructureOptions,
    log_dir: &Path,
    pb: ProgressBar,
) -> Result<StructureSummary> {
    let grouped = {
        let conn = db::connect(db_path)?;
        db::unstructured_by_site(&conn, opts.per_site_limit)?
    };
    let per_site: Vec<(String, usize)> = grouped
        .iter()
        .map(|(site, ids)| (site.clone(), ids.len()))
        .collect();
    let workers = opts.workers.max(1);

    let queue = Arc::new(WorkQueue::new(grouped));
    let total = queue.len();
    let progress = Arc::new(Progress::new(vec![WorkerStats::default(); workers]));
    let log = Arc::new(FailureLog::new(log_dir));
    pb.set_length(total as u64);

    if total > 0 {
        info!(total, workers, batch = opts.batch_size, "Structuring postings");
    }

    let mut set = tokio::task::JoinSet::new();
    for worker in 0..workers {
        let queue = Arc::clone(&queue);
        let progress = Arc::clone(&progress);
        let log = Arc::clone(&log);
        let llm = Arc::clone(&llm);
        let db_path = db_path.to_path_buf();
        let pb = pb.clone();
        let opts = opts.clone();

        set.spawn(async move {
            let mut conn = db::connect(&db_path)
                .with_context(|| format!("worker {} cannot open database", worker))?;

            loop {
                let batch = queue.next_batch(opts.batch_size);
                if batch.is_empty() {
                    break;
                }
                debug!(worker, jobs = batch.len(), "took batch");

                for job in batch {
                    progress.update(worker, |s| s.site = Some(job.0.clone()));
                    let result = process_job(&mut conn, llm.as_ref(), job.1, opts.max_chars).await;
                    match &result {
                        Ok(outcome) => debug!(worker, posting = job.1, ?outcome, "job done"),
                        Err(f) => {
                            warn!(worker, posting = job.1, site = %job.0, "Job failed: {}", f.error);
                            log.record(worker, &job, f);
                        }
                    }
                    progress.update(worker, |s| match result {
                        Ok(JobOutcome::Structured) => s.structured += 1,
                        Ok(JobOutcome::AlreadyStructured) => s.skipped_existing += 1,
                        Ok(JobOutcome::NoDescription) => s.skipped_missing += 1,
                        Err(_) => s.failed += 1,
                    });
                    pb.inc(1);
                }
            }
            anyhow::Ok(())
        });
    }

    while let Some(res) = set.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{:#}", e),
            Err(e) => warn!("Worker task failed: {}", e),
        }
    }
    pb.finish_and_clear();

    let per_worker = progress.snapshot();
    let sum = |f: fn(&WorkerStats) -> usize| per_worker.iter().map(f).sum::<usize>();
    Ok(StructureSummary {
        total,
        structured: sum(|s| s.structured),
        skipped_existing: sum(|s| s.skipped_existing),
        skipped_missing: sum(|s| s.skipped_missing),
        failed: sum(|s| s.failed),
        per_site,
        log_path: log.written().then(|| log.path().to_path_buf()),
        per_worker,
    })
}
