//! Job Manager: tracks long-running import/export/backup jobs in a
//! process-wide table. Grounded on `original_source/app/services/job_service.py`'s
//! status state machine; `DashMap` replaces its in-memory dict with a
//! thread-safe equivalent per the rest of this codebase's concurrency idiom.

use chrono::Utc;
use dashmap::DashMap;

use crate::error::{AidbError, AidbResult};
use crate::models::{Job, JobKind, JobStatus};

pub struct JobManager {
    jobs: DashMap<String, Job>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self { jobs: DashMap::new() }
    }

    pub fn create(&self, kind: JobKind, total: u64) -> Job {
        let mut job = Job::new(kind);
        job.total = total;
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    pub fn start(&self, job_id: &str) -> AidbResult<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Running;
        })
    }

    pub fn record_progress(&self, job_id: &str, processed_delta: u64, error: Option<String>) -> AidbResult<()> {
        self.update(job_id, |job| {
            job.processed += processed_delta;
            if let Some(error) = error {
                job.errors.push(error);
            }
        })
    }

    pub fn finish(&self, job_id: &str, output_uri: Option<String>) -> AidbResult<()> {
        self.update(job_id, |job| {
            job.status = if job.errors.is_empty() { JobStatus::Completed } else { JobStatus::CompletedWithErrors };
            job.ended_at = Some(Utc::now());
            job.output_uri = output_uri;
        })
    }

    pub fn fail(&self, job_id: &str, error: String) -> AidbResult<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.errors.push(error);
            job.ended_at = Some(Utc::now());
        })
    }

    /// Best-effort: only a job still `Running` (or `Pending`) can be
    /// cancelled; a job that already finished is left alone.
    pub fn cancel(&self, job_id: &str) -> AidbResult<bool> {
        let mut job = self.jobs.get_mut(job_id).ok_or_else(|| AidbError::JobNotFound(job_id.to_string()))?;
        if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            job.status = JobStatus::Cancelled;
            job.ended_at = Some(Utc::now());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn get_status(&self, job_id: &str) -> AidbResult<Job> {
        self.jobs.get(job_id).map(|j| j.clone()).ok_or_else(|| AidbError::JobNotFound(job_id.to_string()))
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut Job)) -> AidbResult<()> {
        let mut job = self.jobs.get_mut(job_id).ok_or_else(|| AidbError::JobNotFound(job_id.to_string()))?;
        f(&mut job);
        Ok(())
    }

    /// Removes jobs that finished (or were cancelled) more than
    /// `max_age_hours` ago. Running/Pending jobs are never swept.
    pub fn sweep(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let to_remove: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .ended_at
                    .map(|ended| ended < cutoff)
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in &to_remove {
            self.jobs.remove(id);
        }
        to_remove.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lifecycle_transitions_to_completed() {
        let manager = JobManager::new();
        let job = manager.create(JobKind::Import, 100);
        manager.start(&job.id).unwrap();
        manager.record_progress(&job.id, 100, None).unwrap();
        manager.finish(&job.id, Some("s3://bucket/out".into())).unwrap();
        let status = manager.get_status(&job.id).unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.processed, 100);
    }

    #[test]
    fn job_with_errors_completes_with_errors_status() {
        let manager = JobManager::new();
        let job = manager.create(JobKind::Export, 10);
        manager.start(&job.id).unwrap();
        manager.record_progress(&job.id, 5, Some("row 3 failed".into())).unwrap();
        manager.finish(&job.id, None).unwrap();
        let status = manager.get_status(&job.id).unwrap();
        assert_eq!(status.status, JobStatus::CompletedWithErrors);
    }

    #[test]
    fn cancel_only_affects_running_jobs() {
        let manager = JobManager::new();
        let job = manager.create(JobKind::Backup, 1);
        manager.start(&job.id).unwrap();
        manager.finish(&job.id, None).unwrap();
        let cancelled = manager.cancel(&job.id).unwrap();
        assert!(!cancelled);
    }

    #[test]
    fn sweep_removes_only_old_finished_jobs() {
        let manager = JobManager::new();
        let job = manager.create(JobKind::Import, 1);
        manager.start(&job.id).unwrap();
        manager.finish(&job.id, None).unwrap();
        manager.update(&job.id, |j| j.ended_at = Some(Utc::now() - chrono::Duration::hours(48))).unwrap();
        let removed = manager.sweep(24);
        assert_eq!(removed, 1);
        assert!(manager.get_status(&job.id).is_err());
    }
}
