//! Job watchdog.
//!
//! Every job gets one named deadline, `ks-timeout-{jobId}`, armed when the
//! job is created. If the deadline fires while the job is still `waiting` or
//! `processing`, the job becomes `timeout`. Any terminal write disarms it.
//!
//! Deadlines live in the supervisor, not in the agents that asked for them,
//! so a stuck or restarted dispatcher cannot leave a job non-terminal
//! forever. [`TimeoutSupervisor::restore`] re-arms deadlines for jobs that
//! were still open when the process went away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::job::{JobId, JobPatch, JobRecord, JobStatus};
use crate::store::JobStore;

/// Prefix shared by every deadline name.
pub const DEADLINE_PREFIX: &str = "ks-timeout-";

pub fn deadline_name(job_id: JobId) -> String {
    format!("{DEADLINE_PREFIX}{job_id}")
}

/// Recover the job id from a deadline name. `None` for foreign names.
pub fn job_id_from_deadline(name: &str) -> Option<JobId> {
    name.strip_prefix(DEADLINE_PREFIX)?.parse().ok()
}

struct Deadline {
    generation: u64,
    handle: AbortHandle,
}

/// Owns the per-job deadlines.
pub struct TimeoutSupervisor<S> {
    store: Arc<S>,
    deadlines: Arc<Mutex<HashMap<String, Deadline>>>,
    generation: Arc<AtomicU64>,
}

impl<S> Clone for TimeoutSupervisor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            deadlines: self.deadlines.clone(),
            generation: self.generation.clone(),
        }
    }
}

impl<S: JobStore + 'static> TimeoutSupervisor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            deadlines: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedule the deadline for `job_id`, replacing any existing one.
    pub async fn arm(&self, job_id: JobId, delay: Duration) {
        let name = deadline_name(job_id);

        // Held across spawn and insert so a fast-firing task always finds
        // its own entry.
        let mut deadlines = self.deadlines.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let supervisor = self.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.fire(task_name, generation).await;
        });

        let replaced = deadlines.insert(
            name,
            Deadline {
                generation,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            previous.handle.abort();
            debug!(job_id = %job_id, "watchdog re-armed");
        } else {
            debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "watchdog armed");
        }
    }

    /// Cancel the deadline for `job_id`. A no-op if none is armed.
    pub async fn disarm(&self, job_id: JobId) {
        let removed = self.deadlines.lock().await.remove(&deadline_name(job_id));
        if let Some(deadline) = removed {
            deadline.handle.abort();
            debug!(job_id = %job_id, "watchdog disarmed");
        }
    }

    pub async fn is_armed(&self, job_id: JobId) -> bool {
        self.deadlines
            .lock()
            .await
            .contains_key(&deadline_name(job_id))
    }

    pub async fn armed_count(&self) -> usize {
        self.deadlines.lock().await.len()
    }

    /// Handle a fired deadline by name.
    ///
    /// Returns `true` if the job was moved to `timeout`. Names without the
    /// deadline prefix, unknown jobs and terminal jobs are left alone.
    pub async fn on_deadline(&self, name: &str) -> Result<bool, StoreError> {
        if let Some(deadline) = self.deadlines.lock().await.remove(name) {
            deadline.handle.abort();
        }
        self.expire(name).await
    }

    /// Re-arm deadlines for every non-terminal job in the store.
    ///
    /// The remaining delay counts from each job's `created_at`, so a job
    /// already past its deadline expires right away.
    pub async fn restore(&self, delay: Duration) -> Result<usize, StoreError> {
        let open: Vec<JobRecord> = self
            .store
            .list_recent(None)
            .await?
            .into_iter()
            .filter(|record| !record.is_terminal())
            .collect();

        for record in &open {
            let age = (Utc::now() - record.created_at)
                .to_std()
                .unwrap_or_default();
            self.arm(record.job_id, delay.saturating_sub(age)).await;
        }

        if !open.is_empty() {
            info!(count = open.len(), "watchdog restored open jobs");
        }
        Ok(open.len())
    }

    async fn fire(&self, name: String, generation: u64) {
        {
            let mut deadlines = self.deadlines.lock().await;
            match deadlines.get(&name) {
                Some(current) if current.generation == generation => {
                    deadlines.remove(&name);
                }
                // Superseded by a re-arm or already disarmed
                _ => return,
            }
        }

        if let Err(e) = self.expire(&name).await {
            warn!(deadline = %name, error = %e, "watchdog failed to expire job");
        }
    }

    async fn expire(&self, name: &str) -> Result<bool, StoreError> {
        let Some(job_id) = job_id_from_deadline(name) else {
            debug!(deadline = %name, "ignoring foreign deadline");
            return Ok(false);
        };

        let still_open = |record: &JobRecord| !record.is_terminal();
        match self
            .store
            .update_if(job_id, &still_open, JobPatch::status(JobStatus::Timeout))
            .await
        {
            Ok(Some(_)) => {
                info!(job_id = %job_id, "job timed out");
                Ok(true)
            }
            Ok(None) => {
                debug!(job_id = %job_id, "deadline fired for finished job");
                Ok(false)
            }
            Err(StoreError::NotFound(_)) => {
                debug!(job_id = %job_id, "deadline fired for unknown job");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;

    async fn setup() -> (Arc<MemoryJobStore>, TimeoutSupervisor<MemoryJobStore>, JobId) {
        let store = Arc::new(MemoryJobStore::new());
        let record = JobRecord::new("Topic", 1);
        let job_id = record.job_id;
        store.insert(record).await.unwrap();
        (store.clone(), TimeoutSupervisor::new(store), job_id)
    }

    async fn status(store: &MemoryJobStore, job_id: JobId) -> JobStatus {
        store.get(job_id).await.unwrap().unwrap().status
    }

    #[test]
    fn test_deadline_names() {
        let id = uuid::Uuid::new_v4();
        let name = deadline_name(id);
        assert_eq!(name, format!("ks-timeout-{}", id));
        assert_eq!(job_id_from_deadline(&name), Some(id));
        assert_eq!(job_id_from_deadline("other-alarm"), None);
        assert_eq!(job_id_from_deadline("ks-timeout-garbage"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_for_stuck_job() {
        let (store, supervisor, job_id) = setup().await;
        store
            .update(job_id, JobPatch::status(JobStatus::Processing))
            .await
            .unwrap();

        supervisor.arm(job_id, Duration::from_secs(30)).await;
        assert!(supervisor.is_armed(job_id).await);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(status(&store, job_id).await, JobStatus::Processing);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(status(&store, job_id).await, JobStatus::Timeout);
        assert!(!supervisor.is_armed(job_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_timeout() {
        let (store, supervisor, job_id) = setup().await;

        supervisor.arm(job_id, Duration::from_secs(30)).await;
        supervisor.disarm(job_id).await;
        assert_eq!(supervisor.armed_count().await, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(status(&store, job_id).await, JobStatus::Waiting);

        // Disarming twice is harmless
        supervisor.disarm(job_id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_job_untouched() {
        let (store, supervisor, job_id) = setup().await;
        store
            .update(job_id, JobPatch::status(JobStatus::Ok))
            .await
            .unwrap();

        supervisor.arm(job_id, Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(status(&store, job_id).await, JobStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let (store, supervisor, job_id) = setup().await;

        supervisor.arm(job_id, Duration::from_secs(10)).await;
        supervisor.arm(job_id, Duration::from_secs(30)).await;
        assert_eq!(supervisor.armed_count().await, 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(status(&store, job_id).await, JobStatus::Waiting);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(status(&store, job_id).await, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_on_deadline_by_name() {
        let (store, supervisor, job_id) = setup().await;

        assert!(supervisor.on_deadline(&deadline_name(job_id)).await.unwrap());
        assert_eq!(status(&store, job_id).await, JobStatus::Timeout);

        // Already terminal
        assert!(!supervisor.on_deadline(&deadline_name(job_id)).await.unwrap());
        // Foreign name and unknown job
        assert!(!supervisor.on_deadline("refresh-cache").await.unwrap());
        assert!(!supervisor
            .on_deadline(&deadline_name(uuid::Uuid::new_v4()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_timeout_keeps_raw() {
        let (store, supervisor, job_id) = setup().await;
        store
            .update(job_id, JobPatch::status(JobStatus::Processing).with_raw("partial text"))
            .await
            .unwrap();

        supervisor.on_deadline(&deadline_name(job_id)).await.unwrap();

        let record = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Timeout);
        assert_eq!(record.raw.as_deref(), Some("partial text"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rearms_open_jobs() {
        let store = Arc::new(MemoryJobStore::new());

        let mut stale = JobRecord::new("stale", 1);
        stale.created_at = Utc::now() - chrono::Duration::seconds(120);
        let stale_id = stale.job_id;
        store.insert(stale).await.unwrap();

        let fresh = JobRecord::new("fresh", 1);
        let fresh_id = fresh.job_id;
        store.insert(fresh).await.unwrap();

        let mut done = JobRecord::new("done", 1);
        done.status = JobStatus::Ok;
        store.insert(done).await.unwrap();

        let supervisor = TimeoutSupervisor::new(store.clone());
        let restored = supervisor.restore(Duration::from_secs(30)).await.unwrap();
        assert_eq!(restored, 2);

        // The stale job is already past its deadline
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status(&store, stale_id).await, JobStatus::Timeout);
        assert_eq!(status(&store, fresh_id).await, JobStatus::Waiting);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(status(&store, fresh_id).await, JobStatus::Timeout);
    }
}
