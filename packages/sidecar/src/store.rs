//! Job persistence.
//!
//! [`JobStore`] is the single source of truth for job state. Every write is a
//! [`JobPatch`] merged under the record's own lock, so two writers racing on
//! one job (the watchdog and a raw response) each see a consistent record.
//!
//! Storage technology is up to the implementer; [`MemoryJobStore`] keeps
//! everything in a [`DashMap`] and is what the agents and tests run on.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::job::{JobId, JobPatch, JobRecord};

/// Precondition checked against the current record before a conditional
/// update is applied.
pub type Precondition<'a> = &'a (dyn Fn(&JobRecord) -> bool + Send + Sync);

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails if the id is already taken.
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Point lookup by id.
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Merge `patch` unconditionally (last-write-wins), returning the result.
    ///
    /// Rejects patches that would move the job backward in its lifecycle.
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<JobRecord, StoreError>;

    /// Merge `patch` only if `precondition` holds for the current record.
    ///
    /// Returns `Ok(None)` when the precondition fails; nothing is written.
    /// The check and the write happen under the same lock.
    async fn update_if(
        &self,
        job_id: JobId,
        precondition: Precondition<'_>,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Records ordered by creation time, newest first.
    async fn list_recent(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StoreError>;

    /// Bulk clear. Returns the number of records removed.
    async fn clear(&self) -> Result<usize, StoreError>;
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: DashMap<JobId, JobRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn merge(
        &self,
        job_id: JobId,
        precondition: Option<Precondition<'_>>,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut entry = self
            .records
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;

        if let Some(check) = precondition {
            if !check(entry.value()) {
                return Ok(None);
            }
        }

        if let Some(next) = patch.status {
            if !entry.status.can_become(next) {
                return Err(StoreError::InvalidTransition {
                    job_id,
                    from: entry.status,
                    to: next,
                });
            }
        }

        entry.apply(patch);
        Ok(Some(entry.value().clone()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(record.job_id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(record.job_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.get(&job_id).map(|r| r.value().clone()))
    }

    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<JobRecord, StoreError> {
        self.merge(job_id, None, patch)?
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn update_if(
        &self,
        job_id: JobId,
        precondition: Precondition<'_>,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.merge(job_id, Some(precondition), patch)
    }

    async fn list_recent(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<JobRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.records.len();
        self.records.clear();
        Ok(removed)
    }
}
