//! Bulk cleanup of old submissions.

use cohort_core::error::{AppError, Result};
use cohort_core::traits::{CycleRepo, SubmissionRepo};
use cohort_core::CycleId;
use serde::Serialize;
use tracing::{info, instrument};

use crate::Ports;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Oldest cycle whose submissions were kept.
    pub kept_from: Option<CycleId>,
    pub deleted: u64,
}

#[derive(Clone)]
pub struct RetentionService {
    ports: Ports,
}

impl RetentionService {
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Deletes submissions of every cycle older than the newest
    /// `keep_cycles` cycles.
    #[instrument(skip(self))]
    pub async fn purge_submissions(&self, keep_cycles: usize) -> Result<PurgeReport> {
        if keep_cycles == 0 {
            return Err(AppError::ValidationError("keep_cycles must be at least 1".into()));
        }
        let ids = self.ports.store.list_cycle_ids().await?;
        let Some(&cutoff) = ids.get(keep_cycles - 1) else {
            return Ok(PurgeReport { kept_from: ids.last().copied(), deleted: 0 });
        };

        let deleted = self.ports.store.delete_submissions_before(cutoff).await?;
        if deleted > 0 {
            info!(%cutoff, deleted, "purged old submissions");
        }
        Ok(PurgeReport { kept_from: Some(cutoff), deleted })
    }
}
