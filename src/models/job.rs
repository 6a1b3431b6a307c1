use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::VaultError;
use crate::models::artifact::{ArtifactReference, DurableRecord};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Submitting,
    Polling,
    /// Provider finished; migration of the result is in progress.
    Ready,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Idle, Submitting)
                | (Submitting, Polling)
                | (Submitting, Failed)
                | (Submitting, Cancelled)
                | (Polling, Ready)
                | (Polling, Failed)
                | (Polling, Cancelled)
                | (Ready, Completed)
                | (Ready, Cancelled)
        )
    }
}

/// Terminal result delivered to the controller's observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed {
        record: DurableRecord,
        /// Set when the artifact could not be migrated; `record` then wraps
        /// the ephemeral URI.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        migration_error: Option<String>,
    },
    Failed {
        error_detail: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub job_handle: Option<String>,
    pub status: JobStatus,
    pub result_reference: Option<ArtifactReference>,
    pub error_detail: Option<String>,
    pub attempts: u32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
}

impl GenerationJob {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            job_handle: None,
            status: JobStatus::Idle,
            result_reference: None,
            error_detail: None,
            attempts: 0,
            submitted_at: None,
            finished_at: None,
            outcome: None,
        }
    }

    /// Move to `next`, rejecting any transition the state machine forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), VaultError> {
        if !self.status.can_transition_to(next) {
            return Err(VaultError::Conflict(format!(
                "invalid job transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

impl Default for GenerationJob {
    fn default() -> Self {
        Self::new()
    }
}
