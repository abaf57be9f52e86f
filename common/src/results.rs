use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobResult, JobStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Sólo presente si el job terminó bien
    pub result: Option<JobResult>,
    pub error: Option<String>,
}
