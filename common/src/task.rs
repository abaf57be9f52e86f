use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::worker::WorkerId;

pub type TaskId = String;

/// Ejecución de una partición de un job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub partition: u32,
    pub attempt: u32,

    /// Workers donde ya se intentó (para reintentar en otro)
    pub tried: Vec<WorkerId>,
}

impl Task {
    pub fn new(job_id: &str, partition: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            partition,
            attempt: 0,
            tried: Vec::new(),
        }
    }

    /// Siguiente intento tras fallar en `worker_id`, si quedan intentos.
    pub fn retry(&self, worker_id: &str, max_attempts: u32) -> Option<Task> {
        if self.attempt + 1 >= max_attempts {
            return None;
        }
        let mut next = self.clone();
        next.attempt += 1;
        if !next.tried.iter().any(|w| w == worker_id) {
            next.tried.push(worker_id.to_string());
        }
        Some(next)
    }
}
