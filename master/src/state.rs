// master/src/state.rs

use chrono::Utc;
use common::{CancelToken, EngineError, JobInfo, JobResult, JobStatus};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Estado mutable de un job.
#[derive(Debug)]
pub struct JobState {
    pub info: JobInfo,
    pub result: Option<JobResult>,
    pub error: Option<EngineError>,
}

/// Lo que comparten el controlador, la tarea que ejecuta el job y quien
/// espera su resultado.
pub struct JobShared {
    state: Mutex<JobState>,
    status_tx: watch::Sender<JobStatus>,
    pub cancel: CancelToken,
}

impl JobShared {
    pub fn new(info: JobInfo) -> Self {
        let (status_tx, _) = watch::channel(info.status);
        Self {
            state: Mutex::new(JobState {
                info,
                result: None,
                error: None,
            }),
            status_tx,
            cancel: CancelToken::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> JobInfo {
        self.lock().info.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.lock().info.status
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    pub fn mark_running(&self) {
        let mut st = self.lock();
        if st.info.status == JobStatus::Submitted {
            st.info.status = JobStatus::Running;
            st.info.started_at = Some(Utc::now());
            self.status_tx.send_replace(JobStatus::Running);
        }
    }

    pub fn task_completed(&self) {
        self.lock().info.completed_tasks += 1;
    }

    pub fn task_retried(&self) {
        self.lock().info.retries += 1;
    }

    pub fn task_failed(&self) {
        self.lock().info.failed_tasks += 1;
    }

    /// Cierra el job con su resultado. Si ya estaba en un estado terminal
    /// (p.ej. cancelado mientras tanto) no cambia nada y devuelve false.
    pub fn finish(&self, outcome: Result<JobResult, EngineError>) -> bool {
        let mut st = self.lock();
        if st.info.status.is_terminal() {
            return false;
        }
        let status = match outcome {
            Ok(result) => {
                st.info.persisted = result.persisted.clone();
                st.result = Some(result);
                JobStatus::Completed
            }
            Err(EngineError::Cancelled) => JobStatus::Cancelled,
            Err(e) => {
                st.info.error = Some(e.to_string());
                st.error = Some(e);
                JobStatus::Failed
            }
        };
        st.info.status = status;
        st.info.finished_at = Some(Utc::now());
        self.status_tx.send_replace(status);
        true
    }

    /// Cancela el job si todavía no terminó.
    pub fn cancel(&self) -> bool {
        let mut st = self.lock();
        if st.info.status.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        st.info.status = JobStatus::Cancelled;
        st.info.finished_at = Some(Utc::now());
        self.status_tx.send_replace(JobStatus::Cancelled);
        true
    }
}
