use common::{
    execute_partition, CancelToken, EngineError, EngineResult, FlowGraph, FnRegistry, Partition,
    PartitionOutput, Task, WorkerId, WorkerMetrics,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Instant, SystemTime},
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct WorkerStats {
    last_heartbeat: SystemTime,

    // Métricas
    tasks_started: u64,
    tasks_succeeded: u64,
    tasks_failed: u64,
    total_task_time_ms: u64,

    last_cpu_percent: Option<f32>,
    last_mem_bytes: Option<u64>,
}

/// Worker en proceso: ejecuta particiones en hilos de bloqueo, con un
/// máximo de `max_concurrency` a la vez.
pub struct LocalWorker {
    id: WorkerId,
    hostname: String,
    max_concurrency: u32,
    slots: Arc<Semaphore>,
    alive: AtomicBool,
    stats: Mutex<WorkerStats>,
}

impl LocalWorker {
    pub fn new(hostname: &str, max_concurrency: u32) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hostname: hostname.to_string(),
            max_concurrency,
            slots: Arc::new(Semaphore::new(max_concurrency as usize)),
            alive: AtomicBool::new(true),
            stats: Mutex::new(WorkerStats {
                last_heartbeat: SystemTime::now(),
                tasks_started: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                total_task_time_ms: 0,
                last_cpu_percent: None,
                last_mem_bytes: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    fn stats(&self) -> MutexGuard<'_, WorkerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Marca el worker como caído: no recibe tareas nuevas y lo que termine
    /// mientras tanto se descarta.
    pub fn stop(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!("worker {} marcado como DEAD", self.id);
        }
    }

    pub fn revive(&self) {
        if !self.alive.swap(true, Ordering::SeqCst) {
            info!("worker {} vuelve a estar disponible", self.id);
            self.heartbeat(None, None);
        }
    }

    pub fn heartbeat(&self, cpu_percent: Option<f32>, mem_bytes: Option<u64>) {
        let mut stats = self.stats();
        stats.last_heartbeat = SystemTime::now();
        if cpu_percent.is_some() {
            stats.last_cpu_percent = cpu_percent;
        }
        if mem_bytes.is_some() {
            stats.last_mem_bytes = mem_bytes;
        }
    }

    pub fn last_heartbeat(&self) -> SystemTime {
        self.stats().last_heartbeat
    }

    /// Tareas en vuelo (slots ocupados).
    pub fn active_tasks(&self) -> u32 {
        self.max_concurrency
            .saturating_sub(self.slots.available_permits() as u32)
    }

    /// Ejecuta una partición. Espera un slot libre, corre el ejecutor en un
    /// hilo de bloqueo y actualiza las métricas.
    pub async fn execute(
        &self,
        task: &Task,
        graph: Arc<FlowGraph>,
        partition: Partition,
        registry: Arc<FnRegistry>,
        cancel: CancelToken,
    ) -> EngineResult<PartitionOutput> {
        let pid = partition.id;

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::partition_failed(pid, "semáforo del worker cerrado"))?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !self.is_alive() {
            return Err(EngineError::partition_failed(
                pid,
                format!("worker {} caído", self.id),
            ));
        }

        self.stats().tasks_started += 1;
        debug!(
            "worker {} ejecuta partición {} del job {} (attempt={})",
            self.id, pid, task.job_id, task.attempt
        );

        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            execute_partition(&graph, &partition, &registry, &cancel)
        });
        let mut result = match handle.await {
            Ok(res) => res,
            Err(e) => Err(EngineError::partition_failed(
                pid,
                format!("panic o join error: {e}"),
            )),
        };
        drop(permit);

        if result.is_ok() && !self.is_alive() {
            result = Err(EngineError::partition_failed(
                pid,
                format!("worker {} cayó durante la ejecución", self.id),
            ));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats();
            stats.total_task_time_ms += duration_ms;
            match &result {
                Ok(_) => stats.tasks_succeeded += 1,
                Err(EngineError::Cancelled) => {}
                Err(_) => stats.tasks_failed += 1,
            }
        }

        match &result {
            Ok(_) => debug!(
                "worker {} terminó partición {} en {} ms",
                self.id, pid, duration_ms
            ),
            Err(EngineError::Cancelled) => {
                debug!("worker {} descartó partición {} (cancelada)", self.id, pid)
            }
            Err(e) => warn!("worker {} falló en partición {}: {}", self.id, pid, e),
        }

        result
    }

    pub fn metrics(&self, now: SystemTime) -> WorkerMetrics {
        let stats = self.stats().clone();
        let age_secs = now
            .duration_since(stats.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let avg_ms = if stats.tasks_succeeded > 0 {
            Some(stats.total_task_time_ms as f64 / stats.tasks_succeeded as f64)
        } else {
            None
        };

        WorkerMetrics {
            worker_id: self.id.clone(),
            hostname: self.hostname.clone(),
            dead: !self.is_alive(),
            max_concurrency: self.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_tasks: self.active_tasks(),
            tasks_started: stats.tasks_started,
            tasks_succeeded: stats.tasks_succeeded,
            tasks_failed: stats.tasks_failed,
            avg_task_ms: avg_ms,
            cpu_percent: stats.last_cpu_percent,
            mem_bytes: stats.last_mem_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{source::from_records, Accumulator};
    use serde_json::json;

    fn setup() -> (Arc<FlowGraph>, Partition, Arc<FnRegistry>) {
        let graph = Arc::new(FlowGraph::new().count().unwrap());
        let part = from_records((0..5).map(|i| json!(i)).collect(), 1).remove(0);
        (graph, part, Arc::new(FnRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn execute_cuenta_y_actualiza_metricas() {
        let w = LocalWorker::new("host", 2);
        let (graph, part, reg) = setup();
        let task = Task::new("job", part.id);

        let out = w
            .execute(&task, graph, part, reg, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out, PartitionOutput::Accumulator(Accumulator::Count { n: 5 }));

        let m = w.metrics(SystemTime::now());
        assert_eq!(m.tasks_started, 1);
        assert_eq!(m.tasks_succeeded, 1);
        assert_eq!(m.active_tasks, 0);
        assert!(!m.dead);
    }

    #[tokio::test]
    async fn worker_caido_rechaza_tareas() {
        let w = LocalWorker::new("host", 1);
        w.stop();
        let (graph, part, reg) = setup();
        let task = Task::new("job", part.id);

        let err = w
            .execute(&task, graph, part, reg, CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(w.metrics(SystemTime::now()).dead);

        w.revive();
        assert!(w.is_alive());
    }

    #[tokio::test]
    async fn tarea_cancelada_no_cuenta_como_fallo() {
        let w = LocalWorker::new("host", 1);
        let (graph, part, reg) = setup();
        let task = Task::new("job", part.id);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = w.execute(&task, graph, part, reg, cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(w.metrics(SystemTime::now()).tasks_failed, 0);
    }
}
