use common::{WorkerId, WorkerMetrics};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::{Duration, SystemTime},
};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::telemetry::{self, Telemetry};
use crate::worker::LocalWorker;

/// Conjunto de workers registrados en la sesión.
#[derive(Default)]
pub struct WorkerPool {
    workers: RwLock<Vec<Arc<LocalWorker>>>,
    rr_cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranca `n` workers locales con `concurrency` slots cada uno.
    pub fn spawn_local(n: usize, concurrency: u32) -> Self {
        let pool = Self::new();
        let host = telemetry::hostname();
        for _ in 0..n.max(1) {
            pool.add(Arc::new(LocalWorker::new(&host, concurrency)));
        }
        pool
    }

    pub fn add(&self, worker: Arc<LocalWorker>) {
        info!(
            "worker registrado: {} (max_concurrency={})",
            worker.id(),
            worker.max_concurrency()
        );
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
    }

    pub fn all(&self) -> Vec<Arc<LocalWorker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<LocalWorker>> {
        self.all().into_iter().find(|w| w.id() == id)
    }

    pub fn alive(&self) -> Vec<Arc<LocalWorker>> {
        self.all().into_iter().filter(|w| w.is_alive()).collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elige worker para una tarea:
    /// 1. el preferido (localidad) si está vivo y no se intentó ya ahí;
    /// 2. si no, el menos cargado entre los no intentados, en round-robin
    ///    para desempatar;
    /// 3. si todos se intentaron, cualquiera vivo.
    pub fn pick(&self, preferred: Option<&str>, exclude: &[WorkerId]) -> Option<Arc<LocalWorker>> {
        let alive = self.alive();
        if alive.is_empty() {
            return None;
        }

        if let Some(pref) = preferred {
            if !exclude.iter().any(|w| w == pref) {
                if let Some(w) = alive.iter().find(|w| w.id() == pref) {
                    return Some(Arc::clone(w));
                }
            }
        }

        let fresh: Vec<Arc<LocalWorker>> = alive
            .iter()
            .filter(|w| !exclude.iter().any(|x| x == w.id()))
            .cloned()
            .collect();
        let candidates = if fresh.is_empty() { alive } else { fresh };

        let min_load = candidates.iter().map(|w| w.active_tasks()).min()?;
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        (0..candidates.len())
            .map(|i| &candidates[(start + i) % candidates.len()])
            .find(|w| w.active_tasks() == min_load)
            .cloned()
    }

    pub fn metrics(&self) -> Vec<WorkerMetrics> {
        let now = SystemTime::now();
        self.all().iter().map(|w| w.metrics(now)).collect()
    }

    /// Una pasada de chequeo: marca como caídos los workers sin heartbeat
    /// hace más de `timeout`. Devuelve los recién marcados.
    pub fn sweep_dead(&self, timeout: Duration) -> Vec<WorkerId> {
        let now = SystemTime::now();
        let mut newly_dead = Vec::new();

        for w in self.alive() {
            // last_heartbeat en el futuro? raro, lo ignoramos.
            if let Ok(elapsed) = now.duration_since(w.last_heartbeat()) {
                if elapsed > timeout {
                    warn!(
                        "worker {} sin heartbeat hace {:?}, se da por caído",
                        w.id(),
                        elapsed
                    );
                    w.stop();
                    newly_dead.push(w.id().to_string());
                }
            }
        }

        newly_dead
    }
}

/// Loop de heartbeats de los workers locales, con CPU/MEM del host.
pub async fn run_heartbeats(pool: Arc<WorkerPool>, interval: Duration) {
    let telemetry = Telemetry::new();
    loop {
        let (cpu, mem) = telemetry.sample();
        for w in pool.alive() {
            w.heartbeat(Some(cpu), Some(mem));
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> WorkerPool {
        let pool = WorkerPool::new();
        for _ in 0..n {
            pool.add(Arc::new(LocalWorker::new("test", 1)));
        }
        pool
    }

    #[test]
    fn pick_prefiere_el_worker_local() {
        let pool = pool_of(3);
        let target = pool.all()[2].id().to_string();
        for _ in 0..5 {
            let w = pool.pick(Some(&target), &[]).unwrap();
            assert_eq!(w.id(), target);
        }
    }

    #[test]
    fn pick_evita_workers_ya_intentados() {
        let pool = pool_of(2);
        let ids: Vec<String> = pool.all().iter().map(|w| w.id().to_string()).collect();

        let w = pool.pick(Some(&ids[0]), &[ids[0].clone()]).unwrap();
        assert_eq!(w.id(), ids[1]);

        // si ya se intentó en todos, cualquiera vivo sirve
        assert!(pool.pick(None, &ids).is_some());
    }

    #[test]
    fn pick_ignora_workers_caidos() {
        let pool = pool_of(2);
        let all = pool.all();
        all[0].stop();
        for _ in 0..4 {
            assert_eq!(pool.pick(Some(all[0].id()), &[]).unwrap().id(), all[1].id());
        }
        all[1].stop();
        assert!(pool.pick(None, &[]).is_none());
    }

    #[test]
    fn pick_reparte_en_round_robin_con_carga_igual() {
        let pool = pool_of(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(pool.pick(None, &[]).unwrap().id().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn sweep_dead_marca_workers_sin_heartbeat() {
        let pool = pool_of(2);
        std::thread::sleep(Duration::from_millis(20));
        pool.all()[1].heartbeat(None, None);

        let dead = pool.sweep_dead(Duration::from_millis(10));
        assert_eq!(dead, vec![pool.all()[0].id().to_string()]);
        assert_eq!(pool.alive().len(), 1);
    }
}
