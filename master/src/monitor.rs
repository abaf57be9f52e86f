use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, info};
use worker::WorkerPool;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Loop de tolerancia a fallos: marca como caídos los workers sin heartbeat.
/// Sus tareas en vuelo fallan al terminar y el controlador las reintenta en
/// otro worker.
pub async fn monitor_workers(pool: Arc<WorkerPool>, timeout: Duration) {
    loop {
        sleep(SWEEP_INTERVAL).await;
        sweep_once(&pool, timeout);
    }
}

/// Una pasada de chequeo. Devuelve cuántos workers se marcaron.
pub fn sweep_once(pool: &WorkerPool, timeout: Duration) -> usize {
    let dead = pool.sweep_dead(timeout);
    if dead.is_empty() {
        debug!("monitor: {} workers vivos", pool.alive().len());
    } else {
        info!(
            "monitor: {} workers marcados como muertos, quedan {} vivos",
            dead.len(),
            pool.alive().len()
        );
    }
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker::LocalWorker;

    #[test]
    fn sweep_once_cuenta_los_workers_caidos() {
        let pool = WorkerPool::new();
        pool.add(Arc::new(LocalWorker::new("a", 1)));
        pool.add(Arc::new(LocalWorker::new("b", 1)));

        assert_eq!(sweep_once(&pool, Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(sweep_once(&pool, Duration::from_millis(5)), 2);
        assert!(pool.alive().is_empty());
    }
}
