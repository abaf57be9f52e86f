use std::{env, str::FromStr, time::Duration};

use crate::persist::PersistConfig;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
pub const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 3;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_MAX_RETAINED_JOBS: usize = 1000;

/// Lee una variable de entorno; si falta o no parsea, usa el default.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Configuración de una sesión del motor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dirección donde escucha la API HTTP del master
    pub bind_addr: String,
    /// Cantidad de workers locales
    pub workers: usize,
    /// Slots de ejecución por worker
    pub worker_concurrency: u32,
    /// Intentos por partición antes de dar el job por fallido
    pub max_task_attempts: u32,
    pub heartbeat_timeout: Duration,
    /// Jobs terminados que se conservan para consulta; los más viejos se
    /// olvidan primero
    pub max_retained_jobs: usize,
    pub persist: PersistConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            workers: DEFAULT_WORKERS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            max_retained_jobs: DEFAULT_MAX_RETAINED_JOBS,
            persist: PersistConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuración a partir de variables de entorno:
    /// MASTER_BIND, FLOW_WORKERS, WORKER_CONCURRENCY, MAX_TASK_ATTEMPTS,
    /// HEARTBEAT_TIMEOUT_SECS, MAX_RETAINED_JOBS, PERSIST_DIR, PERSIST_MEMORY_BYTES,
    /// PERSIST_DISK_BYTES, PERSIST_MAX_PARTITION_BYTES.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_or("MASTER_BIND", d.bind_addr),
            workers: env_or("FLOW_WORKERS", d.workers).max(1),
            worker_concurrency: env_or("WORKER_CONCURRENCY", d.worker_concurrency).max(1),
            max_task_attempts: env_or("MAX_TASK_ATTEMPTS", d.max_task_attempts).max(1),
            heartbeat_timeout: Duration::from_secs(env_or(
                "HEARTBEAT_TIMEOUT_SECS",
                d.heartbeat_timeout.as_secs(),
            )),
            max_retained_jobs: env_or("MAX_RETAINED_JOBS", d.max_retained_jobs).max(1),
            persist: PersistConfig {
                dir: env_or("PERSIST_DIR", d.persist.dir),
                memory_capacity: env_or("PERSIST_MEMORY_BYTES", d.persist.memory_capacity),
                disk_capacity: env_or("PERSIST_DISK_BYTES", d.persist.disk_capacity),
                max_partition_bytes: env_or(
                    "PERSIST_MAX_PARTITION_BYTES",
                    d.persist.max_partition_bytes,
                ),
            },
        }
    }

    /// true si el presupuesto de memoria vino explícito por entorno.
    pub fn memory_budget_from_env() -> bool {
        env::var("PERSIST_MEMORY_BYTES").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_respeta_env_var_y_default() {
        env::set_var("FLOWLITE_TEST_WORKERS", "7");
        assert_eq!(env_or("FLOWLITE_TEST_WORKERS", 1usize), 7);
        env::set_var("FLOWLITE_TEST_WORKERS", "no-numero");
        assert_eq!(env_or("FLOWLITE_TEST_WORKERS", 1usize), 1);
        env::remove_var("FLOWLITE_TEST_WORKERS");
        assert_eq!(env_or("FLOWLITE_TEST_WORKERS", 3usize), 3);
    }

    #[test]
    fn from_env_aplica_minimos() {
        env::set_var("MAX_TASK_ATTEMPTS", "0");
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.max_task_attempts, 1);
        env::remove_var("MAX_TASK_ATTEMPTS");
        assert!(cfg.workers >= 1);
    }
}
