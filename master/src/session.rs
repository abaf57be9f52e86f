use std::sync::Arc;

use common::{
    source, EngineConfig, EngineResult, FnRegistry, Partition, PersistHandle, PersistStore,
    PersistedInfo, SourceSpec, StorageTier, WorkerMetrics,
};
use common::source::{RecordFormat, SourceOptions};
use tracing::info;
use worker::WorkerPool;

/// Sesión del cluster: workers, funciones registradas, almacenamiento
/// persistido y configuración. Se pasa explícitamente al controlador.
pub struct Session {
    config: EngineConfig,
    pool: Arc<WorkerPool>,
    registry: Arc<FnRegistry>,
    store: Arc<PersistStore>,
}

impl Session {
    /// Sesión con `config.workers` workers locales.
    pub fn new(config: EngineConfig, registry: FnRegistry) -> Self {
        let pool = WorkerPool::spawn_local(config.workers, config.worker_concurrency);
        Self::with_pool(config, pool, registry)
    }

    pub fn with_pool(config: EngineConfig, pool: WorkerPool, registry: FnRegistry) -> Self {
        let store = PersistStore::new(config.persist.clone());
        info!(
            "sesión creada: {} workers, persist_dir={}",
            pool.len(),
            config.persist.dir.display()
        );
        Self {
            config,
            pool: Arc::new(pool),
            registry: Arc::new(registry),
            store: Arc::new(store),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<FnRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<PersistStore> {
        &self.store
    }

    /// Toma una referencia sobre la fuente persistida, si la hay, para que
    /// no se libere mientras se lee y se envía el job. Se suelta al soltar
    /// el guard.
    pub fn pin_source(&self, source: &SourceSpec) -> EngineResult<SourcePin<'_>> {
        let handle = match source {
            SourceSpec::Persisted { handle } => {
                self.store.acquire(handle)?;
                Some(handle.clone())
            }
            _ => None,
        };
        Ok(SourcePin {
            store: &self.store,
            handle,
        })
    }

    /// Convierte la descripción de fuente de un job en particiones.
    pub fn resolve_source(&self, source: &SourceSpec) -> EngineResult<Vec<Partition>> {
        match source {
            SourceSpec::TextGlob {
                pattern,
                partitions,
                format,
                lenient,
            } => {
                let format = format.unwrap_or_else(|| RecordFormat::from_path(pattern));
                let opts = if *lenient {
                    SourceOptions::lenient()
                } else {
                    SourceOptions::default()
                };
                source::read_glob(pattern, *partitions, format, &opts)
            }
            SourceSpec::Inline {
                records,
                partitions,
            } => Ok(source::from_records(records.clone(), *partitions)),
            SourceSpec::Persisted { handle } => self.store.source(handle),
        }
    }

    pub fn persist(
        &self,
        name: &str,
        partitions: &[Partition],
        tier: StorageTier,
    ) -> EngineResult<PersistHandle> {
        self.store.persist(name, partitions, tier)
    }

    pub fn release(&self, handle: &PersistHandle) -> EngineResult<u32> {
        self.store.release(handle)
    }

    pub fn persisted(&self) -> Vec<PersistedInfo> {
        self.store.list()
    }

    pub fn workers(&self) -> Vec<WorkerMetrics> {
        self.pool.metrics()
    }

    /// Fin de la sesión: libera todo lo persistido.
    pub fn shutdown(&self) {
        info!("cerrando sesión");
        self.store.release_all();
    }
}

/// Referencia temporal sobre una fuente persistida.
pub struct SourcePin<'a> {
    store: &'a PersistStore,
    handle: Option<PersistHandle>,
}

impl Drop for SourcePin<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.store.release(&handle);
        }
    }
}
