use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::partition::{Locator, Partition};
use crate::record::{Record, Records};
use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Memory,
    Disk,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTier::Memory => write!(f, "memory"),
            StorageTier::Disk => write!(f, "disk"),
        }
    }
}

/// Referencia opaca a un flujo persistido.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistHandle(pub String);

impl PersistHandle {
    fn generate() -> Self {
        PersistHandle(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for PersistHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Directorio base del tier de disco.
    pub dir: PathBuf,
    pub memory_capacity: u64,
    pub disk_capacity: u64,
    /// Lo máximo que un worker puede alojar de una sola partición.
    pub max_partition_bytes: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("flowlite-persist"),
            memory_capacity: 512 * 1024 * 1024,
            disk_capacity: 8 * 1024 * 1024 * 1024,
            max_partition_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Resumen de un flujo persistido (para listar vía API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedInfo {
    pub handle: PersistHandle,
    pub name: String,
    pub tier: StorageTier,
    pub refs: u32,
    pub partitions: u32,
    pub records: u64,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

enum StoredData {
    Memory(Arc<[Record]>),
    Disk(PathBuf),
}

struct StoredPartition {
    id: u32,
    len: usize,
    home: Option<WorkerId>,
    data: StoredData,
}

struct PersistedFlow {
    name: String,
    tier: StorageTier,
    refs: u32,
    bytes: u64,
    created_at: DateTime<Utc>,
    partitions: Vec<StoredPartition>,
}

#[derive(Default)]
struct StoreInner {
    flows: HashMap<PersistHandle, PersistedFlow>,
    used_memory: u64,
    used_disk: u64,
}

impl StoreInner {
    fn used(&self, tier: StorageTier) -> u64 {
        match tier {
            StorageTier::Memory => self.used_memory,
            StorageTier::Disk => self.used_disk,
        }
    }

    fn used_mut(&mut self, tier: StorageTier) -> &mut u64 {
        match tier {
            StorageTier::Memory => &mut self.used_memory,
            StorageTier::Disk => &mut self.used_disk,
        }
    }
}

/// Capa de persistencia: resultados de partición fijados en un tier,
/// con conteo de referencias. Nunca se desalojan mientras estén referenciados.
pub struct PersistStore {
    config: PersistConfig,
    inner: Mutex<StoreInner>,
}

/* =========================
   Particiones en disco (JSONL)
   ========================= */

/// Escribe una partición como JSONL (un registro por línea).
pub fn write_partition_file(path: &Path, records: &[Record]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for rec in records {
        serde_json::to_writer(&mut writer, rec)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Lee un archivo de partición (JSONL) y devuelve su contenido como Records.
pub fn read_partition_file(path: &Path) -> EngineResult<Records> {
    let file = File::open(path).map_err(|e| EngineError::SourceUnavailable {
        locator: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Tamaño serializado (JSONL) de una partición.
fn estimate_bytes(records: &[Record]) -> EngineResult<u64> {
    let mut total = 0u64;
    for rec in records {
        total += serde_json::to_vec(rec)?.len() as u64 + 1;
    }
    Ok(total)
}

impl PersistStore {
    pub fn new(config: PersistConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // un panic con el lock tomado no deja el mapa a medias: seguimos
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capacity(&self, tier: StorageTier) -> u64 {
        match tier {
            StorageTier::Memory => self.config.memory_capacity,
            StorageTier::Disk => self.config.disk_capacity,
        }
    }

    /// Fija las particiones en `tier` y devuelve un handle con una referencia.
    pub fn persist(
        &self,
        name: &str,
        partitions: &[Partition],
        tier: StorageTier,
    ) -> EngineResult<PersistHandle> {
        let homes = vec![None; partitions.len()];
        self.persist_placed(name, partitions, &homes, tier)
    }

    /// Igual que `persist`, registrando qué worker produjo cada partición
    /// (se usa para asignar por localidad).
    pub fn persist_placed(
        &self,
        name: &str,
        partitions: &[Partition],
        homes: &[Option<WorkerId>],
        tier: StorageTier,
    ) -> EngineResult<PersistHandle> {
        let sizes = partitions
            .iter()
            .map(|p| estimate_bytes(p.records()))
            .collect::<EngineResult<Vec<u64>>>()?;
        let total: u64 = sizes.iter().sum();

        // 1) reservar capacidad; si algo no entra, falla todo (sin bajar de tier)
        {
            let mut inner = self.lock();
            let mut available = self.capacity(tier).saturating_sub(inner.used(tier));

            for (p, &bytes) in partitions.iter().zip(&sizes) {
                let fits_worker = bytes <= self.config.max_partition_bytes;
                if !fits_worker || bytes > available {
                    return Err(EngineError::InsufficientStorage {
                        tier,
                        partition: p.id,
                        needed: bytes,
                        available: if fits_worker {
                            available
                        } else {
                            self.config.max_partition_bytes
                        },
                    });
                }
                available -= bytes;
            }
            *inner.used_mut(tier) += total;
        }

        let handle = PersistHandle::generate();

        // 2) materializar (un solo escritor por partición)
        let stored = match self.materialize(&handle, partitions, homes, tier) {
            Ok(stored) => stored,
            Err(e) => {
                let mut inner = self.lock();
                *inner.used_mut(tier) -= total;
                drop(inner);
                let _ = fs::remove_dir_all(self.flow_dir(&handle));
                warn!("no se pudo persistir {}: {}", name, e);
                return Err(e);
            }
        };

        info!(
            "flujo {} persistido como {} en {} ({} particiones, {} bytes)",
            name,
            handle,
            tier,
            stored.len(),
            total
        );

        let mut inner = self.lock();
        inner.flows.insert(
            handle.clone(),
            PersistedFlow {
                name: name.to_string(),
                tier,
                refs: 1,
                bytes: total,
                created_at: Utc::now(),
                partitions: stored,
            },
        );

        Ok(handle)
    }

    fn flow_dir(&self, handle: &PersistHandle) -> PathBuf {
        self.config.dir.join(&handle.0)
    }

    fn materialize(
        &self,
        handle: &PersistHandle,
        partitions: &[Partition],
        homes: &[Option<WorkerId>],
        tier: StorageTier,
    ) -> EngineResult<Vec<StoredPartition>> {
        let mut out = Vec::with_capacity(partitions.len());
        for (idx, p) in partitions.iter().enumerate() {
            let data = match tier {
                StorageTier::Memory => StoredData::Memory(p.shared_records()),
                StorageTier::Disk => {
                    let path = self.flow_dir(handle).join(format!("part-{}.jsonl", idx));
                    write_partition_file(&path, p.records())?;
                    StoredData::Disk(path)
                }
            };
            out.push(StoredPartition {
                id: idx as u32,
                len: p.len(),
                home: homes.get(idx).cloned().flatten(),
                data,
            });
        }
        Ok(out)
    }

    /// Suma una referencia; devuelve el total.
    pub fn acquire(&self, handle: &PersistHandle) -> EngineResult<u32> {
        let mut inner = self.lock();
        let flow = inner
            .flows
            .get_mut(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        flow.refs += 1;
        Ok(flow.refs)
    }

    /// Resta una referencia; al llegar a cero se libera el almacenamiento.
    pub fn release(&self, handle: &PersistHandle) -> EngineResult<u32> {
        let mut inner = self.lock();
        let flow = inner
            .flows
            .get_mut(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        flow.refs = flow.refs.saturating_sub(1);
        let remaining = flow.refs;

        let removed = if remaining == 0 {
            inner.flows.remove(handle)
        } else {
            None
        };
        if let Some(flow) = removed {
            *inner.used_mut(flow.tier) -= flow.bytes;
            drop(inner);
            self.reclaim(handle, flow);
        }
        Ok(remaining)
    }

    fn reclaim(&self, handle: &PersistHandle, flow: PersistedFlow) {
        if flow.tier == StorageTier::Disk {
            if let Err(e) = fs::remove_dir_all(self.flow_dir(handle)) {
                warn!("no se pudo borrar el directorio de {}: {}", handle, e);
            }
        }
        info!("flujo persistido {} ({}) liberado", handle, flow.name);
    }

    /// Libera todo (fin de la sesión).
    pub fn release_all(&self) {
        let drained: Vec<(PersistHandle, PersistedFlow)> = {
            let mut inner = self.lock();
            inner.used_memory = 0;
            inner.used_disk = 0;
            inner.flows.drain().collect()
        };
        for (handle, flow) in drained {
            self.reclaim(&handle, flow);
        }
    }

    /// Particiones materializadas, listas para usarse como fuente.
    /// En memoria sólo se clonan `Arc`s; en disco se leen los JSONL.
    pub fn source(&self, handle: &PersistHandle) -> EngineResult<Vec<Partition>> {
        enum Src {
            Mem(Arc<[Record]>),
            File(PathBuf),
        }

        let entries: Vec<(u32, Src)> = {
            let inner = self.lock();
            let flow = inner
                .flows
                .get(handle)
                .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
            flow.partitions
                .iter()
                .map(|p| {
                    let src = match &p.data {
                        StoredData::Memory(recs) => Src::Mem(Arc::clone(recs)),
                        StoredData::Disk(path) => Src::File(path.clone()),
                    };
                    (p.id, src)
                })
                .collect()
        };

        let mut out = Vec::with_capacity(entries.len());
        for (id, src) in entries {
            let locator = Locator::Persisted {
                handle: handle.clone(),
                index: id,
            };
            let part = match src {
                Src::Mem(recs) => Partition::from_shared(id, locator, recs),
                Src::File(path) => {
                    debug!("leyendo partición persistida {}", path.display());
                    Partition::new(id, locator, read_partition_file(&path)?)
                }
            };
            out.push(part);
        }
        Ok(out)
    }

    /// Worker que materializó la partición `index`, si se conoce.
    pub fn home_of(&self, handle: &PersistHandle, index: u32) -> Option<WorkerId> {
        let inner = self.lock();
        inner
            .flows
            .get(handle)?
            .partitions
            .iter()
            .find(|p| p.id == index)
            .and_then(|p| p.home.clone())
    }

    pub fn refs(&self, handle: &PersistHandle) -> Option<u32> {
        self.lock().flows.get(handle).map(|f| f.refs)
    }

    pub fn usage(&self, tier: StorageTier) -> u64 {
        self.lock().used(tier)
    }

    pub fn list(&self) -> Vec<PersistedInfo> {
        let inner = self.lock();
        let mut out: Vec<PersistedInfo> = inner
            .flows
            .iter()
            .map(|(handle, flow)| PersistedInfo {
                handle: handle.clone(),
                name: flow.name.clone(),
                tier: flow.tier,
                refs: flow.refs,
                partitions: flow.partitions.len() as u32,
                records: flow.partitions.iter().map(|p| p.len as u64).sum(),
                bytes: flow.bytes,
                created_at: flow.created_at,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }
}
