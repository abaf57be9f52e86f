use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::persist::PersistHandle;
use crate::record::{Record, Records};

/// De dónde salió una partición. El motor no lo interpreta salvo para
/// localidad (particiones persistidas) y mensajes de error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    /// Rango de bytes `[start, end)` de un archivo de texto.
    ByteRange { path: String, start: u64, end: u64 },
    /// Trozo de una colección en memoria.
    Memory { offset: usize, len: usize },
    /// Partición `index` de un flujo persistido.
    Persisted { handle: PersistHandle, index: u32 },
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::ByteRange { path, start, end } => write!(f, "{}[{}..{})", path, start, end),
            Locator::Memory { offset, len } => write!(f, "memoria[{}..{})", offset, offset + len),
            Locator::Persisted { handle, index } => write!(f, "persistido {}#{}", handle, index),
        }
    }
}

/// Unidad de trabajo: secuencia ordenada de registros más su localizador.
/// Los registros se comparten vía `Arc`, así que clonar una partición no
/// copia datos y nunca se modifica una vez creada.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: u32,
    pub locator: Locator,
    records: Arc<[Record]>,
}

impl Partition {
    pub fn new(id: u32, locator: Locator, records: Records) -> Self {
        Self {
            id,
            locator,
            records: records.into(),
        }
    }

    pub fn from_shared(id: u32, locator: Locator, records: Arc<[Record]>) -> Self {
        Self {
            id,
            locator,
            records,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn shared_records(&self) -> Arc<[Record]> {
        Arc::clone(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Concatena los registros de las particiones en orden de índice.
pub fn concat(partitions: &[Partition]) -> Records {
    let mut sorted: Vec<&Partition> = partitions.iter().collect();
    sorted.sort_by_key(|p| p.id);
    sorted
        .into_iter()
        .flat_map(|p| p.records().iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn concat_respeta_orden_de_indice() {
        let p1 = Partition::new(1, Locator::Memory { offset: 1, len: 1 }, vec![json!("b")]);
        let p0 = Partition::new(0, Locator::Memory { offset: 0, len: 1 }, vec![json!("a")]);
        assert_eq!(concat(&[p1, p0]), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn clonar_comparte_registros() {
        let p = Partition::new(0, Locator::Memory { offset: 0, len: 2 }, vec![json!(1), json!(2)]);
        let q = p.clone();
        assert!(Arc::ptr_eq(&p.shared_records(), &q.shared_records()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn locator_se_muestra_legible() {
        let l = Locator::ByteRange {
            path: "/data/in.txt".into(),
            start: 0,
            end: 10,
        };
        assert_eq!(l.to_string(), "/data/in.txt[0..10)");
    }
}
