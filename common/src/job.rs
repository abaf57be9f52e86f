use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::aggregate::AggregateResult;
use crate::flow::FlowGraph;
use crate::persist::{PersistHandle, StorageTier};
use crate::record::Records;
use crate::source::RecordFormat;

pub type JobId = String;

/// Qué hacer con el resultado de un job al completarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDirective {
    #[default]
    None,
    Memory,
    Disk,
}

impl StorageDirective {
    pub fn tier(&self) -> Option<StorageTier> {
        match self {
            StorageDirective::None => None,
            StorageDirective::Memory => Some(StorageTier::Memory),
            StorageDirective::Disk => Some(StorageTier::Disk),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Particiones terminadas / totales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JobOutput {
    /// Flujo sin agregación: registros en orden de partición.
    Records(Records),
    Aggregate(AggregateResult),
}

/// Resultado final de un job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub output: JobOutput,
    /// Presente si el job se lanzó con una directiva de almacenamiento.
    pub persisted: Option<PersistHandle>,
}

impl JobResult {
    /// Secuencia ordenada de (etiqueta, valor) para un consumidor externo
    /// (gráficos, tablas).
    pub fn to_pairs(&self) -> Vec<(String, Value)> {
        match &self.output {
            JobOutput::Records(recs) => recs
                .iter()
                .enumerate()
                .map(|(i, r)| (i.to_string(), r.clone()))
                .collect(),
            JobOutput::Aggregate(res) => res.to_pairs(),
        }
    }

    pub fn aggregate(&self) -> Option<&AggregateResult> {
        match &self.output {
            JobOutput::Aggregate(res) => Some(res),
            JobOutput::Records(_) => None,
        }
    }

    pub fn records(&self) -> Option<&Records> {
        match &self.output {
            JobOutput::Records(recs) => Some(recs),
            JobOutput::Aggregate(_) => None,
        }
    }

    pub fn summary(&self) -> Value {
        match &self.output {
            JobOutput::Records(recs) => json!({ "records": recs.len() }),
            JobOutput::Aggregate(res) => json!({ "aggregate": res }),
        }
    }
}

fn default_partitions() -> u32 {
    4
}

/// De dónde leer las particiones de un job enviado por HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Patrón de archivos de entrada, ej: "/data/input/*.txt"
    TextGlob {
        pattern: String,
        /// Particiones por archivo
        #[serde(default = "default_partitions")]
        partitions: u32,
        /// Si falta, se infiere por extensión del patrón
        #[serde(default)]
        format: Option<RecordFormat>,
        /// Acepta un último registro sin `\n`
        #[serde(default)]
        lenient: bool,
    },
    Inline {
        records: Records,
        #[serde(default = "default_partitions")]
        partitions: u32,
    },
    Persisted {
        handle: PersistHandle,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,

    /// Grafo de etapas (map, collect, filter, key_by, agregación)
    pub graph: FlowGraph,

    pub source: SourceSpec,

    #[serde(default)]
    pub directive: StorageDirective,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    /// Grafo que se envió para este job
    pub graph: FlowGraph,
    pub directive: StorageDirective,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub retries: u32,

    /// Causa del fallo, si lo hubo
    pub error: Option<String>,
    pub persisted: Option<PersistHandle>,
}

impl JobInfo {
    pub fn new(
        id: JobId,
        name: String,
        graph: FlowGraph,
        directive: StorageDirective,
        total_tasks: u32,
    ) -> Self {
        Self {
            id,
            name,
            status: JobStatus::Submitted,
            graph,
            directive,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            retries: 0,
            error: None,
            persisted: None,
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.completed_tasks,
            total: self.total_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estados_terminales() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn progreso_sin_tareas_es_completo() {
        let p = Progress { completed: 0, total: 0 };
        assert_eq!(p.fraction(), 1.0);
        let p = Progress { completed: 1, total: 4 };
        assert_eq!(p.fraction(), 0.25);
    }

    #[test]
    fn job_request_usa_valores_por_defecto() {
        let raw = r#"{
            "name": "wc",
            "graph": {"stages": [{"op": "collect", "func": "tokenize"}]},
            "source": {"type": "text_glob", "pattern": "/data/input/*.txt"}
        }"#;
        let req: JobRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.directive, StorageDirective::None);
        match req.source {
            SourceSpec::TextGlob {
                partitions,
                format,
                lenient,
                ..
            } => {
                assert_eq!(partitions, 4);
                assert_eq!(format, None);
                assert!(!lenient);
            }
            other => panic!("fuente inesperada: {other:?}"),
        }
    }

    #[test]
    fn status_se_serializa_en_mayusculas() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
    }
}
