use thiserror::Error;

use crate::persist::StorageTier;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errores del motor de flujos.
///
/// Los errores de composición (`InvalidStageComposition`,
/// `IncompatibleAccumulators`) son errores de programación: se devuelven al
/// llamador tal cual y nunca se reintentan. Sólo `PartitionExecutionFailed`
/// es reintentable por el controlador de jobs.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("fuente no disponible ({locator}): {reason}")]
    SourceUnavailable { locator: String, reason: String },

    #[error("límite de partición mal formado en {locator} (offset {offset}): último registro sin terminador")]
    MalformedBoundary { locator: String, offset: u64 },

    #[error("error de parseo en línea {line}: {reason}")]
    ParseError { line: u64, reason: String },

    #[error("composición de etapas inválida: {0}")]
    InvalidStageComposition(String),

    #[error("falló la ejecución de la partición {partition}: {cause}")]
    PartitionExecutionFailed { partition: u32, cause: String },

    #[error("acumuladores incompatibles: {left} vs {right}")]
    IncompatibleAccumulators { left: String, right: String },

    #[error("almacenamiento insuficiente en {tier} para la partición {partition}: se necesitan {needed} bytes, hay {available}")]
    InsufficientStorage {
        tier: StorageTier,
        partition: u32,
        needed: u64,
        available: u64,
    },

    #[error("job cancelado")]
    Cancelled,

    #[error("job desconocido: {0}")]
    UnknownJob(String),

    #[error("flujo persistido desconocido: {0}")]
    UnknownHandle(String),

    #[error("no hay workers vivos para ejecutar la tarea")]
    NoWorkers,

    #[error("error de E/S: {0}")]
    Io(String),

    #[error("error de JSON: {0}")]
    Json(String),
}

impl EngineError {
    /// Sólo los fallos locales de una partición se reintentan.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PartitionExecutionFailed { .. })
    }

    pub fn partition_failed(partition: u32, cause: impl std::fmt::Display) -> Self {
        EngineError::PartitionExecutionFailed {
            partition,
            cause: cause.to_string(),
        }
    }

    pub fn composition(msg: impl Into<String>) -> Self {
        EngineError::InvalidStageComposition(msg.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_partition_execution_failed_es_reintentable() {
        assert!(EngineError::partition_failed(3, "boom").is_retryable());
        assert!(!EngineError::composition("x").is_retryable());
        assert!(!EngineError::InsufficientStorage {
            tier: StorageTier::Disk,
            partition: 0,
            needed: 10,
            available: 1,
        }
        .is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn mensaje_incluye_particion_y_causa() {
        let e = EngineError::partition_failed(7, "division por cero");
        let msg = e.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("division por cero"));
    }
}
