use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::registry::FnRegistry;

/// Cómo sacar un valor (clave, valor o criterio de orden) de un registro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extractor {
    /// Campo de un objeto, ej: `{"field": "token"}`.
    Field(String),
    /// Función `map` registrada, ej: `{"func": "to_lower"}`.
    Func(String),
    /// El registro completo.
    Whole,
}

impl Extractor {
    pub fn field(name: &str) -> Self {
        Extractor::Field(name.to_string())
    }

    pub fn func(name: &str) -> Self {
        Extractor::Func(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Agregación terminal de un grafo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Sum { value: Extractor },
    SumByKey,
    CountByKey,
    AverageByKey,
    DistinctCount { value: Extractor },
    TopK { k: usize, by: Extractor, order: SortOrder },
}

impl Aggregation {
    pub fn name(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum { .. } => "sum",
            Aggregation::SumByKey => "sum_by_key",
            Aggregation::CountByKey => "count_by_key",
            Aggregation::AverageByKey => "average_by_key",
            Aggregation::DistinctCount { .. } => "distinct_count",
            Aggregation::TopK { .. } => "top_k",
        }
    }

    /// Las agregaciones por clave necesitan registros clave/valor.
    pub fn is_keyed(&self) -> bool {
        matches!(
            self,
            Aggregation::SumByKey | Aggregation::CountByKey | Aggregation::AverageByKey
        )
    }
}

/// Descriptor de una etapa. Es un dato plano: los grafos se pueden
/// inspeccionar, validar y reenviar tantas veces como haga falta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Stage {
    Map { func: String },
    MapValues { func: String },
    /// flat_map: cada registro puede generar cero, uno o muchos.
    Collect { func: String },
    Filter { func: String },
    KeyBy { key: Extractor, value: Extractor },
    Aggregate(Aggregation),
}

impl Stage {
    fn describe(&self) -> String {
        match self {
            Stage::Map { func } => format!("map({func})"),
            Stage::MapValues { func } => format!("map_values({func})"),
            Stage::Collect { func } => format!("collect({func})"),
            Stage::Filter { func } => format!("filter({func})"),
            Stage::KeyBy { .. } => "key_by".to_string(),
            Stage::Aggregate(agg) => agg.name().to_string(),
        }
    }
}

/// Forma de los registros que produce un prefijo del grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Records,
    Pairs,
    Aggregated,
}

fn next_shape(shape: Shape, stage: &Stage) -> EngineResult<Shape> {
    if shape == Shape::Aggregated {
        return Err(EngineError::composition(format!(
            "no se puede agregar {} después de una agregación terminal",
            stage.describe()
        )));
    }

    match stage {
        Stage::Map { .. } | Stage::Collect { .. } => Ok(Shape::Records),
        Stage::Filter { .. } => Ok(shape),
        Stage::KeyBy { .. } => Ok(Shape::Pairs),
        Stage::MapValues { .. } => {
            if shape == Shape::Pairs {
                Ok(Shape::Pairs)
            } else {
                Err(EngineError::composition(
                    "map_values requiere una etapa previa que produzca pares clave/valor",
                ))
            }
        }
        Stage::Aggregate(agg) => {
            if agg.is_keyed() && shape != Shape::Pairs {
                return Err(EngineError::composition(format!(
                    "{} requiere una etapa previa que produzca pares clave/valor (key_by)",
                    agg.name()
                )));
            }
            if let Aggregation::TopK { k: 0, .. } = agg {
                return Err(EngineError::composition("top-k con k = 0"));
            }
            Ok(Shape::Aggregated)
        }
    }
}

/// Grafo de flujo perezoso e inmutable.
///
/// Cada operación devuelve un grafo nuevo que extiende al anterior; el
/// receptor nunca se modifica, así el mismo grafo se puede enviar varias veces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    stages: Vec<Stage>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Agrega una etapa validando la composición.
    pub fn then(&self, stage: Stage) -> EngineResult<FlowGraph> {
        next_shape(self.output_shape()?, &stage)?;
        let mut stages = self.stages.clone();
        stages.push(stage);
        Ok(FlowGraph { stages })
    }

    pub fn map(&self, func: &str) -> EngineResult<FlowGraph> {
        self.then(Stage::Map {
            func: func.to_string(),
        })
    }

    pub fn map_values(&self, func: &str) -> EngineResult<FlowGraph> {
        self.then(Stage::MapValues {
            func: func.to_string(),
        })
    }

    pub fn collect(&self, func: &str) -> EngineResult<FlowGraph> {
        self.then(Stage::Collect {
            func: func.to_string(),
        })
    }

    pub fn filter(&self, func: &str) -> EngineResult<FlowGraph> {
        self.then(Stage::Filter {
            func: func.to_string(),
        })
    }

    pub fn key_by(&self, key: Extractor, value: Extractor) -> EngineResult<FlowGraph> {
        self.then(Stage::KeyBy { key, value })
    }

    pub fn count(&self) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::Count))
    }

    pub fn sum(&self, value: Extractor) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::Sum { value }))
    }

    pub fn sum_by_key(&self) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::SumByKey))
    }

    pub fn count_by_key(&self) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::CountByKey))
    }

    pub fn average_by_key(&self) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::AverageByKey))
    }

    pub fn distinct_count(&self, value: Extractor) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::DistinctCount { value }))
    }

    /// Los `k` menores según `by`; empates por orden de entrada.
    pub fn sort_by(&self, by: Extractor, k: usize) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::TopK {
            k,
            by,
            order: SortOrder::Ascending,
        }))
    }

    /// Los `k` mayores según `by`; empates por orden de entrada.
    pub fn sort_by_descending(&self, by: Extractor, k: usize) -> EngineResult<FlowGraph> {
        self.then(Stage::Aggregate(Aggregation::TopK {
            k,
            by,
            order: SortOrder::Descending,
        }))
    }

    /// Forma de la salida; falla si el grafo (p.ej. deserializado) está mal compuesto.
    pub fn output_shape(&self) -> EngineResult<Shape> {
        self.stages
            .iter()
            .try_fold(Shape::Records, |shape, stage| next_shape(shape, stage))
    }

    pub fn aggregation(&self) -> Option<&Aggregation> {
        match self.stages.last() {
            Some(Stage::Aggregate(agg)) => Some(agg),
            _ => None,
        }
    }

    pub fn is_aggregating(&self) -> bool {
        self.aggregation().is_some()
    }

    /// Valida composición y que todas las funciones referenciadas existan.
    pub fn validate(&self, registry: &FnRegistry) -> EngineResult<()> {
        self.output_shape()?;

        let missing = |kind: &str, name: &str| {
            EngineError::composition(format!("función {kind} desconocida: {name}"))
        };
        let check_extractor = |ex: &Extractor| match ex {
            Extractor::Func(name) if registry.map(name).is_none() => Err(missing("map", name)),
            _ => Ok(()),
        };

        for stage in &self.stages {
            match stage {
                Stage::Map { func } | Stage::MapValues { func } => {
                    if registry.map(func).is_none() {
                        return Err(missing("map", func));
                    }
                }
                Stage::Collect { func } => {
                    if registry.flat_map(func).is_none() {
                        return Err(missing("collect", func));
                    }
                }
                Stage::Filter { func } => {
                    if registry.filter(func).is_none() {
                        return Err(missing("filter", func));
                    }
                }
                Stage::KeyBy { key, value } => {
                    check_extractor(key)?;
                    check_extractor(value)?;
                }
                Stage::Aggregate(Aggregation::Sum { value })
                | Stage::Aggregate(Aggregation::DistinctCount { value }) => check_extractor(value)?,
                Stage::Aggregate(Aggregation::TopK { by, .. }) => check_extractor(by)?,
                Stage::Aggregate(_) => {}
            }
        }
        Ok(())
    }

    /// Resumen legible, ej: `collect(tokenize) -> key_by -> sum_by_key`.
    pub fn describe(&self) -> String {
        if self.stages.is_empty() {
            return "identity".to_string();
        }
        self.stages
            .iter()
            .map(Stage::describe)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agregar_etapas_no_modifica_el_grafo_original() {
        let base = FlowGraph::new().collect("tokenize").unwrap();
        let a = base.filter("nonempty_token").unwrap();
        let b = base.map("to_lower").unwrap();

        assert_eq!(base.stages().len(), 1);
        assert_eq!(a.stages().len(), 2);
        assert_eq!(b.stages().len(), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn agregacion_por_clave_sin_key_by_es_invalida() {
        let g = FlowGraph::new().map("identity").unwrap();
        assert!(matches!(
            g.average_by_key(),
            Err(EngineError::InvalidStageComposition(_))
        ));
        assert!(matches!(
            g.count_by_key(),
            Err(EngineError::InvalidStageComposition(_))
        ));

        let keyed = g
            .key_by(Extractor::field("k"), Extractor::field("v"))
            .unwrap();
        assert!(keyed.average_by_key().is_ok());
        // filter conserva la forma de pares
        assert!(keyed.filter("not_null").unwrap().sum_by_key().is_ok());
        // map la pierde
        assert!(keyed.map("identity").unwrap().sum_by_key().is_err());
    }

    #[test]
    fn nada_puede_seguir_a_una_agregacion() {
        let g = FlowGraph::new().count().unwrap();
        assert!(g.is_aggregating());
        assert!(matches!(
            g.map("identity"),
            Err(EngineError::InvalidStageComposition(_))
        ));
    }

    #[test]
    fn top_k_con_k_cero_es_invalido() {
        assert!(FlowGraph::new().sort_by(Extractor::Whole, 0).is_err());
        assert!(FlowGraph::new().sort_by_descending(Extractor::Whole, 3).is_ok());
    }

    #[test]
    fn map_values_requiere_pares() {
        assert!(FlowGraph::new().map_values("identity").is_err());
        let g = FlowGraph::new()
            .key_by(Extractor::Whole, Extractor::Whole)
            .unwrap()
            .map_values("identity")
            .unwrap();
        assert_eq!(g.output_shape().unwrap(), Shape::Pairs);
    }

    #[test]
    fn validate_detecta_funciones_desconocidas() {
        let reg = FnRegistry::with_builtins();
        let ok = FlowGraph::new()
            .collect("tokenize")
            .unwrap()
            .key_by(Extractor::field("token"), Extractor::field("count"))
            .unwrap()
            .sum_by_key()
            .unwrap();
        assert!(ok.validate(&reg).is_ok());

        let bad = FlowGraph::new().map("no_existe").unwrap();
        assert!(matches!(
            bad.validate(&reg),
            Err(EngineError::InvalidStageComposition(_))
        ));

        let bad_key = FlowGraph::new()
            .key_by(Extractor::func("tampoco"), Extractor::Whole)
            .unwrap();
        assert!(bad_key.validate(&reg).is_err());
    }

    #[test]
    fn grafo_deserializado_mal_compuesto_falla_al_validar() {
        let raw = r#"{"stages":[{"op":"aggregate","kind":"average_by_key"}]}"#;
        let g: FlowGraph = serde_json::from_str(raw).unwrap();
        assert!(g.validate(&FnRegistry::with_builtins()).is_err());
    }

    #[test]
    fn describe_muestra_la_cadena() {
        let g = FlowGraph::new()
            .collect("tokenize")
            .unwrap()
            .filter("nonempty_token")
            .unwrap()
            .count()
            .unwrap();
        assert_eq!(g.describe(), "collect(tokenize) -> filter(nonempty_token) -> count");
    }
}
