use anyhow::anyhow;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::aggregate::{Accumulator, Ranked};
use crate::error::{EngineError, EngineResult};
use crate::flow::{Aggregation, Extractor, FlowGraph, Stage};
use crate::partition::Partition;
use crate::record::{as_f64, as_pair, key_string, pair, Record, Records};
use crate::registry::{FilterFn, FlatMapFn, FnRegistry, MapFn};

/// Señal de cancelación compartida entre el controlador y los ejecutores.
/// Se consulta entre registro y registro.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resultado local de una partición.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionOutput {
    Records(Records),
    Accumulator(Accumulator),
}

enum CompiledExtractor {
    Field(String),
    Func(MapFn),
    Whole,
}

impl CompiledExtractor {
    fn compile(ex: &Extractor, registry: &FnRegistry) -> EngineResult<Self> {
        Ok(match ex {
            Extractor::Field(name) => CompiledExtractor::Field(name.clone()),
            Extractor::Func(name) => CompiledExtractor::Func(
                registry
                    .map(name)
                    .ok_or_else(|| EngineError::composition(format!("función map desconocida: {name}")))?,
            ),
            Extractor::Whole => CompiledExtractor::Whole,
        })
    }

    fn apply(&self, rec: &Record) -> anyhow::Result<Value> {
        match self {
            CompiledExtractor::Field(name) => rec
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("registro sin campo \"{name}\"")),
            CompiledExtractor::Func(f) => f(rec),
            CompiledExtractor::Whole => Ok(rec.clone()),
        }
    }
}

enum CompiledStage {
    Map(MapFn),
    MapValues(MapFn),
    Collect(FlatMapFn),
    Filter(FilterFn),
    KeyBy(CompiledExtractor, CompiledExtractor),
}

enum Sink {
    Records,
    Count,
    Sum(CompiledExtractor),
    /// `numeric` = el valor del par debe ser un número (suma / promedio).
    Keyed { numeric: bool },
    Distinct(CompiledExtractor),
    TopK(CompiledExtractor),
}

/// Grafo con todas las funciones ya resueltas contra el registro.
pub struct CompiledFlow {
    stages: Vec<CompiledStage>,
    sink: Sink,
    aggregation: Option<Aggregation>,
}

fn resolve<T>(found: Option<T>, kind: &str, name: &str) -> EngineResult<T> {
    found.ok_or_else(|| EngineError::composition(format!("función {kind} desconocida: {name}")))
}

impl CompiledFlow {
    pub fn compile(graph: &FlowGraph, registry: &FnRegistry) -> EngineResult<Self> {
        graph.output_shape()?;

        let mut stages = Vec::new();
        let mut sink = Sink::Records;

        for stage in graph.stages() {
            match stage {
                Stage::Map { func } => {
                    stages.push(CompiledStage::Map(resolve(registry.map(func), "map", func)?))
                }
                Stage::MapValues { func } => stages.push(CompiledStage::MapValues(resolve(
                    registry.map(func),
                    "map",
                    func,
                )?)),
                Stage::Collect { func } => stages.push(CompiledStage::Collect(resolve(
                    registry.flat_map(func),
                    "collect",
                    func,
                )?)),
                Stage::Filter { func } => stages.push(CompiledStage::Filter(resolve(
                    registry.filter(func),
                    "filter",
                    func,
                )?)),
                Stage::KeyBy { key, value } => stages.push(CompiledStage::KeyBy(
                    CompiledExtractor::compile(key, registry)?,
                    CompiledExtractor::compile(value, registry)?,
                )),
                Stage::Aggregate(agg) => {
                    sink = match agg {
                        Aggregation::Count => Sink::Count,
                        Aggregation::Sum { value } => {
                            Sink::Sum(CompiledExtractor::compile(value, registry)?)
                        }
                        Aggregation::SumByKey | Aggregation::AverageByKey => {
                            Sink::Keyed { numeric: true }
                        }
                        Aggregation::CountByKey => Sink::Keyed { numeric: false },
                        Aggregation::DistinctCount { value } => {
                            Sink::Distinct(CompiledExtractor::compile(value, registry)?)
                        }
                        Aggregation::TopK { by, .. } => {
                            Sink::TopK(CompiledExtractor::compile(by, registry)?)
                        }
                    }
                }
            }
        }

        Ok(Self {
            stages,
            sink,
            aggregation: graph.aggregation().cloned(),
        })
    }

    /// Pasa un registro por todas las etapas no terminales.
    fn apply_stages(&self, rec: &Record) -> anyhow::Result<Records> {
        let mut current = vec![rec.clone()];

        for stage in &self.stages {
            let mut next = Vec::with_capacity(current.len());
            for r in current {
                match stage {
                    CompiledStage::Map(f) => next.push(f(&r)?),
                    CompiledStage::MapValues(f) => {
                        let (k, v) = as_pair(&r)
                            .ok_or_else(|| anyhow!("map_values sobre un registro que no es par"))?;
                        next.push(pair(k.clone(), f(v)?));
                    }
                    CompiledStage::Collect(f) => next.extend(f(&r)?),
                    CompiledStage::Filter(f) => {
                        if f(&r)? {
                            next.push(r);
                        }
                    }
                    CompiledStage::KeyBy(key, value) => {
                        next.push(pair(key.apply(&r)?, value.apply(&r)?))
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }

        Ok(current)
    }

    fn feed(
        &self,
        acc: &mut Accumulator,
        item: Record,
        partition: u32,
        offset: u64,
    ) -> anyhow::Result<()> {
        match &self.sink {
            Sink::Records => {}
            Sink::Count => acc.add_one(),
            Sink::Sum(ex) => {
                let v = ex.apply(&item)?;
                let x = as_f64(&v).ok_or_else(|| anyhow!("valor no numérico: {v}"))?;
                acc.add_number(x);
            }
            Sink::Keyed { numeric } => {
                let (k, v) =
                    as_pair(&item).ok_or_else(|| anyhow!("se esperaba un par clave/valor: {item}"))?;
                let x = if *numeric {
                    as_f64(v).ok_or_else(|| anyhow!("valor no numérico para la clave {k}: {v}"))?
                } else {
                    0.0
                };
                acc.add_keyed(key_string(k), x);
            }
            Sink::Distinct(ex) => acc.add_distinct(key_string(&ex.apply(&item)?)),
            Sink::TopK(ex) => {
                let sort_key = ex.apply(&item)?;
                acc.add_ranked(Ranked {
                    sort_key,
                    partition,
                    offset,
                    record: item,
                });
            }
        }
        Ok(())
    }

    /// Ejecuta el flujo sobre una partición, en orden de registros.
    /// Cualquier fallo aborta la partición entera: no hay resultados parciales.
    pub fn run(&self, partition: &Partition, cancel: &CancelToken) -> EngineResult<PartitionOutput> {
        let pid = partition.id;
        let mut acc = self.aggregation.as_ref().map(Accumulator::empty);
        let mut out: Records = Vec::new();
        let mut emitted: u64 = 0;

        for (idx, rec) in partition.records().iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let produced = self
                .apply_stages(rec)
                .map_err(|e| EngineError::partition_failed(pid, format!("registro {idx}: {e:#}")))?;

            for item in produced {
                match acc.as_mut() {
                    Some(acc) => self
                        .feed(acc, item, pid, emitted)
                        .map_err(|e| EngineError::partition_failed(pid, format!("registro {idx}: {e:#}")))?,
                    None => out.push(item),
                }
                emitted += 1;
            }
        }

        Ok(match acc {
            Some(acc) => PartitionOutput::Accumulator(acc.compact()),
            None => PartitionOutput::Records(out),
        })
    }
}

/// Compila el grafo y lo ejecuta sobre una partición.
pub fn execute_partition(
    graph: &FlowGraph,
    partition: &Partition,
    registry: &FnRegistry,
    cancel: &CancelToken,
) -> EngineResult<PartitionOutput> {
    CompiledFlow::compile(graph, registry)?.run(partition, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateResult;
    use crate::partition::Locator;
    use serde_json::json;

    fn part(id: u32, records: Records) -> Partition {
        let len = records.len();
        Partition::new(id, Locator::Memory { offset: 0, len }, records)
    }

    fn lines(texts: &[&str]) -> Records {
        texts.iter().map(|t| json!({ "text": t })).collect()
    }

    #[test]
    fn collect_filter_y_map_en_orden() {
        let reg = FnRegistry::with_builtins();
        let g = FlowGraph::new()
            .collect("tokenize")
            .unwrap()
            .filter("nonempty_token")
            .unwrap()
            .map("identity")
            .unwrap();

        let out = execute_partition(&g, &part(0, lines(&["Hola mundo", "", "chau"])), &reg, &CancelToken::new())
            .unwrap();
        let tokens: Vec<&str> = match &out {
            PartitionOutput::Records(recs) => recs.iter().map(|r| r["token"].as_str().unwrap()).collect(),
            other => panic!("salida inesperada: {other:?}"),
        };
        assert_eq!(tokens, vec!["hola", "mundo", "chau"]);
    }

    #[test]
    fn average_by_key_local() {
        let reg = FnRegistry::with_builtins();
        let g = FlowGraph::new()
            .key_by(Extractor::field("k"), Extractor::field("v"))
            .unwrap()
            .average_by_key()
            .unwrap();
        let recs = vec![
            json!({"k": "A", "v": 10}),
            json!({"k": "A", "v": "20"}),
            json!({"k": "B", "v": 30}),
        ];

        match execute_partition(&g, &part(0, recs), &reg, &CancelToken::new()).unwrap() {
            PartitionOutput::Accumulator(acc) => {
                let res = acc.finish();
                let expected = AggregateResult::ByKey(
                    [("A".to_string(), 15.0), ("B".to_string(), 30.0)].into(),
                );
                assert_eq!(res, expected);
            }
            other => panic!("salida inesperada: {other:?}"),
        }
    }

    #[test]
    fn fallo_de_un_registro_aborta_la_particion() {
        let mut reg = FnRegistry::new();
        reg.register_map("explota_en_3", |r| {
            if r.as_i64() == Some(3) {
                anyhow::bail!("no me gusta el 3");
            }
            Ok(r.clone())
        });
        let g = FlowGraph::new().map("explota_en_3").unwrap();
        let recs: Records = (1..=5).map(|i| json!(i)).collect();

        let err = execute_partition(&g, &part(7, recs), &reg, &CancelToken::new()).unwrap_err();
        match err {
            EngineError::PartitionExecutionFailed { partition, cause } => {
                assert_eq!(partition, 7);
                assert!(cause.contains("registro 2"));
                assert!(cause.contains("no me gusta el 3"));
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[test]
    fn valor_no_numerico_falla_en_suma() {
        let reg = FnRegistry::with_builtins();
        let g = FlowGraph::new().sum(Extractor::field("v")).unwrap();
        let recs = vec![json!({"v": 1}), json!({"v": "abc"})];
        assert!(matches!(
            execute_partition(&g, &part(0, recs), &reg, &CancelToken::new()),
            Err(EngineError::PartitionExecutionFailed { .. })
        ));
    }

    #[test]
    fn cancelacion_se_respeta_entre_registros() {
        let reg = FnRegistry::with_builtins();
        let g = FlowGraph::new().count().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = execute_partition(&g, &part(0, vec![json!(1)]), &reg, &cancel).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn top_k_registra_posicion_de_salida() {
        let reg = FnRegistry::with_builtins();
        let g = FlowGraph::new()
            .sort_by_descending(Extractor::field("v"), 2)
            .unwrap();
        let recs = vec![json!({"v": 1, "id": "a"}), json!({"v": 5, "id": "b"}), json!({"v": 5, "id": "c"})];

        match execute_partition(&g, &part(3, recs), &reg, &CancelToken::new()).unwrap() {
            PartitionOutput::Accumulator(Accumulator::TopK { items, .. }) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].record["id"], json!("b"));
                assert_eq!(items[0].partition, 3);
                assert_eq!(items[0].offset, 1);
                assert_eq!(items[1].record["id"], json!("c"));
            }
            other => panic!("salida inesperada: {other:?}"),
        }
    }

    #[test]
    fn map_values_conserva_la_clave() {
        let mut reg = FnRegistry::with_builtins();
        reg.register_map("mas_uno", |v| Ok(json!(v.as_i64().unwrap_or(0) + 1)));
        let g = FlowGraph::new()
            .key_by(Extractor::field("k"), Extractor::field("v"))
            .unwrap()
            .map_values("mas_uno")
            .unwrap();

        let out = execute_partition(&g, &part(0, vec![json!({"k": "x", "v": 1})]), &reg, &CancelToken::new())
            .unwrap();
        assert_eq!(out, PartitionOutput::Records(vec![json!({"key": "x", "value": 2})]));
    }

    #[test]
    fn compilar_con_funcion_desconocida_falla() {
        let g = FlowGraph::new().filter("no_existe").unwrap();
        assert!(matches!(
            CompiledFlow::compile(&g, &FnRegistry::new()),
            Err(EngineError::InvalidStageComposition(_))
        ));
    }
}
