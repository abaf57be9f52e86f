use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use crate::error::{EngineError, EngineResult};
use crate::flow::{Aggregation, SortOrder};
use crate::record::{compare_values, Record, Records};

/// Registro candidato a top-k, con su posición de entrada para desempatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranked {
    pub sort_key: Value,
    pub partition: u32,
    pub offset: u64,
    pub record: Record,
}

fn rank_cmp(order: SortOrder, a: &Ranked, b: &Ranked) -> Ordering {
    let by_key = compare_values(&a.sort_key, &b.sort_key);
    let by_key = match order {
        SortOrder::Ascending => by_key,
        SortOrder::Descending => by_key.reverse(),
    };
    // empate: primero la partición, luego el orden original dentro de ella
    by_key
        .then(a.partition.cmp(&b.partition))
        .then(a.offset.cmp(&b.offset))
}

fn sort_and_truncate(items: &mut Vec<Ranked>, k: usize, order: SortOrder) {
    items.sort_by(|a, b| rank_cmp(order, a, b));
    items.truncate(k);
}

/// Estado de agregación de una partición (o de varias ya combinadas).
///
/// `merge` es asociativo y conmutativo: el orden en que terminan las
/// particiones no cambia el resultado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Accumulator {
    Count { n: u64 },
    Sum { total: f64 },
    SumByKey { sums: BTreeMap<String, f64> },
    CountByKey { counts: BTreeMap<String, u64> },
    AverageByKey { stats: BTreeMap<String, (f64, u64)> },
    Distinct { seen: BTreeSet<String> },
    TopK { k: usize, order: SortOrder, items: Vec<Ranked> },
}

impl Accumulator {
    /// Elemento neutro para una agregación.
    pub fn empty(agg: &Aggregation) -> Self {
        match agg {
            Aggregation::Count => Accumulator::Count { n: 0 },
            Aggregation::Sum { .. } => Accumulator::Sum { total: 0.0 },
            Aggregation::SumByKey => Accumulator::SumByKey {
                sums: BTreeMap::new(),
            },
            Aggregation::CountByKey => Accumulator::CountByKey {
                counts: BTreeMap::new(),
            },
            Aggregation::AverageByKey => Accumulator::AverageByKey {
                stats: BTreeMap::new(),
            },
            Aggregation::DistinctCount { .. } => Accumulator::Distinct {
                seen: BTreeSet::new(),
            },
            Aggregation::TopK { k, order, .. } => Accumulator::TopK {
                k: *k,
                order: *order,
                items: Vec::new(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Accumulator::Count { .. } => "count",
            Accumulator::Sum { .. } => "sum",
            Accumulator::SumByKey { .. } => "sum_by_key",
            Accumulator::CountByKey { .. } => "count_by_key",
            Accumulator::AverageByKey { .. } => "average_by_key",
            Accumulator::Distinct { .. } => "distinct_count",
            Accumulator::TopK { .. } => "top_k",
        }
    }

    pub fn add_one(&mut self) {
        if let Accumulator::Count { n } = self {
            *n += 1;
        }
    }

    pub fn add_number(&mut self, x: f64) {
        if let Accumulator::Sum { total } = self {
            *total += x;
        }
    }

    /// Agrega un par ya convertido: la clave canónica y, si hace falta, su valor numérico.
    pub fn add_keyed(&mut self, key: String, value: f64) {
        match self {
            Accumulator::SumByKey { sums } => *sums.entry(key).or_insert(0.0) += value,
            Accumulator::CountByKey { counts } => *counts.entry(key).or_insert(0) += 1,
            Accumulator::AverageByKey { stats } => {
                let e = stats.entry(key).or_insert((0.0, 0));
                e.0 += value;
                e.1 += 1;
            }
            _ => {}
        }
    }

    pub fn add_distinct(&mut self, value: String) {
        if let Accumulator::Distinct { seen } = self {
            seen.insert(value);
        }
    }

    pub fn add_ranked(&mut self, item: Ranked) {
        if let Accumulator::TopK { k, order, items } = self {
            items.push(item);
            // recorte amortizado: sólo cuando la lista duplica k
            if items.len() >= k.saturating_mul(2).max(16) {
                sort_and_truncate(items, *k, *order);
            }
        }
    }

    /// Deja el top-k local ordenado y truncado.
    pub fn compact(mut self) -> Self {
        if let Accumulator::TopK { k, order, items } = &mut self {
            sort_and_truncate(items, *k, *order);
        }
        self
    }

    /// Combina dos acumuladores del mismo tipo.
    pub fn merge(self, other: Accumulator) -> EngineResult<Accumulator> {
        use Accumulator::*;

        match (self, other) {
            (Count { n: a }, Count { n: b }) => Ok(Count { n: a + b }),
            (Sum { total: a }, Sum { total: b }) => Ok(Sum { total: a + b }),
            (SumByKey { sums: mut a }, SumByKey { sums: b }) => {
                for (k, v) in b {
                    *a.entry(k).or_insert(0.0) += v;
                }
                Ok(SumByKey { sums: a })
            }
            (CountByKey { counts: mut a }, CountByKey { counts: b }) => {
                for (k, v) in b {
                    *a.entry(k).or_insert(0) += v;
                }
                Ok(CountByKey { counts: a })
            }
            (AverageByKey { stats: mut a }, AverageByKey { stats: b }) => {
                for (k, (sum, count)) in b {
                    let e = a.entry(k).or_insert((0.0, 0));
                    e.0 += sum;
                    e.1 += count;
                }
                Ok(AverageByKey { stats: a })
            }
            (Distinct { seen: mut a }, Distinct { seen: b }) => {
                a.extend(b);
                Ok(Distinct { seen: a })
            }
            (
                TopK {
                    k: ka,
                    order: oa,
                    items: mut a,
                },
                TopK {
                    k: kb,
                    order: ob,
                    items: b,
                },
            ) if ka == kb && oa == ob => {
                a.extend(b);
                sort_and_truncate(&mut a, ka, oa);
                Ok(TopK {
                    k: ka,
                    order: oa,
                    items: a,
                })
            }
            (left, right) => Err(EngineError::IncompatibleAccumulators {
                left: describe(&left),
                right: describe(&right),
            }),
        }
    }

    /// Resultado final de la agregación.
    pub fn finish(self) -> AggregateResult {
        match self {
            Accumulator::Count { n } => AggregateResult::Count(n),
            Accumulator::Sum { total } => AggregateResult::Sum(total),
            Accumulator::SumByKey { sums } => AggregateResult::ByKey(sums),
            Accumulator::CountByKey { counts } => AggregateResult::Counts(counts),
            Accumulator::AverageByKey { stats } => AggregateResult::ByKey(
                stats
                    .into_iter()
                    .filter(|(_, (_, count))| *count > 0)
                    .map(|(k, (sum, count))| (k, sum / count as f64))
                    .collect(),
            ),
            Accumulator::Distinct { seen } => AggregateResult::Distinct(seen.len() as u64),
            Accumulator::TopK { k, order, mut items } => {
                sort_and_truncate(&mut items, k, order);
                AggregateResult::Ranked(items.into_iter().map(|r| r.record).collect())
            }
        }
    }
}

fn describe(acc: &Accumulator) -> String {
    match acc {
        Accumulator::TopK { k, order, .. } => format!("top_k(k={k}, {order:?})"),
        other => other.kind().to_string(),
    }
}

/// Combina acumuladores por reducción en árbol (de a pares).
/// Devuelve `None` si la lista está vacía.
pub fn merge_all(accs: Vec<Accumulator>) -> EngineResult<Option<Accumulator>> {
    let mut level = accs;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(a.merge(b)?),
                None => next.push(a),
            }
        }
        level = next;
    }
    Ok(level.pop())
}

/// Resultado global de una agregación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AggregateResult {
    Count(u64),
    Sum(f64),
    /// sum_by_key / average_by_key
    ByKey(BTreeMap<String, f64>),
    Counts(BTreeMap<String, u64>),
    Distinct(u64),
    /// top-k ya ordenado
    Ranked(Records),
}

impl AggregateResult {
    /// Pares (etiqueta, valor) en orden, para quien vaya a graficarlos.
    pub fn to_pairs(&self) -> Vec<(String, Value)> {
        match self {
            AggregateResult::Count(n) => vec![("count".to_string(), json!(n))],
            AggregateResult::Sum(x) => vec![("sum".to_string(), json!(x))],
            AggregateResult::ByKey(m) => m.iter().map(|(k, v)| (k.clone(), json!(v))).collect(),
            AggregateResult::Counts(m) => m.iter().map(|(k, v)| (k.clone(), json!(v))).collect(),
            AggregateResult::Distinct(n) => vec![("distinct".to_string(), json!(n))],
            AggregateResult::Ranked(recs) => recs
                .iter()
                .enumerate()
                .map(|(i, r)| ((i + 1).to_string(), r.clone()))
                .collect(),
        }
    }

    /// Representación como registros (para persistir un resultado agregado).
    pub fn to_records(&self) -> Records {
        match self {
            AggregateResult::Ranked(recs) => recs.clone(),
            other => other
                .to_pairs()
                .into_iter()
                .map(|(k, v)| crate::record::pair(json!(k), v))
                .collect(),
        }
    }
}
