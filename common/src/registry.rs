use anyhow::anyhow;
use serde_json::{json, Value};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::record::{Record, Records};

pub type MapFn = Arc<dyn Fn(&Record) -> anyhow::Result<Record> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&Record) -> anyhow::Result<Records> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&Record) -> anyhow::Result<bool> + Send + Sync>;

/// Funciones con nombre a las que hacen referencia las etapas del grafo.
///
/// El grafo sólo guarda nombres (así se puede serializar, inspeccionar y
/// reenviar); los workers los resuelven contra este registro.
#[derive(Clone, Default)]
pub struct FnRegistry {
    maps: HashMap<String, MapFn>,
    flat_maps: HashMap<String, FlatMapFn>,
    filters: HashMap<String, FilterFn>,
}

impl fmt::Debug for FnRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut maps: Vec<&String> = self.maps.keys().collect();
        let mut flat_maps: Vec<&String> = self.flat_maps.keys().collect();
        let mut filters: Vec<&String> = self.filters.keys().collect();
        maps.sort();
        flat_maps.sort();
        filters.sort();
        f.debug_struct("FnRegistry")
            .field("maps", &maps)
            .field("flat_maps", &flat_maps)
            .field("filters", &filters)
            .finish()
    }
}

impl FnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con las funciones de uso común ya cargadas.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_map("identity", |r| Ok(r.clone()));
        reg.register_map("to_lower", |r| Ok(map_strings(r, |s| s.to_lowercase())));
        reg.register_map("trim", |r| Ok(map_strings(r, |s| s.trim().to_string())));
        reg.register_map("text", |r| {
            r.get("text")
                .cloned()
                .ok_or_else(|| anyhow!("registro sin campo \"text\""))
        });
        reg.register_flat_map("tokenize", |r| Ok(tokenize(r)));
        reg.register_filter("nonempty_token", |r| {
            Ok(r.get("token")
                .and_then(|v| v.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false))
        });
        reg.register_filter("not_null", |r| Ok(!r.is_null()));
        reg
    }

    pub fn register_map<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        self.maps.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn register_flat_map<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Record) -> anyhow::Result<Records> + Send + Sync + 'static,
    {
        self.flat_maps.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn register_filter<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Record) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn map(&self, name: &str) -> Option<MapFn> {
        self.maps.get(name).cloned()
    }

    pub fn flat_map(&self, name: &str) -> Option<FlatMapFn> {
        self.flat_maps.get(name).cloned()
    }

    pub fn filter(&self, name: &str) -> Option<FilterFn> {
        self.filters.get(name).cloned()
    }
}

/// Aplica `f` al registro si es string, o a cada campo string si es objeto.
fn map_strings(rec: &Record, f: impl Fn(&str) -> String) -> Record {
    match rec {
        Value::String(s) => Value::String(f(s)),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k.clone(), Value::String(f(s))),
                    other => (k.clone(), other.clone()),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// {"text": "..."} (o un string suelto) -> varios {"token": <palabra>, "count": 1}
fn tokenize(rec: &Record) -> Records {
    let text = match rec {
        Value::String(s) => s.as_str(),
        other => other.get("text").and_then(|v| v.as_str()).unwrap_or(""),
    };

    text.split_whitespace()
        .filter_map(|raw| {
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase();
            (!cleaned.is_empty()).then(|| json!({ "token": cleaned, "count": 1_u64 }))
        })
        .collect()
}
