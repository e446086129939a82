use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Cantidad de registros que fueron al canal de errores.
pub const DATA_ERRORS_KEY: &str = "flow.dataerrors";
pub const RECORDS_IN_KEY: &str = "flow.records.in";
pub const RECORDS_OUT_KEY: &str = "flow.records.out";

/// Resultados de un job, o de toda la corrida una vez mezclados:
/// clave → lista de valores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobResults {
    values: BTreeMap<String, Vec<Value>>,
}

impl JobResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, value: Value) {
        self.values.entry(key.to_string()).or_default().push(value);
    }

    /// Concatena los valores de claves iguales.
    pub fn merge(&mut self, other: JobResults) {
        for (key, mut values) in other.values {
            self.values.entry(key).or_default().append(&mut values);
        }
    }

    pub fn get(&self, key: &str) -> Option<&[Value]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// Suma de los valores numéricos de una clave.
    pub fn total(&self, key: &str) -> u64 {
        self.get(key)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_u64)
            .sum()
    }

    pub fn data_errors(&self) -> u64 {
        self.total(DATA_ERRORS_KEY)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
