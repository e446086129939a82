use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use crate::results::JobResults;

/// Pares (clave, valor) emitidos por una función para un registro.
pub type Emitted = Vec<(String, Value)>;

/// Iterador de valores que recibe un reducer para una clave.
pub type Values<'a> = Box<dyn Iterator<Item = Value> + 'a>;

type MapBody = dyn Fn(&str, &Value, &JobContext) -> anyhow::Result<Emitted> + Send + Sync;
type ReduceBody =
    dyn for<'a> Fn(&str, Values<'a>, &JobContext) -> anyhow::Result<Emitted> + Send + Sync;

fn map_body<F>(f: F) -> Arc<MapBody>
where
    F: Fn(&str, &Value, &JobContext) -> anyhow::Result<Emitted> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn reduce_body<F>(f: F) -> Arc<ReduceBody>
where
    F: for<'a> Fn(&str, Values<'a>, &JobContext) -> anyhow::Result<Emitted> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Lo que una función ve del job que la está corriendo: los argumentos del
/// job y un lugar donde dejar resultados propios.
///
/// Los resultados se juntan con los contadores del job y se mezclan con los
/// de los demás jobs al final de la corrida. Las tareas de un job corren en
/// paralelo, así que todo pasa por un mutex.
#[derive(Debug, Default)]
pub struct JobContext {
    args: BTreeMap<String, String>,
    values: Mutex<JobResults>,
    counters: Mutex<BTreeMap<String, i64>>,
}

impl JobContext {
    pub fn new(args: BTreeMap<String, String>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    /// Agrega un valor a la lista de `key`.
    pub fn record(&self, key: &str, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(key, value);
    }

    /// Suma `by` al contador `key`; el job reporta un único valor por contador.
    pub fn increment(&self, key: &str, by: i64) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_insert(0) += by;
    }

    pub fn results(&self) -> JobResults {
        let mut results = self
            .values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        for (key, total) in counters.iter() {
            results.push(key, Value::from(*total));
        }
        results
    }
}

/// Función map con nombre: recibe un registro y emite cero, uno o muchos pares.
///
/// El nombre se usa para armar el nombre del job y para etiquetar los
/// errores de datos en el canal de errores.
#[derive(Clone)]
pub struct MapFn {
    name: Arc<str>,
    body: Arc<MapBody>,
}

impl MapFn {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&str, &Value) -> anyhow::Result<Emitted> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            body: map_body(move |key, value, _ctx| f(key, value)),
        }
    }

    /// Igual que `new`, pero la función recibe el contexto del job.
    pub fn with_context<F>(name: &str, f: F) -> Self
    where
        F: Fn(&str, &Value, &JobContext) -> anyhow::Result<Emitted> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            body: map_body(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Llama a la función fuera de un job, con un contexto vacío.
    pub fn call(&self, key: &str, value: &Value) -> anyhow::Result<Emitted> {
        self.call_in(key, value, &JobContext::default())
    }

    pub fn call_in(&self, key: &str, value: &Value, ctx: &JobContext) -> anyhow::Result<Emitted> {
        (self.body)(key, value, ctx)
    }

    /// true si ambas envuelven exactamente la misma implementación.
    pub fn same_as(&self, other: &MapFn) -> bool {
        self.name == other.name
            && std::ptr::eq(
                Arc::as_ptr(&self.body) as *const (),
                Arc::as_ptr(&other.body) as *const (),
            )
    }
}

impl fmt::Debug for MapFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MapFn({})", self.name)
    }
}

/// Función reduce con nombre: recibe la clave y un iterador con sus valores.
#[derive(Clone)]
pub struct ReduceFn {
    name: Arc<str>,
    body: Arc<ReduceBody>,
}

impl ReduceFn {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&str, Values<'a>) -> anyhow::Result<Emitted> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            body: reduce_body(move |key, values, _ctx| f(key, values)),
        }
    }

    pub fn with_context<F>(name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&str, Values<'a>, &JobContext) -> anyhow::Result<Emitted>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: Arc::from(name),
            body: reduce_body(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, key: &str, values: Values<'_>) -> anyhow::Result<Emitted> {
        self.call_in(key, values, &JobContext::default())
    }

    pub fn call_in(
        &self,
        key: &str,
        values: Values<'_>,
        ctx: &JobContext,
    ) -> anyhow::Result<Emitted> {
        (self.body)(key, values, ctx)
    }

    pub fn same_as(&self, other: &ReduceFn) -> bool {
        self.name == other.name
            && std::ptr::eq(
                Arc::as_ptr(&self.body) as *const (),
                Arc::as_ptr(&other.body) as *const (),
            )
    }
}

impl fmt::Debug for ReduceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReduceFn({})", self.name)
    }
}
