use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::{
    chain::{Encoder, ErrorReporter, FunctionChain},
    dag::JobSpec,
    dfs::Dfs,
    engine::ExecutionEngine,
    error::{FlowError, Result},
    functions::{JobContext, ReduceFn, Values},
    job::{JobConfig, JobId, MapOutputKey},
    results::{JobResults, DATA_ERRORS_KEY, RECORDS_IN_KEY, RECORDS_OUT_KEY},
    scheduler::JobRunner,
    task::{Collector, ShuffleKey, TaskLogic},
};

/// Etapa de un job, usada en la ruta del canal de errores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Map,
    Reduce,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Map => "map",
            Stage::Reduce => "reduce",
        }
    }
}

/// Canal lateral de errores de datos de una etapa de un job.
///
/// Cada error va como una línea JSON a
/// `<workpath>/errors/job-<id>/<etapa>/<operación>`.
pub struct ErrorChannel {
    base: String,
    job_id: JobId,
    stage: Stage,
    dfs: Arc<dyn Dfs>,
    counter: Arc<AtomicU64>,
    write_lock: Mutex<()>,
}

impl ErrorChannel {
    pub fn new(spec: &JobSpec, stage: Stage, dfs: Arc<dyn Dfs>, counter: Arc<AtomicU64>) -> Self {
        Self {
            base: format!("{}/errors/job-{}/{}", spec.workpath, spec.id, stage.as_str()),
            job_id: spec.id,
            stage,
            dfs,
            counter,
            write_lock: Mutex::new(()),
        }
    }
}

impl ErrorReporter for ErrorChannel {
    fn report(&self, key: &str, value: &str, operation: &str, message: &str) {
        warn!(
            "job {} ({}): error de datos en '{}' con clave '{}': {}",
            self.job_id,
            self.stage.as_str(),
            operation,
            key,
            message
        );
        let line = json!({
            "key": key,
            "value": value,
            "operation": operation,
            "error": message,
        })
        .to_string();
        let path = format!("{}/{}", self.base, operation);

        {
            let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = self.dfs.append_line(&path, &line) {
                error!("no se pudo escribir el error de datos en {}: {}", path, e);
            }
        }
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cuenta lo que pasa por un collector.
struct Counting<'a> {
    inner: &'a mut dyn Collector,
    count: &'a AtomicU64,
}

impl Collector for Counting<'_> {
    fn collect(&mut self, key: ShuffleKey, value: String) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.inner.collect(key, value);
    }
}

/// Lógica por registro de un spec: lo que el engine ejecuta en cada tarea.
pub struct PipeJob {
    input_json: bool,
    passthrough: bool,
    map_chain: FunctionChain,
    reducer: Option<ReduceFn>,
    reduce_chain: FunctionChain,
    map_errors: ErrorChannel,
    reduce_errors: ErrorChannel,
    context: JobContext,
    data_errors: Arc<AtomicU64>,
    records_in: AtomicU64,
    map_out: AtomicU64,
    reduce_out: AtomicU64,
}

impl PipeJob {
    pub fn new(spec: &JobSpec, dfs: Arc<dyn Dfs>) -> Self {
        let has_reducer = spec.reducer.is_some();

        let map_encoder = if spec.secondary_sort {
            Encoder::SecondarySort
        } else if !has_reducer && !spec.output_json {
            Encoder::Raw
        } else {
            Encoder::Json
        };
        let reduce_encoder = if spec.output_json {
            Encoder::Json
        } else {
            Encoder::Raw
        };

        // texto crudo sólo puede ir directo a la salida o a un reducer si ya es JSON
        let passthrough = spec.pre_mappers.is_empty()
            && !spec.secondary_sort
            && (!has_reducer || spec.input_json);

        let data_errors = Arc::new(AtomicU64::new(0));
        Self {
            input_json: spec.input_json,
            passthrough,
            // la posición 0 es la decodificación de la entrada
            map_chain: FunctionChain::new(spec.pre_mappers.clone(), 1, map_encoder),
            reducer: spec.reducer.clone(),
            reduce_chain: FunctionChain::new(spec.post_mappers.clone(), 1, reduce_encoder),
            map_errors: ErrorChannel::new(spec, Stage::Map, Arc::clone(&dfs), Arc::clone(&data_errors)),
            reduce_errors: ErrorChannel::new(spec, Stage::Reduce, dfs, Arc::clone(&data_errors)),
            context: JobContext::new(spec.job_args.clone()),
            data_errors,
            records_in: AtomicU64::new(0),
            map_out: AtomicU64::new(0),
            reduce_out: AtomicU64::new(0),
        }
    }

    pub fn data_errors(&self) -> u64 {
        self.data_errors.load(Ordering::SeqCst)
    }

    /// Resultados que dejaron las funciones más los contadores del job.
    pub fn results(&self) -> JobResults {
        let mut results = self.context.results();
        let errors = self.data_errors();
        if errors > 0 {
            results.push(DATA_ERRORS_KEY, json!(errors));
        }
        let out = if self.reducer.is_some() {
            &self.reduce_out
        } else {
            &self.map_out
        };
        results.push(RECORDS_IN_KEY, json!(self.records_in.load(Ordering::SeqCst)));
        results.push(RECORDS_OUT_KEY, json!(out.load(Ordering::SeqCst)));
        results
    }
}

impl TaskLogic for PipeJob {
    fn map(&self, key: String, value: String, out: &mut dyn Collector) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
        let mut out = Counting {
            inner: out,
            count: &self.map_out,
        };

        if self.passthrough {
            out.collect(ShuffleKey::Text(key), value);
            return;
        }

        let decoded = if self.input_json {
            match serde_json::from_str::<Value>(&value) {
                Ok(v) => v,
                Err(e) => {
                    self.map_errors
                        .report(&key, &value, "decode-0", &e.to_string());
                    return;
                }
            }
        } else {
            Value::String(value)
        };

        self.map_chain
            .call(&key, &decoded, &self.context, &mut out, &self.map_errors);
    }

    fn reduce(&self, key: &str, values: &mut dyn Iterator<Item = String>, out: &mut dyn Collector) {
        let mut out = Counting {
            inner: out,
            count: &self.reduce_out,
        };

        let Some(reducer) = &self.reducer else {
            for v in values {
                out.collect(ShuffleKey::Text(key.to_string()), v);
            }
            return;
        };

        let operation = format!("{}-0", reducer.name());
        let errors = &self.reduce_errors;
        let decoded: Values<'_> = Box::new(values.filter_map(|raw| {
            match serde_json::from_str::<Value>(&raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.report(key, &raw, &operation, &e.to_string());
                    None
                }
            }
        }));

        match reducer.call_in(key, decoded, &self.context) {
            Ok(emitted) => {
                for (k, v) in emitted {
                    self.reduce_chain.call(&k, &v, &self.context, &mut out, errors);
                }
            }
            Err(e) => errors.report(key, "<valores>", &operation, &format!("{e:#}")),
        }
    }
}

/// Convierte cada spec en un job del engine y lo corre.
pub struct JobExecutor {
    session_name: String,
    engine: Arc<dyn ExecutionEngine>,
    dfs: Arc<dyn Dfs>,
}

impl JobExecutor {
    pub fn new(session_name: String, engine: Arc<dyn ExecutionEngine>, dfs: Arc<dyn Dfs>) -> Self {
        Self {
            session_name,
            engine,
            dfs,
        }
    }

    /// `<sesión> <id> <funciones separadas por ->`
    pub fn job_name(&self, spec: &JobSpec) -> String {
        format!(
            "{} {} {}",
            self.session_name,
            spec.id,
            spec.function_names().join("-")
        )
        .trim_end()
        .to_string()
    }

    pub fn job_config(&self, spec: &JobSpec) -> JobConfig {
        JobConfig {
            name: self.job_name(spec),
            input_paths: spec.input_paths.clone(),
            input_format: spec.input_format,
            output_path: spec.resolved_output(),
            output_format: spec.output_format,
            compression: spec.compression,
            map_output_key: if spec.secondary_sort {
                MapOutputKey::TextInt
            } else {
                MapOutputKey::Text
            },
            reduce_tasks: if spec.reducer.is_none() { Some(0) } else { None },
            speculative_execution: false,
            job_args: spec.job_args.clone(),
        }
    }

    pub fn execute(&self, spec: &JobSpec) -> Result<JobResults> {
        let config = self.job_config(spec);
        if config.input_paths.is_empty() {
            return Err(FlowError::config(format!(
                "el job '{}' no tiene rutas de entrada",
                config.name
            )));
        }

        if self.dfs.exists(&config.output_path) {
            if let Ok(modified) = self.dfs.modified(&config.output_path) {
                debug!(
                    "se borra la salida previa {} (modificada {})",
                    config.output_path,
                    DateTime::<Local>::from(modified).format("%Y-%m-%d %H:%M:%S")
                );
            }
            self.dfs.delete(&config.output_path)?;
        }

        info!(
            "job '{}': {} entrada(s) -> {}",
            config.name,
            config.input_paths.len(),
            config.output_path
        );
        let job = PipeJob::new(spec, Arc::clone(&self.dfs));
        let report = self.engine.run_job(&config, &job)?;
        if !report.succeeded() {
            return Err(FlowError::job(
                &config.name,
                report
                    .message
                    .unwrap_or_else(|| "el engine no reportó éxito".to_string()),
            ));
        }

        let results = job.results();
        info!(
            "job '{}' terminado: {} map(s), {} reduce(s), {} registro(s) leídos, {} error(es) de datos",
            config.name,
            report.map_tasks,
            report.reduce_tasks,
            results.total(RECORDS_IN_KEY),
            job.data_errors()
        );
        Ok(results)
    }
}

impl JobRunner for JobExecutor {
    fn run_job(&self, spec: &JobSpec) -> Result<JobResults> {
        self.execute(spec)
    }
}
