use std::{
    cell::RefCell,
    fmt,
    path::Path,
    sync::Arc,
};

use chrono::Local;
use tracing::{error, info, warn};

use crate::{
    compiler,
    config::FlowConfig,
    dag::JobGraph,
    dfs::{Dfs, LocalFs},
    engine::{ExecutionEngine, LocalEngine},
    error::{FlowError, Result},
    executor::JobExecutor,
    functions::{MapFn, ReduceFn},
    graph::{LineageGraph, PipeId, PipeKind, SinkOptions, SourceOptions},
    job::InputFormat,
    registry::OperationRegistry,
    results::JobResults,
    scheduler::Scheduler,
};

/// Sesión: dueña del grafo de linaje, del registro de operaciones y del
/// directorio de trabajo de una corrida.
pub struct Session {
    name: String,
    workpath: String,
    config: FlowConfig,
    graph: RefCell<LineageGraph>,
    registry: OperationRegistry,
    engine: Arc<dyn ExecutionEngine>,
    dfs: Arc<dyn Dfs>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("workpath", &self.workpath)
            .field("pipes", &self.graph.borrow().len())
            .finish()
    }
}

impl Session {
    /// Sesión con configuración tomada de las env vars.
    pub fn new(name: &str) -> Self {
        Self::with_config(name, FlowConfig::from_env())
    }

    /// El directorio de trabajo es `<work_root>/<name>-<yyMMdd-HHmmss>`.
    pub fn with_config(name: &str, config: FlowConfig) -> Self {
        let stamp = Local::now().format("%y%m%d-%H%M%S");
        let workpath = config
            .work_root
            .join(format!("{name}-{stamp}"))
            .to_string_lossy()
            .to_string();
        let dfs: Arc<dyn Dfs> = Arc::new(LocalFs);
        let engine: Arc<dyn ExecutionEngine> =
            Arc::new(LocalEngine::from_config(&config, Arc::clone(&dfs)));

        Self {
            name: name.to_string(),
            workpath,
            config,
            graph: RefCell::new(LineageGraph::new()),
            registry: OperationRegistry::new(),
            engine,
            dfs,
        }
    }

    pub fn with_workpath(mut self, workpath: impl AsRef<Path>) -> Self {
        self.workpath = workpath.as_ref().to_string_lossy().to_string();
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_dfs(mut self, dfs: Arc<dyn Dfs>) -> Self {
        self.dfs = dfs;
        self
    }

    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workpath(&self) -> &str {
        &self.workpath
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut OperationRegistry {
        &mut self.registry
    }

    /// Crea un source con las rutas dadas (admiten glob).
    pub fn source<I, S>(&self, paths: I, format: InputFormat, json: bool) -> Pipe<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_with(
            paths,
            SourceOptions {
                format,
                json,
                ..SourceOptions::default()
            },
        )
    }

    pub fn source_with<I, S>(&self, paths: I, options: SourceOptions) -> Pipe<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        let id = self.graph.borrow_mut().add_source(paths, options);
        Pipe { session: self, id }
    }

    fn add_pipe(&self, kind: PipeKind, upstream: Vec<PipeId>) -> Result<Pipe<'_>> {
        let id = self.graph.borrow_mut().add(kind, upstream)?;
        Ok(Pipe { session: self, id })
    }

    /// Compila y linkea el grafo sin ejecutar nada.
    pub fn plan(&self) -> Result<JobGraph> {
        let graph = self.graph.borrow();
        let mut jobs = compiler::compile(&graph, &self.workpath)?;
        jobs.link();
        jobs.validate()?;
        Ok(jobs)
    }

    /// Compila, borra el directorio de trabajo y corre todos los jobs.
    pub fn run(&self) -> Result<JobResults> {
        let jobs = self.plan()?;
        info!(
            "sesión '{}': {} pipe(s) compiladas a {} job(s), directorio de trabajo {}",
            self.name,
            self.graph.borrow().len(),
            jobs.len(),
            self.workpath
        );
        for spec in jobs.specs() {
            info!(
                "  job {} [{}] padres={:?} entradas={:?} salida={}",
                spec.id,
                spec.function_names().join(", "),
                spec.parents,
                spec.input_paths,
                spec.resolved_output()
            );
        }

        self.dfs.delete(&self.workpath)?;

        let executor = JobExecutor::new(
            self.name.clone(),
            Arc::clone(&self.engine),
            Arc::clone(&self.dfs),
        );
        let scheduler = Scheduler::new(self.config.max_in_flight, self.config.poll_interval);
        let results = scheduler.run(jobs, Arc::new(executor))?;

        if self.has_errors() {
            error!(
                "hubo errores de datos; ver {}",
                self.errors_path()
            );
        }
        Ok(results)
    }

    pub fn errors_path(&self) -> String {
        format!("{}/errors", self.workpath)
    }

    pub fn has_errors(&self) -> bool {
        self.dfs.exists(&self.errors_path())
    }

    /// Borra el directorio de trabajo salvo que haya errores de datos.
    pub fn cleanup(&self) -> Result<()> {
        if self.has_errors() {
            warn!(
                "se conserva {} porque contiene errores de datos",
                self.workpath
            );
            return Ok(());
        }
        self.dfs.delete(&self.workpath)
    }
}

/// Handle liviano a una pipe del grafo de una sesión.
#[derive(Clone, Copy)]
pub struct Pipe<'s> {
    session: &'s Session,
    id: PipeId,
}

impl fmt::Debug for Pipe<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipe({})", self.id)
    }
}

impl<'s> Pipe<'s> {
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    fn upstream(&self, sources: &[Pipe<'s>]) -> Result<Vec<PipeId>> {
        let mut ids = Vec::with_capacity(sources.len() + 1);
        ids.push(self.id);
        for other in sources {
            if !std::ptr::eq(self.session, other.session) {
                return Err(FlowError::config(format!(
                    "{} pertenece a otra sesión",
                    other.id
                )));
            }
            ids.push(other.id);
        }
        Ok(ids)
    }

    pub fn map(&self, mapper: MapFn) -> Result<Pipe<'s>> {
        self.map_with(mapper, &[])
    }

    /// Mapper cuyos orígenes son esta pipe más `sources`.
    pub fn map_with(&self, mapper: MapFn, sources: &[Pipe<'s>]) -> Result<Pipe<'s>> {
        let upstream = self.upstream(sources)?;
        self.session
            .add_pipe(PipeKind::Mapper { mapper }, upstream)
    }

    pub fn reduce(&self, reducer: ReduceFn) -> Result<Pipe<'s>> {
        self.reduce_with(reducer, &[], false)
    }

    pub fn reduce_with(
        &self,
        reducer: ReduceFn,
        sources: &[Pipe<'s>],
        secondary_sort: bool,
    ) -> Result<Pipe<'s>> {
        let upstream = self.upstream(sources)?;
        self.session.add_pipe(
            PipeKind::Reducer {
                reducer,
                secondary_sort,
            },
            upstream,
        )
    }

    pub fn sink(&self, path: &str) -> Result<Pipe<'s>> {
        self.sink_with(path, SinkOptions::default())
    }

    pub fn sink_with(&self, path: &str, options: SinkOptions) -> Result<Pipe<'s>> {
        self.session.add_pipe(
            PipeKind::Sink {
                path: path.to_string(),
                options,
            },
            vec![self.id],
        )
    }

    /// Aplica una operación registrada por nombre.
    pub fn op(&self, name: &str, sources: &[Pipe<'s>]) -> Result<Pipe<'s>> {
        let operation = self
            .session
            .registry
            .get(name)
            .ok_or_else(|| FlowError::config(format!("operación desconocida: '{name}'")))?;
        operation.apply(self, sources)
    }

    /// Atajo para correr toda la sesión desde cualquier pipe.
    pub fn run(&self) -> Result<JobResults> {
        self.session.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::OutputFormat,
        registry::Operation,
        results::{DATA_ERRORS_KEY, RECORDS_IN_KEY},
    };
    use serde_json::json;
    use std::{env, fs, path::PathBuf, time::Duration};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("session_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn test_session(name: &str, tmp: &Path) -> Session {
        let config = FlowConfig {
            poll_interval: Duration::from_millis(10),
            work_root: tmp.to_path_buf(),
            reduce_tasks: 2,
            ..FlowConfig::default()
        };
        Session::with_config(name, config).with_workpath(tmp.join("work"))
    }

    fn identity(name: &str) -> MapFn {
        MapFn::new(name, |k, v| Ok(vec![(k.to_string(), v.clone())]))
    }

    fn read_lines(dir: &Path) -> Vec<String> {
        let mut lines = Vec::new();
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("part-"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        for f in files {
            lines.extend(fs::read_to_string(f).unwrap().lines().map(String::from));
        }
        lines
    }

    #[test]
    fn workpath_por_defecto_usa_nombre_y_fecha() {
        let tmp = temp_dir("workpath");
        let config = FlowConfig {
            work_root: tmp.clone(),
            ..FlowConfig::default()
        };
        let session = Session::with_config("wc", config);
        let dir = Path::new(session.workpath()).file_name().unwrap().to_str().unwrap().to_string();

        assert!(dir.starts_with("wc-"));
        assert_eq!(dir.len(), "wc-".len() + "yyMMdd-HHmmss".len());
    }

    #[test]
    fn encadenar_sobre_sink_falla() {
        let tmp = temp_dir("sink_misuse");
        let session = test_session("misuse", &tmp);
        let out = session
            .source(["in.txt"], InputFormat::Text, false)
            .sink("out")
            .unwrap();

        assert!(matches!(out.map(identity("m")), Err(FlowError::Config(_))));
        assert!(matches!(out.sink("otra"), Err(FlowError::Config(_))));
    }

    #[test]
    fn pipes_de_otra_sesion_se_rechazan() {
        let tmp = temp_dir("other_session");
        let a = test_session("a", &tmp);
        let b = test_session("b", &tmp);
        let pa = a.source(["x"], InputFormat::Text, false);
        let pb = b.source(["y"], InputFormat::Text, false);

        assert!(matches!(pa.map_with(identity("m"), &[pb]), Err(FlowError::Config(_))));
    }

    #[test]
    fn op_aplica_operacion_registrada_o_falla_si_no_existe() {
        let tmp = temp_dir("op");
        let mut registry = OperationRegistry::new();
        registry
            .register("passthrough", Operation::Map(identity("passthrough")))
            .unwrap();
        let session = test_session("op", &tmp).with_registry(registry);

        let src = session.source(["in.txt"], InputFormat::Text, false);
        let mapped = src.op("passthrough", &[]).unwrap();
        mapped.sink("out").unwrap();

        let plan = session.plan().unwrap();
        assert_eq!(plan.spec(0).function_names(), vec!["passthrough"]);
        assert!(matches!(src.op("no-existe", &[]), Err(FlowError::Config(_))));
    }

    #[test]
    fn plan_es_determinista() {
        let tmp = temp_dir("plan_det");
        let session = test_session("det", &tmp);
        let src = session.source(["in.txt"], InputFormat::Text, false);
        let shared = src.map(identity("shared")).unwrap();
        shared.map(identity("a")).unwrap().sink("a").unwrap();
        shared.map(identity("b")).unwrap().sink("b").unwrap();

        let first = session.plan().unwrap().summaries();
        let second = session.plan().unwrap().summaries();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn un_registro_malo_no_tumba_el_job() {
        let tmp = temp_dir("fault_isolation");
        let input = tmp.join("numbers.txt");
        fs::write(&input, "1\n2\nboom\n4\n5\n").unwrap();
        let out = tmp.join("out");

        let session = test_session("faults", &tmp);
        let parse = MapFn::new("parse", |_k, v| {
            let text = v.as_str().unwrap_or_default();
            let n: i64 = text.parse()?;
            Ok(vec![(text.to_string(), json!(n * 10))])
        });
        session
            .source([input.to_str().unwrap()], InputFormat::Text, false)
            .map(parse)
            .unwrap()
            .sink_with(
                out.to_str().unwrap(),
                SinkOptions {
                    format: OutputFormat::Text,
                    json: false,
                    compression: None,
                },
            )
            .unwrap();

        let results = session.run().unwrap();

        let mut lines = read_lines(&out);
        lines.sort();
        assert_eq!(lines, vec!["1\t10", "2\t20", "4\t40", "5\t50"]);
        assert_eq!(results.get(DATA_ERRORS_KEY), Some(&[json!(1)][..]));
        assert_eq!(results.total(RECORDS_IN_KEY), 5);

        let error_file = tmp.join("work/errors/job-0/map/parse-1");
        let content = fs::read_to_string(error_file).unwrap();
        let entries: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["value"], json!("boom"));
        assert_eq!(entries[0]["operation"], json!("parse-1"));
        assert!(session.has_errors());
    }

    #[test]
    fn wordcount_con_fan_out_corre_tres_etapas() {
        let tmp = temp_dir("wordcount_fan_out");
        let input = tmp.join("lines.txt");
        fs::write(&input, "a b a\nc a b\n").unwrap();
        let all = tmp.join("all");
        let frequent = tmp.join("frequent");

        let session = test_session("wc", &tmp);
        let tokenize = MapFn::new("tokenize", |_k, v| {
            Ok(v.as_str()
                .unwrap_or_default()
                .split_whitespace()
                .map(|w| (w.to_string(), json!(1)))
                .collect())
        });
        let count = ReduceFn::new("count", |k, values| {
            let total: i64 = values.filter_map(|v| v.as_i64()).sum();
            Ok(vec![(k.to_string(), json!(total))])
        });
        let at_least_two = MapFn::new("at_least_two", |k, v| {
            Ok(if v.as_i64().unwrap_or(0) >= 2 {
                vec![(k.to_string(), v.clone())]
            } else {
                vec![]
            })
        });
        let text = SinkOptions {
            format: OutputFormat::Text,
            json: true,
            compression: None,
        };

        let counts = session
            .source([input.to_str().unwrap()], InputFormat::Text, false)
            .map(tokenize)
            .unwrap()
            .reduce(count)
            .unwrap();
        counts.sink_with(all.to_str().unwrap(), text.clone()).unwrap();
        counts
            .map(at_least_two)
            .unwrap()
            .sink_with(frequent.to_str().unwrap(), text)
            .unwrap();

        session.run().unwrap();

        let mut all_lines = read_lines(&all);
        all_lines.sort();
        assert_eq!(all_lines, vec!["a\t3", "b\t2", "c\t1"]);

        let mut frequent_lines = read_lines(&frequent);
        frequent_lines.sort();
        assert_eq!(frequent_lines, vec!["a\t3", "b\t2"]);
        assert!(!session.has_errors());

        session.cleanup().unwrap();
        assert!(!Path::new(session.workpath()).exists());
    }

    fn raw_text_sink() -> SinkOptions {
        SinkOptions {
            format: OutputFormat::Text,
            json: false,
            compression: None,
        }
    }

    #[test]
    fn reduce_directo_sobre_texto_crudo_no_pierde_registros() {
        let tmp = temp_dir("reduce_raw_text");
        let input = tmp.join("in.txt");
        fs::write(&input, "hola\nmundo\nhola\n").unwrap();
        let out = tmp.join("out");

        let session = test_session("raw_reduce", &tmp);
        let join_values = ReduceFn::new("join_values", |k, values| {
            let words: Vec<String> = values
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect();
            Ok(vec![(k.to_string(), json!(words.join(",")))])
        });
        session
            .source([input.to_str().unwrap()], InputFormat::Text, false)
            .reduce(join_values)
            .unwrap()
            .sink_with(out.to_str().unwrap(), raw_text_sink())
            .unwrap();

        let results = session.run().unwrap();

        let mut lines = read_lines(&out);
        lines.sort();
        assert_eq!(lines, vec!["0\thola", "11\thola", "5\tmundo"]);
        assert_eq!(results.data_errors(), 0);
        assert!(!session.has_errors());
    }

    #[test]
    fn fan_out_desde_un_sink_crudo_se_relee_como_texto() {
        let tmp = temp_dir("fan_out_raw_sink");
        let input = tmp.join("in.txt");
        fs::write(&input, "hola\nmundo\n").unwrap();
        let a = tmp.join("a");
        let b = tmp.join("b");

        let session = test_session("raw_fan_out", &tmp);
        let upper = MapFn::new("upper", |k, v| {
            Ok(vec![(k.to_string(), json!(v.as_str().unwrap_or_default().to_uppercase()))])
        });
        let shared = session
            .source([input.to_str().unwrap()], InputFormat::Text, false)
            .map(upper)
            .unwrap();
        shared.sink_with(a.to_str().unwrap(), raw_text_sink()).unwrap();
        shared
            .map(identity("ident"))
            .unwrap()
            .sink_with(b.to_str().unwrap(), raw_text_sink())
            .unwrap();

        let plan = session.plan().unwrap();
        assert_eq!(plan.len(), 2);
        assert!(!plan.spec(1).input_json);

        let results = session.run().unwrap();
        assert_eq!(results.data_errors(), 0);

        let mut a_lines = read_lines(&a);
        a_lines.sort();
        let mut b_lines = read_lines(&b);
        b_lines.sort();
        assert_eq!(a_lines, vec!["0\tHOLA", "5\tMUNDO"]);
        assert_eq!(b_lines, a_lines);
    }

    #[test]
    fn contadores_de_las_funciones_llegan_al_resultado_de_la_corrida() {
        let tmp = temp_dir("user_counters");
        let input = tmp.join("in.txt");
        fs::write(&input, "a\nb\nc\n").unwrap();
        let first = tmp.join("first");
        let second = tmp.join("second");

        let session = test_session("counters", &tmp);
        let mark = |name: &str| {
            MapFn::with_context(name, |k, v, ctx| {
                ctx.increment("vistos", 1);
                Ok(vec![(k.to_string(), v.clone())])
            })
        };
        let text = SinkOptions {
            format: OutputFormat::Text,
            json: true,
            compression: None,
        };
        let marked = session
            .source([input.to_str().unwrap()], InputFormat::Text, false)
            .map(mark("primero"))
            .unwrap();
        marked.sink_with(first.to_str().unwrap(), text.clone()).unwrap();
        marked
            .map(mark("segundo"))
            .unwrap()
            .sink_with(second.to_str().unwrap(), text)
            .unwrap();

        let results = session.run().unwrap();

        assert_eq!(results.get("vistos"), Some(&[json!(3), json!(3)][..]));
        assert_eq!(results.total(RECORDS_IN_KEY), 6);
    }
}
