use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::hash_map::DefaultHasher,
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::FlowConfig,
    dfs::Dfs,
    error::{FlowError, Result},
    job::{Compression, EngineReport, InputFormat, JobConfig, JobStatus, OutputFormat},
    task::{Collector, ShuffleKey, TaskLogic},
};

/// Motor que ejecuta un job completo: lee entradas, corre las tareas map,
/// hace shuffle/sort y corre las tareas reduce.
pub trait ExecutionEngine: Send + Sync {
    /// Bloquea hasta que el job termina. Un fallo del job se informa en el
    /// reporte; `Err` queda para problemas de configuración.
    fn run_job(&self, config: &JobConfig, logic: &dyn TaskLogic) -> Result<EngineReport>;
}

/// Engine en proceso sobre el filesystem local.
///
/// Una tarea map por archivo de entrada, particiones de shuffle en disco
/// (JSONL por partición) y una tarea reduce por partición. Las tareas corren
/// en hilos con a lo sumo `task_concurrency` a la vez. La salida se arma en
/// un directorio de intento y se renombra al final.
pub struct LocalEngine {
    dfs: Arc<dyn Dfs>,
    reduce_tasks: u32,
    task_concurrency: usize,
}

impl LocalEngine {
    pub fn new(dfs: Arc<dyn Dfs>, reduce_tasks: u32, task_concurrency: usize) -> Self {
        Self {
            dfs,
            reduce_tasks: reduce_tasks.max(1),
            task_concurrency: task_concurrency.max(1),
        }
    }

    pub fn from_config(config: &FlowConfig, dfs: Arc<dyn Dfs>) -> Self {
        Self::new(dfs, config.reduce_tasks, config.task_concurrency)
    }

    fn failed(config: &JobConfig, message: String) -> EngineReport {
        EngineReport {
            job_name: config.name.clone(),
            status: JobStatus::Failed,
            map_tasks: 0,
            reduce_tasks: 0,
            message: Some(message),
        }
    }
}

impl ExecutionEngine for LocalEngine {
    fn run_job(&self, config: &JobConfig, logic: &dyn TaskLogic) -> Result<EngineReport> {
        if config.speculative_execution {
            warn!("job '{}': ejecución especulativa no soportada, se ignora", config.name);
        }

        let inputs = expand_inputs(&config.input_paths)?;
        if inputs.is_empty() {
            return Ok(Self::failed(
                config,
                format!("no hay archivos de entrada en {:?}", config.input_paths),
            ));
        }

        let reduce_tasks = config.reduce_tasks.unwrap_or(self.reduce_tasks);
        let attempt = format!("{}._attempt-{}", config.output_path, Uuid::new_v4());
        debug!(
            "job '{}': {} archivo(s), {} reduce(s), clave {:?}, intento en {}",
            config.name,
            inputs.len(),
            reduce_tasks,
            config.map_output_key,
            attempt
        );

        let run = LocalRun {
            config,
            logic,
            inputs: &inputs,
            attempt: Path::new(&attempt),
            reduce_tasks,
            concurrency: self.task_concurrency,
        };

        match run.execute() {
            Ok(()) => {
                self.dfs.delete(&config.output_path)?;
                self.dfs.rename(&attempt, &config.output_path)?;
                info!(
                    "job '{}': salida lista en {}",
                    config.name, config.output_path
                );
                Ok(EngineReport {
                    job_name: config.name.clone(),
                    status: JobStatus::Succeeded,
                    map_tasks: inputs.len() as u32,
                    reduce_tasks,
                    message: None,
                })
            }
            Err(e) => {
                let _ = self.dfs.delete(&attempt);
                Ok(Self::failed(config, e.to_string()))
            }
        }
    }
}

/* =========================
   Entradas
   ========================= */

/// Expande globs y directorios a la lista de archivos a leer.
/// En los directorios se ignoran archivos que empiezan con `_` o `.`.
fn expand_inputs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for pattern in patterns {
        let paths = glob::glob(pattern)
            .map_err(|e| FlowError::config(format!("patrón de entrada inválido '{pattern}': {e}")))?;

        for entry in paths {
            let path = entry.map_err(|e| FlowError::io(e.path().to_path_buf(), e.into()))?;
            if path.is_dir() {
                let mut inner: Vec<PathBuf> = fs::read_dir(&path)
                    .map_err(|e| FlowError::io(&path, e))?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && !is_hidden(p))
                    .collect();
                inner.sort();
                files.extend(inner);
            } else if !files.contains(&path) {
                files.push(path);
            }
        }
    }

    Ok(files)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('_') || n.starts_with('.'))
        .unwrap_or(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Abre un archivo descomprimiendo según la extensión.
/// Devuelve también la ruta "lógica" sin la extensión de compresión.
fn open_input(path: &Path) -> io::Result<(Box<dyn BufRead>, PathBuf)> {
    let file = File::open(path)?;
    let ext = extension(path);
    let reader: Box<dyn Read> = match ext.as_str() {
        "gz" => Box::new(GzDecoder::new(file)),
        "zz" => Box::new(ZlibDecoder::new(file)),
        _ => Box::new(file),
    };
    let logical = if ext == "gz" || ext == "zz" {
        path.with_extension("")
    } else {
        path.to_path_buf()
    };
    Ok((Box::new(BufReader::new(reader)), logical))
}

/// Registro serializado en formato `pairs`.
#[derive(Debug, Serialize, Deserialize)]
struct PairLine {
    key: String,
    value: String,
}

fn invalid(path: &Path, msg: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {msg}", path.display()),
    )
}

/// Lee un archivo de entrada como pares (clave, valor) en texto.
fn read_records(path: &Path, declared: InputFormat) -> io::Result<Vec<(String, String)>> {
    let (reader, logical) = open_input(path)?;

    let format = match declared {
        InputFormat::Auto => match extension(&logical).as_str() {
            "jsonl" => InputFormat::Pairs,
            "csv" => InputFormat::Csv,
            _ => InputFormat::Auto,
        },
        other => other,
    };

    if format == InputFormat::Csv {
        return read_csv_records(reader, path);
    }

    let mut out = Vec::new();
    let mut offset: u64 = 0;
    for line in reader.lines() {
        let line = line?;
        let line_offset = offset;
        offset += line.len() as u64 + 1;

        match format {
            InputFormat::Text => out.push((line_offset.to_string(), line)),
            InputFormat::KeyValue => out.push(split_key_value(line)),
            InputFormat::Pairs => {
                if line.trim().is_empty() {
                    continue;
                }
                let pair: PairLine = serde_json::from_str(&line).map_err(|e| invalid(path, e))?;
                out.push((pair.key, pair.value));
            }
            InputFormat::Auto | InputFormat::Csv => {
                if line.contains('\t') {
                    out.push(split_key_value(line));
                } else {
                    out.push((line_offset.to_string(), line));
                }
            }
        }
    }
    Ok(out)
}

fn split_key_value(line: String) -> (String, String) {
    match line.split_once('\t') {
        Some((k, v)) => (k.to_string(), v.to_string()),
        None => (line, String::new()),
    }
}

/// CSV con encabezado: la clave es el número de fila y el valor un objeto
/// JSON con las columnas como strings.
fn read_csv_records(reader: Box<dyn BufRead>, path: &Path) -> io::Result<Vec<(String, String)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| invalid(path, e))?
        .iter()
        // limpia BOM por si viene de Excel/Windows
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut out = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| invalid(path, e))?;
        let mut obj = serde_json::Map::new();
        for (idx, h) in headers.iter().enumerate() {
            let val = record.get(idx).unwrap_or("");
            obj.insert(h.clone(), Value::String(val.to_string()));
        }
        out.push((row.to_string(), Value::Object(obj).to_string()));
    }
    Ok(out)
}

/* =========================
   Salidas
   ========================= */

enum OutputStream {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zlib(ZlibEncoder<BufWriter<File>>),
}

impl OutputStream {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            OutputStream::Plain(w) => w,
            OutputStream::Gzip(w) => w,
            OutputStream::Zlib(w) => w,
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            OutputStream::Plain(mut w) => w.flush(),
            OutputStream::Gzip(w) => w.finish()?.flush(),
            OutputStream::Zlib(w) => w.finish()?.flush(),
        }
    }
}

/// Nombre de un archivo de salida: `part-<m|r>-NNNNN[.jsonl][.gz|.zz]`.
fn part_file_name(phase: char, idx: usize, format: OutputFormat, compression: Option<Compression>) -> String {
    let mut name = format!("part-{phase}-{idx:05}");
    if format == OutputFormat::Pairs {
        name.push_str(".jsonl");
    }
    if let Some(c) = compression {
        name.push('.');
        name.push_str(c.extension());
    }
    name
}

/// Collector que escribe pares al archivo de salida de una tarea.
struct PartWriter {
    stream: OutputStream,
    format: OutputFormat,
    error: Option<io::Error>,
}

impl PartWriter {
    fn create(path: &Path, format: OutputFormat, compression: Option<Compression>) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let stream = match compression {
            None => OutputStream::Plain(file),
            Some(Compression::Gzip) => OutputStream::Gzip(GzEncoder::new(file, flate2::Compression::default())),
            Some(Compression::Zlib) => OutputStream::Zlib(ZlibEncoder::new(file, flate2::Compression::default())),
        };
        Ok(Self {
            stream,
            format,
            error: None,
        })
    }

    fn write(&mut self, key: &str, value: String) -> io::Result<()> {
        let w = self.stream.writer();
        match self.format {
            OutputFormat::Text => writeln!(w, "{key}\t{value}"),
            OutputFormat::Pairs => {
                let line = serde_json::to_string(&PairLine {
                    key: key.to_string(),
                    value,
                })?;
                writeln!(w, "{line}")
            }
        }
    }

    fn finish(self) -> io::Result<()> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.stream.finish()
    }
}

impl Collector for PartWriter {
    fn collect(&mut self, key: ShuffleKey, value: String) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.write(key.text(), value) {
            self.error = Some(e);
        }
    }
}

/* =========================
   Shuffle a particiones en disco
   ========================= */

fn hash_key_to_partition(key: &str, num_partitions: u32) -> u32 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % num_partitions as u64) as u32
}

/// Registro intermedio del shuffle: clave, orden secundario y valor.
#[derive(Debug, Serialize, Deserialize)]
struct ShuffleRecord {
    k: String,
    o: i64,
    v: String,
}

/// Collector de una tarea map con reduce: reparte cada par a
/// `<dir>/part-<p>.jsonl` según hash(clave) % particiones.
struct ShuffleWriter {
    writers: Vec<BufWriter<File>>,
    error: Option<io::Error>,
}

impl ShuffleWriter {
    fn create(dir: &Path, num_partitions: u32) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut writers = Vec::with_capacity(num_partitions as usize);
        for pid in 0..num_partitions {
            let file = File::create(dir.join(format!("part-{pid}.jsonl")))?;
            writers.push(BufWriter::new(file));
        }
        Ok(Self {
            writers,
            error: None,
        })
    }

    fn write(&mut self, key: ShuffleKey, value: String) -> io::Result<()> {
        let pid = hash_key_to_partition(key.text(), self.writers.len() as u32) as usize;
        let record = ShuffleRecord {
            o: key.order(),
            k: match key {
                ShuffleKey::Text(t) | ShuffleKey::TextInt(t, _) => t,
            },
            v: value,
        };
        let w = &mut self.writers[pid];
        serde_json::to_writer(&mut *w, &record)?;
        w.write_all(b"\n")
    }

    fn finish(self) -> io::Result<()> {
        if let Some(e) = self.error {
            return Err(e);
        }
        for mut w in self.writers {
            w.flush()?;
        }
        Ok(())
    }
}

impl Collector for ShuffleWriter {
    fn collect(&mut self, key: ShuffleKey, value: String) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.write(key, value) {
            self.error = Some(e);
        }
    }
}

/// Lee una partición de shuffle (JSONL).
fn read_partition(path: &Path) -> io::Result<Vec<ShuffleRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line).map_err(|e| invalid(path, e))?);
    }
    Ok(out)
}

/* =========================
   Ejecución de un job
   ========================= */

/// Corre `count` tareas con a lo sumo `concurrency` hilos a la vez.
fn run_tasks<F>(count: usize, concurrency: usize, task: F) -> io::Result<()>
where
    F: Fn(usize) -> io::Result<()> + Sync,
{
    if count == 0 {
        return Ok(());
    }
    let next = &AtomicUsize::new(0);
    let task = &task;
    let workers = concurrency.max(1).min(count);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(move |_| {
                scope.spawn(move || -> io::Result<()> {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        if idx >= count {
                            return Ok(());
                        }
                        task(idx)?;
                    }
                })
            })
            .collect();

        let mut result = Ok(());
        for h in handles {
            let outcome = h
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("panic en una tarea")));
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    })
}

struct LocalRun<'a> {
    config: &'a JobConfig,
    logic: &'a dyn TaskLogic,
    inputs: &'a [PathBuf],
    attempt: &'a Path,
    reduce_tasks: u32,
    concurrency: usize,
}

impl LocalRun<'_> {
    fn execute(&self) -> io::Result<()> {
        fs::create_dir_all(self.attempt)?;

        if self.reduce_tasks == 0 {
            run_tasks(self.inputs.len(), self.concurrency, |idx| self.map_only_task(idx))?;
        } else {
            let shuffle_dir = self.attempt.join("_shuffle");
            run_tasks(self.inputs.len(), self.concurrency, |idx| {
                self.shuffle_map_task(idx, &shuffle_dir)
            })?;
            run_tasks(self.reduce_tasks as usize, self.concurrency, |pid| {
                self.reduce_task(pid, &shuffle_dir)
            })?;
            fs::remove_dir_all(&shuffle_dir)?;
        }

        File::create(self.attempt.join("_SUCCESS"))?;
        Ok(())
    }

    fn map_input(&self, idx: usize, out: &mut dyn Collector) -> io::Result<()> {
        let input = &self.inputs[idx];
        let records = read_records(input, self.config.input_format)?;
        debug!("map {}: {} registro(s) de {}", idx, records.len(), input.display());
        for (key, value) in records {
            self.logic.map(key, value, out);
        }
        Ok(())
    }

    fn map_only_task(&self, idx: usize) -> io::Result<()> {
        let name = part_file_name('m', idx, self.config.output_format, self.config.compression);
        let mut writer = PartWriter::create(
            &self.attempt.join(name),
            self.config.output_format,
            self.config.compression,
        )?;
        self.map_input(idx, &mut writer)?;
        writer.finish()
    }

    fn shuffle_map_task(&self, idx: usize, shuffle_dir: &Path) -> io::Result<()> {
        let dir = shuffle_dir.join(format!("map-{idx:05}"));
        let mut writer = ShuffleWriter::create(&dir, self.reduce_tasks)?;
        self.map_input(idx, &mut writer)?;
        writer.finish()
    }

    /// Junta la partición `pid` de todas las tareas map, ordena por
    /// (clave, orden) y llama al reduce una vez por clave.
    fn reduce_task(&self, pid: usize, shuffle_dir: &Path) -> io::Result<()> {
        let mut entries = Vec::new();
        for idx in 0..self.inputs.len() {
            let path = shuffle_dir
                .join(format!("map-{idx:05}"))
                .join(format!("part-{pid}.jsonl"));
            entries.extend(read_partition(&path)?);
        }
        // sort_by es estable: a igual (clave, orden) se respeta el orden de llegada
        entries.sort_by(|a, b| a.k.cmp(&b.k).then(a.o.cmp(&b.o)));

        let name = part_file_name('r', pid, self.config.output_format, self.config.compression);
        let mut writer = PartWriter::create(
            &self.attempt.join(name),
            self.config.output_format,
            self.config.compression,
        )?;

        let mut start = 0;
        while start < entries.len() {
            let mut end = start + 1;
            while end < entries.len() && entries[end].k == entries[start].k {
                end += 1;
            }
            let key = entries[start].k.clone();
            let mut values = entries[start..end].iter_mut().map(|e| std::mem::take(&mut e.v));
            self.logic.reduce(&key, &mut values, &mut writer);
            start = end;
        }

        debug!("reduce {}: {} registro(s)", pid, entries.len());
        writer.finish()
    }
}
