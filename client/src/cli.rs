use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    FlowConfig, InputFormat, OperationRegistry, OutputFormat, Session, SinkOptions,
};
use std::path::PathBuf;
use tracing::info;

use crate::ops;

#[derive(Parser)]
#[command(name = "flowmini")]
#[command(about = "CLI para compilar y correr pipelines map/reduce con el engine local")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Carpeta donde se crea el directorio de trabajo (default: FLOW_WORK_ROOT o ".")
    #[arg(long, global = true)]
    work_root: Option<PathBuf>,

    /// Jobs corriendo a la vez (default: FLOW_MAX_IN_FLIGHT o 3)
    #[arg(long, global = true)]
    max_in_flight: Option<usize>,

    /// Particiones de reduce del engine local (default: FLOW_REDUCE_TASKS o 4)
    #[arg(long, global = true)]
    reduce_tasks: Option<u32>,
}

impl Cli {
    fn flow_config(&self) -> FlowConfig {
        let mut config = FlowConfig::from_env();
        if let Some(root) = &self.work_root {
            config.work_root = root.clone();
        }
        if let Some(k) = self.max_in_flight {
            config.max_in_flight = k.max(1);
        }
        if let Some(n) = self.reduce_tasks {
            config.reduce_tasks = n.max(1);
        }
        config
    }
}

#[derive(Args)]
struct WordcountArgs {
    /// Archivos o globs de entrada (texto)
    #[arg(value_name = "ENTRADA", required = true)]
    inputs: Vec<String>,

    /// Directorio de salida con todos los conteos
    #[arg(long)]
    output: String,

    /// Directorio de salida con las palabras frecuentes (opcional)
    #[arg(long)]
    frequent_output: Option<String>,

    /// Mínimo de apariciones para considerar una palabra frecuente
    #[arg(long, default_value_t = 2)]
    min_count: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// WordCount: cuenta palabras y opcionalmente separa las frecuentes
    Wordcount(WordcountArgs),

    /// Muestra el plan de jobs del WordCount como JSON, sin ejecutarlo
    Plan(WordcountArgs),

    /// Join entre dos CSV por clave usando orden secundario
    Join {
        /// Ruta al CSV de ventas
        #[arg(value_name = "VENTAS_CSV")]
        left: String,

        /// Ruta al CSV de catalogo
        #[arg(value_name = "CATALOGO_CSV")]
        right: String,

        /// Nombre de la columna clave
        #[arg(long, default_value = "product_id")]
        key: String,

        /// Directorio de salida
        #[arg(long)]
        output: String,
    },
}

/// Salida `clave\tvalor` con el valor en JSON, así otro job la puede releer.
fn text_sink() -> SinkOptions {
    SinkOptions {
        format: OutputFormat::Text,
        json: true,
        compression: None,
    }
}

fn wordcount_session(args: &WordcountArgs, config: FlowConfig) -> Result<Session> {
    let mut registry = OperationRegistry::new();
    ops::register_all(&mut registry)?;
    let session = Session::with_config("wordcount", config).with_registry(registry);

    {
        let counts = session
            .source(args.inputs.iter().cloned(), InputFormat::Text, false)
            .op("tokenize", &[])?
            .op("count", &[])?;
        counts.sink_with(&args.output, text_sink())?;

        if let Some(frequent) = &args.frequent_output {
            counts
                .map(ops::at_least(args.min_count))?
                .sink_with(frequent, text_sink())?;
        }
    }
    Ok(session)
}

fn join_session(left: &str, right: &str, key: &str, output: &str, config: FlowConfig) -> Result<Session> {
    let session = Session::with_config("join", config);

    {
        let ventas = session
            .source([left], InputFormat::Csv, true)
            .map(ops::tag_by("tag_ventas", key, 1))?;
        let catalogo = session
            .source([right], InputFormat::Csv, true)
            .map(ops::tag_by("tag_catalogo", key, 0))?;
        ventas
            .reduce_with(ops::join_sorted(key), &[catalogo], true)?
            .sink_with(output, text_sink())?;
    }
    Ok(session)
}

/// Corre la sesión, imprime los resultados y limpia el directorio de trabajo.
fn run_session(session: &Session) -> Result<()> {
    let results = session
        .run()
        .with_context(|| format!("falló la corrida de '{}'", session.name()))?;

    println!("Resultados:");
    println!("{}", serde_json::to_string_pretty(&results)?);

    if results.data_errors() > 0 {
        println!(
            "Hubo {} error(es) de datos; detalle en {}",
            results.data_errors(),
            session.errors_path()
        );
    }
    session.cleanup()?;
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.flow_config();

    match &cli.command {
        Commands::Wordcount(args) => {
            info!("wordcount sobre {:?}", args.inputs);
            let session = wordcount_session(args, config)?;
            run_session(&session)?;
            println!("WordCount completado. Salida: {}", args.output);
        }

        Commands::Plan(args) => {
            let session = wordcount_session(args, config)?;
            let plan = session.plan()?;
            println!("{}", serde_json::to_string_pretty(&plan.summaries())?);
        }

        Commands::Join {
            left,
            right,
            key,
            output,
        } => {
            println!("Ejecutando join entre CSVs:");
            println!("  left : {}", left);
            println!("  right: {}", right);
            println!("  key  : {}", key);
            println!("  out  : {}", output);

            let session = join_session(left, right, key, output, config)?;
            run_session(&session)?;
            println!("Join completado. Salida: {}", output);
        }
    }

    Ok(())
}
