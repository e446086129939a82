//! Pipelines map/reduce declarados de forma perezosa, compilados a un DAG de
//! jobs y ejecutados con concurrencia acotada sobre un engine.

pub mod chain;
pub mod compiler;
pub mod config;
pub mod dag;
pub mod dfs;
pub mod engine;
pub mod error;
pub mod executor;
pub mod functions;
pub mod graph;
pub mod job;
pub mod registry;
pub mod results;
pub mod scheduler;
pub mod session;
pub mod task;

pub use config::FlowConfig;
pub use dag::{JobGraph, JobSpec, JobSummary};
pub use error::{FlowError, Result};
pub use functions::{Emitted, JobContext, MapFn, ReduceFn, Values};
pub use graph::{SinkOptions, SourceOptions};
pub use job::{Compression, InputFormat, OutputFormat};
pub use registry::{Operation, OperationRegistry};
pub use results::JobResults;
pub use session::{Pipe, Session};
