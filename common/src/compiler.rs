use std::collections::HashMap;

use tracing::debug;

use crate::{
    dag::JobGraph,
    error::{FlowError, Result},
    graph::{LineageGraph, PipeId, PipeKind, PipeNode},
    job::JobId,
};

/// Baja el grafo de linaje a un DAG de jobs.
///
/// Recorre hacia atrás desde cada sink (en orden de creación), juntando en
/// un mismo job todo el trabajo map contiguo y cortando en cada reducer extra
/// y en cada pipe compartida por varios consumidores. El resultado no está
/// linkeado todavía: falta `JobGraph::link`.
pub fn compile(graph: &LineageGraph, workpath: &str) -> Result<JobGraph> {
    validate(graph)?;

    let mut compiler = Compiler {
        graph,
        workpath,
        jobs: JobGraph::new(),
        memo: HashMap::new(),
    };

    for &sink_id in graph.sinks() {
        let sink = compiler.node(sink_id)?;
        let PipeKind::Sink { path, options } = &sink.kind else {
            return Err(FlowError::config(format!("{sink_id} no es un sink")));
        };

        let spec = compiler.jobs.allocate(workpath);
        {
            let s = compiler.jobs.spec_mut(spec);
            s.output_path = Some(path.clone());
            s.output_format = options.format;
            s.output_json = options.json;
            s.compression = options.compression;
        }
        compiler.walk(spec, sink.upstream[0])?;
    }

    debug!(
        "grafo con {} pipe(s) compilado a {} job(s)",
        graph.len(),
        compiler.jobs.len()
    );
    Ok(compiler.jobs)
}

/// Errores de forma que se detectan antes de compilar.
fn validate(graph: &LineageGraph) -> Result<()> {
    if graph.sources().is_empty() {
        return Err(FlowError::config("no hay sources definidos"));
    }
    if graph.sinks().is_empty() {
        return Err(FlowError::config("no hay sinks definidos"));
    }

    for node in graph.nodes() {
        match &node.kind {
            PipeKind::Source { paths, .. } if paths.is_empty() => {
                return Err(FlowError::config(format!("{} no tiene rutas de entrada", node.id)));
            }
            PipeKind::Sink { .. } if node.upstream.len() != 1 => {
                return Err(FlowError::config(format!(
                    "el sink {} tiene {} orígenes, se esperaba uno",
                    node.id,
                    node.upstream.len()
                )));
            }
            PipeKind::Mapper { .. } | PipeKind::Reducer { .. } if node.upstream.is_empty() => {
                return Err(FlowError::config(format!(
                    "el {} {} no tiene origen",
                    node.kind.label(),
                    node.id
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

struct Compiler<'g> {
    graph: &'g LineageGraph,
    workpath: &'g str,
    jobs: JobGraph,
    /// Pipe ya compilada → job que la contiene.
    memo: HashMap<PipeId, JobId>,
}

impl<'g> Compiler<'g> {
    fn node(&self, id: PipeId) -> Result<&'g PipeNode> {
        self.graph
            .node(id)
            .ok_or_else(|| FlowError::config(format!("{id} no existe en el grafo")))
    }

    /// Crea un job nuevo como padre de `child`.
    fn boundary(&mut self, child: JobId) -> JobId {
        let parent = self.jobs.allocate(self.workpath);
        self.jobs.add_edge(parent, child);
        parent
    }

    fn walk(&mut self, mut spec: JobId, pipe_id: PipeId) -> Result<()> {
        if let Some(&owner) = self.memo.get(&pipe_id) {
            self.jobs.add_edge(owner, spec);
            return Ok(());
        }

        let pipe = self.node(pipe_id)?;
        if pipe.downstream.len() > 1 && !pipe.is_source() && !self.jobs.spec(spec).is_noop() {
            spec = self.boundary(spec);
        }

        match &pipe.kind {
            PipeKind::Source { paths, options } => {
                let s = self.jobs.spec_mut(spec);
                for p in paths {
                    if !s.input_paths.contains(p) {
                        s.input_paths.push(p.clone());
                    }
                }
                s.input_format = options.format;
                s.input_json = options.json;
                s.job_args
                    .extend(options.job_args.iter().map(|(k, v)| (k.clone(), v.clone())));
                return Ok(());
            }
            PipeKind::Mapper { mapper } => {
                self.jobs.spec_mut(spec).pre_mappers.insert(0, mapper.clone());
            }
            PipeKind::Reducer {
                reducer,
                secondary_sort,
            } => {
                if self.jobs.spec(spec).reducer.is_some() {
                    spec = self.boundary(spec);
                }
                let s = self.jobs.spec_mut(spec);
                s.reducer = Some(reducer.clone());
                s.secondary_sort = *secondary_sort;
                s.post_mappers = std::mem::take(&mut s.pre_mappers);
            }
            PipeKind::Sink { .. } => {
                return Err(FlowError::config(format!(
                    "el sink {pipe_id} no puede ser origen de otra pipe"
                )));
            }
        }

        self.memo.insert(pipe_id, spec);

        match pipe.upstream.as_slice() {
            [] => Err(FlowError::config(format!("{pipe_id} no tiene origen"))),
            [single] => self.walk(spec, *single),
            many => {
                // ni el primer upstream sigue en este spec: cada rama no source tiene su padre
                for &up in many {
                    if self.node(up)?.is_source() {
                        self.walk(spec, up)?;
                    } else if let Some(&owner) = self.memo.get(&up) {
                        self.jobs.add_edge(owner, spec);
                    } else {
                        let parent = self.boundary(spec);
                        self.walk(parent, up)?;
                    }
                }
                Ok(())
            }
        }
    }
}
