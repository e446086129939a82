use std::{collections::BTreeMap, fmt};

use crate::{
    error::{FlowError, Result},
    functions::{MapFn, ReduceFn},
    job::{Compression, InputFormat, OutputFormat},
};

/// Id de una pipe; crece con cada pipe creada en la sesión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub usize);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub format: InputFormat,
    /// Decodificar cada valor como JSON antes de los mappers.
    pub json: bool,
    pub job_args: BTreeMap<String, String>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            format: InputFormat::Auto,
            json: true,
            job_args: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub format: OutputFormat,
    /// Codificar cada valor como JSON al escribir.
    pub json: bool,
    pub compression: Option<Compression>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            json: true,
            compression: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipeKind {
    Source {
        paths: Vec<String>,
        options: SourceOptions,
    },
    Mapper {
        mapper: MapFn,
    },
    Reducer {
        reducer: ReduceFn,
        secondary_sort: bool,
    },
    Sink {
        path: String,
        options: SinkOptions,
    },
}

impl PipeKind {
    pub fn label(&self) -> &'static str {
        match self {
            PipeKind::Source { .. } => "source",
            PipeKind::Mapper { .. } => "mapper",
            PipeKind::Reducer { .. } => "reducer",
            PipeKind::Sink { .. } => "sink",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipeNode {
    pub id: PipeId,
    pub kind: PipeKind,
    pub upstream: Vec<PipeId>,
    pub downstream: Vec<PipeId>,
}

impl PipeNode {
    pub fn is_source(&self) -> bool {
        matches!(self.kind, PipeKind::Source { .. })
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.kind, PipeKind::Sink { .. })
    }
}

/// Grafo de linaje: sólo registra etapas, no ejecuta nada.
///
/// Las pipes sólo pueden referenciar pipes ya creadas, así que el grafo es
/// acíclico por construcción.
#[derive(Debug, Default)]
pub struct LineageGraph {
    nodes: Vec<PipeNode>,
    sources: Vec<PipeId>,
    sinks: Vec<PipeId>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: PipeKind, upstream: Vec<PipeId>) -> Result<PipeId> {
        for up in &upstream {
            let node = self
                .nodes
                .get(up.0)
                .ok_or_else(|| FlowError::config(format!("{up} no existe en este grafo")))?;
            if node.is_sink() {
                return Err(FlowError::config(format!(
                    "no se puede encadenar sobre el sink {up}"
                )));
            }
        }
        if matches!(kind, PipeKind::Sink { .. }) && upstream.len() != 1 {
            return Err(FlowError::config("un sink necesita exactamente un origen"));
        }

        let id = PipeId(self.nodes.len());
        for up in &upstream {
            let downstream = &mut self.nodes[up.0].downstream;
            if !downstream.contains(&id) {
                downstream.push(id);
            }
        }

        match kind {
            PipeKind::Source { .. } => self.sources.push(id),
            PipeKind::Sink { .. } => self.sinks.push(id),
            _ => {}
        }

        self.nodes.push(PipeNode {
            id,
            kind,
            upstream,
            downstream: Vec::new(),
        });
        Ok(id)
    }

    /// Un source no tiene orígenes, así que agregarlo nunca falla.
    pub fn add_source(&mut self, paths: Vec<String>, options: SourceOptions) -> PipeId {
        let id = PipeId(self.nodes.len());
        self.sources.push(id);
        self.nodes.push(PipeNode {
            id,
            kind: PipeKind::Source { paths, options },
            upstream: Vec::new(),
            downstream: Vec::new(),
        });
        id
    }

    pub fn node(&self, id: PipeId) -> Option<&PipeNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[PipeNode] {
        &self.nodes
    }

    pub fn sources(&self) -> &[PipeId] {
        &self.sources
    }

    /// Sinks en orden de creación.
    pub fn sinks(&self) -> &[PipeId] {
        &self.sinks
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
