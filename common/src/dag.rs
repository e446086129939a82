use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::{FlowError, Result},
    functions::{MapFn, ReduceFn},
    job::{Compression, InputFormat, JobId, OutputFormat},
};

/// Especificación de un job físico: entradas, funciones antes y después del
/// shuffle, reducer opcional, salida y aristas con otros jobs.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub workpath: String,

    pub input_paths: Vec<String>,
    pub input_format: InputFormat,
    pub input_json: bool,

    /// Funciones de la fase map, en orden de ejecución.
    pub pre_mappers: Vec<MapFn>,
    pub reducer: Option<ReduceFn>,
    pub secondary_sort: bool,
    /// Funciones después del reducer, en orden de ejecución.
    pub post_mappers: Vec<MapFn>,

    /// `None` hasta el linkeo; ahí se asigna `<workpath>/job-<id>`.
    pub output_path: Option<String>,
    pub output_format: OutputFormat,
    pub output_json: bool,
    pub compression: Option<Compression>,

    pub job_args: BTreeMap<String, String>,

    pub parents: Vec<JobId>,
    pub children: Vec<JobId>,
}

pub fn default_output_path(workpath: &str, id: JobId) -> String {
    format!("{workpath}/job-{id}")
}

impl JobSpec {
    /// Spec vacío con los defaults de un job intermedio.
    pub fn new(id: JobId, workpath: &str) -> Self {
        Self {
            id,
            workpath: workpath.to_string(),
            input_paths: Vec::new(),
            input_format: InputFormat::Auto,
            input_json: true,
            pre_mappers: Vec::new(),
            reducer: None,
            secondary_sort: false,
            post_mappers: Vec::new(),
            output_path: None,
            output_format: OutputFormat::Pairs,
            output_json: true,
            compression: Some(Compression::Gzip),
            job_args: BTreeMap::new(),
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Sin mappers ni reducer: el job sólo copiaría la entrada.
    pub fn is_noop(&self) -> bool {
        self.pre_mappers.is_empty() && self.reducer.is_none() && self.post_mappers.is_empty()
    }

    pub fn resolved_output(&self) -> String {
        self.output_path
            .clone()
            .unwrap_or_else(|| default_output_path(&self.workpath, self.id))
    }

    /// Nombres de todas las funciones del job, en orden de ejecución.
    pub fn function_names(&self) -> Vec<&str> {
        self.pre_mappers
            .iter()
            .map(MapFn::name)
            .chain(self.reducer.iter().map(ReduceFn::name))
            .chain(self.post_mappers.iter().map(MapFn::name))
            .collect()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            input_paths: self.input_paths.clone(),
            input_format: self.input_format,
            pre_mappers: self.pre_mappers.iter().map(|f| f.name().to_string()).collect(),
            reducer: self.reducer.as_ref().map(|r| r.name().to_string()),
            secondary_sort: self.secondary_sort,
            post_mappers: self.post_mappers.iter().map(|f| f.name().to_string()).collect(),
            output_path: self.output_path.clone(),
            output_format: self.output_format,
            parents: self.parents.clone(),
            children: self.children.clone(),
        }
    }
}

/// Vista serializable de un spec, para mostrar el plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub input_paths: Vec<String>,
    pub input_format: InputFormat,
    pub pre_mappers: Vec<String>,
    pub reducer: Option<String>,
    pub secondary_sort: bool,
    pub post_mappers: Vec<String>,
    pub output_path: Option<String>,
    pub output_format: OutputFormat,
    pub parents: Vec<JobId>,
    pub children: Vec<JobId>,
}

/// DAG de jobs. El id de cada spec es su posición en el vector.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    specs: Vec<JobSpec>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, workpath: &str) -> JobId {
        let id = self.specs.len();
        self.specs.push(JobSpec::new(id, workpath));
        id
    }

    /// `parent` debe terminar antes de que arranque `child`.
    pub fn add_edge(&mut self, parent: JobId, child: JobId) {
        if !self.specs[parent].children.contains(&child) {
            self.specs[parent].children.push(child);
        }
        if !self.specs[child].parents.contains(&parent) {
            self.specs[child].parents.push(parent);
        }
    }

    pub fn spec(&self, id: JobId) -> &JobSpec {
        &self.specs[id]
    }

    pub fn spec_mut(&mut self, id: JobId) -> &mut JobSpec {
        &mut self.specs[id]
    }

    pub fn specs(&self) -> &[JobSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn into_specs(self) -> Vec<JobSpec> {
        self.specs
    }

    /// Asigna rutas de salida y conecta la salida de cada padre a las
    /// entradas de sus hijos. Idempotente.
    pub fn link(&mut self) {
        for spec in self.specs.iter_mut() {
            if spec.output_path.is_none() {
                spec.output_path = Some(default_output_path(&spec.workpath, spec.id));
            }
        }

        for idx in 0..self.specs.len() {
            let output = self.specs[idx].resolved_output();
            let children = self.specs[idx].children.clone();
            for child in children {
                let inputs = &mut self.specs[child].input_paths;
                if !inputs.contains(&output) {
                    inputs.push(output.clone());
                }
            }
        }

        // la salida de un padre se lee tal como se escribió
        for idx in 0..self.specs.len() {
            let parents = &self.specs[idx].parents;
            let Some(&first) = parents.first() else {
                continue;
            };
            let outputs: Vec<String> = parents
                .iter()
                .map(|&p| self.specs[p].resolved_output())
                .collect();
            let own_inputs = self.specs[idx]
                .input_paths
                .iter()
                .any(|path| !outputs.contains(path));
            let json = self.specs[first].output_json;
            let agree = parents.iter().all(|&p| self.specs[p].output_json == json);

            // con sources propios o padres mezclados decide `validate`
            if !own_inputs && agree {
                self.specs[idx].input_json = json;
            }
        }
    }

    /// Verifica que todos los specs linkeados tengan de dónde leer y que
    /// lean las salidas de sus padres con la misma codificación.
    pub fn validate(&self) -> Result<()> {
        for spec in &self.specs {
            if spec.input_paths.is_empty() {
                return Err(FlowError::config(format!(
                    "el job {} no tiene rutas de entrada",
                    spec.id
                )));
            }
            for &parent in &spec.parents {
                if self.specs[parent].output_json != spec.input_json {
                    return Err(FlowError::config(format!(
                        "el job {} mezcla entradas JSON y texto crudo (padre {})",
                        spec.id, parent
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.specs.iter().map(JobSpec::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> MapFn {
        MapFn::new(name, |k, v| Ok(vec![(k.to_string(), v.clone())]))
    }

    #[test]
    fn spec_nuevo_es_noop_con_defaults_intermedios() {
        let spec = JobSpec::new(3, "/tmp/wc");
        assert!(spec.is_noop());
        assert_eq!(spec.output_format, OutputFormat::Pairs);
        assert_eq!(spec.compression, Some(Compression::Gzip));
        assert_eq!(spec.resolved_output(), "/tmp/wc/job-3");
    }

    #[test]
    fn function_names_respeta_orden_de_ejecucion() {
        let mut spec = JobSpec::new(0, "/w");
        spec.pre_mappers = vec![identity("a"), identity("b")];
        spec.post_mappers = vec![identity("c")];
        assert_eq!(spec.function_names(), vec!["a", "b", "c"]);
        assert!(!spec.is_noop());
    }

    #[test]
    fn link_asigna_salidas_y_es_idempotente() {
        let mut g = JobGraph::new();
        let child = g.allocate("/w");
        let parent = g.allocate("/w");
        g.spec_mut(child).output_path = Some("/data/out".into());
        g.spec_mut(parent).input_paths.push("/data/in".into());
        g.add_edge(parent, child);
        g.add_edge(parent, child);

        g.link();
        g.link();

        assert_eq!(g.spec(parent).output_path.as_deref(), Some("/w/job-1"));
        assert_eq!(g.spec(child).input_paths, vec!["/w/job-1".to_string()]);
        assert_eq!(g.spec(parent).children, vec![child]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn validate_rechaza_specs_sin_entradas() {
        let mut g = JobGraph::new();
        g.allocate("/w");
        g.link();
        assert!(matches!(g.validate(), Err(FlowError::Config(_))));
    }

    #[test]
    fn link_lee_la_salida_del_padre_con_su_codificacion() {
        let mut g = JobGraph::new();
        let parent = g.allocate("/w");
        let child = g.allocate("/w");
        g.spec_mut(parent).input_paths.push("/data/in".into());
        g.spec_mut(parent).output_path = Some("/data/crudo".into());
        g.spec_mut(parent).output_json = false;
        g.add_edge(parent, child);

        g.link();
        g.link();

        assert!(!g.spec(child).input_json);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn validate_rechaza_padres_con_codificaciones_mezcladas() {
        let mut g = JobGraph::new();
        let child = g.allocate("/w");
        let crudo = g.allocate("/w");
        let json = g.allocate("/w");
        for p in [crudo, json] {
            g.spec_mut(p).input_paths.push("/data/in".into());
            g.add_edge(p, child);
        }
        g.spec_mut(crudo).output_json = false;

        g.link();

        assert!(matches!(g.validate(), Err(FlowError::Config(_))));
    }
}
