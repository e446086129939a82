use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id de una especificación de job dentro de un plan (índice en el DAG).
pub type JobId = usize;

/// Formato de entrada que entiende el engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Se infiere por extensión y contenido de cada archivo.
    #[default]
    Auto,
    /// Una línea por registro; la clave es el offset en bytes.
    Text,
    /// `clave\tvalor` por línea.
    KeyValue,
    /// CSV con encabezado; el valor es un objeto JSON con las columnas.
    Csv,
    /// JSON lines `{"key": .., "value": ..}`.
    Pairs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `clave\tvalor` por línea.
    Text,
    /// JSON lines `{"key": .., "value": ..}`; preserva claves y valores tal cual.
    #[default]
    Pairs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Zlib,
}

impl Compression {
    /// Extensión que se agrega a los archivos comprimidos.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Zlib => "zz",
        }
    }
}

/// Tipo de clave que sale de la fase map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapOutputKey {
    #[default]
    Text,
    /// Clave compuesta (texto, orden) para orden secundario.
    TextInt,
}

/// Configuración concreta que recibe el engine para correr un job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub input_paths: Vec<String>,
    pub input_format: InputFormat,
    pub output_path: String,
    pub output_format: OutputFormat,
    pub compression: Option<Compression>,
    pub map_output_key: MapOutputKey,

    /// `Some(0)` = job sólo-map; `None` = default del engine.
    pub reduce_tasks: Option<u32>,

    /// Siempre false en los jobs que genera el executor.
    pub speculative_execution: bool,

    /// Argumentos extra para el engine, pasados tal cual.
    pub job_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

/// Lo que devuelve el engine al terminar un job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub job_name: String,
    pub status: JobStatus,
    pub map_tasks: u32,
    pub reduce_tasks: u32,
    pub message: Option<String>,
}

impl EngineReport {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatos_se_serializan_en_minusculas() {
        assert_eq!(serde_json::to_string(&InputFormat::KeyValue).unwrap(), "\"keyvalue\"");
        assert_eq!(serde_json::to_string(&OutputFormat::Pairs).unwrap(), "\"pairs\"");
        assert_eq!(serde_json::to_string(&JobStatus::Succeeded).unwrap(), "\"SUCCEEDED\"");
        assert_eq!(serde_json::to_string(&MapOutputKey::TextInt).unwrap(), "\"text_int\"");
    }

    #[test]
    fn extension_de_compresion() {
        assert_eq!(Compression::Gzip.extension(), "gz");
        assert_eq!(Compression::Zlib.extension(), "zz");
    }
}
