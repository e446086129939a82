use std::{io, path::Path};
use thiserror::Error;

/// Errores fatales de una corrida.
///
/// Los errores de datos por registro nunca llegan acá: se cuentan y se
/// escriben en el canal de errores del job.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Grafo mal formado, rutas faltantes, operación desconocida, etc.
    #[error("error de configuración: {0}")]
    Config(String),

    /// El engine reportó fallo o el hilo del job terminó con error.
    #[error("el job '{job}' falló: {message}")]
    Job { job: String, message: String },

    #[error("error de E/S en {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("error de JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

impl FlowError {
    pub fn config(msg: impl Into<String>) -> Self {
        FlowError::Config(msg.into())
    }

    pub fn job(job: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Job {
            job: job.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        FlowError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mensajes_incluyen_contexto() {
        let e = FlowError::job("wc 0 tokenize", "engine sin éxito");
        assert_eq!(e.to_string(), "el job 'wc 0 tokenize' falló: engine sin éxito");

        let e = FlowError::io("/tmp/x", io::Error::new(io::ErrorKind::NotFound, "no existe"));
        assert!(e.to_string().contains("/tmp/x"));
    }

    #[test]
    fn json_se_convierte_con_from() {
        fn parse(s: &str) -> Result<serde_json::Value> {
            Ok(serde_json::from_str(s)?)
        }
        assert!(matches!(parse("{"), Err(FlowError::Json(_))));
    }
}
