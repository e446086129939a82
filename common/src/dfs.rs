use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    time::SystemTime,
};

use crate::error::{FlowError, Result};

/// Operaciones de filesystem que necesitan la sesión, el executor y el engine.
pub trait Dfs: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    /// Borra un archivo o un directorio completo. Si no existe, no hace nada.
    fn delete(&self, path: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn modified(&self, path: &str) -> Result<SystemTime>;

    /// Agrega una línea al final del archivo, creando carpetas si hace falta.
    fn append_line(&self, path: &str, line: &str) -> Result<()>;
}

/// Implementación sobre el filesystem local.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| FlowError::io(parent, e))?;
        }
    }
    Ok(())
}

impl Dfs for LocalFs {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn delete(&self, path: &str) -> Result<()> {
        let p = Path::new(path);
        if p.is_dir() {
            fs::remove_dir_all(p).map_err(|e| FlowError::io(p, e))?;
        } else if p.exists() {
            fs::remove_file(p).map_err(|e| FlowError::io(p, e))?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        ensure_parent(Path::new(to))?;
        fs::rename(from, to).map_err(|e| FlowError::io(from, e))
    }

    fn modified(&self, path: &str) -> Result<SystemTime> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| FlowError::io(path, e))
    }

    fn append_line(&self, path: &str, line: &str) -> Result<()> {
        let p = Path::new(path);
        ensure_parent(p)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(p)
            .map_err(|e| FlowError::io(p, e))?;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).map_err(|e| FlowError::io(p, e))
    }
}
