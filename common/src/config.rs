use std::{env, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_REDUCE_TASKS: u32 = 4;
pub const DEFAULT_TASK_CONCURRENCY: usize = 2;

/// Configuración de una sesión y del engine local.
///
/// Cada campo se puede sobreescribir con una env var:
///   - FLOW_MAX_IN_FLIGHT     jobs corriendo a la vez
///   - FLOW_POLL_INTERVAL_MS  intervalo de sondeo del scheduler
///   - FLOW_WORK_ROOT         carpeta donde se crea el directorio de trabajo
///   - FLOW_REDUCE_TASKS      particiones de reduce del engine local
///   - FLOW_TASK_CONCURRENCY  tareas en paralelo dentro de un job
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub max_in_flight: usize,
    pub poll_interval: Duration,
    pub work_root: PathBuf,
    pub reduce_tasks: u32,
    pub task_concurrency: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            work_root: PathBuf::from("."),
            reduce_tasks: DEFAULT_REDUCE_TASKS,
            task_concurrency: DEFAULT_TASK_CONCURRENCY,
        }
    }
}

impl FlowConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_in_flight: env_or("FLOW_MAX_IN_FLIGHT", defaults.max_in_flight).max(1),
            poll_interval: Duration::from_millis(env_or(
                "FLOW_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )),
            work_root: env::var("FLOW_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_root),
            reduce_tasks: env_or("FLOW_REDUCE_TASKS", defaults.reduce_tasks).max(1),
            task_concurrency: env_or("FLOW_TASK_CONCURRENCY", defaults.task_concurrency).max(1),
        }
    }
}

/// Lee una env var y la parsea; si falta o no parsea, usa el default.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_respeta_env_var() {
        env::set_var("FLOW_TEST_ENV_OR_VALOR", "1234");
        assert_eq!(env_or("FLOW_TEST_ENV_OR_VALOR", 7_usize), 1234);
        env::remove_var("FLOW_TEST_ENV_OR_VALOR");
    }

    #[test]
    fn env_or_usa_default_si_no_parsea() {
        env::set_var("FLOW_TEST_ENV_OR_BASURA", "no-es-numero");
        assert_eq!(env_or("FLOW_TEST_ENV_OR_BASURA", 3_u32), 3);
        env::remove_var("FLOW_TEST_ENV_OR_BASURA");

        assert_eq!(env_or("FLOW_TEST_ENV_OR_AUSENTE", 5_u64), 5);
    }

    #[test]
    fn defaults_coinciden_con_constantes() {
        let cfg = FlowConfig::default();
        assert_eq!(cfg.max_in_flight, 3);
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.task_concurrency, 2);
    }
}
