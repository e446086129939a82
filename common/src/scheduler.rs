use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use tracing::{error, info};

use crate::{
    config::{DEFAULT_MAX_IN_FLIGHT, DEFAULT_POLL_INTERVAL_MS},
    dag::{JobGraph, JobSpec},
    error::{FlowError, Result},
    job::JobId,
    results::JobResults,
};

/// Corre un spec completo y devuelve sus resultados.
pub trait JobRunner: Send + Sync {
    fn run_job(&self, spec: &JobSpec) -> Result<JobResults>;
}

/// Estado compartido entre el coordinador y los hilos de los jobs.
#[derive(Default)]
struct RunState {
    completed: HashSet<JobId>,
    results: Vec<JobResults>,
    failure: Option<FlowError>,
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    // un hilo que hizo panic no deja el estado a medio escribir
    state.lock().unwrap_or_else(|p| p.into_inner())
}

/// Ejecuta un DAG de jobs con a lo sumo `max_in_flight` corriendo a la vez.
///
/// Un hilo por job; el coordinador revisa cada `poll_interval` qué specs
/// tienen todos sus padres completos y los lanza mientras haya lugar.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_in_flight: usize,
    poll_interval: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_IN_FLIGHT,
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        )
    }
}

impl Scheduler {
    pub fn new(max_in_flight: usize, poll_interval: Duration) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            poll_interval,
        }
    }

    pub fn run(&self, graph: JobGraph, runner: Arc<dyn JobRunner>) -> Result<JobResults> {
        let specs: Vec<Arc<JobSpec>> = graph.into_specs().into_iter().map(Arc::new).collect();
        let total = specs.len();
        let state = Arc::new(Mutex::new(RunState::default()));
        let mut started: HashSet<JobId> = HashSet::new();

        loop {
            {
                let mut st = lock(&state);
                if let Some(err) = st.failure.take() {
                    error!("corrida abortada: {}", err);
                    return Err(err);
                }
                if st.completed.len() >= total {
                    break;
                }

                let mut launched = 0;
                for spec in &specs {
                    if started.len() - st.completed.len() >= self.max_in_flight {
                        break;
                    }
                    if started.contains(&spec.id) {
                        continue;
                    }
                    if spec.parents.iter().all(|p| st.completed.contains(p)) {
                        self.launch(Arc::clone(spec), Arc::clone(&runner), Arc::clone(&state))?;
                        started.insert(spec.id);
                        launched += 1;
                    }
                }

                if launched == 0 && started.len() == st.completed.len() {
                    return Err(FlowError::config(format!(
                        "el DAG no puede avanzar: {} de {} jobs completos y ninguno listo",
                        st.completed.len(),
                        total
                    )));
                }
            }
            thread::sleep(self.poll_interval);
        }

        let mut st = lock(&state);
        let mut aggregate = JobResults::new();
        for results in st.results.drain(..) {
            aggregate.merge(results);
        }

        let errors = aggregate.data_errors();
        if errors > 0 {
            error!("{} registro(s) con errores de datos durante la corrida", errors);
        }
        info!("{} job(s) completados", total);
        Ok(aggregate)
    }

    fn launch(
        &self,
        spec: Arc<JobSpec>,
        runner: Arc<dyn JobRunner>,
        state: Arc<Mutex<RunState>>,
    ) -> Result<()> {
        info!("lanzando job {}", spec.id);
        let thread_name = format!("flow-job-{}", spec.id);
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run_job(&spec)));
                let mut st = lock(&state);
                match outcome {
                    Ok(Ok(results)) => {
                        info!("job {} completado", spec.id);
                        st.results.push(results);
                        st.completed.insert(spec.id);
                    }
                    Ok(Err(e)) => {
                        error!("job {} falló: {}", spec.id, e);
                        st.failure.get_or_insert(e);
                    }
                    Err(_) => {
                        error!("job {}: panic en el hilo del job", spec.id);
                        st.failure.get_or_insert(FlowError::job(
                            format!("job-{}", spec.id),
                            "panic en el hilo del job",
                        ));
                    }
                }
            })
            .map_err(|e| FlowError::io(format!("hilo {thread_name}"), e))?;
        Ok(())
    }
}
