use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    error::{FlowError, Result},
    functions::{MapFn, ReduceFn},
    session::Pipe,
};

/// Operación reutilizable que se puede aplicar por nombre sobre una pipe.
#[derive(Debug, Clone)]
pub enum Operation {
    Map(MapFn),
    Reduce {
        reducer: ReduceFn,
        secondary_sort: bool,
    },
}

impl Operation {
    fn same_as(&self, other: &Operation) -> bool {
        match (self, other) {
            (Operation::Map(a), Operation::Map(b)) => a.same_as(b),
            (
                Operation::Reduce {
                    reducer: a,
                    secondary_sort: sa,
                },
                Operation::Reduce {
                    reducer: b,
                    secondary_sort: sb,
                },
            ) => sa == sb && a.same_as(b),
            _ => false,
        }
    }

    /// Crea la pipe correspondiente con `pipe` y `sources` como orígenes.
    pub fn apply<'s>(&self, pipe: &Pipe<'s>, sources: &[Pipe<'s>]) -> Result<Pipe<'s>> {
        match self {
            Operation::Map(mapper) => pipe.map_with(mapper.clone(), sources),
            Operation::Reduce {
                reducer,
                secondary_sort,
            } => pipe.reduce_with(reducer.clone(), sources, *secondary_sort),
        }
    }
}

/// Mapa nombre → operación que arma la sesión.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una operación. Registrar otra implementación con un nombre
    /// ya usado es error; volver a registrar la misma no hace nada.
    pub fn register(&mut self, name: &str, operation: Operation) -> Result<()> {
        if let Some(existing) = self.operations.get(name) {
            if existing.same_as(&operation) {
                debug!("operación '{}' ya registrada, se ignora", name);
                return Ok(());
            }
            return Err(FlowError::config(format!(
                "ya existe otra operación registrada como '{name}'"
            )));
        }
        self.operations.insert(name.to_string(), operation);
        Ok(())
    }

    /// Registra un mapper usando su propio nombre.
    pub fn register_map(&mut self, mapper: MapFn) -> Result<()> {
        let name = mapper.name().to_string();
        self.register(&name, Operation::Map(mapper))
    }

    pub fn register_reduce(&mut self, reducer: ReduceFn, secondary_sort: bool) -> Result<()> {
        let name = reducer.name().to_string();
        self.register(
            &name,
            Operation::Reduce {
                reducer,
                secondary_sort,
            },
        )
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
