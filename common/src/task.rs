use serde::{Deserialize, Serialize};

/// Clave que sale de la fase map.
///
/// Con orden secundario el engine agrupa por el texto y ordena los valores
/// de cada grupo por el entero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShuffleKey {
    Text(String),
    TextInt(String, i64),
}

impl ShuffleKey {
    pub fn text(&self) -> &str {
        match self {
            ShuffleKey::Text(t) | ShuffleKey::TextInt(t, _) => t,
        }
    }

    pub fn order(&self) -> i64 {
        match self {
            ShuffleKey::Text(_) => 0,
            ShuffleKey::TextInt(_, order) => *order,
        }
    }
}

/// Destino de los pares que emite una tarea map o reduce.
pub trait Collector {
    fn collect(&mut self, key: ShuffleKey, value: String);
}

impl Collector for Vec<(ShuffleKey, String)> {
    fn collect(&mut self, key: ShuffleKey, value: String) {
        self.push((key, value));
    }
}

/// Lógica por registro que el engine ejecuta dentro de sus tareas.
///
/// El engine lee las entradas, llama `map` por cada registro, hace el
/// shuffle/sort y llama `reduce` una vez por clave. Los errores de datos
/// se manejan dentro de la implementación; estas llamadas no fallan.
pub trait TaskLogic: Send + Sync {
    fn map(&self, key: String, value: String, out: &mut dyn Collector);

    fn reduce(&self, key: &str, values: &mut dyn Iterator<Item = String>, out: &mut dyn Collector);
}
