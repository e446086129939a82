use serde_json::Value;

use crate::{
    functions::{JobContext, MapFn},
    task::{Collector, ShuffleKey},
};

/// Destino de los errores de datos que encuentra una cadena.
pub trait ErrorReporter {
    fn report(&self, key: &str, value: &str, operation: &str, message: &str);
}

/// Cómo se escribe cada par al final de la cadena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    /// Strings tal cual, el resto como JSON.
    Raw,
    Json,
    /// El valor tiene que ser `[orden, payload]`; la clave pasa a (clave, orden).
    SecondarySort,
}

/// Texto de un valor sin comillas si es string.
pub fn raw_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn secondary_order(value: &Value) -> Option<i64> {
    match value.as_array()?.as_slice() {
        [order, _payload] => order.as_i64(),
        _ => None,
    }
}

/// Secuencia de funciones que se aplican registro a registro.
///
/// Cada salida de una etapa entra a la siguiente; si una etapa falla para
/// un registro, el error se reporta y sólo ese registro se descarta.
#[derive(Debug, Clone)]
pub struct FunctionChain {
    stages: Vec<MapFn>,
    first_index: usize,
    encoder: Encoder,
}

impl FunctionChain {
    /// `first_index` es la posición de la primera etapa dentro de la cadena
    /// completa del job; se usa para nombrar las operaciones.
    pub fn new(stages: Vec<MapFn>, first_index: usize, encoder: Encoder) -> Self {
        Self {
            stages,
            first_index,
            encoder,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Nombre de la operación en la posición `idx` (relativa a esta cadena).
    pub fn operation_name(&self, idx: usize) -> String {
        let name = self.stages.get(idx).map(MapFn::name).unwrap_or("collect");
        format!("{}-{}", name, self.first_index + idx)
    }

    pub fn call(
        &self,
        key: &str,
        value: &Value,
        ctx: &JobContext,
        out: &mut dyn Collector,
        errors: &dyn ErrorReporter,
    ) {
        self.call_from(0, key, value, ctx, out, errors);
    }

    fn call_from(
        &self,
        idx: usize,
        key: &str,
        value: &Value,
        ctx: &JobContext,
        out: &mut dyn Collector,
        errors: &dyn ErrorReporter,
    ) {
        let Some(stage) = self.stages.get(idx) else {
            self.encode(key, value, out, errors);
            return;
        };

        match stage.call_in(key, value, ctx) {
            Ok(emitted) => {
                for (k, v) in emitted {
                    self.call_from(idx + 1, &k, &v, ctx, out, errors);
                }
            }
            Err(e) => errors.report(
                key,
                &raw_text(value),
                &self.operation_name(idx),
                &format!("{e:#}"),
            ),
        }
    }

    fn encode(&self, key: &str, value: &Value, out: &mut dyn Collector, errors: &dyn ErrorReporter) {
        match self.encoder {
            Encoder::Raw => out.collect(ShuffleKey::Text(key.to_string()), raw_text(value)),
            Encoder::Json => out.collect(ShuffleKey::Text(key.to_string()), value.to_string()),
            Encoder::SecondarySort => match secondary_order(value) {
                Some(order) => {
                    out.collect(ShuffleKey::TextInt(key.to_string(), order), value.to_string())
                }
                None => errors.report(
                    key,
                    &raw_text(value),
                    &self.operation_name(self.stages.len()),
                    "orden secundario requiere un valor [entero, payload]",
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured(Mutex<Vec<(String, String, String)>>);

    impl ErrorReporter for Captured {
        fn report(&self, key: &str, value: &str, operation: &str, _message: &str) {
            self.0
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string(), operation.to_string()));
        }
    }

    fn split_words() -> MapFn {
        MapFn::new("split", |_k, v| {
            Ok(v.as_str()
                .unwrap_or_default()
                .split_whitespace()
                .map(|w| (w.to_string(), json!(1)))
                .collect())
        })
    }

    fn reject(word: &'static str) -> MapFn {
        MapFn::new("reject", move |k, v| {
            if k == word {
                anyhow::bail!("palabra prohibida: {k}");
            }
            Ok(vec![(k.to_string(), v.clone())])
        })
    }

    #[test]
    fn cadena_aplica_etapas_en_orden_y_codifica_json() {
        let chain = FunctionChain::new(vec![split_words()], 1, Encoder::Json);
        let errors = Captured::default();
        let mut out: Vec<(ShuffleKey, String)> = Vec::new();

        chain.call("0", &json!("a b"), &JobContext::default(), &mut out, &errors);

        assert_eq!(
            out,
            vec![
                (ShuffleKey::Text("a".into()), "1".to_string()),
                (ShuffleKey::Text("b".into()), "1".to_string()),
            ]
        );
        assert!(errors.0.lock().unwrap().is_empty());
    }

    #[test]
    fn etapa_que_falla_descarta_solo_ese_registro() {
        let chain = FunctionChain::new(vec![split_words(), reject("b")], 1, Encoder::Raw);
        let errors = Captured::default();
        let mut out: Vec<(ShuffleKey, String)> = Vec::new();

        chain.call("0", &json!("a b c"), &JobContext::default(), &mut out, &errors);

        let keys: Vec<&str> = out.iter().map(|(k, _)| k.text()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(
            errors.0.lock().unwrap().clone(),
            vec![("b".to_string(), "1".to_string(), "reject-2".to_string())]
        );
    }

    #[test]
    fn orden_secundario_arma_clave_compuesta() {
        let chain = FunctionChain::new(vec![], 1, Encoder::SecondarySort);
        let errors = Captured::default();
        let mut out: Vec<(ShuffleKey, String)> = Vec::new();

        chain.call("u1", &json!([3, "c"]), &JobContext::default(), &mut out, &errors);
        chain.call("u1", &json!("sin orden"), &JobContext::default(), &mut out, &errors);

        assert_eq!(
            out,
            vec![(ShuffleKey::TextInt("u1".into(), 3), r#"[3,"c"]"#.to_string())]
        );
        let captured = errors.0.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].2, "collect-1");
    }

    #[test]
    fn raw_text_no_agrega_comillas_a_strings() {
        assert_eq!(raw_text(&json!("hola")), "hola");
        assert_eq!(raw_text(&json!(3)), "3");
        assert_eq!(raw_text(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
