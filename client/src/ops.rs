use anyhow::{anyhow, Context};
use common::{FlowError, MapFn, OperationRegistry, ReduceFn};
use serde_json::{json, Map, Value};

/// flat_map: línea de texto -> un par (palabra, 1) por token.
/// Limpia: sólo alfanumérico y '_', en minúscula.
pub fn tokenize() -> MapFn {
    MapFn::new("tokenize", |_key, value| {
        let text = value
            .as_str()
            .ok_or_else(|| anyhow!("se esperaba una línea de texto, llegó {value}"))?;

        Ok(text
            .split_whitespace()
            .map(|raw| {
                raw.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_')
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .map(|w| (w, json!(1)))
            .collect())
    })
}

/// reduce: suma los conteos de cada palabra.
pub fn count() -> ReduceFn {
    ReduceFn::new("count", |key, values| {
        let mut total: u64 = 0;
        for v in values {
            total += v
                .as_u64()
                .ok_or_else(|| anyhow!("conteo inválido para '{key}': {v}"))?;
        }
        Ok(vec![(key.to_string(), json!(total))])
    })
}

/// filter: deja pasar sólo las palabras con al menos `min` apariciones.
pub fn at_least(min: u64) -> MapFn {
    MapFn::new("at_least", move |key, value| {
        let n = value
            .as_u64()
            .ok_or_else(|| anyhow!("conteo inválido para '{key}': {value}"))?;
        Ok(if n >= min {
            vec![(key.to_string(), value.clone())]
        } else {
            vec![]
        })
    })
}

/// Re-indexa un registro JSON por `key_field` y lo etiqueta con `order`
/// para el orden secundario: `(clave, [order, registro])`.
pub fn tag_by(name: &str, key_field: &str, order: i64) -> MapFn {
    let key_field = key_field.to_string();
    MapFn::new(name, move |_key, value| {
        let key = value
            .get(&key_field)
            .and_then(Value::as_str)
            .with_context(|| format!("registro sin campo '{key_field}'"))?;
        Ok(vec![(key.to_string(), json!([order, value]))])
    })
}

/// Fusiona dos registros JSON en uno solo.
/// - el campo `key_field` se mantiene una sola vez
/// - si un campo existe en ambos lados, se respeta el del lado izquierdo
///   y el del derecho se guarda con prefijo `right_`.
fn merge_records(left: &Value, right: &Value, key_field: &str) -> Value {
    let mut obj = Map::new();

    if let Some(lobj) = left.as_object() {
        for (k, v) in lobj {
            obj.insert(k.clone(), v.clone());
        }
    }

    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            if k == key_field {
                continue;
            }
            if obj.contains_key(k) {
                obj.insert(format!("right_{k}"), v.clone());
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    Value::Object(obj)
}

/// reduce con orden secundario: los registros con orden 0 (catálogo) llegan
/// primero; cada registro con orden 1 (ventas) se combina con ellos.
/// Inner join: ventas sin catálogo no generan salida.
pub fn join_sorted(key_field: &str) -> ReduceFn {
    let key_field = key_field.to_string();
    ReduceFn::new("join", move |key, values| {
        let mut catalog: Vec<Value> = Vec::new();
        let mut out = Vec::new();

        for v in values {
            let (order, payload) = match v.as_array().map(Vec::as_slice) {
                Some([order, payload]) => (order.as_i64(), payload.clone()),
                _ => return Err(anyhow!("valor sin etiqueta de orden: {v}")),
            };
            match order {
                Some(0) => catalog.push(payload),
                Some(_) => {
                    for c in &catalog {
                        out.push((key.to_string(), merge_records(&payload, c, &key_field)));
                    }
                }
                None => return Err(anyhow!("orden inválido en {v}")),
            }
        }
        Ok(out)
    })
}

/// Operaciones disponibles por nombre desde la CLI.
pub fn register_all(registry: &mut OperationRegistry) -> Result<(), FlowError> {
    registry.register_map(tokenize())?;
    registry.register_reduce(count(), false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Values;

    fn values(v: Vec<Value>) -> Values<'static> {
        Box::new(v.into_iter())
    }

    #[test]
    fn tokenize_normaliza_y_descarta_signos() {
        let out = tokenize().call("0", &json!("Hola hola, mundo!! ...")).unwrap();
        let words: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(words, vec!["hola", "hola", "mundo"]);
        assert!(out.iter().all(|(_, v)| *v == json!(1)));
    }

    #[test]
    fn tokenize_falla_si_el_valor_no_es_texto() {
        assert!(tokenize().call("0", &json!({"text": "x"})).is_err());
    }

    #[test]
    fn count_suma_valores() {
        let out = count()
            .call("hola", values(vec![json!(1), json!(2), json!(1)]))
            .unwrap();
        assert_eq!(out, vec![("hola".to_string(), json!(4))]);
    }

    #[test]
    fn at_least_filtra_por_minimo() {
        let f = at_least(2);
        assert!(f.call("a", &json!(1)).unwrap().is_empty());
        assert_eq!(f.call("b", &json!(3)).unwrap(), vec![("b".to_string(), json!(3))]);
    }

    #[test]
    fn tag_by_reindexa_por_campo() {
        let tag = tag_by("tag_ventas", "product_id", 1);
        let out = tag.call("0", &json!({"product_id": "7", "qty": "2"})).unwrap();
        assert_eq!(
            out,
            vec![("7".to_string(), json!([1, {"product_id": "7", "qty": "2"}]))]
        );
        assert!(tag.call("1", &json!({"otro": "x"})).is_err());
    }

    #[test]
    fn join_combina_ventas_con_catalogo() {
        let out = join_sorted("product_id")
            .call(
                "7",
                values(vec![
                    json!([0, {"product_id": "7", "name": "mate"}]),
                    json!([1, {"product_id": "7", "qty": "2"}]),
                    json!([1, {"product_id": "7", "qty": "5", "name": "x"}]),
                ]),
            )
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, json!({"product_id": "7", "qty": "2", "name": "mate"}));
        assert_eq!(
            out[1].1,
            json!({"product_id": "7", "qty": "5", "name": "x", "right_name": "mate"})
        );
    }

    #[test]
    fn join_sin_catalogo_no_emite() {
        let out = join_sorted("product_id")
            .call("9", values(vec![json!([1, {"product_id": "9"}])]))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn register_all_registra_tokenize_y_count() {
        let mut reg = OperationRegistry::new();
        register_all(&mut reg).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.get("tokenize").is_some());
        assert!(reg.get("count").is_some());
    }
}
