//! Conversion between terms and JSON values.
//!
//! Term → JSON (`term_to_json`):
//!
//! | Term | JSON |
//! |---|---|
//! | atom `a` | `"a"` |
//! | `[]` | `[]` |
//! | integer / finite float | number |
//! | non-finite float | `"inf"`, `"-inf"`, `"nan"` |
//! | string `"s"` | `"s"` |
//! | proper list | array |
//! | compound `f(a,b)` (including partial lists, functor `[|]`) | `{"f": [a, b]}` |
//! | unbound variable | omitted |
//!
//! JSON → term (`json_to_term`):
//!
//! | JSON | Term |
//! |---|---|
//! | string | atom |
//! | integer / float | integer / float |
//! | `true` / `false` / `null` | atoms `true` / `false` / `null` |
//! | array | proper list |
//! | `{"f": [args...]}` (one key, array value) | compound `f(args...)` (atom `f` when empty) |
//! | any other object | list of `Key-Value` pairs in key order |

use serde_json::{Map, Number, Value};

use super::{Term, LIST_FUNCTOR};

/// Converts a term to JSON. Returns `None` only for an unbound variable.
pub fn term_to_json(term: &Term) -> Option<Value> {
    match term {
        Term::Var(_) => None,
        Term::Atom(name) if name == super::NIL => Some(Value::Array(Vec::new())),
        Term::Atom(name) | Term::Str(name) => Some(Value::String(name.clone())),
        Term::Int(v) => Some(Value::Number(Number::from(*v))),
        Term::Float(v) => Some(float_to_json(*v)),
        Term::Compound(name, args) => {
            if name == LIST_FUNCTOR {
                if let Some(items) = term.list_items() {
                    return Some(Value::Array(items.into_iter().filter_map(term_to_json).collect()));
                }
            }
            let converted: Vec<Value> = args.iter().filter_map(term_to_json).collect();
            let mut map = Map::new();
            map.insert(name.clone(), Value::Array(converted));
            Some(Value::Object(map))
        }
    }
}

fn float_to_json(v: f64) -> Value {
    match Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None if v.is_nan() => Value::String("nan".to_string()),
        None if v > 0.0 => Value::String("inf".to_string()),
        None => Value::String("-inf".to_string()),
    }
}

/// Converts a JSON value to a ground term.
pub fn json_to_term(value: &Value) -> Term {
    match value {
        Value::Null => Term::atom("null"),
        Value::Bool(b) => Term::atom(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Term::Int(i)
            } else {
                Term::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Term::Atom(s.clone()),
        Value::Array(items) => Term::list(items.iter().map(json_to_term).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((name, Value::Array(args))) = map.iter().next() {
                    return Term::compound(name.clone(), args.iter().map(json_to_term).collect());
                }
            }
            Term::list(
                map.iter()
                    .map(|(k, v)| Term::Compound("-".to_string(), vec![Term::Atom(k.clone()), json_to_term(v)]))
                    .collect(),
            )
        }
    }
}

/// Canonical rule-language text for a JSON value.
pub fn json_to_term_string(value: &Value) -> String {
    json_to_term(value).to_canonical()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::term::parse_term;

    #[test]
    fn atoms_numbers_lists_and_compounds() {
        let t = parse_term("f(a, 1, 2.5, \"s\", [x, y], g(h))").unwrap().term;
        assert_eq!(
            term_to_json(&t).unwrap(),
            json!({"f": ["a", 1, 2.5, "s", ["x", "y"], {"g": ["h"]}]})
        );
    }

    #[test]
    fn unbound_variables_are_omitted() {
        let t = parse_term("f(a, X, [1, Y, 2])").unwrap().term;
        assert_eq!(term_to_json(&t).unwrap(), json!({"f": ["a", [1, 2]]}));
        assert!(term_to_json(&Term::Var(0)).is_none());
    }

    #[test]
    fn partial_lists_keep_their_cells() {
        let t = parse_term("[a|b]").unwrap().term;
        assert_eq!(term_to_json(&t).unwrap(), json!({"[|]": ["a", "b"]}));
        assert_eq!(term_to_json(&Term::nil()).unwrap(), json!([]));
    }

    #[test]
    fn non_finite_floats_become_strings() {
        assert_eq!(term_to_json(&Term::Float(f64::INFINITY)).unwrap(), json!("inf"));
        assert_eq!(term_to_json(&Term::Float(f64::NAN)).unwrap(), json!("nan"));
    }

    #[test]
    fn json_objects_become_compounds_or_pairs() {
        assert_eq!(json_to_term_string(&json!({"set_tempo": [120]})), "set_tempo(120)");
        assert_eq!(json_to_term_string(&json!({"stop": []})), "stop");
        assert_eq!(
            json_to_term_string(&json!({"key": "c", "mode": "major"})),
            "[-(key,c),-(mode,major)]"
        );
    }

    #[test]
    fn json_scalars_map_to_atoms_and_numbers() {
        assert_eq!(json_to_term_string(&json!("Hello World")), "'Hello World'");
        assert_eq!(json_to_term_string(&json!(true)), "true");
        assert_eq!(json_to_term_string(&json!(null)), "null");
        assert_eq!(json_to_term_string(&json!(-3)), "-3");
        assert_eq!(json_to_term_string(&json!([1, "a"])), "[1,a]");
    }

    #[test]
    fn compound_json_survives_a_round_trip() {
        let value = json!({"add_chord": [4, {"chord": ["g", "dominant7"]}]});
        let term = json_to_term(&value);
        assert_eq!(term_to_json(&term).unwrap(), value);
    }
}
