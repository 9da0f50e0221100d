//! Recovering a JSON object from model output that may wrap it in prose,
//! code fences or an array.

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
#[error("no JSON object recovered ({})", .attempts.join("; "))]
pub struct SalvageError {
    /// One message per strategy tried, in order.
    pub attempts: Vec<String>,
}

type Attempt = Result<Map<String, Value>, String>;

pub fn salvage(raw: &str) -> Result<Map<String, Value>, SalvageError> {
    let strategies: [(&str, fn(&str) -> Attempt); 4] = [
        ("direct", direct),
        ("balanced braces", first_balanced),
        ("inside array", inside_array),
        ("code fence", strip_fences),
    ];

    let mut attempts = Vec::new();
    for (name, strategy) in strategies {
        match strategy(raw) {
            Ok(obj) => return Ok(obj),
            Err(e) => attempts.push(format!("{}: {}", name, e)),
        }
    }
    Err(SalvageError { attempts })
}

fn as_object(v: Value) -> Attempt {
    match v {
        Value::Object(m) => Ok(m),
        Value::Array(mut xs) if xs.len() == 1 && xs[0].is_object() => match xs.pop() {
            Some(Value::Object(m)) => Ok(m),
            _ => Err("expected object".into()),
        },
        Value::Array(xs) => Err(format!("expected object, got array of {}", xs.len())),
        other => Err(format!("expected object, got {}", kind(&other))),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse(s: &str) -> Attempt {
    serde_json::from_str::<Value>(s.trim())
        .map_err(|e| e.to_string())
        .and_then(as_object)
}

fn direct(raw: &str) -> Attempt {
    parse(raw)
}

fn first_balanced(raw: &str) -> Attempt {
    let span = balanced_span(raw, 0).ok_or("no balanced {...} span")?;
    parse(span)
}

fn inside_array(raw: &str) -> Attempt {
    let open = raw.find('[').ok_or("no [ found")?;
    let span = balanced_span(raw, open + 1).ok_or("no balanced {...} span inside [")?;
    parse(span)
}

fn strip_fences(raw: &str) -> Attempt {
    let body: Vec<&str> = raw
        .trim()
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect();
    if body.is_empty() {
        return Err("nothing left after removing fences".into());
    }
    parse(&body.join("\n"))
}

/// The first `{...}` span at or after byte `from`, matching braces outside
/// of string literals.
fn balanced_span(s: &str, from: usize) -> Option<&str> {
    let start = from + s.get(from..)?.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj() -> Map<String, Value> {
        json!({"title": "Dev {senior}", "skills": ["Rust", "\"quoted\""], "n": 3})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn bare_object() {
        let raw = serde_json::to_string(&obj()).unwrap();
        assert_eq!(salvage(&raw).unwrap(), obj());
    }

    #[test]
    fn single_element_array() {
        let raw = format!("[{}]", serde_json::to_string(&obj()).unwrap());
        assert_eq!(salvage(&raw).unwrap(), obj());
    }

    #[test]
    fn prose_and_fences() {
        let body = serde_json::to_string_pretty(&obj()).unwrap();
        let fenced = format!("```json\n{}\n```", body);
        let prose = format!("Sure! Here is the data:\n{}\nLet me know if you need more.", body);
        assert_eq!(salvage(&fenced).unwrap(), obj());
        assert_eq!(salvage(&prose).unwrap(), obj());
    }

    #[test]
    fn array_after_junk_braces() {
        let raw = format!(
            "Output uses {{placeholders}} as described. Result: [{}] done",
            serde_json::to_string(&obj()).unwrap()
        );
        assert_eq!(salvage(&raw).unwrap(), obj());
    }

    #[test]
    fn brace_in_fence_line() {
        // The first balanced span is the fence tag; only dropping fence lines works.
        let raw = "```{json}\n{\"a\": 1}\n```";
        assert_eq!(salvage(raw).unwrap(), json!({"a": 1}).as_object().unwrap().clone());
    }

    #[test]
    fn all_strategies_reported() {
        let err = salvage("I could not find any job data.").unwrap_err();
        assert_eq!(err.attempts.len(), 4);
        assert!(err.attempts[0].starts_with("direct:"));
        assert!(err.to_string().contains("code fence"));
    }

    #[test]
    fn non_object_rejected() {
        assert!(salvage("[1, 2]").is_err());
        assert!(salvage("\"just a string\"").is_err());
        assert!(salvage("[{\"a\":1},{\"b\":2}]").is_ok_and(|m| m.contains_key("a")));
    }

    #[test]
    fn unbalanced_span() {
        assert_eq!(balanced_span("x {\"a\": \"}\" ", 0), None);
        assert_eq!(balanced_span("x {\"a\": \"}\"} y", 0), Some("{\"a\": \"}\"}"));
        assert_eq!(balanced_span(r#"{"a": "\"{"}"#, 0), Some(r#"{"a": "\"{"}"#));
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn json_object() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map("[a-z_]{1,8}", json_value(), 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn recovers_wrapped_objects(o in json_object(), pretty in any::<bool>()) {
            let body = if pretty {
                serde_json::to_string_pretty(&o).unwrap()
            } else {
                serde_json::to_string(&o).unwrap()
            };
            let wrappings = [
                body.clone(),
                format!("[{}]", body),
                format!("```json\n{}\n```", body),
                format!("Here is the extracted posting:\n{}\nAll fields follow the schema.", body),
            ];
            for w in &wrappings {
                prop_assert_eq!(&salvage(w).unwrap(), &o);
            }
        }
    }
}
