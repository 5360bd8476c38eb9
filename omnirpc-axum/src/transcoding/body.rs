//! Request assembly and response projection for transcoded calls.
//!
//! The body field selector decides how the HTTP body maps onto the request
//! message: `*` decodes the whole body into the message, a field name
//! decodes the body into that field with variable bindings populating
//! siblings, and no selector builds the message from bindings alone.

use omnirpc_axum_core::Status;
use serde_json::{Map, Value};

use super::matcher::VariableBinding;

/// Build the JSON request object for a transcoded call.
pub(crate) fn assemble_request(
    body: &[u8],
    selector: Option<&str>,
    bindings: &[VariableBinding],
) -> Result<Value, Status> {
    let mut root = match selector {
        Some("*") => {
            if body.is_empty() {
                Value::Object(Map::new())
            } else {
                parse_body(body)?
            }
        }
        Some(field) => {
            let mut root = Map::new();
            if !body.is_empty() {
                let parsed = parse_body(body)?;
                let path: Vec<String> = field.split('.').map(str::to_string).collect();
                insert_path(&mut root, &path, parsed);
            }
            Value::Object(root)
        }
        None => Value::Object(Map::new()),
    };

    if !bindings.is_empty() {
        let Value::Object(obj) = &mut root else {
            return Err(Status::invalid_argument(
                "request body must be a json object",
            ));
        };
        for binding in bindings {
            insert_path(obj, &binding.field_path, Value::String(binding.value.clone()));
        }
    }

    Ok(root)
}

/// Project the encoded response onto the HTTP body per the response-body
/// field selector.
pub(crate) fn project_response(selector: Option<&str>, value: Value) -> Value {
    let Some(selector) = selector else {
        return value;
    };
    let mut current = value;
    for key in selector.split('.') {
        current = match current {
            Value::Object(mut obj) => obj.remove(key).unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    current
}

fn parse_body(body: &[u8]) -> Result<Value, Status> {
    serde_json::from_slice(body)
        .map_err(|e| Status::invalid_argument(format!("malformed json body: {e}")))
}

/// Set a value at a dotted field path, creating intermediate objects.
fn insert_path(obj: &mut Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            obj.insert(leaf.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = obj
                .entry(head.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested) = entry {
                insert_path(nested, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcoding::matcher::BindingSource;
    use serde_json::json;

    fn binding(path: &[&str], value: &str) -> VariableBinding {
        VariableBinding {
            field_path: path.iter().map(|s| s.to_string()).collect(),
            value: value.to_string(),
            source: BindingSource::Path,
        }
    }

    #[test]
    fn test_star_selector_uses_whole_body() {
        let value = assemble_request(br#"{"title":"dune"}"#, Some("*"), &[]).unwrap();
        assert_eq!(value, json!({"title": "dune"}));
    }

    #[test]
    fn test_field_selector_nests_body() {
        let value = assemble_request(
            br#"{"title":"dune"}"#,
            Some("book"),
            &[binding(&["shelf"], "5")],
        )
        .unwrap();
        assert_eq!(value, json!({"book": {"title": "dune"}, "shelf": "5"}));
    }

    #[test]
    fn test_no_selector_uses_bindings_only() {
        let value = assemble_request(
            b"",
            None,
            &[binding(&["shelf"], "5"), binding(&["book", "id"], "dune")],
        )
        .unwrap();
        assert_eq!(value, json!({"shelf": "5", "book": {"id": "dune"}}));
    }

    #[test]
    fn test_empty_body_with_star_selector() {
        let value = assemble_request(b"", Some("*"), &[binding(&["shelf"], "5")]).unwrap();
        assert_eq!(value, json!({"shelf": "5"}));
    }

    #[test]
    fn test_malformed_body_rejected() {
        let err = assemble_request(b"{oops", Some("*"), &[]).unwrap_err();
        assert_eq!(err.code(), omnirpc_axum_core::Code::InvalidArgument);
    }

    #[test]
    fn test_project_response_selects_field() {
        let value = json!({"book": {"title": "dune"}, "etag": "abc"});
        assert_eq!(
            project_response(Some("book"), value.clone()),
            json!({"title": "dune"})
        );
        assert_eq!(
            project_response(Some("book.title"), value.clone()),
            json!("dune")
        );
        assert_eq!(project_response(Some("missing"), value.clone()), Value::Null);
        assert_eq!(project_response(None, value.clone()), value);
    }
}
