//! Reconciles loose action shapes into the canonical `{type: tool|message}`
//! form. Models inconsistently nest the tool identifier; the rules here
//! accept the common variants without rejecting anything — downstream
//! validation handles genuinely invalid objects.

use pilot_core::ToolName;
use serde_json::{Map, Value};

pub fn normalize_action(mut value: Value) -> Value {
    if !value.is_object() {
        return value;
    }

    let action_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);

    match action_type.as_deref() {
        Some("tool") | Some("message") => {}
        // `{"type": "read_file", ...}` — the tool name sits in `type`.
        Some(t) if ToolName::from_name(t).is_some() => {
            let name = t.to_string();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("name".to_string(), Value::String(name));
                obj.insert("type".to_string(), Value::String("tool".to_string()));
                obj.entry("args")
                    .or_insert_with(|| Value::Object(Map::new()));
            }
        }
        _ => {
            // `{"name": "read_file", "args": {...}}` — the type tag is
            // missing or junk but the shape is unmistakably a tool call.
            let known_name = value
                .get("name")
                .and_then(Value::as_str)
                .and_then(ToolName::from_name)
                .is_some();
            let has_args_map = value.get("args").is_some_and(Value::is_object);
            if known_name && has_args_map {
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("type".to_string(), Value::String("tool".to_string()));
                }
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_actions_pass_through_unchanged() {
        let msg = json!({"type":"message","content":"done"});
        assert_eq!(normalize_action(msg.clone()), msg);

        let tool = json!({"type":"tool","name":"read_file","args":{"path":"a"}});
        assert_eq!(normalize_action(tool.clone()), tool);
    }

    #[test]
    fn tool_name_in_type_slot_is_lifted() {
        let out = normalize_action(json!({"type":"read_file","args":{"path":"a"}}));
        assert_eq!(out["type"], "tool");
        assert_eq!(out["name"], "read_file");
        assert_eq!(out["args"]["path"], "a");
    }

    #[test]
    fn missing_args_default_to_empty_mapping() {
        let out = normalize_action(json!({"type":"list_files"}));
        assert_eq!(out["type"], "tool");
        assert!(out["args"].as_object().unwrap().is_empty());
    }

    #[test]
    fn bare_name_and_args_coerce_to_tool() {
        let out = normalize_action(json!({"name":"search_text","args":{"pattern":"x"}}));
        assert_eq!(out["type"], "tool");
        assert_eq!(out["name"], "search_text");
    }

    #[test]
    fn unknown_shapes_pass_through_for_downstream_rejection() {
        let junk = json!({"type":"deploy","target":"prod"});
        assert_eq!(normalize_action(junk.clone()), junk);

        let no_args = json!({"name":"read_file"});
        assert_eq!(normalize_action(no_args.clone()), no_args);
    }
}
