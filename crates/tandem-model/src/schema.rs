// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-provider JSON Schema shaping.
//!
//! The same structural schema (for a JSON response or a function-tool input)
//! is tuned differently per target:
//!
//! - **OpenAI / ChatGPT** strict mode requires `additionalProperties: false`
//!   on every object, every property key listed in `required`, and a resolved
//!   root (no top-level `$ref`).
//! - **Gemini** wants an explicit `propertyOrdering` and expands the
//!   JSON-Schema `["T", "null"]` type form into `nullable: true`.
//! - **Fireworks** accepts standard JSON Schema 7 unchanged.

use serde_json::{json, Map, Value};

/// Shape a schema for the OpenAI / ChatGPT strict `json_schema` format.
pub fn for_openai(schema: &Value) -> Value {
    let resolved = resolve_root_ref(schema);
    let mut shaped = resolved;
    tighten_objects(&mut shaped);
    shaped
}

/// Shape a schema for Gemini's `responseJsonSchema` / function declarations.
pub fn for_gemini(schema: &Value) -> Value {
    let mut shaped = resolve_root_ref(schema);
    gemini_adjust(&mut shaped);
    shaped
}

/// Fireworks takes standard JSON Schema 7 as-is.
pub fn for_fireworks(schema: &Value) -> Value {
    schema.clone()
}

/// Replace a top-level `$ref` with the referenced definition, keeping the
/// definition table in place for nested references.
fn resolve_root_ref(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };
    let Some(reference) = obj.get("$ref").and_then(Value::as_str) else {
        return schema.clone();
    };
    let defs_key = if obj.contains_key("$defs") {
        "$defs"
    } else {
        "definitions"
    };
    let name = reference
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let Some(target) = obj
        .get(defs_key)
        .and_then(|d| d.get(name))
        .and_then(Value::as_object)
    else {
        return schema.clone();
    };

    // Merge: referenced definition wins, sibling keys (title, $defs) are kept.
    let mut merged: Map<String, Value> = obj.clone();
    merged.remove("$ref");
    for (k, v) in target {
        merged.insert(k.clone(), v.clone());
    }
    Value::Object(merged)
}

/// Recursively apply strict-mode constraints to every object schema.
fn tighten_objects(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if obj.get("type").and_then(Value::as_str) == Some("object")
        || obj.contains_key("properties")
    {
        let keys: Vec<String> = obj
            .get("properties")
            .and_then(Value::as_object)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        obj.insert("additionalProperties".into(), json!(false));
        obj.insert("required".into(), json!(keys));
    }

    for key in ["properties", "$defs", "definitions"] {
        if let Some(children) = obj.get_mut(key).and_then(Value::as_object_mut) {
            for child in children.values_mut() {
                tighten_objects(child);
            }
        }
    }
    if let Some(items) = obj.get_mut("items") {
        tighten_objects(items);
    }
    for key in ["anyOf", "allOf", "oneOf"] {
        if let Some(list) = obj.get_mut(key).and_then(Value::as_array_mut) {
            for child in list {
                tighten_objects(child);
            }
        }
    }
}

/// Recursively add `propertyOrdering` and expand nullable type arrays.
fn gemini_adjust(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    // ["string", "null"] → type: "string", nullable: true
    if let Some(types) = obj.get("type").and_then(Value::as_array) {
        let non_null: Vec<String> = types
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| *t != "null")
            .map(str::to_string)
            .collect();
        let had_null = types.iter().any(|t| t.as_str() == Some("null"));
        if non_null.len() == 1 {
            obj.insert("type".into(), json!(non_null[0]));
            if had_null {
                obj.insert("nullable".into(), json!(true));
            }
        }
    }

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        let ordering: Vec<String> = props.keys().cloned().collect();
        obj.insert("propertyOrdering".into(), json!(ordering));
    }

    for key in ["properties", "$defs", "definitions"] {
        if let Some(children) = obj.get_mut(key).and_then(Value::as_object_mut) {
            for child in children.values_mut() {
                gemini_adjust(child);
            }
        }
    }
    if let Some(items) = obj.get_mut("items") {
        gemini_adjust(items);
    }
    for key in ["anyOf", "allOf", "oneOf"] {
        if let Some(list) = obj.get_mut(key).and_then(Value::as_array_mut) {
            for child in list {
                gemini_adjust(child);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_requires_all_keys_and_forbids_extras() {
        let schema = json!({
            "type": "object",
            "properties": {
                "headline": { "type": "string" },
                "score": { "type": "number" }
            },
            "required": ["headline"]
        });
        let shaped = for_openai(&schema);
        assert_eq!(shaped["additionalProperties"], json!(false));
        let required: Vec<&str> = shaped["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"headline"));
        assert!(required.contains(&"score"));
    }

    #[test]
    fn openai_tightens_nested_objects_and_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "name": { "type": "string" } }
                    }
                }
            }
        });
        let shaped = for_openai(&schema);
        let inner = &shaped["properties"]["items"]["items"];
        assert_eq!(inner["additionalProperties"], json!(false));
        assert_eq!(inner["required"], json!(["name"]));
    }

    #[test]
    fn openai_resolves_root_ref() {
        let schema = json!({
            "$ref": "#/$defs/Headline",
            "$defs": {
                "Headline": {
                    "type": "object",
                    "properties": { "text": { "type": "string" } }
                }
            }
        });
        let shaped = for_openai(&schema);
        assert_eq!(shaped["type"], json!("object"));
        assert!(shaped.get("$ref").is_none());
        assert_eq!(shaped["required"], json!(["text"]));
    }

    #[test]
    fn gemini_adds_property_ordering() {
        let schema = json!({
            "type": "object",
            "properties": {
                "headline": { "type": "string" },
                "body": { "type": "string" }
            }
        });
        let shaped = for_gemini(&schema);
        let ordering = shaped["propertyOrdering"].as_array().unwrap();
        assert_eq!(ordering.len(), 2);
    }

    #[test]
    fn gemini_expands_nullable_type_arrays() {
        let schema = json!({
            "type": "object",
            "properties": {
                "note": { "type": ["string", "null"] }
            }
        });
        let shaped = for_gemini(&schema);
        assert_eq!(shaped["properties"]["note"]["type"], json!("string"));
        assert_eq!(shaped["properties"]["note"]["nullable"], json!(true));
    }

    #[test]
    fn fireworks_passes_through_unchanged() {
        let schema = json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        });
        assert_eq!(for_fireworks(&schema), schema);
    }
}
