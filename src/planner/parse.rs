//! Parses a plan out of an LLM's raw text response (spec §4.7).
//!
//! Two shapes are accepted, in order of preference:
//!
//! 1. A JSON object matching [`Plan`]'s shape, optionally wrapped in a
//!    ```` ```json ... ``` ```` fence.
//! 2. A line-oriented fallback markup: one `>>toolId k=v k2="quoted value"`
//!    line per step, with numeric/boolean/quoted-string/array/object
//!    coercion on each value.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{Plan, PlanStep};

/// Try the JSON shape first, then the `>>tool k=v` fallback markup.
/// Returns `None` if neither shape can be recovered from `text`.
pub fn parse_plan_response(text: &str) -> Option<Plan> {
    parse_json_plan(text).or_else(|| parse_fallback_markup(text))
}

fn parse_json_plan(text: &str) -> Option<Plan> {
    let candidate = extract_json_block(text);
    let value: Value = serde_json::from_str(candidate.trim()).ok()?;
    plan_from_value(&value)
}

/// Strip a surrounding ` ```json ... ``` ` (or bare ` ``` ... ``` `) fence
/// if present; otherwise return the text unchanged.
fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}

fn plan_from_value(value: &Value) -> Option<Plan> {
    let steps_value = if value.is_array() {
        value
    } else {
        value.get("steps")?
    };
    let array = steps_value.as_array()?;
    let mut steps = Vec::with_capacity(array.len());
    for (i, raw) in array.iter().enumerate() {
        let object = raw.as_object()?;
        let step_id = object
            .get("step_id")
            .or_else(|| object.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("step-{}", i.saturating_add(1)));
        let description = object
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let tool_id = object
            .get("tool_id")
            .or_else(|| object.get("tool"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let input = object.get("input").or_else(|| object.get("args")).cloned();
        let depends_on = object
            .get("depends_on")
            .or_else(|| object.get("dependsOn"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        steps.push(PlanStep {
            step_id,
            description,
            tool_id,
            input,
            depends_on,
        });
    }
    Some(Plan { steps })
}

/// Parse the `>>toolId k=v k2="quoted value"` fallback markup: one step per
/// line beginning with `>>`. A leading free-text line not starting with
/// `>>` becomes that step's description.
fn parse_fallback_markup(text: &str) -> Option<Plan> {
    let mut steps = Vec::new();
    let mut pending_description: Option<String> = None;

    for (i, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(rest) = line.strip_prefix(">>") else {
            pending_description = Some(line.to_string());
            continue;
        };

        let mut parts = rest.splitn(2, char::is_whitespace);
        let tool_id = parts.next().unwrap_or("").trim().to_string();
        if tool_id.is_empty() {
            continue;
        }
        let kv_text = parts.next().unwrap_or("");
        let input = parse_key_value_pairs(kv_text);

        steps.push(PlanStep {
            step_id: format!("step-{}", i.saturating_add(1)),
            description: pending_description.take().unwrap_or_else(|| format!("run {tool_id}")),
            tool_id: Some(tool_id),
            input: Some(input),
            depends_on: Vec::new(),
        });
    }

    if steps.is_empty() {
        None
    } else {
        Some(Plan { steps })
    }
}

/// Tokenize `k=v k2="quoted with spaces" k3=[1,2] k4={"a":1} k5=true k6=3`
/// into a JSON object, coercing each value by shape.
fn parse_key_value_pairs(text: &str) -> Value {
    let mut out = BTreeMap::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i = i.saturating_add(1);
        }
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i = i.saturating_add(1);
        }
        if i >= chars.len() || chars[i] != '=' {
            break;
        }
        let key: String = chars[key_start..i].iter().collect();
        i = i.saturating_add(1);

        let (raw_value, next) = read_value_token(&chars, i);
        i = next;
        if !key.is_empty() {
            out.insert(key, coerce_value(&raw_value));
        }
    }
    Value::Object(out.into_iter().collect())
}

fn read_value_token(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
        let quote = chars[i];
        i = i.saturating_add(1);
        let value_start = i;
        while i < chars.len() && chars[i] != quote {
            i = i.saturating_add(1);
        }
        let value: String = chars[value_start..i].iter().collect();
        return (value, i.saturating_add(1).min(chars.len()));
    }
    if i < chars.len() && (chars[i] == '[' || chars[i] == '{') {
        let open = chars[i];
        let close = if open == '[' { ']' } else { '}' };
        let value_start = i;
        let mut depth = 0usize;
        while i < chars.len() {
            if chars[i] == open {
                depth = depth.saturating_add(1);
            } else if chars[i] == close {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    i = i.saturating_add(1);
                    break;
                }
            }
            i = i.saturating_add(1);
        }
        let value: String = chars[value_start..i].iter().collect();
        return (value, i);
    }
    let value_start = i;
    while i < chars.len() && !chars[i].is_whitespace() {
        i = i.saturating_add(1);
    }
    (chars[value_start..i].iter().collect(), i)
}

fn coerce_value(raw: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        if !v.is_string() || raw.starts_with('"') {
            return v;
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else if let Ok(f) = raw.parse::<f64>() {
                Value::from(f)
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json_plan() {
        let text = r#"{"steps":[{"step_id":"s1","description":"read a file","tool_id":"fs.read","input":{"path":"hello.txt"}}]}"#;
        let plan = parse_plan_response(text).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool_id.as_deref(), Some("fs.read"));
        assert_eq!(plan.steps[0].input, Some(json!({"path": "hello.txt"})));
    }

    #[test]
    fn parses_json_plan_inside_fence() {
        let text = "Here is the plan:\n```json\n{\"steps\":[{\"step_id\":\"s1\",\"description\":\"d\",\"tool_id\":\"fs.read\"}]}\n```\n";
        let plan = parse_plan_response(text).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn parses_fallback_markup_with_coercion() {
        let text = "Reading the file now\n>>fs.read path=\"hello.txt\" recursive=false limit=3\n";
        let plan = parse_plan_response(text).unwrap();
        assert_eq!(plan.steps.len(), 1);
        let step = &plan.steps[0];
        assert_eq!(step.tool_id.as_deref(), Some("fs.read"));
        assert_eq!(step.description, "Reading the file now");
        let input = step.input.as_ref().unwrap();
        assert_eq!(input.get("path").unwrap(), &json!("hello.txt"));
        assert_eq!(input.get("recursive").unwrap(), &json!(false));
        assert_eq!(input.get("limit").unwrap(), &json!(3));
    }

    #[test]
    fn parses_fallback_markup_array_and_object_values() {
        let text = ">>fs.write paths=[1,2,3] meta={\"a\":1}\n";
        let plan = parse_plan_response(text).unwrap();
        let input = plan.steps[0].input.as_ref().unwrap();
        assert_eq!(input.get("paths").unwrap(), &json!([1, 2, 3]));
        assert_eq!(input.get("meta").unwrap(), &json!({"a": 1}));
    }

    #[test]
    fn unparseable_text_returns_none() {
        assert!(parse_plan_response("just some prose with no markup").is_none());
    }

    #[test]
    fn multi_step_dependency_graph_round_trips() {
        let text = r#"{"steps":[
            {"step_id":"a","description":"first"},
            {"step_id":"b","description":"second","dependsOn":["a"]}
        ]}"#;
        let plan = parse_plan_response(text).unwrap();
        assert_eq!(plan.steps[1].depends_on, vec!["a".to_string()]);
    }
}
