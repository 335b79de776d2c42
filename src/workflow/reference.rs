//! 跨步骤引用：`$<stepId>.<field>[.<path>...]`
//!
//! 引用可以出现在 inputs 的任意层级（数组、对象中的字符串）。字段名以字母或下划线开头，`$5.00` 这类金额不算引用。
//! 整个字符串恰好是一个引用时，解析为被引用值本身（保留类型）；嵌在更长文本中时按文本替换。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::artifacts::ArtifactStore;

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$([A-Za-z0-9_\-]+)\.([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)")
            .expect("reference pattern is valid")
    })
}

/// 一个引用：被引用步骤、Artifact 字段、以及字段内的嵌套路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    pub step_id: String,
    pub field: String,
    pub path: Vec<String>,
}

impl std::fmt::Display for StepRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}.{}", self.step_id, self.field)?;
        for seg in &self.path {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}

impl StepRef {
    fn from_captures(caps: &regex::Captures<'_>) -> Self {
        let mut segments = caps[2].split('.').map(str::to_string);
        let field = segments.next().unwrap_or_default();
        Self {
            step_id: caps[1].to_string(),
            field,
            path: segments.collect(),
        }
    }
}

/// 执行期引用解析失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("unresolved reference {reference}: step '{step_id}' has no artifact")]
    MissingArtifact { reference: String, step_id: String },
    #[error("unresolved reference {reference}: field '{field}' not found")]
    MissingField { reference: String, field: String },
}

/// 在一个字符串中找出所有引用
pub fn refs_in_str(text: &str) -> Vec<StepRef> {
    reference_regex()
        .captures_iter(text)
        .map(|caps| StepRef::from_captures(&caps))
        .collect()
}

/// 递归收集 JSON 值中的所有引用
pub fn refs_in_value(value: &Value) -> Vec<StepRef> {
    let mut out = Vec::new();
    collect(value, &mut out);
    out
}

fn collect(value: &Value, out: &mut Vec<StepRef>) {
    match value {
        Value::String(s) => out.extend(refs_in_str(s)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}

/// 收集一个 Step inputs 中的所有引用
pub fn refs_in_inputs(inputs: &Map<String, Value>) -> Vec<StepRef> {
    let mut out = Vec::new();
    for value in inputs.values() {
        collect(value, &mut out);
    }
    out
}

/// 把指向 from 的引用改写为指向 to，保留字段与路径
pub fn rename_step_refs(value: &mut Value, from: &str, to: &str) {
    match value {
        Value::String(s) => {
            let renamed = reference_regex().replace_all(s, |caps: &regex::Captures<'_>| {
                if &caps[1] == from {
                    format!("${to}.{}", &caps[2])
                } else {
                    caps[0].to_string()
                }
            });
            if let std::borrow::Cow::Owned(renamed) = renamed {
                *s = renamed;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| rename_step_refs(v, from, to)),
        Value::Object(map) => map.values_mut().for_each(|v| rename_step_refs(v, from, to)),
        _ => {}
    }
}

/// 把 inputs 中的所有引用替换为 Artifact Store 中的值；缺失即报错，绝不默认
pub fn resolve_inputs(
    inputs: &Map<String, Value>,
    artifacts: &ArtifactStore,
) -> Result<Map<String, Value>, ReferenceError> {
    inputs
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, artifacts)?)))
        .collect()
}

fn resolve_value(value: &Value, artifacts: &ArtifactStore) -> Result<Value, ReferenceError> {
    match value {
        Value::String(s) => resolve_str(s, artifacts),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, artifacts))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(v, artifacts)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_str(text: &str, artifacts: &ArtifactStore) -> Result<Value, ReferenceError> {
    let re = reference_regex();
    if let Some(m) = re.find(text) {
        if m.start() == 0 && m.end() == text.len() {
            let caps = re.captures(text).ok_or_else(|| ReferenceError::MissingField {
                reference: text.to_string(),
                field: String::new(),
            })?;
            return lookup(&StepRef::from_captures(&caps), artifacts).cloned();
        }
    } else {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        out.push_str(&text[last..whole.0]);
        let value = lookup(&StepRef::from_captures(&caps), artifacts)?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.1;
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

fn lookup<'a>(reference: &StepRef, artifacts: &'a ArtifactStore) -> Result<&'a Value, ReferenceError> {
    let artifact = artifacts
        .get(&reference.step_id)
        .ok_or_else(|| ReferenceError::MissingArtifact {
            reference: reference.to_string(),
            step_id: reference.step_id.clone(),
        })?;
    let mut current = artifact
        .fields
        .get(&reference.field)
        .ok_or_else(|| ReferenceError::MissingField {
            reference: reference.to_string(),
            field: reference.field.clone(),
        })?;
    for seg in &reference.path {
        let next = match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| ReferenceError::MissingField {
            reference: reference.to_string(),
            field: seg.clone(),
        })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ArtifactStore {
        let mut store = ArtifactStore::new();
        let fields = json!({"path": "/tmp/a", "count": 3, "meta": {"pages": [1, 2]}});
        store
            .put("1", fields.as_object().cloned().unwrap(), 0)
            .unwrap();
        store
    }

    #[test]
    fn test_refs_found_at_any_depth() {
        let inputs = json!({
            "p": "$1.path",
            "list": ["x", "$a.b"],
            "nested": {"q": "see $c.d.e please"}
        });
        let refs = refs_in_inputs(inputs.as_object().unwrap());
        let ids: Vec<&str> = refs.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(refs.len(), 3);
        assert!(ids.contains(&"1") && ids.contains(&"a") && ids.contains(&"c"));
        let deep = refs.iter().find(|r| r.step_id == "c").unwrap();
        assert_eq!(deep.field, "d");
        assert_eq!(deep.path, vec!["e".to_string()]);
    }

    #[test]
    fn test_exact_reference_keeps_type() {
        let inputs = json!({"p": "$1.path", "n": "$1.count", "page": "$1.meta.pages.1"});
        let resolved = resolve_inputs(inputs.as_object().unwrap(), &store()).unwrap();
        assert_eq!(resolved["p"], "/tmp/a");
        assert_eq!(resolved["n"], 3);
        assert_eq!(resolved["page"], 2);
    }

    #[test]
    fn test_embedded_reference_substituted_as_text() {
        let inputs = json!({"msg": "found $1.count files at $1.path"});
        let resolved = resolve_inputs(inputs.as_object().unwrap(), &store()).unwrap();
        assert_eq!(resolved["msg"], "found 3 files at /tmp/a");
    }

    #[test]
    fn test_missing_field_is_hard_error() {
        let inputs = json!({"p": "$1.nope"});
        let err = resolve_inputs(inputs.as_object().unwrap(), &store()).unwrap_err();
        assert!(matches!(err, ReferenceError::MissingField { .. }));
    }

    #[test]
    fn test_missing_artifact_is_hard_error() {
        let inputs = json!({"p": ["$2.path"]});
        let err = resolve_inputs(inputs.as_object().unwrap(), &store()).unwrap_err();
        assert!(matches!(err, ReferenceError::MissingArtifact { .. }));
    }

    #[test]
    fn test_rename_only_touches_matching_step() {
        let mut value = json!({"p": "$b.path", "q": ["see $b.meta.x and $bb.path"], "r": "$a.b"});
        rename_step_refs(&mut value, "b", "b2");
        assert_eq!(
            value,
            json!({"p": "$b2.path", "q": ["see $b2.meta.x and $bb.path"], "r": "$a.b"})
        );
    }

    #[test]
    fn test_prices_are_not_references() {
        let inputs = json!({"price": "$5.00", "msg": "costs $12.50 at $1.path"});
        let refs = refs_in_inputs(inputs.as_object().unwrap());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].step_id, "1");
        let resolved = resolve_inputs(inputs.as_object().unwrap(), &store()).unwrap();
        assert_eq!(resolved["price"], "$5.00");
        assert_eq!(resolved["msg"], "costs $12.50 at /tmp/a");
    }

    #[test]
    fn test_literals_untouched() {
        let inputs = json!({"a": 1, "b": true, "c": "no refs here", "d": null});
        let resolved = resolve_inputs(inputs.as_object().unwrap(), &ArtifactStore::new()).unwrap();
        assert_eq!(Value::Object(resolved), inputs);
    }
}
