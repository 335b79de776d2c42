//! Artifact Store：Step id → 结果字段
//!
//! 每个 Step id 只写一次；重规划沿用已完成的 Step id 时原样保留，只有显式 invalidate（即重跑）后才能再写。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::OrchestratorError;
use crate::workflow::types::StepId;

/// 单个步骤的产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub fields: Map<String, Value>,
    /// 写入时的计划代次
    pub generation: u32,
    /// 写入时间（毫秒时间戳）
    pub written_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStore {
    entries: BTreeMap<StepId, Artifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入产出；同一 Step id 已有产出时拒绝
    pub fn put(
        &mut self,
        step_id: &str,
        fields: Map<String, Value>,
        generation: u32,
    ) -> Result<(), OrchestratorError> {
        if self.entries.contains_key(step_id) {
            return Err(OrchestratorError::ArtifactAlreadyWritten(step_id.to_string()));
        }
        self.entries.insert(
            step_id.to_string(),
            Artifact {
                fields,
                generation,
                written_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    /// 显式作废（Step 将被重跑），返回旧产出
    pub fn invalidate(&mut self, step_id: &str) -> Option<Artifact> {
        self.entries.remove(step_id)
    }

    pub fn get(&self, step_id: &str) -> Option<&Artifact> {
        self.entries.get(step_id)
    }

    pub fn field(&self, step_id: &str, field: &str) -> Option<&Value> {
        self.entries.get(step_id).and_then(|a| a.fields.get(field))
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.entries.contains_key(step_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_write_once() {
        let mut store = ArtifactStore::new();
        store.put("a", fields(json!({"x": 1})), 0).unwrap();
        let err = store.put("a", fields(json!({"x": 2})), 1).unwrap_err();
        assert!(matches!(err, OrchestratorError::ArtifactAlreadyWritten(id) if id == "a"));
        assert_eq!(store.field("a", "x"), Some(&json!(1)));
    }

    #[test]
    fn test_invalidate_allows_rewrite() {
        let mut store = ArtifactStore::new();
        store.put("a", fields(json!({"x": 1})), 0).unwrap();
        let old = store.invalidate("a").unwrap();
        assert_eq!(old.fields["x"], 1);
        store.put("a", fields(json!({"x": 2})), 1).unwrap();
        assert_eq!(store.get("a").unwrap().generation, 1);
    }
}
