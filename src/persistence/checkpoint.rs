//! 检查点持久化
//!
//! 每个快照一个 JSON 文件：`<checkpoint_dir>/<run_id>__<label>.json`，内含 version 与完整 Run State。
//! 写入走「临时文件 + fsync + rename + fsync 目录」，读到的要么是旧快照要么是新快照。
//! 快照只在步骤之间拍：保存前 running 一律回退为 pending。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::events::{emit, EventSender, RunEvent};
use crate::core::state::{RunMetadata, RunState};
use crate::core::OrchestratorError;

/// 检查点文件格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

const SEPARATOR: &str = "__";

/// 指向一个已保存快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointHandle {
    pub run_id: String,
    pub label: String,
    pub path: PathBuf,
    /// 同一 run 内单调递增
    pub sequence: u64,
    pub saved_at: i64,
}

#[derive(Serialize)]
struct CheckpointFileRef<'a> {
    version: u32,
    run_id: &'a str,
    label: &'a str,
    sequence: u64,
    saved_at: i64,
    state: &'a RunState,
}

#[derive(Deserialize)]
struct CheckpointFile {
    version: u32,
    state: RunState,
}

/// 只读文件头（列表时用）
#[derive(Deserialize)]
struct CheckpointHeader {
    version: u32,
    run_id: String,
    label: String,
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    saved_at: i64,
}

/// 已序列化、尚未落盘的快照
struct EncodedCheckpoint {
    handle: CheckpointHandle,
    metadata: RunMetadata,
    content: Vec<u8>,
}

impl EncodedCheckpoint {
    fn commit(self, state: &mut RunState) -> CheckpointHandle {
        state.metadata = self.metadata;
        tracing::info!(run_id = %self.handle.run_id, label = %self.handle.label, path = %self.handle.path.display(), "checkpoint saved");
        self.handle
    }
}

/// 检查点目录
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存快照；同 run 同 label 覆盖旧文件。写盘成功后才更新 state.metadata
    pub fn save(&self, state: &mut RunState, label: &str) -> Result<CheckpointHandle, OrchestratorError> {
        let encoded = self.encode(state, label)?;
        fs::create_dir_all(&self.dir)?;
        atomic_write_file(&encoded.handle.path, &encoded.content)?;
        Ok(encoded.commit(state))
    }

    /// save 的异步版本：文件 I/O 放到阻塞线程池
    pub async fn save_async(&self, state: &mut RunState, label: &str) -> Result<CheckpointHandle, OrchestratorError> {
        let encoded = self.encode(state, label)?;
        let dir = self.dir.clone();
        let path = encoded.handle.path.clone();
        let content = encoded.content.clone();
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir)?;
            atomic_write_file(&path, &content)
        })
        .await
        .map_err(|e| OrchestratorError::CheckpointError(format!("checkpoint writer failed: {e}")))??;
        Ok(encoded.commit(state))
    }

    fn encode(&self, state: &RunState, label: &str) -> Result<EncodedCheckpoint, OrchestratorError> {
        let label = sanitize_label(label);
        let mut snapshot = state.clone();
        snapshot.metadata.checkpoints += 1;
        snapshot.metadata.last_checkpoint = Some(label.clone());
        snapshot.metadata.touch();
        snapshot.plan.settle_running();

        let saved_at = chrono::Utc::now().timestamp_millis();
        let sequence = snapshot.metadata.checkpoints;
        let file = CheckpointFileRef {
            version: CHECKPOINT_VERSION,
            run_id: snapshot.run_id(),
            label: &label,
            sequence,
            saved_at,
            state: &snapshot,
        };
        let content = serde_json::to_vec_pretty(&file)?;
        let path = self
            .dir
            .join(format!("{}{SEPARATOR}{}.json", snapshot.run_id(), label));

        Ok(EncodedCheckpoint {
            handle: CheckpointHandle {
                run_id: snapshot.run_id().to_string(),
                label,
                path,
                sequence,
                saved_at,
            },
            metadata: snapshot.metadata,
            content,
        })
    }

    pub fn load(&self, handle: &CheckpointHandle) -> Result<RunState, OrchestratorError> {
        Self::load_path(&handle.path)
    }

    /// 从文件加载；终态 run 也可加载（用于查看）
    pub fn load_path(path: &Path) -> Result<RunState, OrchestratorError> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::CheckpointError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: CheckpointFile = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::CheckpointError(format!("invalid checkpoint {}: {}", path.display(), e))
        })?;
        if file.version > CHECKPOINT_VERSION {
            return Err(OrchestratorError::CheckpointError(format!(
                "checkpoint version {} is newer than supported {}",
                file.version, CHECKPOINT_VERSION
            )));
        }
        let mut state = file.state;
        state.plan.settle_running();
        Ok(state)
    }

    /// 列出快照（可按 run 过滤），按 run_id、sequence 排序；无法解析的文件跳过
    pub fn list(&self, run_id: Option<&str>) -> Result<Vec<CheckpointHandle>, OrchestratorError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut handles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name.starts_with('.') || !name.contains(SEPARATOR) {
                continue;
            }
            if let Some(wanted) = run_id {
                if !name.starts_with(&format!("{wanted}{SEPARATOR}")) {
                    continue;
                }
            }
            match read_header(&path) {
                Ok(header) if header.version <= CHECKPOINT_VERSION => handles.push(CheckpointHandle {
                    run_id: header.run_id,
                    label: header.label,
                    path,
                    sequence: header.sequence,
                    saved_at: header.saved_at,
                }),
                Ok(header) => {
                    tracing::warn!(path = %path.display(), version = header.version, "skipping checkpoint with unsupported version");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                }
            }
        }
        handles.sort_by(|a, b| a.run_id.cmp(&b.run_id).then(a.sequence.cmp(&b.sequence)));
        Ok(handles)
    }

    /// 某个 run 最新的快照
    pub fn latest(&self, run_id: &str) -> Result<Option<CheckpointHandle>, OrchestratorError> {
        Ok(self
            .list(Some(run_id))?
            .into_iter()
            .max_by_key(|h| h.sequence))
    }
}

/// 保存检查点并发出事件；失败只记 warn，不打断运行
pub async fn checkpoint(
    store: Option<&CheckpointStore>,
    state: &mut RunState,
    label: &str,
    events: Option<&EventSender>,
) -> Option<CheckpointHandle> {
    let store = store?;
    match store.save_async(state, label).await {
        Ok(handle) => {
            emit(
                events,
                RunEvent::Checkpoint {
                    label: handle.label.clone(),
                    path: handle.path.display().to_string(),
                },
            );
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(label = %label, error = %e, "checkpoint failed");
            None
        }
    }
}

/// label 只保留 [A-Za-z0-9_-]，其它字符替换为 '_'
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "checkpoint".to_string()
    } else {
        cleaned
    }
}

fn read_header(path: &Path) -> Result<CheckpointHeader, OrchestratorError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("checkpoint"),
        std::process::id(),
        uuid::Uuid::new_v4().simple(),
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(parent)?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::budget::Budget;
    use crate::workflow::types::{Plan, Step, StepStatus};
    use serde_json::json;

    fn sample_state() -> RunState {
        let mut state = RunState::new("tidy downloads", Budget::with_steps(10));
        let mut a = Step::new("a", "list_dir");
        a.status = StepStatus::Completed;
        let mut b = Step::new("b", "echo");
        b.status = StepStatus::Running;
        b.deps = vec!["a".into()];
        state.plan = Plan::new("tidy downloads", vec![a, b]);
        state
            .artifacts
            .put("a", json!({"count": 2}).as_object().cloned().unwrap(), 0)
            .unwrap();
        state
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = sample_state();

        let handle = store.save(&mut state, "step-a").unwrap();
        assert_eq!(handle.label, "step-a");
        assert!(handle
            .path
            .ends_with(format!("{}__step-a.json", state.run_id())));

        let loaded = store.load(&handle).unwrap();
        assert_eq!(loaded.goal, "tidy downloads");
        assert_eq!(loaded.artifacts.field("a", "count"), Some(&json!(2)));
        assert_eq!(loaded.plan.status_of("b"), Some(StepStatus::Pending));
        assert_eq!(loaded.metadata.last_checkpoint.as_deref(), Some("step-a"));
    }

    #[test]
    fn test_file_contains_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let handle = store.save(&mut sample_state(), "final").unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&handle.path).unwrap()).unwrap();
        assert_eq!(raw["version"], CHECKPOINT_VERSION);
        assert_eq!(raw["state"]["goal"], "tidy downloads");
    }

    #[test]
    fn test_list_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut first = sample_state();
        let mut second = sample_state();
        store.save(&mut first, "validated-g0").unwrap();
        store.save(&mut first, "step-a").unwrap();
        store.save(&mut second, "validated-g0").unwrap();

        assert_eq!(store.list(None).unwrap().len(), 3);
        let own = store.list(Some(first.run_id())).unwrap();
        assert_eq!(own.len(), 2);
        let latest = store.latest(first.run_id()).unwrap().unwrap();
        assert_eq!(latest.label, "step-a");
        assert!(store.latest("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"));
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let handle = store.save(&mut sample_state(), "final").unwrap();
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&handle.path).unwrap()).unwrap();
        raw["version"] = json!(CHECKPOINT_VERSION + 1);
        fs::write(&handle.path, raw.to_string()).unwrap();
        assert!(matches!(
            CheckpointStore::load_path(&handle.path),
            Err(OrchestratorError::CheckpointError(_))
        ));
    }

    #[test]
    fn test_failed_save_leaves_metadata_alone() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let store = CheckpointStore::new(&blocker);
        let mut state = sample_state();

        assert!(store.save(&mut state, "step-a").is_err());
        assert_eq!(state.metadata.checkpoints, 0);
        assert!(state.metadata.last_checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_async_save_counts_only_successes() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = sample_state();

        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        assert!(checkpoint(Some(&CheckpointStore::new(&blocker)), &mut state, "step-a", None)
            .await
            .is_none());
        assert_eq!(state.metadata.checkpoints, 0);

        let store = CheckpointStore::new(dir.path().join("cp"));
        let handle = store.save_async(&mut state, "step-a").await.unwrap();
        assert_eq!(handle.sequence, 1);
        assert_eq!(state.metadata.checkpoints, 1);
        assert_eq!(state.metadata.last_checkpoint.as_deref(), Some("step-a"));
        let loaded = store.load(&handle).unwrap();
        assert_eq!(loaded.metadata.checkpoints, 1);
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("step-a/b c"), "step-a_b_c");
        assert_eq!(sanitize_label(""), "checkpoint");
    }
}
