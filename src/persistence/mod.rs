//! 持久化：Run State 检查点的保存、加载与列举

pub mod checkpoint;

pub use checkpoint::{checkpoint, CheckpointHandle, CheckpointStore, CHECKPOINT_VERSION};
