//! 断点续跑：检查点记录（[`checkpoint`]）与对账恢复（[`manager`]）

pub mod checkpoint;
pub mod manager;

pub use checkpoint::{new_checkpoint_id, Checkpoint, SessionSnapshot, WorkerProcessState, CHECKPOINT_FORMAT_VERSION};
pub use manager::{CheckpointSummary, ContinuationManager, ReconcileDecision, ResumePlan};
