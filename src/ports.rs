//! Narrow interfaces onto the external collaborators spec §1 explicitly
//! places out of scope: the record executor, the WAL reader's state backend,
//! the meta-store, and the RPC transport reached through a message callback.
//! The core depends only on these traits, never on a concrete store or
//! transport (mirrors `sem_os_core::ports` depending only on trait objects,
//! with `sem_os_postgres` — here `stream-task-testkit` — providing the only
//! concrete implementation this workspace ships).

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::{EpSet, TaskId};
use crate::state_machine::TaskStatus;

/// The query-operator executor driving a task's record processing. Out of
/// scope per spec §1; the core only ever needs to kill it.
pub trait Executor: Send + Sync {
    fn kill(&self);
}

/// The per-task state backend (checkpoint storage). Out of scope per spec
/// §1; the core only needs to close it, passing whether the task is
/// dropping so the backend can decide whether to keep or discard state.
pub trait StateBackend: Send + Sync {
    fn close(&self, dropping: bool);
}

/// A handle to a companion task, as resolved by the meta-store's
/// `get_task`. Used by [`crate::fill_history::clear_h_task_attr`].
pub trait TaskHandle: Send + Sync {
    fn id(&self) -> TaskId;
    fn clear_fill_history_pointer(&self);
    fn set_persistent_status(&self, status: TaskStatus);
}

/// The meta-store: persists task records and collects launch-result
/// outcomes. `vg_id`/`stage` are the local node identifier and its current
/// (monotonic per restart) stage.
#[async_trait]
pub trait MetaStore: Send + Sync {
    fn vg_id(&self) -> i32;
    fn stage(&self) -> i64;

    async fn save_task(&self, id: TaskId) -> Result<()>;

    /// `add_task_launch_result` — records a terminal launch outcome
    /// (success or failure) for correlation and reporting.
    async fn add_task_launch_result(&self, id: TaskId, start_ts_ms: i64, end_ts_ms: i64, success: bool);

    async fn get_task(&self, id: TaskId) -> Option<std::sync::Arc<dyn TaskHandle>>;
}

/// A downstream-readiness probe, as sent by the check engine (spec §4.5
/// "Sending a probe").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRequest {
    pub stream_id: u64,
    pub upstream_task_id: u32,
    pub upstream_node_id: i32,
    pub child_id: i32,
    pub stage: i64,
    pub req_id: i64,
    pub downstream_node_id: i32,
    pub downstream_task_id: i32,
}

/// `{stream_id, task_id, node_id}` — the checkpoint request body (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReq {
    pub stream_id: u64,
    pub task_id: u32,
    pub node_id: i32,
}

/// `{vg_id, task_id, reset_rel_halt}` — the drop-task request body (spec
/// §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropTaskReq {
    pub vg_id: i32,
    pub task_id: u32,
    pub reset_rel_halt: bool,
}

/// The outbound RPC surface the core reaches through. Narrow by design: the
/// actual transport, retries, and connection management are out of scope
/// (spec §1).
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// `STREAM_TASK_CHECK` → downstream.
    async fn send_check_msg(&self, req: CheckRequest, node_id: i32, epset: &EpSet) -> Result<()>;

    /// `STREAM_TASK_DROP` → local write queue.
    async fn enqueue_drop_task(&self, req: DropTaskReq) -> Result<()>;

    /// `MND_STREAM_REQ_CHKPT` → management node.
    async fn send_checkpoint_req(&self, req: CheckpointReq, mnode_epset: &EpSet) -> Result<()>;
}
