//! In-memory test doubles for the stream-task-core ports. Mirrors the split
//! between `sem_os_core::ports` and `sem_os_postgres`'s implementation of
//! them: this crate is the only concrete `MetaStore`/`MessageCallback`
//! implementation in the workspace, built for tests rather than production.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stream_task_core::{
    CheckRequest, CheckpointReq, DropTaskReq, Executor, MessageCallback, MetaStore, Result, StateBackend,
    TaskHandle, TaskId, TaskStatus,
};

/// A single recorded `add_task_launch_result` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchResult {
    pub id: TaskId,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub success: bool,
}

#[derive(Default)]
struct Inner {
    tasks: std::collections::HashMap<TaskId, Arc<dyn TaskHandle>>,
    saved: Vec<TaskId>,
    launch_results: Vec<LaunchResult>,
}

/// An in-memory `MetaStore` that just records calls and serves back
/// pre-registered [`TaskHandle`]s. No persistence, no network — entirely
/// deterministic for tests.
pub struct InMemoryMeta {
    vg_id: i32,
    stage: i64,
    inner: Mutex<Inner>,
}

impl InMemoryMeta {
    pub fn new(vg_id: i32, stage: i64) -> Self {
        Self { vg_id, stage, inner: Mutex::new(Inner::default()) }
    }

    pub fn register_task(&self, handle: Arc<dyn TaskHandle>) {
        self.inner.lock().unwrap().tasks.insert(handle.id(), handle);
    }

    pub fn saved_tasks(&self) -> Vec<TaskId> {
        self.inner.lock().unwrap().saved.clone()
    }

    pub fn launch_results(&self) -> Vec<LaunchResult> {
        self.inner.lock().unwrap().launch_results.clone()
    }
}

#[async_trait]
impl MetaStore for InMemoryMeta {
    fn vg_id(&self) -> i32 {
        self.vg_id
    }

    fn stage(&self) -> i64 {
        self.stage
    }

    async fn save_task(&self, id: TaskId) -> Result<()> {
        self.inner.lock().unwrap().saved.push(id);
        Ok(())
    }

    async fn add_task_launch_result(&self, id: TaskId, start_ts_ms: i64, end_ts_ms: i64, success: bool) {
        self.inner.lock().unwrap().launch_results.push(LaunchResult { id, start_ts_ms, end_ts_ms, success });
    }

    async fn get_task(&self, id: TaskId) -> Option<Arc<dyn TaskHandle>> {
        self.inner.lock().unwrap().tasks.get(&id).cloned()
    }
}

/// A bare [`TaskHandle`] that records the calls the core makes against a
/// companion task.
pub struct InMemoryTaskHandle {
    id: TaskId,
    fill_history_cleared: Mutex<bool>,
    persistent_status: Mutex<Option<TaskStatus>>,
}

impl InMemoryTaskHandle {
    pub fn new(id: TaskId) -> Self {
        Self { id, fill_history_cleared: Mutex::new(false), persistent_status: Mutex::new(None) }
    }

    pub fn fill_history_cleared(&self) -> bool {
        *self.fill_history_cleared.lock().unwrap()
    }

    pub fn persistent_status(&self) -> Option<TaskStatus> {
        *self.persistent_status.lock().unwrap()
    }
}

impl TaskHandle for InMemoryTaskHandle {
    fn id(&self) -> TaskId {
        self.id
    }

    fn clear_fill_history_pointer(&self) {
        *self.fill_history_cleared.lock().unwrap() = true;
    }

    fn set_persistent_status(&self, status: TaskStatus) {
        *self.persistent_status.lock().unwrap() = Some(status);
    }
}

/// Every outbound message the core has sent through a [`RecordingMsgCb`].
#[derive(Debug, Clone, PartialEq)]
pub enum SentMessage {
    Check(CheckRequest),
    DropTask(DropTaskReq),
    Checkpoint(CheckpointReq),
}

/// An in-memory `MessageCallback` that records every outbound message
/// instead of putting it on the wire.
#[derive(Default)]
pub struct RecordingMsgCb {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingMsgCb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageCallback for RecordingMsgCb {
    async fn send_check_msg(&self, req: CheckRequest, _node_id: i32, _epset: &stream_task_core::EpSet) -> Result<()> {
        self.sent.lock().unwrap().push(SentMessage::Check(req));
        Ok(())
    }

    async fn enqueue_drop_task(&self, req: DropTaskReq) -> Result<()> {
        self.sent.lock().unwrap().push(SentMessage::DropTask(req));
        Ok(())
    }

    async fn send_checkpoint_req(&self, req: CheckpointReq, _mnode_epset: &stream_task_core::EpSet) -> Result<()> {
        self.sent.lock().unwrap().push(SentMessage::Checkpoint(req));
        Ok(())
    }
}

/// An `Executor` that just remembers whether it was killed.
#[derive(Default)]
pub struct NullExecutor {
    killed: Mutex<bool>,
}

impl NullExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_killed(&self) -> bool {
        *self.killed.lock().unwrap()
    }
}

impl Executor for NullExecutor {
    fn kill(&self) {
        *self.killed.lock().unwrap() = true;
    }
}

/// A `StateBackend` that just remembers whether/how it was closed.
#[derive(Default)]
pub struct NullStateBackend {
    closed: Mutex<Option<bool>>,
}

impl NullStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(dropping)` once [`StateBackend::close`] has been called.
    pub fn closed_with(&self) -> Option<bool> {
        *self.closed.lock().unwrap()
    }
}

impl StateBackend for NullStateBackend {
    fn close(&self, dropping: bool) {
        *self.closed.lock().unwrap() = Some(dropping);
    }
}
