//! Per-task lifecycle core for a stream-processing dataflow node.
//!
//! A [`task::StreamTask`] owns its [`state_machine::TaskStateMachine`],
//! topology ([`topology::UpstreamInfo`] / [`topology::OutputVariant`]),
//! scheduling interlock ([`sched::SchedFlag`]), and downstream-readiness
//! monitor ([`check_engine::CheckEngine`]). The wire format for persisting
//! and restoring a task is in [`codec`]. Everything the core needs from its
//! host — metadata storage, message delivery, execution, state-backend
//! teardown — comes in through the narrow traits in [`ports`].

pub mod check_engine;
pub mod codec;
pub mod config;
pub mod error;
pub mod fill_history;
pub mod identity;
pub mod messaging;
pub mod ports;
pub mod sched;
pub mod state_machine;
pub mod task;
pub mod timer;
pub mod topology;

pub use check_engine::{CheckEngine, DownstreamRsp, DownstreamStatus};
pub use codec::{CheckpointOnly, TaskRecord, CURRENT_VER, INCOMPATIBLE_VER, SUBTABLE_CHANGED_VER};
pub use config::StreamTaskConfig;
pub use error::{Result, StreamTaskError};
pub use fill_history::HistoryLaunchBackoff;
pub use identity::{CheckpointInfo, DataRange, EpSet, Endpoint, ExecStats, OutputKind, TaskId, TaskLevel};
pub use ports::{
    CheckRequest, CheckpointReq, DropTaskReq, Executor, MessageCallback, MetaStore, StateBackend, TaskHandle,
};
pub use sched::{SchedFlag, SchedStatus};
pub use state_machine::{TaskEvent, TaskStateMachine, TaskStatus};
pub use task::{CompanionLinks, PausedTaskCounter, StreamTask};
pub use timer::{TimerActive, TimerGuard};
pub use topology::{
    ChildEpInfo, DownstreamTarget, FixedDispatchInfo, OutputVariant, ShuffleDispatchInfo, SmaSinkInfo,
    TableSinkInfo, UpstreamInfo, VgroupInfo,
};
