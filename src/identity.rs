//! Task identity and the other small value types shared across modules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniquely identifies a task within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub stream_id: u64,
    pub task_id: u32,
}

impl TaskId {
    pub fn new(stream_id: u64, task_id: u32) -> Self {
        Self { stream_id, task_id }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.stream_id, self.task_id)
    }
}

/// Position of a task within the dataflow graph. Never changes after creation
/// (invariant #1).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskLevel {
    Source,
    Agg,
    Sink,
}

impl TaskLevel {
    pub fn has_upstream(&self) -> bool {
        matches!(self, Self::Agg | Self::Sink)
    }

    pub fn has_downstream(&self) -> bool {
        matches!(self, Self::Source | Self::Agg)
    }

    /// `is_sink_task` — a SINK task never runs the downstream-readiness
    /// check protocol and never encodes `qmsg` in the wire record.
    pub fn is_sink_task(&self) -> bool {
        matches!(self, Self::Sink)
    }
}

/// Discriminator for the output/dispatch variant a task encodes. Never changes
/// after creation (invariant #1).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputKind {
    Table,
    Sma,
    Fetch,
    FixedDispatch,
    ShuffleDispatch,
}

/// A single network endpoint (host/port pair reaching a node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub fqdn: String,
    pub port: u16,
}

/// An ordered list of endpoints reaching a node, with a preferred index.
///
/// Readers tolerate a transiently torn value here (§5 shared-resource
/// policy): an in-flight `assign` from a meta-push thread may be observed
/// half-updated by a concurrent dispatcher read, which simply falls back to
/// using the stale entry until the next dispatch attempt picks up the
/// completed update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpSet {
    pub eps: Vec<Endpoint>,
    pub in_use: usize,
}

impl EpSet {
    pub fn new(eps: Vec<Endpoint>, in_use: usize) -> Self {
        Self { eps, in_use }
    }

    pub fn preferred(&self) -> Option<&Endpoint> {
        self.eps.get(self.in_use)
    }

    /// Replace in place — mirrors `epsetAssign` in the original implementation.
    pub fn assign(&mut self, other: &EpSet) {
        self.eps = other.eps.clone();
        self.in_use = other.in_use;
    }
}

/// `{checkpoint_id, checkpoint_ver, processed_ver, next_process_ver, msg_ver}`.
/// Monotonic (invariant #2: `checkpoint_ver <= processed_ver <= next_process_ver`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: i64,
    pub checkpoint_ver: i64,
    pub processed_ver: i64,
    pub next_process_ver: i64,
    pub msg_ver: i64,
}

/// `{min_ver, max_ver, window_start, window_end}`. Set once at creation for a
/// fill-history task; otherwise collapses to the initial log version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    pub min_ver: u64,
    pub max_ver: u64,
    pub window_start: i64,
    pub window_end: i64,
}

/// Execution/launch statistics, tracked for diagnostics only — never
/// load-bearing for a transition decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStats {
    pub created_ms: i64,
    pub latest_update_ms: i64,
    pub update_count: u32,
}
