//! Error taxonomy (spec §7). One variant per failure class; the core never
//! unwinds the process — every fallible operation returns `Result<T>`.

use thiserror::Error;

use crate::state_machine::{TaskEvent, TaskStatus};

pub type Result<T> = std::result::Result<T, StreamTaskError>;

#[derive(Debug, Error)]
pub enum StreamTaskError {
    /// Allocation failure at a codec or queue boundary. Rust's allocator
    /// aborts rather than returning an error in the common case, so this
    /// variant is reserved for the few places that deliberately check a
    /// bound before allocating (e.g. a caller-supplied buffer capacity).
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid task record version {found}, expected ({min_exclusive}, {max}]")]
    InvalidVersion {
        found: i64,
        min_exclusive: i64,
        max: i64,
    },

    #[error("malformed task record: {0}")]
    Decode(String),

    #[error("task check already in progress, started at {started_at_ms}ms")]
    AlreadyInCheckProcess { started_at_ms: i64 },

    #[error("response for unknown downstream task 0x{task_id:x}, req 0x{req_id:x}")]
    UnknownTaskResponse { task_id: i32, req_id: i64 },

    #[error("event {event:?} not legal in state {state:?}")]
    StateMachineReject { state: TaskStatus, event: TaskEvent },

    #[error("duplicate upstream entry for node {node_id} task 0x{task_id:x}")]
    DuplicateUpstream { node_id: i32, task_id: i32 },

    #[error("message delivery failed: {0}")]
    Messaging(#[from] anyhow::Error),
}
