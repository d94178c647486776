//! The status state machine (spec §4.3). A bounded, event-driven automaton.
//! Events are delivered synchronously (the caller blocks for the resulting
//! state) or asynchronously (queued, with a completion callback run after
//! the transition lands).

use std::future::Future;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Result, StreamTaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Uninit,
    Ready,
    ScanHistory,
    Halt,
    Pause,
    CkInProgress,
    Dropping,
    Stop,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::Dropping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    /// Fires once at `init`, choosing `Ready` or `ScanHistory` per `fill_history`.
    Init { fill_history: bool },
    ScanHistoryDone,
    CheckStart,
    CheckDone,
    CheckFault,
    Pause,
    /// Restore the state recorded before the most recent `Pause`.
    Resume,
    Stop,
    /// The meta-store observes drop; the core only reacts to it.
    Drop,
}

/// The bounded automaton. `state` and `prior_before_pause` are guarded
/// independently with a plain (non-recursive) mutex — re-entrancy from a
/// completion callback is handled by `handle_event_async` releasing the lock
/// before invoking the callback, which is the "split the API into
/// lock-held/lock-free halves" alternative Design Notes §9 recommends in
/// place of the original's recursive mutex.
pub struct TaskStateMachine {
    state: Mutex<TaskStatus>,
    prior_before_pause: Mutex<Option<TaskStatus>>,
}

impl TaskStateMachine {
    pub fn new(fill_history: bool) -> Self {
        let initial = if fill_history { TaskStatus::ScanHistory } else { TaskStatus::Ready };
        Self {
            state: Mutex::new(initial),
            prior_before_pause: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TaskStatus {
        *self.state.lock().unwrap()
    }

    /// Deliver an event synchronously; the caller observes the resulting
    /// state (or an error if the event is illegal in the current state).
    pub fn handle_event_sync(&self, event: TaskEvent) -> Result<TaskStatus> {
        let mut state = self.state.lock().unwrap();
        let next = legal_transition(*state, event).ok_or(StreamTaskError::StateMachineReject {
            state: *state,
            event,
        })?;

        if matches!(event, TaskEvent::Pause) {
            *self.prior_before_pause.lock().unwrap() = Some(*state);
        }

        debug!(from = %*state, to = %next, ?event, "task state transition");
        *state = next;
        Ok(next)
    }

    /// Deliver an event asynchronously: queue it, transition, then invoke
    /// `on_complete` with the resulting state. The lock is released before
    /// the callback runs, so the callback may safely re-enter the state
    /// machine (e.g. to check the result of its own transition).
    pub async fn handle_event_async<F, Fut>(&self, event: TaskEvent, on_complete: F) -> Result<TaskStatus>
    where
        F: FnOnce(TaskStatus) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let next = self.handle_event_sync(event)?;
        on_complete(next).await;
        Ok(next)
    }

    /// `restore_status` — return to the state recorded before `Pause`. If
    /// the task was not paused, this is a no-op: log and leave state alone
    /// (the pause counter is left untouched by the caller in that case,
    /// §4.3 pause/resume semantics).
    pub fn restore_status(&self) -> Option<TaskStatus> {
        let mut state = self.state.lock().unwrap();
        if *state != TaskStatus::Pause {
            warn!(current = %*state, "resume with no matching pause, no-op");
            return None;
        }

        let prior = self.prior_before_pause.lock().unwrap().take();
        match prior {
            Some(prior) => {
                debug!(to = %prior, "task resumed from pause");
                *state = prior;
                Some(prior)
            }
            None => {
                warn!("pause recorded no prior state, staying in Pause");
                None
            }
        }
    }
}

/// The transition table. `Stop` reaches every non-terminal state; `Drop` is
/// external-only (§4.3: "the core only observes DROPPING").
fn legal_transition(from: TaskStatus, event: TaskEvent) -> Option<TaskStatus> {
    use TaskEvent::*;
    use TaskStatus::*;

    if matches!(event, Stop) && !from.is_terminal() {
        return Some(TaskStatus::Stop);
    }

    match (from, event) {
        (Uninit, Init { fill_history: true }) => Some(ScanHistory),
        (Uninit, Init { fill_history: false }) => Some(Ready),
        (ScanHistory, ScanHistoryDone) => Some(Ready),
        (Ready, CheckStart) => Some(CkInProgress),
        (CkInProgress, CheckDone) => Some(Ready),
        (CkInProgress, CheckFault) => Some(Halt),
        (Ready, Pause) | (ScanHistory, Pause) | (Halt, Pause) => Some(Pause),
        (Pause, Resume) => None, // handled by restore_status, not the table
        (Ready, Drop) | (ScanHistory, Drop) | (Halt, Drop) | (Pause, Drop) => Some(Dropping),
        _ => None,
    }
}
