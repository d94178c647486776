//! Downstream-readiness check engine (spec §4.5) — the heart of the core.
//! On start-up, and after any topology change invalidating prior readiness,
//! a non-sink task probes every downstream task and waits for all of them
//! to report ready, tolerating timeouts and aborting on fault. The monitor
//! runs as a `tokio::spawn`ed loop ticking on `CHECK_RSP_INTERVAL`, holding
//! one [`TimerGuard`] per outstanding tick so invariant #4
//! (`in_check_process => timer_active >= 1`) holds without a busy-poll.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StreamTaskConfig;
use crate::error::{Result, StreamTaskError};
use crate::identity::TaskId;
use crate::ports::{CheckRequest, MessageCallback, MetaStore};
use crate::state_machine::{TaskStateMachine, TaskStatus};
use crate::timer::TimerActive;
use crate::topology::DownstreamTarget;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamRsp {
    /// No response observed yet (`status == -1` in spec prose).
    Outstanding,
    /// A response arrived, but the downstream isn't ready yet.
    NotReady,
    Ready,
    UpstreamNewStage,
    DownstreamNotLeader,
}

impl DownstreamRsp {
    fn is_fault(self) -> bool {
        matches!(self, Self::UpstreamNewStage | Self::DownstreamNotLeader)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamStatus {
    pub task_id: i32,
    pub node_id: i32,
    pub status: DownstreamRsp,
    pub req_id: i64,
    pub rsp_ts_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct OwnContext {
    id: TaskId,
    node_id: i32,
    stage: i64,
    self_child_id: i32,
    related_fill_history: Option<TaskId>,
}

struct Entry {
    task_id: i32,
    node_id: i32,
    epset: crate::identity::EpSet,
    status: DownstreamRsp,
    req_id: i64,
    rsp_ts: Option<Instant>,
}

struct CheckState {
    own: Option<OwnContext>,
    list: Vec<Entry>,
    not_ready_tasks: i32,
    start: Instant,
    start_ms: i64,
    in_check_process: bool,
    stop_check_process: bool,
}

impl CheckState {
    fn new() -> Self {
        Self {
            own: None,
            list: Vec::new(),
            not_ready_tasks: 0,
            start: Instant::now(),
            start_ms: 0,
            in_check_process: false,
            stop_check_process: false,
        }
    }

    fn snapshot(&self) -> Vec<DownstreamStatus> {
        self.list
            .iter()
            .map(|e| DownstreamStatus {
                task_id: e.task_id,
                node_id: e.node_id,
                status: e.status,
                req_id: e.req_id,
                rsp_ts_ms: e.rsp_ts.map(|_| now_ms()),
            })
            .collect()
    }
}

enum TickOutcome {
    Continue,
    Exit,
}

/// Per-task engine state, shared with the spawned monitor loop via `Arc`.
pub struct CheckEngine {
    state: AsyncMutex<CheckState>,
    timer_active: TimerActive,
    next_req_id: AtomicI64,
}

impl CheckEngine {
    pub fn new(timer_active: TimerActive) -> Arc<Self> {
        Arc::new(Self {
            state: AsyncMutex::new(CheckState::new()),
            timer_active,
            next_req_id: AtomicI64::new(1),
        })
    }

    pub async fn in_check_process(&self) -> bool {
        self.state.lock().await.in_check_process
    }

    /// Outstanding timer-guard count (invariant #4: `in_check_process =>
    /// timer_active >= 1`), for callers that need to observe drain without
    /// reaching into the monitor loop itself.
    pub fn timer_active_count(&self) -> i32 {
        self.timer_active.count()
    }

    pub async fn snapshot(&self) -> Vec<DownstreamStatus> {
        self.state.lock().await.snapshot()
    }

    /// `start_monitor_check_rsp` — step 1-6 of spec §4.5: mark in-process,
    /// seed `not_ready_tasks`, send the initial probe round, and spawn the
    /// monitor tick loop.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_monitor_check_rsp<M, C>(
        self: &Arc<Self>,
        id: TaskId,
        node_id: i32,
        stage: i64,
        self_child_id: i32,
        targets: Vec<DownstreamTarget>,
        related_fill_history: Option<TaskId>,
        state_machine: Arc<TaskStateMachine>,
        meta: Arc<M>,
        msg_cb: Arc<C>,
        config: StreamTaskConfig,
    ) -> Result<()>
    where
        M: MetaStore + 'static,
        C: MessageCallback + 'static,
    {
        let own = OwnContext { id, node_id, stage, self_child_id, related_fill_history };

        // Armed synchronously, before any `.await` below, so invariant #4
        // (`in_check_process => timer_active >= 1`) holds for the entire
        // window the check session is live — including the probe-send loop
        // and the gap before the spawned monitor reaches its first tick.
        let first_guard;
        {
            let mut st = self.state.lock().await;
            if st.in_check_process {
                return Err(StreamTaskError::AlreadyInCheckProcess { started_at_ms: st.start_ms });
            }
            st.in_check_process = true;
            st.stop_check_process = false;
            st.list.clear();
            st.not_ready_tasks = targets.len() as i32;
            st.start = Instant::now();
            st.start_ms = now_ms();
            st.own = Some(own);
            first_guard = self.timer_active.arm();
            info!(%id, not_ready = st.not_ready_tasks, "starting downstream readiness check");
        }

        for target in &targets {
            self.add_req_info(target.task_id, target.node_id, target.epset.clone(), 0).await;
            self.send_probe_to(&own, msg_cb.as_ref(), target.task_id).await?;
        }

        let engine = self.clone();
        let interval = config.check_rsp_interval;
        let mut next_guard = Some(first_guard);
        tokio::spawn(async move {
            loop {
                let _guard = next_guard.take().unwrap_or_else(|| engine.timer_active.arm());
                tokio::time::sleep(interval).await;
                match engine.tick(&state_machine, meta.as_ref(), msg_cb.as_ref(), &config).await {
                    TickOutcome::Continue => continue,
                    TickOutcome::Exit => break,
                }
            }
        });

        Ok(())
    }

    /// `add_req_info` — idempotent push of an outstanding entry.
    async fn add_req_info(&self, task_id: i32, node_id: i32, epset: crate::identity::EpSet, req_id: i64) {
        let mut st = self.state.lock().await;
        if st.list.iter().any(|e| e.task_id == task_id) {
            debug!(task_id, "add_req_info: entry already present, left unchanged");
            return;
        }
        st.list.push(Entry {
            task_id,
            node_id,
            epset,
            status: DownstreamRsp::Outstanding,
            req_id,
            rsp_ts: None,
        });
    }

    async fn send_probe_to<C: MessageCallback>(&self, own: &OwnContext, msg_cb: &C, task_id: i32) -> Result<()> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let (node_id, epset) = {
            let mut st = self.state.lock().await;
            let Some(entry) = st.list.iter_mut().find(|e| e.task_id == task_id) else {
                return Ok(());
            };
            entry.req_id = req_id;
            (entry.node_id, entry.epset.clone())
        };

        let req = CheckRequest {
            stream_id: own.id.stream_id,
            upstream_task_id: own.id.task_id,
            upstream_node_id: own.node_id,
            child_id: own.self_child_id,
            stage: own.stage,
            req_id,
            downstream_node_id: node_id,
            downstream_task_id: task_id,
        };
        debug!(task_id, req_id, "sending downstream-readiness probe");
        msg_cb.send_check_msg(req, node_id, &epset).await
    }

    /// `update_check_info` — record a downstream's response. Returns the
    /// (possibly decremented) `not_ready_tasks` count.
    pub async fn update_check_info(&self, task_id: i32, req_id: i64, status: DownstreamRsp) -> Result<i32> {
        let mut st = self.state.lock().await;
        let Some(entry) = st.list.iter_mut().find(|e| e.task_id == task_id) else {
            return Err(StreamTaskError::UnknownTaskResponse { task_id, req_id });
        };
        if entry.req_id != req_id {
            return Err(StreamTaskError::UnknownTaskResponse { task_id, req_id });
        }

        let was_ready = entry.status == DownstreamRsp::Ready;
        entry.status = status;
        entry.rsp_ts = Some(Instant::now());

        if status == DownstreamRsp::Ready && !was_ready {
            st.not_ready_tasks -= 1;
        }
        Ok(st.not_ready_tasks)
    }

    /// `stop_monitor_check_rsp` — request the next tick to exit.
    pub async fn stop_monitor_check_rsp(&self) {
        let mut st = self.state.lock().await;
        st.stop_check_process = true;
    }

    /// `complete_check_rsp` — clear in-process bookkeeping. Idempotent;
    /// calling it when already complete warns but does not fail (the Open
    /// Question in spec §9 is resolved that way, deliberately).
    pub async fn complete_check_rsp(&self) {
        let mut st = self.state.lock().await;
        self.complete_locked(&mut st);
    }

    fn complete_locked(&self, st: &mut CheckState) {
        if !st.in_check_process {
            warn!("complete_check_rsp called while not in check process");
        }
        st.in_check_process = false;
        st.stop_check_process = false;
        st.start_ms = 0;
        st.not_ready_tasks = 0;
        st.list.clear();
    }

    async fn tick<M: MetaStore, C: MessageCallback>(
        self: &Arc<Self>,
        state_machine: &TaskStateMachine,
        meta: &M,
        msg_cb: &C,
        config: &StreamTaskConfig,
    ) -> TickOutcome {
        let state = state_machine.state();
        let own = {
            let st = self.state.lock().await;
            st.own
        };
        let Some(own) = own else { return TickOutcome::Exit };

        if state == TaskStatus::Stop {
            let start_ms = self.state.lock().await.start_ms;
            self.complete_check_rsp().await;
            self.report_launch_failure(own, start_ms, meta).await;
            return TickOutcome::Exit;
        }
        if matches!(state, TaskStatus::Dropping | TaskStatus::Ready) {
            self.complete_check_rsp().await;
            return TickOutcome::Exit;
        }

        let mut st = self.state.lock().await;
        if st.not_ready_tasks == 0 {
            self.complete_locked(&mut st);
            return TickOutcome::Exit;
        }

        let total = st.list.len() as i32;
        let mut ready = 0;
        let mut fault = 0;
        let mut timeout = 0;
        let mut not_ready = 0;
        let check_not_rsp = config.check_not_rsp_duration;
        let elapsed = st.start.elapsed();
        for e in &st.list {
            if e.status == DownstreamRsp::Ready {
                ready += 1;
            }
            if e.status.is_fault() {
                fault += 1;
            }
            if e.status == DownstreamRsp::Outstanding && e.rsp_ts.is_none() && elapsed >= check_not_rsp {
                timeout += 1;
            }
            if e.rsp_ts.is_some() && e.status != DownstreamRsp::Ready && !e.status.is_fault() {
                not_ready += 1;
            }
        }

        if ready + fault + timeout + not_ready == total && fault > 0 {
            warn!(task_id = %own.id, fault, "downstream readiness check aborted on fault");
            self.complete_locked(&mut st);
            return TickOutcome::Exit;
        }

        if st.stop_check_process {
            let start_ms = st.start_ms;
            self.complete_locked(&mut st);
            drop(st);
            self.report_launch_failure(own, start_ms, meta).await;
            return TickOutcome::Exit;
        }

        let not_ready_idx: Vec<usize> = st
            .list
            .iter()
            .enumerate()
            .filter(|(_, e)| e.rsp_ts.is_some() && e.status != DownstreamRsp::Ready && !e.status.is_fault())
            .map(|(i, _)| i)
            .collect();
        let timeout_idx: Vec<usize> = st
            .list
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == DownstreamRsp::Outstanding && e.rsp_ts.is_none() && elapsed >= check_not_rsp)
            .map(|(i, _)| i)
            .collect();

        for &i in &not_ready_idx {
            st.list[i].status = DownstreamRsp::Outstanding;
            st.list[i].rsp_ts = None;
        }
        if !timeout_idx.is_empty() {
            st.start = Instant::now();
            st.start_ms = now_ms();
        }

        let mut resend: Vec<i32> = not_ready_idx.iter().chain(timeout_idx.iter()).map(|&i| st.list[i].task_id).collect();
        resend.sort_unstable();
        resend.dedup();
        drop(st);

        for task_id in resend {
            if let Err(err) = self.send_probe_to(&own, msg_cb, task_id).await {
                warn!(%err, task_id, "failed to re-send downstream-readiness probe");
            }
        }

        TickOutcome::Continue
    }

    async fn report_launch_failure<M: MetaStore>(&self, own: OwnContext, start_ms: i64, meta: &M) {
        let end = now_ms();
        meta.add_task_launch_result(own.id, start_ms, end, false).await;
        if let Some(fh) = own.related_fill_history {
            meta.add_task_launch_result(fh, start_ms, end, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EpSet, Endpoint};
    use crate::ports::{CheckpointReq, DropTaskReq};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMeta {
        launch_results: Mutex<Vec<(TaskId, bool)>>,
    }

    #[async_trait]
    impl MetaStore for FakeMeta {
        fn vg_id(&self) -> i32 {
            1
        }
        fn stage(&self) -> i64 {
            1
        }
        async fn save_task(&self, _id: TaskId) -> Result<()> {
            Ok(())
        }
        async fn add_task_launch_result(&self, id: TaskId, _start_ts_ms: i64, _end_ts_ms: i64, success: bool) {
            self.launch_results.lock().unwrap().push((id, success));
        }
        async fn get_task(&self, _id: TaskId) -> Option<Arc<dyn crate::ports::TaskHandle>> {
            None
        }
    }

    #[derive(Default)]
    struct FakeMsgCb {
        sent: Mutex<Vec<CheckRequest>>,
    }

    #[async_trait]
    impl MessageCallback for FakeMsgCb {
        async fn send_check_msg(&self, req: CheckRequest, _node_id: i32, _epset: &EpSet) -> Result<()> {
            self.sent.lock().unwrap().push(req);
            Ok(())
        }
        async fn enqueue_drop_task(&self, _req: DropTaskReq) -> Result<()> {
            Ok(())
        }
        async fn send_checkpoint_req(&self, _req: CheckpointReq, _mnode_epset: &EpSet) -> Result<()> {
            Ok(())
        }
    }

    fn ep() -> EpSet {
        EpSet::new(vec![Endpoint { fqdn: "h".into(), port: 1 }], 0)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_converges_on_first_tick() {
        let engine = CheckEngine::new(TimerActive::new());
        let sm = Arc::new(TaskStateMachine::new(false));
        let meta = Arc::new(FakeMeta::default());
        let msg_cb = Arc::new(FakeMsgCb::default());
        let config = StreamTaskConfig::default();

        let id = TaskId::new(1, 0x100);
        let targets = vec![DownstreamTarget { task_id: 0x200, node_id: 5, epset: ep() }];

        engine
            .start_monitor_check_rsp(id, 1, 1, 0, targets, None, sm.clone(), meta.clone(), msg_cb.clone(), config)
            .await
            .unwrap();

        let req_id = msg_cb.sent.lock().unwrap()[0].req_id;
        let remaining = engine.update_check_info(0x200, req_id, DownstreamRsp::Ready).await.unwrap();
        assert_eq!(remaining, 0);

        tokio::time::advance(config.check_rsp_interval).await;
        tokio::task::yield_now().await;

        assert!(!engine.in_check_process().await);
        assert_eq!(engine.timer_active.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_is_rejected() {
        let engine = CheckEngine::new(TimerActive::new());
        let sm = Arc::new(TaskStateMachine::new(false));
        let meta = Arc::new(FakeMeta::default());
        let msg_cb = Arc::new(FakeMsgCb::default());
        let config = StreamTaskConfig::default();
        let id = TaskId::new(1, 0x100);
        let targets = vec![DownstreamTarget { task_id: 0x200, node_id: 5, epset: ep() }];

        engine
            .start_monitor_check_rsp(id, 1, 1, 0, targets.clone(), None, sm.clone(), meta.clone(), msg_cb.clone(), config)
            .await
            .unwrap();

        let err = engine
            .start_monitor_check_rsp(id, 1, 1, 0, targets, None, sm, meta, msg_cb, config)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamTaskError::AlreadyInCheckProcess { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_check_reports_launch_failure() {
        let engine = CheckEngine::new(TimerActive::new());
        let sm = Arc::new(TaskStateMachine::new(false));
        let meta = Arc::new(FakeMeta::default());
        let msg_cb = Arc::new(FakeMsgCb::default());
        let config = StreamTaskConfig::default();
        let id = TaskId::new(1, 0x100);
        let targets = vec![
            DownstreamTarget { task_id: 0x200, node_id: 5, epset: ep() },
            DownstreamTarget { task_id: 0x201, node_id: 6, epset: ep() },
        ];

        engine
            .start_monitor_check_rsp(id, 1, 1, 0, targets, None, sm.clone(), meta.clone(), msg_cb.clone(), config)
            .await
            .unwrap();

        sm.handle_event_sync(crate::state_machine::TaskEvent::Stop).unwrap();

        tokio::time::advance(config.check_rsp_interval).await;
        tokio::task::yield_now().await;

        assert!(!engine.in_check_process().await);
        let results = meta.launch_results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], (id, false));
    }
}
