//! The stream-task object (spec §4.2): owns all per-task state and wires
//! together the state machine, topology registry, check engine, and
//! scheduling interlock behind a single handle. Mirrors the shape of
//! `sem_os_core`'s aggregate types — plain data plus narrow methods — with
//! every external collaborator reached through `dyn` port trait objects.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::check_engine::CheckEngine;
use crate::config::StreamTaskConfig;
use crate::error::Result;
use crate::fill_history;
use crate::identity::{CheckpointInfo, DataRange, EpSet, ExecStats, OutputKind, TaskId, TaskLevel};
use crate::messaging;
use crate::ports::{Executor, MessageCallback, MetaStore, StateBackend};
use crate::sched::SchedFlag;
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus};
use crate::timer::TimerActive;
use crate::topology::{OutputVariant, UpstreamInfo};

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// `{h_task, stream_task}` — the bidirectional fill-history companion link
/// (spec §4.1/§4.6). Only one side is populated on any given task instance:
/// a normal task with a companion carries `h_task`; the fill-history task
/// itself carries `stream_task` pointing back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompanionLinks {
    pub h_task: Option<TaskId>,
    pub stream_task: Option<TaskId>,
}

/// A process-wide counter injected into every task, rather than a global
/// (Design Notes §9). One instance is shared across every task on a node.
#[derive(Debug, Clone, Default)]
pub struct PausedTaskCounter(Arc<AtomicI32>);

impl PausedTaskCounter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(0)))
    }

    pub fn count(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single-writer token bucket gating a sink task's output rate (spec §4.2
/// init: "35 tokens, 35 burst, sink-rate cap").
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_bytes_per_sec: u64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    const BURST: f64 = 35.0;

    fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            capacity: Self::BURST,
            tokens: Self::BURST,
            rate_bytes_per_sec,
            last_refill: std::time::Instant::now(),
        }
    }

    fn try_consume(&mut self, cost: f64) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec as f64).min(self.capacity);
        self.last_refill = std::time::Instant::now();

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// The stream-task object. Constructed in two steps — [`StreamTask::new_task`]
/// then [`StreamTask::init`] — matching spec §3's "created, then
/// initialized" lifecycle split.
pub struct StreamTask {
    pub id: TaskId,
    pub level: TaskLevel,
    pub output_kind: OutputKind,
    pub total_level: i32,
    pub self_child_id: i32,
    pub node_id: Mutex<i32>,
    pub epset: Mutex<EpSet>,
    pub mnode_epset: Mutex<EpSet>,
    pub checkpoint: Mutex<CheckpointInfo>,
    pub fill_history: bool,
    pub companions: Mutex<CompanionLinks>,
    pub data_range: Mutex<DataRange>,
    pub upstream: Mutex<UpstreamInfo>,
    pub output: Mutex<OutputVariant>,
    pub exec_stats: Mutex<ExecStats>,
    pub trigger_param: i64,

    pub state_machine: Arc<TaskStateMachine>,
    pub sched: SchedFlag,
    pub check_engine: Arc<CheckEngine>,
    timer_active: TimerActive,
    ref_cnt: AtomicI32,

    token_bucket: Mutex<TokenBucket>,
    executor: Mutex<Option<Box<dyn Executor>>>,
    state_backend: Mutex<Option<Box<dyn StateBackend>>>,

    meta: Mutex<Option<Arc<dyn MetaStore>>>,
    msg_cb: Mutex<Option<Arc<dyn MessageCallback>>>,
}

impl StreamTask {
    /// `new_task` — allocate immutable identity, set initial status
    /// (`READY` or `SCAN_HISTORY`), scheduling `INACTIVE`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_task(
        id: TaskId,
        level: TaskLevel,
        output_kind: OutputKind,
        output: OutputVariant,
        epset: EpSet,
        mnode_epset: EpSet,
        fill_history: bool,
        total_level: i32,
        self_child_id: i32,
        config: &StreamTaskConfig,
    ) -> Self {
        let timer_active = TimerActive::new();
        Self {
            id,
            level,
            output_kind,
            total_level,
            self_child_id,
            node_id: Mutex::new(0),
            epset: Mutex::new(epset),
            mnode_epset: Mutex::new(mnode_epset),
            checkpoint: Mutex::new(CheckpointInfo::default()),
            fill_history,
            companions: Mutex::new(CompanionLinks::default()),
            data_range: Mutex::new(DataRange::default()),
            upstream: Mutex::new(UpstreamInfo::default()),
            output: Mutex::new(output),
            exec_stats: Mutex::new(ExecStats::default()),
            trigger_param: 0,
            state_machine: Arc::new(TaskStateMachine::new(fill_history)),
            sched: SchedFlag::default(),
            check_engine: CheckEngine::new(timer_active.clone()),
            timer_active,
            ref_cnt: AtomicI32::new(0),
            token_bucket: Mutex::new(TokenBucket::new(config.sink_data_rate_bytes_per_sec)),
            executor: Mutex::new(None),
            state_backend: Mutex::new(None),
            meta: Mutex::new(None),
            msg_cb: Mutex::new(None),
        }
    }

    /// `init` — attach collaborators, derive version info, set reference
    /// count to 1 (spec §4.2).
    pub fn init(
        &self,
        meta: Arc<dyn MetaStore>,
        msg_cb: Arc<dyn MessageCallback>,
        node_id: i32,
        initial_ver: i64,
        has_companion: bool,
    ) {
        self.ref_cnt.store(1, Ordering::SeqCst);
        *self.node_id.lock().unwrap() = node_id;
        self.exec_stats.lock().unwrap().created_ms = now_ms();
        self.upstream.lock().unwrap().open_all_upstream_inputs();
        self.derive_initial_version(initial_ver, has_companion);
        *self.meta.lock().unwrap() = Some(meta);
        *self.msg_cb.lock().unwrap() = Some(msg_cb);
        info!(%self.id, initial_ver, "task initialized");
    }

    /// The three-branch version-derivation rule (spec §4.2).
    fn derive_initial_version(&self, initial_ver: i64, has_companion: bool) {
        let mut ckpt = self.checkpoint.lock().unwrap();
        let mut range = self.data_range.lock().unwrap();

        if !self.fill_history && !has_companion {
            ckpt.checkpoint_ver = initial_ver - 1;
            ckpt.processed_ver = initial_ver - 1;
            ckpt.next_process_ver = initial_ver;
            range.min_ver = initial_ver as u64;
            range.max_ver = initial_ver as u64;
        } else if self.fill_history {
            ckpt.checkpoint_ver = range.max_ver as i64;
            ckpt.processed_ver = range.max_ver as i64;
            ckpt.next_process_ver = range.max_ver as i64 + 1;
        } else if range.min_ver == 0 {
            // Legacy compatibility: a pre-upgrade companion with no
            // recorded minimum version.
            ckpt.checkpoint_ver = 0;
            ckpt.processed_ver = 0;
            ckpt.next_process_ver = 1;
        } else {
            ckpt.checkpoint_ver = range.min_ver as i64 - 1;
            ckpt.processed_ver = range.min_ver as i64 - 1;
            ckpt.next_process_ver = range.min_ver as i64;
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state_machine.state()
    }

    /// Attach the query-operator executor driving this task's record
    /// processing. Typically called once, right after [`Self::init`].
    pub fn attach_executor(&self, executor: Box<dyn Executor>) {
        *self.executor.lock().unwrap() = Some(executor);
    }

    /// Attach the per-task state backend (checkpoint storage).
    pub fn attach_state_backend(&self, backend: Box<dyn StateBackend>) {
        *self.state_backend.lock().unwrap() = Some(backend);
    }

    fn meta(&self) -> Option<Arc<dyn MetaStore>> {
        self.meta.lock().unwrap().clone()
    }

    fn msg_cb(&self) -> Option<Arc<dyn MessageCallback>> {
        self.msg_cb.lock().unwrap().clone()
    }

    /// Drives the downstream-readiness check engine using this task's
    /// current topology. No-op (returns immediately) for a sink task, which
    /// has no downstream to probe.
    pub async fn start_check_downstream(&self) -> Result<()> {
        if self.level.is_sink_task() {
            debug!(%self.id, "sink task has no downstream to check");
            return Ok(());
        }
        let targets = self.output.lock().unwrap().downstream_targets();
        if targets.is_empty() {
            return Ok(());
        }

        let (Some(meta), Some(msg_cb)) = (self.meta(), self.msg_cb()) else {
            return Ok(());
        };
        let node_id = *self.node_id.lock().unwrap();
        let stage = meta.stage();
        let related_fill_history = self.companions.lock().unwrap().h_task;

        self.state_machine.handle_event_sync(TaskEvent::CheckStart)?;
        self.check_engine
            .start_monitor_check_rsp(
                self.id,
                node_id,
                stage,
                self.self_child_id,
                targets,
                related_fill_history,
                self.state_machine.clone(),
                meta,
                msg_cb,
                StreamTaskConfig::default(),
            )
            .await
    }

    /// `stop` — emit `STOP` and kill the executor.
    pub fn stop(&self) -> Result<TaskStatus> {
        let next = self.state_machine.handle_event_sync(TaskEvent::Stop)?;
        if let Some(executor) = self.executor.lock().unwrap().as_ref() {
            executor.kill();
        }
        Ok(next)
    }

    /// `pause` — asynchronous `PAUSE` event; increments the shared paused
    /// counter once the transition lands. Kills the executor immediately
    /// for SOURCE tasks or fill-history tasks, halting log scanning.
    pub async fn pause(&self, counter: &PausedTaskCounter) -> Result<TaskStatus> {
        if self.level == TaskLevel::Source || self.fill_history {
            if let Some(executor) = self.executor.lock().unwrap().as_ref() {
                executor.kill();
            }
        }
        let counter = counter.clone();
        self.state_machine
            .handle_event_async(TaskEvent::Pause, move |_state| {
                let counter = counter.clone();
                async move { counter.increment() }
            })
            .await
    }

    /// `resume` — restore the pre-pause state; decrements the counter only
    /// on a successful restore, per spec §4.3.
    pub fn resume(&self, counter: &PausedTaskCounter) -> Option<TaskStatus> {
        let restored = self.state_machine.restore_status();
        if restored.is_some() {
            counter.decrement();
        }
        restored
    }

    /// `update_epset_info` — combined batch update (spec §4.4): for each
    /// `(node_id, new_epset)`, update our own epset if it's self-addressed,
    /// then dispatch to the upstream or downstream adjacency depending on
    /// level. Also updates `exec_stats` (the original's `execInfo.latestUpdateTs`/
    /// `updateCount`, recovered from original_source/).
    pub fn update_epset_info(&self, updates: &[(i32, EpSet)]) -> Result<()> {
        let self_node_id = *self.node_id.lock().unwrap();
        for (node_id, new_epset) in updates {
            if *node_id == self_node_id {
                self.epset.lock().unwrap().assign(new_epset);
            }
            if self.level.has_upstream() {
                self.upstream.lock().unwrap().update_upstream_info(*node_id, new_epset)?;
            }
            if self.level.has_downstream() {
                self.output.lock().unwrap().update_downstream_info(*node_id, new_epset);
            }
        }

        let mut stats = self.exec_stats.lock().unwrap();
        stats.latest_update_ms = now_ms();
        stats.update_count += 1;
        Ok(())
    }

    /// `reset_upstream_stage_info` — recovered from original_source/; see
    /// `SPEC_FULL.md` §C.
    pub fn reset_upstream_stage_info(&self) {
        self.upstream.lock().unwrap().reset_upstream_stage_info(self.level);
    }

    pub fn is_sink_task(&self) -> bool {
        self.level.is_sink_task()
    }

    /// `clear_h_task_attr` — see [`fill_history::clear_h_task_attr`]; a
    /// no-op unless this task is the fill-history task.
    pub async fn clear_h_task_attr(&self, reset_rel_halt: bool) -> Result<()> {
        let Some(meta) = self.meta() else { return Ok(()) };
        let Some(companion) = self.companions.lock().unwrap().stream_task else {
            return Ok(());
        };
        fill_history::clear_h_task_attr(meta.as_ref(), self.fill_history, companion, reset_rel_halt).await
    }

    /// `build_and_send_drop_task_msg` — see [`messaging::build_and_send_drop_task_msg`].
    pub async fn send_drop_task_msg(&self, reset_rel_halt: bool) -> Result<()> {
        let Some(msg_cb) = self.msg_cb() else { return Ok(()) };
        let Some(meta) = self.meta() else { return Ok(()) };
        messaging::build_and_send_drop_task_msg(msg_cb.as_ref(), self.id, meta.vg_id(), reset_rel_halt).await
    }

    /// Attempt to consume `bytes` from the sink-rate token bucket. Always
    /// returns `true` for non-sink tasks (no cap applies).
    pub fn try_consume_sink_tokens(&self, bytes: u64) -> bool {
        if !self.is_sink_task() {
            return true;
        }
        self.token_bucket.lock().unwrap().try_consume(bytes as f64)
    }

    pub fn retain(&self) -> i32 {
        self.ref_cnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn release(&self) -> i32 {
        self.ref_cnt.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// `free_task` — strict teardown: snapshot status, drain `timer_active`
    /// and `ref_cnt` to zero, close the executor and state backend in
    /// order. The 100 ms poll matches spec §5's documented mechanism; the
    /// drain condition itself is computed from the atomic [`TimerActive`]
    /// count rather than manual increments/decrements (Design Notes §9).
    pub async fn free_task(&self) {
        let snapshot = self.state_machine.state();
        while self.timer_active.count() > 0 || self.ref_cnt.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(executor) = self.executor.lock().unwrap().take() {
            executor.kill();
        }

        let dropping = snapshot == TaskStatus::Dropping;
        if let Some(backend) = self.state_backend.lock().unwrap().take() {
            backend.close(dropping);
        }

        info!(%self.id, ?snapshot, "task freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Endpoint;
    use crate::topology::{FixedDispatchInfo, ShuffleDispatchInfo, VgroupInfo};

    fn ep(port: u16) -> EpSet {
        EpSet::new(vec![Endpoint { fqdn: "h".into(), port }], 0)
    }

    fn new_source(config: &StreamTaskConfig) -> StreamTask {
        StreamTask::new_task(
            TaskId::new(1, 0x100),
            TaskLevel::Source,
            OutputKind::FixedDispatch,
            OutputVariant::Fixed(FixedDispatchInfo { task_id: 0x200, node_id: 5, epset: ep(100) }),
            ep(1),
            ep(2),
            false,
            1,
            0,
            config,
        )
    }

    #[test]
    fn version_defaults_for_a_fresh_source_task() {
        let config = StreamTaskConfig::default();
        let task = new_source(&config);
        task.derive_initial_version(100, false);

        let ckpt = task.checkpoint.lock().unwrap();
        let range = task.data_range.lock().unwrap();
        assert_eq!(ckpt.checkpoint_ver, 99);
        assert_eq!(ckpt.next_process_ver, 100);
        assert_eq!(range.min_ver, 100);
        assert_eq!(range.max_ver, 100);
    }

    #[test]
    fn legacy_companion_with_zero_min_ver_resets_to_zero_zero_one() {
        let config = StreamTaskConfig::default();
        let task = new_source(&config);
        task.derive_initial_version(100, true);

        let ckpt = task.checkpoint.lock().unwrap();
        assert_eq!(ckpt.checkpoint_ver, 0);
        assert_eq!(ckpt.processed_ver, 0);
        assert_eq!(ckpt.next_process_ver, 1);
    }

    #[test]
    fn scenario_b_update_epset_info_touches_only_matching_entries() {
        let config = StreamTaskConfig::default();
        let task = StreamTask::new_task(
            TaskId::new(1, 0xB),
            TaskLevel::Agg,
            OutputKind::ShuffleDispatch,
            OutputVariant::Shuffle(ShuffleDispatchInfo {
                vgroups: vec![
                    VgroupInfo { vg_id: 7, task_id: 1, epset: ep(7) },
                    VgroupInfo { vg_id: 8, task_id: 2, epset: ep(8) },
                    VgroupInfo { vg_id: 9, task_id: 3, epset: ep(9) },
                ],
                stb_full_name: String::new(),
            }),
            ep(1),
            ep(2),
            false,
            2,
            0,
            &config,
        );
        task.upstream.lock().unwrap().set_upstream_info(0xA, 3, 0, ep(3));

        task.update_epset_info(&[(3, ep(300)), (9, ep(900))]).unwrap();

        assert_eq!(task.upstream.lock().unwrap().get(0xA).unwrap().epset, ep(300));
        let OutputVariant::Shuffle(s) = &*task.output.lock().unwrap() else { unreachable!() };
        assert_eq!(s.vgroups[0].epset, ep(7));
        assert_eq!(s.vgroups[1].epset, ep(8));
        assert_eq!(s.vgroups[2].epset, ep(900));
    }

    #[tokio::test]
    async fn pause_then_resume_conserves_the_counter() {
        let config = StreamTaskConfig::default();
        let task = new_source(&config);
        let counter = PausedTaskCounter::new();

        task.pause(&counter).await.unwrap();
        assert_eq!(counter.count(), 1);

        task.resume(&counter);
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test]
    async fn resume_without_pause_preserves_the_counter() {
        let config = StreamTaskConfig::default();
        let task = new_source(&config);
        let counter = PausedTaskCounter::new();

        task.resume(&counter);
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test]
    async fn free_task_waits_for_timer_active_to_drain() {
        let config = StreamTaskConfig::default();
        let task = new_source(&config);
        task.ref_cnt.store(0, Ordering::SeqCst);
        let guard = task.timer_active.arm();

        let task = Arc::new(task);
        let t2 = task.clone();
        let freed = tokio::spawn(async move { t2.free_task().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!freed.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), freed).await.unwrap().unwrap();
    }
}
