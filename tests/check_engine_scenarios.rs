//! Downstream-readiness check engine scenarios not already covered by
//! `check_engine.rs`'s own unit tests: the timeout-retry classification and
//! the fault-abort path (spec §8 "Check-engine retry" / "Check-engine fault
//! abort").

use std::sync::Arc;

use stream_task_core::{CheckEngine, DownstreamRsp, DownstreamTarget, EpSet, Endpoint, StreamTaskConfig, TaskId, TaskStateMachine, TimerActive};
use stream_task_testkit::{InMemoryMeta, RecordingMsgCb, SentMessage};

fn ep(port: u16) -> EpSet {
    EpSet::new(vec![Endpoint { fqdn: "h".into(), port }], 0)
}

fn check_req_ids(msg_cb: &RecordingMsgCb, task_id: i32) -> Vec<i64> {
    msg_cb
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            SentMessage::Check(req) if req.downstream_task_id == task_id => Some(req.req_id),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn retry_reclassifies_unresponsive_downstreams_as_timeout() {
    let engine = CheckEngine::new(TimerActive::new());
    let sm = Arc::new(TaskStateMachine::new(false));
    let meta = Arc::new(InMemoryMeta::new(1, 1));
    let msg_cb = Arc::new(RecordingMsgCb::new());
    let config = StreamTaskConfig::default();
    let id = TaskId::new(1, 0x100);

    let targets = vec![
        DownstreamTarget { task_id: 7, node_id: 70, epset: ep(7) },
        DownstreamTarget { task_id: 8, node_id: 80, epset: ep(8) },
        DownstreamTarget { task_id: 9, node_id: 90, epset: ep(9) },
    ];

    engine
        .start_monitor_check_rsp(id, 1, 1, 0, targets, None, sm.clone(), meta.clone(), msg_cb.clone(), config)
        .await
        .unwrap();

    let req_id_7 = check_req_ids(&msg_cb, 7)[0];
    engine.update_check_info(7, req_id_7, DownstreamRsp::Ready).await.unwrap();

    // Tasks 8 and 9 never respond. Tick repeatedly until past check_not_rsp_duration.
    let mut elapsed = std::time::Duration::ZERO;
    while elapsed < config.check_not_rsp_duration + config.check_rsp_interval {
        tokio::time::advance(config.check_rsp_interval).await;
        tokio::task::yield_now().await;
        elapsed += config.check_rsp_interval;
    }

    assert!(engine.in_check_process().await, "should still be waiting on 8 and 9");
    assert!(check_req_ids(&msg_cb, 8).len() >= 2, "task 8 should have been re-probed after timeout");
    assert!(check_req_ids(&msg_cb, 9).len() >= 2, "task 9 should have been re-probed after timeout");

    let snapshot = engine.snapshot().await;
    let still_outstanding = snapshot
        .iter()
        .filter(|s| s.task_id == 8 || s.task_id == 9)
        .all(|s| s.status == DownstreamRsp::Outstanding);
    assert!(still_outstanding, "re-probed entries reset to Outstanding, awaiting a fresh response");
}

#[tokio::test(start_paused = true)]
async fn fault_abort_exits_once_every_downstream_is_classified() {
    let engine = CheckEngine::new(TimerActive::new());
    let sm = Arc::new(TaskStateMachine::new(false));
    let meta = Arc::new(InMemoryMeta::new(1, 1));
    let msg_cb = Arc::new(RecordingMsgCb::new());
    let config = StreamTaskConfig::default();
    let id = TaskId::new(1, 0x100);

    let targets = vec![
        DownstreamTarget { task_id: 7, node_id: 70, epset: ep(7) },
        DownstreamTarget { task_id: 8, node_id: 80, epset: ep(8) },
    ];

    engine
        .start_monitor_check_rsp(id, 1, 1, 0, targets, None, sm.clone(), meta.clone(), msg_cb.clone(), config)
        .await
        .unwrap();

    let req_id_7 = check_req_ids(&msg_cb, 7)[0];
    let req_id_8 = check_req_ids(&msg_cb, 8)[0];
    engine.update_check_info(7, req_id_7, DownstreamRsp::Ready).await.unwrap();
    engine.update_check_info(8, req_id_8, DownstreamRsp::DownstreamNotLeader).await.unwrap();

    tokio::time::advance(config.check_rsp_interval).await;
    tokio::task::yield_now().await;

    assert!(!engine.in_check_process().await, "should abort once the fault is classified alongside the rest");
    assert_eq!(engine.timer_active_count(), 0);
}
