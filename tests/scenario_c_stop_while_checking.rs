//! End-to-end scenario C (spec §8): a task mid-check receives `STOP`; the
//! next monitor tick reports the launch as failed exactly once and tears
//! down the check session.

use std::sync::Arc;

use stream_task_core::{
    Endpoint, EpSet, OutputKind, OutputVariant, ShuffleDispatchInfo, StreamTask, StreamTaskConfig, TaskEvent, TaskId,
    TaskLevel, VgroupInfo,
};
use stream_task_testkit::{InMemoryMeta, RecordingMsgCb};

fn ep(port: u16) -> EpSet {
    EpSet::new(vec![Endpoint { fqdn: "h".into(), port }], 0)
}

#[tokio::test(start_paused = true)]
async fn stop_mid_check_reports_launch_failure_exactly_once() {
    let config = StreamTaskConfig::default();
    let task = Arc::new(StreamTask::new_task(
        TaskId::new(1, 0xAA),
        TaskLevel::Agg,
        OutputKind::ShuffleDispatch,
        OutputVariant::Shuffle(ShuffleDispatchInfo {
            vgroups: vec![
                VgroupInfo { vg_id: 7, task_id: 1, epset: ep(7) },
                VgroupInfo { vg_id: 8, task_id: 2, epset: ep(8) },
            ],
            stb_full_name: "db.stb".into(),
        }),
        ep(1),
        ep(2),
        false,
        2,
        0,
        &config,
    ));

    let meta = Arc::new(InMemoryMeta::new(10, 1));
    let msg_cb = Arc::new(RecordingMsgCb::new());
    task.init(meta.clone(), msg_cb.clone(), 10, 1, false);

    task.start_check_downstream().await.unwrap();

    task.state_machine.handle_event_sync(TaskEvent::Stop).unwrap();

    tokio::time::advance(config.check_rsp_interval).await;
    tokio::task::yield_now().await;

    assert!(!task.check_engine.in_check_process().await);
    let results = meta.launch_results();
    assert_eq!(results.len(), 1, "exactly one launch-result report, no fill-history companion here");
    assert_eq!(results[0].id, task.id);
    assert!(!results[0].success);
}
