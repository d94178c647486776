//! Free-task safety (spec §8): resources are released exactly once, and only
//! once every outstanding timer has drained.

use std::sync::Arc;

use stream_task_core::{Endpoint, EpSet, OutputKind, OutputVariant, SmaSinkInfo, StreamTask, StreamTaskConfig, TaskId, TaskLevel};
use stream_task_testkit::{InMemoryMeta, NullExecutor, NullStateBackend, RecordingMsgCb};

fn ep(port: u16) -> EpSet {
    EpSet::new(vec![Endpoint { fqdn: "h".into(), port }], 0)
}

#[tokio::test]
async fn free_task_closes_executor_and_state_backend_exactly_once() {
    let config = StreamTaskConfig::default();
    let task = StreamTask::new_task(
        TaskId::new(1, 0x42),
        TaskLevel::Sink,
        OutputKind::Sma,
        OutputVariant::Sma(SmaSinkInfo { sma_id: 7 }),
        ep(1),
        ep(2),
        false,
        1,
        0,
        &config,
    );

    let meta = Arc::new(InMemoryMeta::new(1, 1));
    let msg_cb = Arc::new(RecordingMsgCb::new());
    task.init(meta, msg_cb, 1, 1, false);

    let executor = Arc::new(NullExecutor::new());
    let backend = Arc::new(NullStateBackend::new());
    task.attach_executor(Box::new(ArcExecutor(executor.clone())));
    task.attach_state_backend(Box::new(ArcStateBackend(backend.clone())));

    task.stop().unwrap();
    task.release();
    task.free_task().await;

    assert!(executor.was_killed());
    assert_eq!(backend.closed_with(), Some(false));
}

struct ArcExecutor(Arc<NullExecutor>);
impl stream_task_core::Executor for ArcExecutor {
    fn kill(&self) {
        self.0.kill();
    }
}

struct ArcStateBackend(Arc<NullStateBackend>);
impl stream_task_core::StateBackend for ArcStateBackend {
    fn close(&self, dropping: bool) {
        self.0.close(dropping);
    }
}
