//! Messaging side effects (spec §4.8): building and dispatching the two
//! outbound requests the core originates on its own initiative, rather than
//! in direct response to an inbound message — drop-task and checkpoint-req.
//! Both are thin wrappers over [`MessageCallback`]; the transport itself is
//! out of scope (spec §1).

use tracing::info;

use crate::error::Result;
use crate::identity::TaskId;
use crate::ports::{CheckpointReq, DropTaskReq, MessageCallback};

/// `streamBuildAndSendDropTaskMsg` — notify a single downstream node that
/// this task is dropping, so it releases the corresponding upstream entry.
pub async fn build_and_send_drop_task_msg(
    cb: &dyn MessageCallback,
    id: TaskId,
    vg_id: i32,
    reset_rel_halt: bool,
) -> Result<()> {
    info!(%id, vg_id, reset_rel_halt, "sending drop-task notice");
    cb.enqueue_drop_task(DropTaskReq {
        vg_id,
        task_id: id.task_id,
        reset_rel_halt,
    })
    .await
}

/// `streamTaskSendCheckpointReq` — ask the management node to assign a new
/// checkpoint id.
pub async fn send_checkpoint_req(
    cb: &dyn MessageCallback,
    id: TaskId,
    node_id: i32,
    mnode_epset: &crate::identity::EpSet,
) -> Result<()> {
    info!(%id, node_id, "requesting checkpoint id from management node");
    cb.send_checkpoint_req(
        CheckpointReq {
            stream_id: id.stream_id,
            task_id: id.task_id,
            node_id,
        },
        mnode_epset,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EpSet, Endpoint};
    use crate::ports::CheckRequest;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallback {
        drops: Mutex<Vec<DropTaskReq>>,
        checkpoint_reqs: Mutex<Vec<CheckpointReq>>,
    }

    #[async_trait]
    impl MessageCallback for RecordingCallback {
        async fn send_check_msg(&self, _req: CheckRequest, _node_id: i32, _epset: &EpSet) -> Result<()> {
            Ok(())
        }

        async fn enqueue_drop_task(&self, req: DropTaskReq) -> Result<()> {
            self.drops.lock().unwrap().push(req);
            Ok(())
        }

        async fn send_checkpoint_req(&self, req: CheckpointReq, _mnode_epset: &EpSet) -> Result<()> {
            self.checkpoint_reqs.lock().unwrap().push(req);
            Ok(())
        }
    }

    #[tokio::test]
    async fn drop_task_msg_carries_the_reset_flag() {
        let cb = RecordingCallback::default();
        build_and_send_drop_task_msg(&cb, TaskId::new(1, 2), 9, true).await.unwrap();

        let recorded = cb.drops.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].task_id, 2);
        assert_eq!(recorded[0].vg_id, 9);
        assert!(recorded[0].reset_rel_halt);
    }

    #[tokio::test]
    async fn checkpoint_req_carries_stream_and_task_id() {
        let cb = RecordingCallback::default();
        let mnode = EpSet::new(vec![Endpoint { fqdn: "mnode".into(), port: 6030 }], 0);
        send_checkpoint_req(&cb, TaskId::new(7, 3), 1, &mnode).await.unwrap();

        let recorded = cb.checkpoint_reqs.lock().unwrap();
        assert_eq!(recorded[0], CheckpointReq { stream_id: 7, task_id: 3, node_id: 1 });
    }
}
