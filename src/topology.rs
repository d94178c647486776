//! Topology registry (spec §4.4): the upstream child-endpoint list and the
//! downstream dispatcher, plus the combined `update_epset_info` batch update.

use tracing::debug;

use crate::error::{Result, StreamTaskError};
use crate::identity::{EpSet, TaskLevel};

/// One upstream child endpoint (for AGG/SINK), or one implied downstream
/// dispatch target.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEpInfo {
    pub child_id: i32,
    pub task_id: i32,
    pub node_id: i32,
    pub epset: EpSet,
    /// `-1` means unknown; once an upstream reports a stage, later checks
    /// detect regressions and fail fast.
    pub stage: i64,
    pub data_allowed: bool,
}

impl ChildEpInfo {
    fn new(task_id: i32, node_id: i32, child_id: i32, epset: EpSet) -> Self {
        Self {
            child_id,
            task_id,
            node_id,
            epset,
            stage: -1,
            data_allowed: true,
        }
    }
}

/// Ordered upstream list (invariant #6: each `(node_id, task_id)` pair is
/// distinct).
#[derive(Debug, Default)]
pub struct UpstreamInfo {
    list: Vec<ChildEpInfo>,
    num_of_closed: i32,
}

impl UpstreamInfo {
    pub fn list(&self) -> &[ChildEpInfo] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, task_id: i32) -> Option<&ChildEpInfo> {
        self.list.iter().find(|e| e.task_id == task_id)
    }

    /// `set_upstream_info` — construct a child-endpoint record and append.
    pub fn set_upstream_info(&mut self, task_id: i32, node_id: i32, child_id: i32, epset: EpSet) {
        self.list.push(ChildEpInfo::new(task_id, node_id, child_id, epset));
    }

    /// `update_upstream_info` — first entry matching `node_id` has its epset
    /// replaced. The C original updates only the first match and relies on
    /// invariant #6 to make that safe; per the Open Question in spec §9, we
    /// surface a duplicate as a structured error instead of silently
    /// skipping it.
    pub fn update_upstream_info(&mut self, node_id: i32, new_epset: &EpSet) -> Result<()> {
        let mut matches = self.list.iter_mut().filter(|e| e.node_id == node_id);
        let Some(first) = matches.next() else {
            return Ok(());
        };
        first.epset.assign(new_epset);
        debug!(node_id, "updated upstream epset");

        if let Some(dup) = matches.next() {
            return Err(StreamTaskError::DuplicateUpstream {
                node_id,
                task_id: dup.task_id,
            });
        }
        Ok(())
    }

    /// `open_all_upstream_inputs` — set every `data_allowed = true`, reset
    /// `num_of_closed`.
    pub fn open_all_upstream_inputs(&mut self) {
        for e in &mut self.list {
            e.data_allowed = true;
        }
        self.num_of_closed = 0;
    }

    /// `close_upstream_input` — the core does not auto-increment
    /// `num_of_closed`; the caller bumps it once the close is final via
    /// [`UpstreamInfo::note_closed`].
    pub fn close_upstream_input(&mut self, upstream_task_id: i32) {
        if let Some(e) = self.list.iter_mut().find(|e| e.task_id == upstream_task_id) {
            e.data_allowed = false;
        }
    }

    pub fn note_closed(&mut self) {
        self.num_of_closed += 1;
    }

    pub fn all_upstream_closed(&self) -> bool {
        self.num_of_closed as usize == self.list.len()
    }

    /// `reset_upstream_stage_info` — reset every upstream's stage to
    /// unknown. No-op for SOURCE tasks, which have no upstream.
    pub fn reset_upstream_stage_info(&mut self, level: TaskLevel) {
        if level == TaskLevel::Source {
            return;
        }
        for e in &mut self.list {
            e.stage = -1;
        }
    }
}

/// One vgroup entry in a shuffle dispatcher's vgroup list.
#[derive(Debug, Clone, PartialEq)]
pub struct VgroupInfo {
    pub vg_id: i32,
    pub task_id: i32,
    pub epset: EpSet,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedDispatchInfo {
    pub task_id: i32,
    pub node_id: i32,
    pub epset: EpSet,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShuffleDispatchInfo {
    pub vgroups: Vec<VgroupInfo>,
    pub stb_full_name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSinkInfo {
    pub stb_uid: i64,
    pub stb_full_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmaSinkInfo {
    pub sma_id: i64,
}

/// One downstream probe target, as handed to the check engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamTarget {
    pub task_id: i32,
    pub node_id: i32,
    pub epset: EpSet,
}

/// The output/dispatch variant. Tagged union mirroring `output_type` as the
/// discriminant (Design Notes §9).
#[derive(Debug, Clone, PartialEq)]
pub enum OutputVariant {
    Table(TableSinkInfo),
    Sma(SmaSinkInfo),
    Fetch,
    Fixed(FixedDispatchInfo),
    Shuffle(ShuffleDispatchInfo),
}

impl OutputVariant {
    /// `streamTaskGetNumOfDownstream` from the original — 0 for SINK/TABLE,
    /// 1 for FIXED_DISPATCH, the vgroup count for SHUFFLE_DISPATCH. Used by
    /// the check engine to seed `not_ready_tasks`.
    pub fn num_of_downstream(&self) -> i32 {
        match self {
            Self::Table(_) | Self::Sma(_) | Self::Fetch => 0,
            Self::Fixed(_) => 1,
            Self::Shuffle(s) => s.vgroups.len() as i32,
        }
    }

    /// The concrete probe targets the check engine dials: one per downstream
    /// task, carrying the address to send the probe to. Empty for SINK
    /// outputs (`is_sink_task`), which never run the check protocol.
    pub fn downstream_targets(&self) -> Vec<DownstreamTarget> {
        match self {
            Self::Table(_) | Self::Sma(_) | Self::Fetch => Vec::new(),
            Self::Fixed(f) => vec![DownstreamTarget {
                task_id: f.task_id,
                node_id: f.node_id,
                epset: f.epset.clone(),
            }],
            Self::Shuffle(s) => s
                .vgroups
                .iter()
                .map(|vg| DownstreamTarget {
                    task_id: vg.task_id,
                    node_id: vg.vg_id,
                    epset: vg.epset.clone(),
                })
                .collect(),
        }
    }

    /// `update_downstream_info` — for fixed, replace if `node_id` matches;
    /// for shuffle, replace the first vgroup entry with matching `vg_id`.
    pub fn update_downstream_info(&mut self, node_id: i32, new_epset: &EpSet) {
        match self {
            Self::Fixed(f) if f.node_id == node_id => {
                f.epset.assign(new_epset);
                debug!(node_id, "updated fixed-dispatch epset");
            }
            Self::Shuffle(s) => {
                if let Some(vg) = s.vgroups.iter_mut().find(|vg| vg.vg_id == node_id) {
                    vg.epset.assign(new_epset);
                    debug!(node_id, vg_id = vg.vg_id, "updated shuffle vgroup epset");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(n: u16) -> EpSet {
        EpSet::new(vec![crate::identity::Endpoint { fqdn: "h".into(), port: n }], 0)
    }

    #[test]
    fn update_upstream_info_replaces_only_matching_node() {
        let mut up = UpstreamInfo::default();
        up.set_upstream_info(0xa, 7, 0, ep(100));
        up.set_upstream_info(0xb, 8, 1, ep(200));

        up.update_upstream_info(7, &ep(999)).unwrap();

        assert_eq!(up.get(0xa).unwrap().epset, ep(999));
        assert_eq!(up.get(0xb).unwrap().epset, ep(200));
    }

    #[test]
    fn duplicate_node_id_is_a_structured_error() {
        let mut up = UpstreamInfo::default();
        up.set_upstream_info(0xa, 7, 0, ep(1));
        up.set_upstream_info(0xb, 7, 1, ep(2));

        let err = up.update_upstream_info(7, &ep(3)).unwrap_err();
        assert!(matches!(err, StreamTaskError::DuplicateUpstream { node_id: 7, .. }));
    }

    #[test]
    fn shuffle_downstream_update_touches_only_matching_vgroup() {
        let mut out = OutputVariant::Shuffle(ShuffleDispatchInfo {
            vgroups: vec![
                VgroupInfo { vg_id: 7, task_id: 1, epset: ep(7) },
                VgroupInfo { vg_id: 8, task_id: 2, epset: ep(8) },
                VgroupInfo { vg_id: 9, task_id: 3, epset: ep(9) },
            ],
            stb_full_name: String::new(),
        });

        out.update_downstream_info(9, &ep(900));

        let OutputVariant::Shuffle(s) = &out else { unreachable!() };
        assert_eq!(s.vgroups[0].epset, ep(7));
        assert_eq!(s.vgroups[1].epset, ep(8));
        assert_eq!(s.vgroups[2].epset, ep(900));
    }
}
