//! The versioned binary task-record codec (spec §4.1). Every record opens
//! with a 64-bit `ver`; fields are appended over time and an older decoder
//! must leave later fields at their typed default, so this is hand-written
//! against `byteorder` rather than derived — a derive macro can't express
//! "skip this field if `ver` predates it" or the checkpoint-only partial
//! decode.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{self, Read, Write};

use crate::error::{Result, StreamTaskError};
use crate::identity::{CheckpointInfo, DataRange, EpSet, Endpoint, OutputKind, TaskId, TaskLevel};
use crate::task::CompanionLinks;
use crate::topology::{
    ChildEpInfo, FixedDispatchInfo, OutputVariant, SmaSinkInfo, TableSinkInfo, ShuffleDispatchInfo, VgroupInfo,
};

/// A decoder rejects anything at or below this version outright.
pub const INCOMPATIBLE_VER: i64 = 0;
/// The newest version this build knows how to produce and fully decode.
pub const CURRENT_VER: i64 = 3;
/// `subtable_without_md5` is present from this version onward.
pub const SUBTABLE_CHANGED_VER: i64 = 2;

const RESERVE_LEN: usize = 64;

/// The full, self-contained on-wire representation of a task record. A
/// plain value type; [`encode`]/[`decode`] convert it to/from bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub ver: i64,
    pub id: TaskId,
    pub total_level: i32,
    pub level: TaskLevel,
    pub output_kind: OutputKind,
    pub msg_type: i16,
    pub task_status: i8,
    pub sched_status: i8,
    pub self_child_id: i32,
    pub node_id: i32,
    pub epset: EpSet,
    pub mnode_epset: EpSet,
    pub checkpoint_id: i64,
    pub checkpoint_ver: i64,
    pub fill_history: bool,
    pub companions: CompanionLinks,
    pub data_range: DataRange,
    pub upstream: Vec<ChildEpInfo>,
    /// Present unless `level == SINK` (a sink task has no downstream query
    /// plan to ship).
    pub qmsg: Option<String>,
    pub output: OutputVariant,
    pub trigger_param: i64,
    /// Only meaningful from [`SUBTABLE_CHANGED_VER`] onward; `None` when
    /// decoded from an older record.
    pub subtable_without_md5: Option<bool>,
    pub reserve: String,
}

/// The subset a checkpoint-only decode materializes (spec §4.1 "partial decoder").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOnly {
    pub msg_ver: i64,
    pub checkpoint_id: i64,
    pub checkpoint_ver: i64,
}

fn check_version(ver: i64) -> Result<()> {
    if ver <= INCOMPATIBLE_VER || ver > CURRENT_VER {
        return Err(StreamTaskError::InvalidVersion {
            found: ver,
            min_exclusive: INCOMPATIBLE_VER,
            max: CURRENT_VER,
        });
    }
    Ok(())
}

fn write_cstr<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    w.write_u32::<LE>(bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_cstr<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32::<LE>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn write_epset<W: Write>(w: &mut W, epset: &EpSet) -> io::Result<()> {
    w.write_u32::<LE>(epset.eps.len() as u32)?;
    for ep in &epset.eps {
        write_cstr(w, &ep.fqdn)?;
        w.write_u16::<LE>(ep.port)?;
    }
    w.write_u32::<LE>(epset.in_use as u32)
}

fn read_epset<R: Read>(r: &mut R) -> io::Result<EpSet> {
    let count = r.read_u32::<LE>()? as usize;
    let mut eps = Vec::with_capacity(count);
    for _ in 0..count {
        let fqdn = read_cstr(r)?;
        let port = r.read_u16::<LE>()?;
        eps.push(Endpoint { fqdn, port });
    }
    let in_use = r.read_u32::<LE>()? as usize;
    Ok(EpSet { eps, in_use })
}

fn write_task_id_pair<W: Write>(w: &mut W, id: Option<TaskId>) -> io::Result<()> {
    let id = id.unwrap_or(TaskId { stream_id: 0, task_id: 0 });
    w.write_i64::<LE>(id.stream_id as i64)?;
    w.write_i32::<LE>(id.task_id as i32)
}

fn read_task_id_pair<R: Read>(r: &mut R) -> io::Result<Option<TaskId>> {
    let stream_id = r.read_i64::<LE>()?;
    let task_id = r.read_i32::<LE>()?;
    if stream_id == 0 && task_id == 0 {
        Ok(None)
    } else {
        Ok(Some(TaskId::new(stream_id as u64, task_id as u32)))
    }
}

fn output_kind_tag(kind: OutputKind) -> i8 {
    match kind {
        OutputKind::Table => 0,
        OutputKind::Sma => 1,
        OutputKind::Fetch => 2,
        OutputKind::FixedDispatch => 3,
        OutputKind::ShuffleDispatch => 4,
    }
}

fn output_kind_from_tag(tag: i8) -> Result<OutputKind> {
    Ok(match tag {
        0 => OutputKind::Table,
        1 => OutputKind::Sma,
        2 => OutputKind::Fetch,
        3 => OutputKind::FixedDispatch,
        4 => OutputKind::ShuffleDispatch,
        other => return Err(StreamTaskError::Decode(format!("unknown output_type tag {other}"))),
    })
}

fn write_output_variant<W: Write>(w: &mut W, output: &OutputVariant) -> io::Result<()> {
    match output {
        OutputVariant::Table(t) => {
            w.write_i64::<LE>(t.stb_uid)?;
            write_cstr(w, &t.stb_full_name)
        }
        OutputVariant::Sma(s) => w.write_i64::<LE>(s.sma_id),
        OutputVariant::Fetch => w.write_i8(0),
        OutputVariant::Fixed(f) => {
            w.write_i32::<LE>(f.task_id)?;
            w.write_i32::<LE>(f.node_id)?;
            write_epset(w, &f.epset)
        }
        OutputVariant::Shuffle(s) => {
            w.write_u32::<LE>(s.vgroups.len() as u32)?;
            for vg in &s.vgroups {
                w.write_i32::<LE>(vg.vg_id)?;
                w.write_i32::<LE>(vg.task_id)?;
                write_epset(w, &vg.epset)?;
            }
            write_cstr(w, &s.stb_full_name)
        }
    }
}

fn read_output_variant<R: Read>(r: &mut R, kind: OutputKind) -> Result<OutputVariant> {
    Ok(match kind {
        OutputKind::Table => {
            let stb_uid = r.read_i64::<LE>().map_err(decode_err)?;
            let stb_full_name = read_cstr(r).map_err(decode_err)?;
            OutputVariant::Table(TableSinkInfo { stb_uid, stb_full_name })
        }
        OutputKind::Sma => {
            let sma_id = r.read_i64::<LE>().map_err(decode_err)?;
            OutputVariant::Sma(SmaSinkInfo { sma_id })
        }
        OutputKind::Fetch => {
            let _reserved = r.read_i8().map_err(decode_err)?;
            OutputVariant::Fetch
        }
        OutputKind::FixedDispatch => {
            let task_id = r.read_i32::<LE>().map_err(decode_err)?;
            let node_id = r.read_i32::<LE>().map_err(decode_err)?;
            let epset = read_epset(r).map_err(decode_err)?;
            OutputVariant::Fixed(FixedDispatchInfo { task_id, node_id, epset })
        }
        OutputKind::ShuffleDispatch => {
            let count = r.read_u32::<LE>().map_err(decode_err)? as usize;
            let mut vgroups = Vec::with_capacity(count);
            for _ in 0..count {
                let vg_id = r.read_i32::<LE>().map_err(decode_err)?;
                let task_id = r.read_i32::<LE>().map_err(decode_err)?;
                let epset = read_epset(r).map_err(decode_err)?;
                vgroups.push(VgroupInfo { vg_id, task_id, epset });
            }
            let stb_full_name = read_cstr(r).map_err(decode_err)?;
            OutputVariant::Shuffle(ShuffleDispatchInfo { vgroups, stb_full_name })
        }
    })
}

fn decode_err(e: io::Error) -> StreamTaskError {
    StreamTaskError::Decode(e.to_string())
}

/// `tEncodeStreamTask` — serialize the full record, field order per spec §4.1.
pub fn encode(record: &TaskRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let w = &mut buf;

    w.write_i64::<LE>(record.ver).map_err(decode_err)?;
    w.write_i64::<LE>(record.id.stream_id as i64).map_err(decode_err)?;
    w.write_i32::<LE>(record.id.task_id as i32).map_err(decode_err)?;
    w.write_i32::<LE>(record.total_level).map_err(decode_err)?;
    w.write_i8(record.level as i8).map_err(decode_err)?;
    w.write_i8(output_kind_tag(record.output_kind)).map_err(decode_err)?;
    w.write_i16::<LE>(record.msg_type).map_err(decode_err)?;
    w.write_i8(record.task_status).map_err(decode_err)?;
    w.write_i8(record.sched_status).map_err(decode_err)?;
    w.write_i32::<LE>(record.self_child_id).map_err(decode_err)?;
    w.write_i32::<LE>(record.node_id).map_err(decode_err)?;
    write_epset(w, &record.epset).map_err(decode_err)?;
    write_epset(w, &record.mnode_epset).map_err(decode_err)?;
    w.write_i64::<LE>(record.checkpoint_id).map_err(decode_err)?;
    w.write_i64::<LE>(record.checkpoint_ver).map_err(decode_err)?;
    w.write_i8(record.fill_history as i8).map_err(decode_err)?;
    write_task_id_pair(w, record.companions.h_task).map_err(decode_err)?;
    write_task_id_pair(w, record.companions.stream_task).map_err(decode_err)?;
    w.write_u64::<LE>(record.data_range.min_ver).map_err(decode_err)?;
    w.write_u64::<LE>(record.data_range.max_ver).map_err(decode_err)?;
    w.write_i64::<LE>(record.data_range.window_start).map_err(decode_err)?;
    w.write_i64::<LE>(record.data_range.window_end).map_err(decode_err)?;

    w.write_i32::<LE>(record.upstream.len() as i32).map_err(decode_err)?;
    for up in &record.upstream {
        w.write_i32::<LE>(up.task_id).map_err(decode_err)?;
        w.write_i32::<LE>(up.node_id).map_err(decode_err)?;
        w.write_i32::<LE>(up.child_id).map_err(decode_err)?;
        write_epset(w, &up.epset).map_err(decode_err)?;
        w.write_i64::<LE>(up.stage).map_err(decode_err)?;
    }

    if record.level != TaskLevel::Sink {
        write_cstr(w, record.qmsg.as_deref().unwrap_or("")).map_err(decode_err)?;
    }

    write_output_variant(w, &record.output).map_err(decode_err)?;
    w.write_i64::<LE>(record.trigger_param).map_err(decode_err)?;

    if record.ver >= SUBTABLE_CHANGED_VER {
        w.write_i8(record.subtable_without_md5.unwrap_or(false) as i8).map_err(decode_err)?;
    }

    let mut reserve = record.reserve.clone();
    reserve.truncate(RESERVE_LEN);
    write_cstr(w, &reserve).map_err(decode_err)?;

    Ok(buf)
}

/// `tDecodeStreamTask` — full decode. Fields introduced after `ver` are left
/// at their typed default (`None`/`0`/empty) rather than read.
pub fn decode(bytes: &[u8]) -> Result<TaskRecord> {
    let mut r = io::Cursor::new(bytes);

    let ver = r.read_i64::<LE>().map_err(decode_err)?;
    check_version(ver)?;

    let stream_id = r.read_i64::<LE>().map_err(decode_err)? as u64;
    let task_id = r.read_i32::<LE>().map_err(decode_err)? as u32;
    let total_level = r.read_i32::<LE>().map_err(decode_err)?;
    let level_tag = r.read_i8().map_err(decode_err)?;
    let level = match level_tag {
        0 => TaskLevel::Source,
        1 => TaskLevel::Agg,
        2 => TaskLevel::Sink,
        other => return Err(StreamTaskError::Decode(format!("unknown level tag {other}"))),
    };
    let output_kind = output_kind_from_tag(r.read_i8().map_err(decode_err)?)?;
    let msg_type = r.read_i16::<LE>().map_err(decode_err)?;
    let task_status = r.read_i8().map_err(decode_err)?;
    let sched_status = r.read_i8().map_err(decode_err)?;
    let self_child_id = r.read_i32::<LE>().map_err(decode_err)?;
    let node_id = r.read_i32::<LE>().map_err(decode_err)?;
    let epset = read_epset(&mut r).map_err(decode_err)?;
    let mnode_epset = read_epset(&mut r).map_err(decode_err)?;
    let checkpoint_id = r.read_i64::<LE>().map_err(decode_err)?;
    let checkpoint_ver = r.read_i64::<LE>().map_err(decode_err)?;
    let fill_history = r.read_i8().map_err(decode_err)? != 0;
    let h_task = read_task_id_pair(&mut r).map_err(decode_err)?;
    let stream_task = read_task_id_pair(&mut r).map_err(decode_err)?;
    let min_ver = r.read_u64::<LE>().map_err(decode_err)?;
    let max_ver = r.read_u64::<LE>().map_err(decode_err)?;
    let window_start = r.read_i64::<LE>().map_err(decode_err)?;
    let window_end = r.read_i64::<LE>().map_err(decode_err)?;

    let upstream_count = r.read_i32::<LE>().map_err(decode_err)?;
    let mut upstream = Vec::with_capacity(upstream_count.max(0) as usize);
    for _ in 0..upstream_count {
        let u_task_id = r.read_i32::<LE>().map_err(decode_err)?;
        let u_node_id = r.read_i32::<LE>().map_err(decode_err)?;
        let child_id = r.read_i32::<LE>().map_err(decode_err)?;
        let u_epset = read_epset(&mut r).map_err(decode_err)?;
        let stage = r.read_i64::<LE>().map_err(decode_err)?;
        upstream.push(ChildEpInfo {
            child_id,
            task_id: u_task_id,
            node_id: u_node_id,
            epset: u_epset,
            stage,
            data_allowed: true,
        });
    }

    let qmsg = if level != TaskLevel::Sink {
        let s = read_cstr(&mut r).map_err(decode_err)?;
        if s.is_empty() { None } else { Some(s) }
    } else {
        None
    };

    let output = read_output_variant(&mut r, output_kind)?;
    let trigger_param = r.read_i64::<LE>().map_err(decode_err)?;

    let subtable_without_md5 = if ver >= SUBTABLE_CHANGED_VER {
        Some(r.read_i8().map_err(decode_err)? != 0)
    } else {
        None
    };

    let reserve = read_cstr(&mut r).map_err(decode_err)?;

    Ok(TaskRecord {
        ver,
        id: TaskId::new(stream_id, task_id),
        total_level,
        level,
        output_kind,
        msg_type,
        task_status,
        sched_status,
        self_child_id,
        node_id,
        epset,
        mnode_epset,
        checkpoint_id,
        checkpoint_ver,
        fill_history,
        companions: CompanionLinks { h_task, stream_task },
        data_range: DataRange { min_ver, max_ver, window_start, window_end },
        upstream,
        qmsg,
        output,
        trigger_param,
        subtable_without_md5,
        reserve,
    })
}

/// `tDecodeStreamTaskChkInfo` — the checkpoint-only partial decode: skip
/// every field ahead of `checkpoint_id`/`checkpoint_ver` by reading and
/// discarding, then stop. Used by the meta-store to read checkpoint
/// metadata without materializing the full record.
pub fn decode_checkpoint_info(bytes: &[u8]) -> Result<CheckpointOnly> {
    let mut r = io::Cursor::new(bytes);

    let ver = r.read_i64::<LE>().map_err(decode_err)?;
    check_version(ver)?;

    let _stream_id = r.read_i64::<LE>().map_err(decode_err)?;
    let _task_id = r.read_i32::<LE>().map_err(decode_err)?;
    let _total_level = r.read_i32::<LE>().map_err(decode_err)?;
    let _level = r.read_i8().map_err(decode_err)?;
    let _output_kind = r.read_i8().map_err(decode_err)?;
    let msg_type = r.read_i16::<LE>().map_err(decode_err)?;
    let _task_status = r.read_i8().map_err(decode_err)?;
    let _sched_status = r.read_i8().map_err(decode_err)?;
    let _self_child_id = r.read_i32::<LE>().map_err(decode_err)?;
    let _node_id = r.read_i32::<LE>().map_err(decode_err)?;
    let _epset = read_epset(&mut r).map_err(decode_err)?;
    let _mnode_epset = read_epset(&mut r).map_err(decode_err)?;
    let checkpoint_id = r.read_i64::<LE>().map_err(decode_err)?;
    let checkpoint_ver = r.read_i64::<LE>().map_err(decode_err)?;

    Ok(CheckpointOnly { msg_ver: msg_type as i64, checkpoint_id, checkpoint_ver })
}
