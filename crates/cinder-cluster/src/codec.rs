//! Binary encoding of a cluster config, used for gossip and on disk.
//!
//! All integers are little-endian.
//!
//! ```text
//! magic "CCFG" | version u8 | slot count u16 | epoch u64 | worker count u16
//! worker*: id [16] | addr len u16 | addr | port u16 | role u8
//!          | replica_of ordinal u16 | config epoch u64
//!          | hostname len u16 | hostname            (v2 only)
//! slot section: encoding u8, then
//!   dense: one (owner, migrating, importing) ordinal triple per slot
//!   runs:  run count u16, then (run length u16, triple) per run
//! ```
//!
//! Ordinals are 1-based positions in the worker table; 0 means none. The
//! encoder picks whichever slot encoding is smaller.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::MAX_WORKERS;
use crate::node::MAX_FIELD_LEN;
use crate::slots::{SlotMap, SlotState};
use crate::{ClusterConfig, CodecError, NodeId, NodeRole, Worker};

/// Leading bytes of every encoded config.
pub const MAGIC: &[u8; 4] = b"CCFG";

/// Version written by [`ClusterConfig::to_bytes`].
pub const FORMAT_VERSION: u8 = 2;

/// Oldest version the decoder still accepts. v1 has no hostnames.
pub const MIN_FORMAT_VERSION: u8 = 1;

const SLOTS_DENSE: u8 = 0;
const SLOTS_RUNS: u8 = 1;

const TRIPLE_LEN: usize = 6;
const RUN_LEN: usize = 2 + TRIPLE_LEN;
// id + addr len + port + role + replica_of + config epoch
const MIN_WORKER_LEN: usize = NodeId::LEN + 2 + 2 + 1 + 2 + 8;

type Triple = [u16; 3];

impl ClusterConfig {
    /// Serializes the config into an owned buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.worker_count() * 64);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the config into the given buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        encode_versioned(self, buf, FORMAT_VERSION);
    }

    /// Parses a config produced by [`ClusterConfig::to_bytes`] (or an older
    /// supported version).
    ///
    /// The decoded config is checked against every invariant before it is
    /// returned.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        decode(data)
    }
}

fn encode_versioned(config: &ClusterConfig, buf: &mut BytesMut, version: u8) {
    let ordinals: HashMap<NodeId, u16> = config
        .workers()
        .iter()
        .enumerate()
        .map(|(idx, w)| (w.id, idx as u16 + 1))
        .collect();
    let ordinal = |id: Option<NodeId>| id.and_then(|id| ordinals.get(&id).copied()).unwrap_or(0);

    buf.put_slice(MAGIC);
    buf.put_u8(version);
    buf.put_u16_le(config.slot_count());
    buf.put_u64_le(config.epoch());

    // add_worker, merge and decode all cap the table at MAX_WORKERS
    debug_assert!(config.worker_count() <= MAX_WORKERS);
    buf.put_u16_le(config.worker_count() as u16);
    for worker in config.workers() {
        buf.put_slice(worker.id.as_bytes());
        put_str(buf, &worker.address);
        buf.put_u16_le(worker.port);
        buf.put_u8(worker.role.tag());
        buf.put_u16_le(ordinal(worker.replica_of));
        buf.put_u64_le(worker.config_epoch);
        if version >= 2 {
            put_str(buf, &worker.hostname);
        }
    }

    let triples: Vec<Triple> = config
        .slots()
        .iter()
        .map(|(_, s)| {
            [
                ordinal(s.owner),
                ordinal(s.migrating_to),
                ordinal(s.importing_from),
            ]
        })
        .collect();
    let runs = runs_of(&triples);

    if 2 + runs.len() * RUN_LEN < triples.len() * TRIPLE_LEN {
        buf.put_u8(SLOTS_RUNS);
        buf.put_u16_le(runs.len() as u16);
        for (len, triple) in runs {
            buf.put_u16_le(len);
            put_triple(buf, triple);
        }
    } else {
        buf.put_u8(SLOTS_DENSE);
        for triple in triples {
            put_triple(buf, triple);
        }
    }
}

fn runs_of(triples: &[Triple]) -> Vec<(u16, Triple)> {
    let mut runs: Vec<(u16, Triple)> = Vec::new();
    for &triple in triples {
        match runs.last_mut() {
            Some((len, last)) if *last == triple => *len += 1,
            _ => runs.push((1, triple)),
        }
    }
    runs
}

fn put_str(buf: &mut BytesMut, s: &str) {
    // workers can't hold fields longer than MAX_FIELD_LEN
    debug_assert!(s.len() <= MAX_FIELD_LEN);
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_triple(buf: &mut BytesMut, triple: Triple) {
    for ordinal in triple {
        buf.put_u16_le(ordinal);
    }
}

// -- decoding --

fn decode(mut buf: &[u8]) -> Result<ClusterConfig, CodecError> {
    let magic = get_slice(&mut buf, MAGIC.len(), "magic")?;
    if magic != MAGIC {
        return Err(CodecError::InvalidMagic);
    }
    let version = get_u8(&mut buf, "version")?;
    if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let slot_count = get_u16(&mut buf, "slot count")?;
    if slot_count == 0 {
        return Err(CodecError::InvalidData("slot count is zero".into()));
    }
    let epoch = get_u64(&mut buf, "epoch")?;

    let worker_count = get_u16(&mut buf, "worker count")? as usize;
    if worker_count == 0 {
        return Err(CodecError::InvalidData("worker table is empty".into()));
    }
    if worker_count > MAX_WORKERS {
        return Err(CodecError::InvalidData(format!(
            "worker count {worker_count} exceeds limit"
        )));
    }

    let mut raw = Vec::with_capacity(worker_count.min(buf.len() / MIN_WORKER_LEN));
    for _ in 0..worker_count {
        raw.push(decode_worker(&mut buf, version)?);
    }
    let ids: Vec<NodeId> = raw.iter().map(|(w, _)| w.id).collect();
    let resolve = |field: &'static str, ordinal: u16| -> Result<Option<NodeId>, CodecError> {
        match ordinal {
            0 => Ok(None),
            n => ids
                .get(n as usize - 1)
                .copied()
                .map(Some)
                .ok_or(CodecError::InvalidReference {
                    field,
                    index: n,
                    count: ids.len(),
                }),
        }
    };

    let mut workers = Vec::with_capacity(raw.len());
    for (mut worker, replica_of) in raw {
        worker.replica_of = resolve("replica_of", replica_of)?;
        workers.push(worker);
    }

    let triples = decode_slots(&mut buf, slot_count)?;
    let mut states = Vec::with_capacity(triples.len());
    for [owner, migrating, importing] in triples {
        states.push(SlotState {
            owner: resolve("slot owner", owner)?,
            migrating_to: resolve("slot migrating", migrating)?,
            importing_from: resolve("slot importing", importing)?,
        });
    }

    if !buf.is_empty() {
        return Err(CodecError::InvalidData(format!(
            "{} trailing bytes",
            buf.len()
        )));
    }

    let slots = SlotMap::from_states(states)
        .ok_or_else(|| CodecError::InvalidData("slot map size".into()))?;
    let config = ClusterConfig::from_parts(workers, slots, epoch);
    config.validate().map_err(CodecError::InvalidData)?;
    Ok(config)
}

/// Decodes one worker record. The replica-of ordinal is returned raw since
/// it can point forward in the table.
fn decode_worker(buf: &mut &[u8], version: u8) -> Result<(Worker, u16), CodecError> {
    let mut id = [0u8; NodeId::LEN];
    id.copy_from_slice(get_slice(buf, NodeId::LEN, "node id")?);
    let address = get_str(buf, "address")?;
    let port = get_u16(buf, "port")?;
    let tag = get_u8(buf, "role")?;
    let role = NodeRole::from_tag(tag)
        .ok_or_else(|| CodecError::InvalidData(format!("unknown role tag {tag}")))?;
    let replica_of = get_u16(buf, "replica_of")?;
    let config_epoch = get_u64(buf, "config epoch")?;
    let hostname = if version >= 2 {
        get_str(buf, "hostname")?
    } else {
        ""
    };

    let worker = Worker::new(
        NodeId::from_bytes(id),
        address,
        port,
        role,
        None,
        config_epoch,
        hostname,
    );
    Ok((worker, replica_of))
}

fn decode_slots(buf: &mut &[u8], slot_count: u16) -> Result<Vec<Triple>, CodecError> {
    let encoding = get_u8(buf, "slot encoding")?;
    let mut triples = Vec::with_capacity(slot_count as usize);
    match encoding {
        SLOTS_DENSE => {
            for _ in 0..slot_count {
                triples.push(get_triple(buf)?);
            }
        }
        SLOTS_RUNS => {
            let run_count = get_u16(buf, "run count")?;
            for _ in 0..run_count {
                let len = get_u16(buf, "run length")? as usize;
                let triple = get_triple(buf)?;
                if len == 0 || triples.len() + len > slot_count as usize {
                    return Err(CodecError::InvalidData(format!(
                        "slot run of {len} overflows {slot_count} slots"
                    )));
                }
                triples.resize(triples.len() + len, triple);
            }
            if triples.len() != slot_count as usize {
                return Err(CodecError::InvalidData(format!(
                    "slot runs cover {} of {slot_count} slots",
                    triples.len()
                )));
            }
        }
        other => {
            return Err(CodecError::InvalidData(format!(
                "unknown slot encoding {other}"
            )))
        }
    }
    Ok(triples)
}

// Safe read helpers that report truncation instead of panicking.

fn ensure(buf: &[u8], needed: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            field,
            needed: needed - buf.len(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, CodecError> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, CodecError> {
    ensure(buf, 2, field)?;
    Ok(buf.get_u16_le())
}

fn get_u64(buf: &mut &[u8], field: &'static str) -> Result<u64, CodecError> {
    ensure(buf, 8, field)?;
    Ok(buf.get_u64_le())
}

fn get_slice<'a>(
    buf: &mut &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], CodecError> {
    ensure(buf, len, field)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_str<'a>(buf: &mut &'a [u8], field: &'static str) -> Result<&'a str, CodecError> {
    let len = get_u16(buf, field)? as usize;
    let bytes = get_slice(buf, len, field)?;
    std::str::from_utf8(bytes)
        .map_err(|_| CodecError::InvalidData(format!("{field} is not valid utf-8")))
}

fn get_triple(buf: &mut &[u8]) -> Result<Triple, CodecError> {
    Ok([
        get_u16(buf, "slot owner")?,
        get_u16(buf, "slot migrating")?,
        get_u16(buf, "slot importing")?,
    ])
}
