//! Cluster-id bootstrap (spec §4.8): a small Snowflake-style id generator
//! plus the on-disk two-field cluster-id file, mirroring
//! `storeServer.ClusterID` in the original store role — generalized away
//! from a LevelDB-specific snowflake package into a self-contained one.
//!
//! The file holds one line, `"<snowflakeId>,<firstStartTimeMs>"`. On first
//! boot there is no file: the machine id is derived as one more than the
//! highest machine id already visible in the registry for this server
//! name, a fresh id is minted, and the line is written atomically
//! (write-temp, then rename). On every subsequent boot the file is read
//! back verbatim and the same cluster id is reused forever.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::TenuredError;
use crate::registry::Registry;

const EPOCH_MS: u64 = 1_600_000_000_000; // 2020-09-13T12:26:40Z
const MACHINE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_MACHINE_ID: u64 = (1 << MACHINE_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// The fields packed into one Snowflake-style id, as produced by
/// [`Snowflake::next_id`] and recovered by [`decompose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decomposed {
    pub time_ms: u64,
    pub machine_id: u16,
    pub sequence: u16,
}

pub fn decompose(id: u64) -> Decomposed {
    let sequence = (id & MAX_SEQUENCE) as u16;
    let machine_id = ((id >> SEQUENCE_BITS) & MAX_MACHINE_ID) as u16;
    let time_ms = (id >> (SEQUENCE_BITS + MACHINE_ID_BITS)) + EPOCH_MS;
    Decomposed {
        time_ms,
        machine_id,
        sequence,
    }
}

/// A monotonic id generator: 41 bits of milliseconds since [`EPOCH_MS`], 10
/// bits of machine id, 12 bits of per-millisecond sequence.
pub struct Snowflake {
    machine_id: u16,
    state: Mutex<(u64, u64)>, // (last_ms, sequence)
}

impl Snowflake {
    pub fn new(machine_id: u16) -> Result<Self, TenuredError> {
        if machine_id as u64 > MAX_MACHINE_ID {
            return Err(TenuredError::Internal);
        }
        Ok(Self {
            machine_id,
            state: Mutex::new((0, 0)),
        })
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now = now_ms();
        if now < state.0 {
            // Clock moved backwards; stall on the last known millisecond
            // rather than emitting a duplicate id.
            now = state.0;
        }
        let sequence = if now == state.0 {
            (state.1 + 1) & MAX_SEQUENCE
        } else {
            0
        };
        if sequence == 0 && now == state.0 {
            now += 1;
        }
        *state = (now, sequence);
        ((now - EPOCH_MS) << (SEQUENCE_BITS + MACHINE_ID_BITS))
            | ((self.machine_id as u64) << SEQUENCE_BITS)
            | sequence
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Resolves (and persists, on first boot) this process's cluster id for
/// `server_name`. Returns `(cluster_id, first_start_time_ms, snowflake)`.
pub async fn bootstrap(
    path: &Path,
    server_name: &str,
    registry: &dyn Registry,
) -> Result<(u64, u64, Snowflake), TenuredError> {
    if let Some((cluster_id, first_start)) = read_existing(path).await? {
        let machine_id = decompose(cluster_id).machine_id;
        let snowflake = Snowflake::new(machine_id)?;
        return Ok((cluster_id, first_start, snowflake));
    }

    let machine_id = max_machine_id(server_name, registry).await? + 1;
    let snowflake = Snowflake::new(machine_id)?;
    let cluster_id = snowflake.next_id();
    let first_start = decompose(cluster_id).time_ms;

    write_atomically(path, cluster_id, first_start).await?;
    Ok((cluster_id, first_start, snowflake))
}

async fn max_machine_id(server_name: &str, registry: &dyn Registry) -> Result<u16, TenuredError> {
    let peers = registry.lookup(server_name, &[]).await?;
    let max = peers
        .iter()
        .filter_map(|instance| instance.id.parse::<u64>().ok())
        .map(|id| decompose(id).machine_id)
        .max()
        .unwrap_or(0);
    Ok(max)
}

async fn read_existing(path: &Path) -> Result<Option<(u64, u64)>, TenuredError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(_) => return Err(TenuredError::Internal),
    };
    let (cluster_id, first_start) = contents
        .trim()
        .split_once(',')
        .ok_or(TenuredError::Internal)?;
    let cluster_id = cluster_id.parse().map_err(|_| TenuredError::Internal)?;
    let first_start = first_start.parse().map_err(|_| TenuredError::Internal)?;
    Ok(Some((cluster_id, first_start)))
}

async fn write_atomically(path: &Path, cluster_id: u64, first_start: u64) -> Result<(), TenuredError> {
    let tmp: PathBuf = path.with_extension("cid.tmp");
    tokio::fs::write(&tmp, format!("{cluster_id},{first_start}")).await.map_err(|_| TenuredError::Internal)?;
    tokio::fs::rename(&tmp, path).await.map_err(|_| TenuredError::Internal)
}
