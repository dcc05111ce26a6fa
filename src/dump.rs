//! Periodic debug dumps.
//!
//! One file set per epoch: the three current-page maps, per-block access
//! statistics, the admission window counters, the CDF, the admit set, and
//! every remote ring snapshot. Meant for offline analysis of cache
//! behavior; failures are logged and otherwise ignored.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

use serde::Serialize;

use crate::cache::ShardState;
use crate::metadata::RING_ENTRY_ABSENT;

#[derive(Serialize)]
struct CurrentPagesDump {
    primary: Vec<u64>,
    write: Vec<u64>,
    rdma: Vec<u64>,
}

#[derive(Serialize)]
struct RemoteRingDump {
    host: String,
    present: usize,
    entries: Vec<(u64, i64)>,
}

fn write_json<T: Serialize>(dir: &Path, name: &str, epoch: u64, value: &T) -> io::Result<()> {
    let path = dir.join(format!("{name}_{epoch}.json"));
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value).map_err(io::Error::other)
}

pub(crate) fn write_epoch(state: &ShardState, dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let epoch = state.dump_epoch;

    let mut pages = CurrentPagesDump {
        primary: state.current_pages.keys().map(|id| id.0).collect(),
        write: state.write_pages.keys().map(|id| id.0).collect(),
        rdma: state.rdma_pages.keys().map(|id| id.0).collect(),
    };
    pages.primary.sort_unstable();
    pages.write.sort_unstable();
    pages.rdma.sort_unstable();
    write_json(dir, "current_pages", epoch, &pages)?;

    write_json(dir, "block_info", epoch, &state.stats.block_info)?;
    write_json(dir, "internal_nodes", epoch, &state.stats.internal_nodes)?;
    write_json(dir, "access_counts", epoch, &state.stats.perf)?;
    write_json(dir, "cdf", epoch, &state.admission.cdf)?;
    write_json(dir, "admit_set", epoch, state.admission.admit_set())?;

    let rings: Vec<RemoteRingDump> = state
        .peers
        .iter()
        .map(|peer| {
            let snapshot = peer.mirror.snapshot();
            let entries: Vec<(u64, i64)> = snapshot
                .iter()
                .enumerate()
                .filter(|(_, &entry)| entry != RING_ENTRY_ABSENT)
                .map(|(index, &entry)| (index as u64, entry))
                .collect();
            RemoteRingDump {
                host: peer.host.clone(),
                present: entries.len(),
                entries,
            }
        })
        .collect();
    write_json(dir, "remote_rings", epoch, &rings)?;
    Ok(())
}
