//! Collective save and load of forests, and local save and load of connectivities.
//!
//! A forest save runs `Header → ConnectivityBlock → ForestSummary →
//! PerRankQuadrantBlocks → Commit`; a load runs the same stages with a final
//! `Validate` instead of `Commit`. Each stage ends with a verdict agreement, so
//! every rank leaves a stage with the same outcome. Forest files are written to
//! `<path>.partial` and only renamed into place once every rank succeeded.

use super::format::{
    CONNECTIVITY_PREFIX_LEN, FOREST_HEADER_LEN, ForestHeader, connectivity_block_len,
    read_connectivity, read_connectivity_prefix, read_offsets, read_records, record_len,
    write_connectivity, write_records,
};
use crate::algs::collective::{self, agree};
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::partition::{balanced_counts, counts_to_offsets};
use crate::algs::wire::{ByteReader, ByteWriter};
use crate::forest::{Forest, Quadrant};
use crate::forest_error::ForestError;
use crate::topology::connectivity::Connectivity;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SAVE_TAG: CommTag = CommTag::new(0x5900);

/// How quadrant records reach the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Every rank writes its records at the offset given by the ownership table.
    #[default]
    ParallelOffsets,
    /// Records are gathered on rank 0, which writes them in rank order.
    GatherToRoot,
}

/// Options for [`load_forest_ext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Spread the quadrants evenly over the current ranks. When false and the
    /// rank count matches the one at save time, the saved partition is kept.
    pub autopartition: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            autopartition: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    ConnectivityBlock,
    ForestSummary,
    PerRankQuadrantBlocks,
    Validate,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Header => "header",
            Stage::ConnectivityBlock => "connectivity block",
            Stage::ForestSummary => "forest summary",
            Stage::PerRankQuadrantBlocks => "quadrant blocks",
            Stage::Validate => "validate",
            Stage::Commit => "commit",
        };
        f.write_str(name)
    }
}

fn run_stage<C, T, F>(comm: &C, stage: Stage, body: F) -> Result<T, ForestError>
where
    C: Communicator,
    F: FnOnce() -> Result<T, ForestError>,
{
    log::debug!("rank {}: checkpoint stage {stage}", comm.rank());
    let outcome = body();
    if let Err(e) = &outcome {
        log::debug!("rank {}: stage {stage} failed locally: {e}", comm.rank());
    }
    agree(comm, outcome)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn read_exact_or_corrupt(file: &mut File, buf: &mut [u8], what: &str) -> Result<(), ForestError> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            ForestError::CorruptHeader(format!("file ends inside the {what}"))
        }
        _ => e.into(),
    })
}

/// Write `conn` to `path`. Local, not collective.
pub fn save_connectivity<const D: usize>(
    path: impl AsRef<Path>,
    conn: &Connectivity<D>,
) -> Result<(), ForestError> {
    let path = path.as_ref();
    let mut w = ByteWriter::new();
    write_connectivity(&mut w, conn);
    let tmp = partial_path(path);
    if let Err(e) = fs::write(&tmp, w.into_inner()).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    log::info!(
        "saved connectivity of {} trees to {}",
        conn.num_trees(),
        path.display()
    );
    Ok(())
}

/// Read a connectivity written by [`save_connectivity`]. Local, not collective.
pub fn load_connectivity<const D: usize>(
    path: impl AsRef<Path>,
) -> Result<Connectivity<D>, ForestError> {
    let bytes = fs::read(path.as_ref())?;
    let mut r = ByteReader::new(&bytes);
    let conn = read_connectivity::<D>(&mut r)?;
    if r.remaining() != 0 {
        return Err(ForestError::CorruptHeader(format!(
            "{} trailing bytes after the connectivity",
            r.remaining()
        )));
    }
    Ok(conn)
}

/// Save `forest` with the default [`WritePolicy`]. Collective.
pub fn save_forest<C: Communicator, const D: usize>(
    comm: &C,
    path: impl AsRef<Path>,
    forest: &Forest<D>,
) -> Result<(), ForestError> {
    save_forest_with(comm, path, forest, WritePolicy::default())
}

/// Save `forest` to `path`. Collective; all ranks pass the same path.
///
/// On failure every rank returns the same error and no file is left at `path`
/// (an existing file there is only replaced on success).
pub fn save_forest_with<C: Communicator, const D: usize>(
    comm: &C,
    path: impl AsRef<Path>,
    forest: &Forest<D>,
    policy: WritePolicy,
) -> Result<(), ForestError> {
    forest.check_comm(comm)?;
    let path = path.as_ref();
    let tmp = partial_path(path);
    let outcome = write_forest_file(comm, path, &tmp, forest, policy);
    if outcome.is_err() && comm.rank() == 0 {
        let _ = fs::remove_file(&tmp);
    }
    outcome
}

fn write_forest_file<C: Communicator, const D: usize>(
    comm: &C,
    path: &Path,
    tmp: &Path,
    forest: &Forest<D>,
    policy: WritePolicy,
) -> Result<(), ForestError> {
    let (rank, size) = (comm.rank(), comm.size());
    // Fresh table: the forest may have been refined since its last synchronization.
    let counts = collective::all_gather_u64(comm, SAVE_TAG, forest.local_count() as u64)?;
    let offsets = counts_to_offsets(&counts);
    let header = ForestHeader {
        dim: D as u32,
        max_level: u32::from(Quadrant::<D>::MAX_LEVEL),
        global_count: offsets[size],
        rank_count: size as u32,
    };

    let head = {
        let mut w = ByteWriter::new();
        header.write(&mut w);
        w.into_inner()
    };
    run_stage(comm, Stage::Header, || {
        if rank == 0 {
            File::create(tmp)?.write_all(&head)?;
        }
        Ok(())
    })?;

    let conn_block = {
        let mut w = ByteWriter::new();
        write_connectivity(&mut w, forest.connectivity());
        w.into_inner()
    };
    run_stage(comm, Stage::ConnectivityBlock, || {
        if rank == 0 {
            OpenOptions::new().append(true).open(tmp)?.write_all(&conn_block)?;
        }
        Ok(())
    })?;

    let summary = {
        let mut w = ByteWriter::new();
        offsets.iter().for_each(|&o| w.put_u64(o));
        w.into_inner()
    };
    run_stage(comm, Stage::ForestSummary, || {
        if rank == 0 {
            OpenOptions::new().append(true).open(tmp)?.write_all(&summary)?;
        }
        Ok(())
    })?;

    let data_start = (head.len() + conn_block.len() + summary.len()) as u64;
    let records = {
        let mut w = ByteWriter::new();
        write_records(&mut w, forest.local_quadrants());
        w.into_inner()
    };
    match policy {
        WritePolicy::ParallelOffsets => {
            run_stage(comm, Stage::PerRankQuadrantBlocks, || {
                if records.is_empty() {
                    return Ok(());
                }
                let mut file = OpenOptions::new().write(true).open(tmp)?;
                file.seek(SeekFrom::Start(
                    data_start + offsets[rank] * record_len(D) as u64,
                ))?;
                file.write_all(&records)?;
                file.sync_data()?;
                Ok(())
            })?;
        }
        WritePolicy::GatherToRoot => {
            let gathered = collective::gather_bytes(comm, SAVE_TAG.offset(2), 0, records);
            run_stage(comm, Stage::PerRankQuadrantBlocks, || {
                if let Some(blocks) = gathered? {
                    let mut file = OpenOptions::new().append(true).open(tmp)?;
                    for block in &blocks {
                        file.write_all(block)?;
                    }
                    file.sync_data()?;
                }
                Ok(())
            })?;
        }
    }

    run_stage(comm, Stage::Commit, || {
        if rank == 0 {
            fs::rename(tmp, path)?;
        }
        Ok(())
    })?;
    if rank == 0 {
        log::info!(
            "saved {} quadrants from {size} ranks to {}",
            header.global_count,
            path.display()
        );
    }
    Ok(())
}

/// Load a forest, spreading it evenly over the ranks of `comm`. Collective.
pub fn load_forest<C: Communicator, const D: usize>(
    comm: &C,
    path: impl AsRef<Path>,
) -> Result<Forest<D>, ForestError> {
    load_forest_ext(comm, path, LoadOptions::default())
}

/// Load a forest written by [`save_forest`] on any number of ranks. Collective.
///
/// The returned forest has passed the connectivity symmetry check and the
/// distributed ordering check; on any failure every rank returns the same error.
pub fn load_forest_ext<C: Communicator, const D: usize>(
    comm: &C,
    path: impl AsRef<Path>,
    options: LoadOptions,
) -> Result<Forest<D>, ForestError> {
    let path = path.as_ref();
    let (rank, size) = (comm.rank(), comm.size());

    let (mut file, file_len, header) = run_stage(comm, Stage::Header, || {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut buf = [0u8; FOREST_HEADER_LEN];
        read_exact_or_corrupt(&mut file, &mut buf, "forest header")?;
        let header = ForestHeader::read::<D>(&mut ByteReader::new(&buf))?;
        Ok((file, file_len, header))
    })?;

    let conn = run_stage(comm, Stage::ConnectivityBlock, || {
        let mut block = vec![0u8; CONNECTIVITY_PREFIX_LEN];
        read_exact_or_corrupt(&mut file, &mut block, "connectivity block")?;
        let (num_trees, num_vertices) =
            read_connectivity_prefix::<D>(&mut ByteReader::new(&block))?;
        let len = connectivity_block_len::<D>(num_trees, num_vertices)
            .filter(|&n| n <= file_len)
            .ok_or_else(|| {
                ForestError::CorruptHeader(format!(
                    "connectivity of {num_trees} trees does not fit a {file_len} byte file"
                ))
            })?;
        block.resize(len as usize, 0);
        let rest = &mut block[CONNECTIVITY_PREFIX_LEN..];
        read_exact_or_corrupt(&mut file, rest, "connectivity block")?;
        read_connectivity::<D>(&mut ByteReader::new(&block)).map(Arc::new)
    })?;

    let (saved, data_start) = run_stage(comm, Stage::ForestSummary, || {
        let remaining = file_len.saturating_sub(file.stream_position()?);
        let n = (u64::from(header.rank_count) + 1)
            .checked_mul(8)
            .filter(|&n| n <= remaining)
            .ok_or_else(|| {
                ForestError::CorruptHeader(format!(
                    "ownership table of {} ranks does not fit the {remaining} bytes left",
                    header.rank_count
                ))
            })?;
        let mut buf = vec![0u8; n as usize];
        read_exact_or_corrupt(&mut file, &mut buf, "ownership table")?;
        let saved = read_offsets(&mut ByteReader::new(&buf), &header)?;
        let data_start = file.stream_position()?;
        let expected = header
            .global_count
            .checked_mul(record_len(D) as u64)
            .and_then(|n| n.checked_add(data_start));
        if expected != Some(file_len) {
            return Err(ForestError::CorruptHeader(format!(
                "{} quadrants need {expected:?} bytes, file has {file_len}",
                header.global_count
            )));
        }
        Ok((saved, data_start))
    })?;

    let keep_saved = !options.autopartition && header.rank_count as usize == size;
    let targets = if keep_saved {
        saved
    } else {
        counts_to_offsets(&balanced_counts(header.global_count, size))
    };
    let local = run_stage(comm, Stage::PerRankQuadrantBlocks, || {
        let count = (targets[rank + 1] - targets[rank]) as usize;
        let rec = record_len(D);
        file.seek(SeekFrom::Start(data_start + targets[rank] * rec as u64))?;
        let mut buf = vec![0u8; count * rec];
        read_exact_or_corrupt(&mut file, &mut buf, "quadrant records")?;
        read_records::<D>(&mut ByteReader::new(&buf), count, conn.num_trees())
    })?;

    let forest = agree(comm, Forest::from_local(comm, conn, local))?;
    let valid = agree(comm, forest.is_valid(comm))?;
    run_stage(comm, Stage::Validate, || {
        if !valid {
            return Err(ForestError::InvalidForest(format!(
                "{} does not hold a sorted, non-overlapping quadrant sequence",
                path.display()
            )));
        }
        if forest.global_first_quadrant() != targets.as_slice() {
            return Err(ForestError::InvalidForest(
                "loaded partition does not match the ownership table".into(),
            ));
        }
        Ok(())
    })?;

    if rank == 0 {
        log::info!(
            "loaded {} quadrants saved by {} ranks onto {size} ranks from {}",
            header.global_count,
            header.rank_count,
            path.display()
        );
    }
    Ok(forest)
}
