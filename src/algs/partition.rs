//! Morton-order-preserving repartitioning of a forest across ranks.
//!
//! Each rank intersects the global index range it currently owns with every
//! rank's target range and ships the overlapping sub-ranges. Receives are
//! concatenated in source-rank order, which keeps the global sequence sorted,
//! so the result depends only on the global sequence and the target counts.

use crate::algs::collective::{self, agree};
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{decode_quadrants, decode_u64s, encode_quadrants, encode_u64s};
use crate::forest::{Forest, Quadrant};
use crate::forest_error::ForestError;
use itertools::Itertools;

/// Tag of the quadrant exchange in [`partition`]; the payload phase uses `+ 1`.
pub const PARTITION_TAG: CommTag = CommTag::new(0x5700);
const WEIGHT_TAG: CommTag = CommTag::new(0x5800);

/// Split `global` items over `size` ranks; the first `global % size` ranks get one extra.
pub fn balanced_counts(global: u64, size: usize) -> Vec<u64> {
    let size64 = size as u64;
    (0..size64)
        .map(|r| global / size64 + u64::from(r < global % size64))
        .collect()
}

/// Exclusive prefix sums with the total appended (`counts.len() + 1` entries).
pub fn counts_to_offsets(counts: &[u64]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    offsets.push(0);
    let mut acc = 0u64;
    for &c in counts {
        acc += c;
        offsets.push(acc);
    }
    offsets
}

fn check_targets(targets: &[u64], size: usize, global: u64) -> Result<Vec<u64>, ForestError> {
    if targets.len() != size {
        return Err(ForestError::RankCountMismatch {
            expected: size,
            got: targets.len(),
        });
    }
    let sum: u64 = targets.iter().sum();
    if sum != global {
        return Err(ForestError::PartitionSizeMismatch {
            expected: global,
            got: sum,
        });
    }
    Ok(counts_to_offsets(targets))
}

/// Number of items whose owner differs between two ownership tables.
fn shipped_between(from: &[u64], to: &[u64]) -> u64 {
    from.iter()
        .tuple_windows()
        .zip(to.iter().tuple_windows())
        .map(|((&a0, &a1), (&b0, &b1))| {
            let kept = a1.min(b1).saturating_sub(a0.max(b0));
            (a1 - a0) - kept
        })
        .sum()
}

/// Redistribute `forest` to `target_counts` (one entry per rank), or to the
/// balanced split when `None`. Collective.
///
/// The current ownership table is always re-derived first, so the forest may
/// have been refined or coarsened since it was last synchronized. Returns the
/// number of quadrants that changed owner globally.
pub fn partition<C: Communicator, const D: usize>(
    forest: &mut Forest<D>,
    comm: &C,
    target_counts: Option<&[u64]>,
) -> Result<u64, ForestError> {
    agree(comm, forest.synchronize(comm))?;
    let (rank, size) = (comm.rank(), comm.size());
    let global = forest.global_count();
    let current = forest.global_first_quadrant().to_vec();

    let targets = match target_counts {
        Some(t) => check_targets(t, size, global),
        None => Ok(counts_to_offsets(&balanced_counts(global, size))),
    };
    let targets = agree(comm, targets)?;

    let shipped = shipped_between(&current, &targets);
    if shipped == 0 {
        log::debug!("rank {rank}: partition already matches the target");
        return Ok(0);
    }

    let (begin, end) = (current[rank], current[rank + 1]);
    let local = forest.local_quadrants();
    let outgoing: Vec<Vec<u8>> = targets
        .iter()
        .tuple_windows()
        .map(|(&t0, &t1)| {
            let lo = begin.max(t0);
            let hi = end.min(t1);
            if lo < hi {
                encode_quadrants(&local[(lo - begin) as usize..(hi - begin) as usize])
            } else {
                Vec::new()
            }
        })
        .collect();
    log::debug!(
        "rank {rank}: partition sends {} bytes",
        outgoing.iter().map(Vec::len).sum::<usize>()
    );

    let expected = targets[rank + 1] - targets[rank];
    let received = collective::exchange(comm, PARTITION_TAG, outgoing).and_then(|incoming| {
        let quads: Vec<Quadrant<D>> = incoming
            .iter()
            .map(|bytes| decode_quadrants::<D>(bytes))
            .flatten_ok()
            .collect::<Result<_, _>>()?;
        if quads.len() as u64 == expected {
            Ok(quads)
        } else {
            Err(ForestError::PartitionSizeMismatch {
                expected,
                got: quads.len() as u64,
            })
        }
    });
    let received = agree(comm, received)?;

    forest.install(received, targets);
    agree(comm, forest.synchronize(comm))?;
    if rank == 0 {
        log::info!("partition moved {shipped} of {global} quadrants over {size} ranks");
    }
    Ok(shipped)
}

/// Partition so that every rank receives about the same total `weight`.
///
/// A quadrant whose global weight prefix is `w` out of a total `W` goes to rank
/// `floor(w * size / W)`. With a zero total weight the balanced split is used.
pub fn partition_weighted<C, F, const D: usize>(
    forest: &mut Forest<D>,
    comm: &C,
    mut weight: F,
) -> Result<u64, ForestError>
where
    C: Communicator,
    F: FnMut(&Quadrant<D>) -> u64,
{
    forest.check_comm(comm)?;
    let size = comm.size();
    let weights: Vec<u64> = forest.local_quadrants().iter().map(&mut weight).collect();
    let sums = agree(comm, collective::all_gather_u64(comm, WEIGHT_TAG, weights.iter().sum()))?;
    let total: u64 = sums.iter().sum();
    if total == 0 {
        return partition(forest, comm, None);
    }

    let mut prefix: u64 = sums[..comm.rank()].iter().sum();
    let mut mine = vec![0u64; size];
    for w in weights {
        let dest = (u128::from(prefix) * size as u128 / u128::from(total)) as usize;
        mine[dest.min(size - 1)] += 1;
        prefix += w;
    }

    let gathered = collective::all_gather_bytes(comm, WEIGHT_TAG, &encode_u64s(&mine));
    let targets = gathered.and_then(|all| {
        let mut targets = vec![0u64; size];
        for bytes in &all {
            for (t, c) in targets.iter_mut().zip(decode_u64s(bytes)?) {
                *t += c;
            }
        }
        Ok(targets)
    });
    let targets = agree(comm, targets)?;
    partition(forest, comm, Some(&targets))
}
