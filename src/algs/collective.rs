//! Collective operations built from point-to-point messages.
//!
//! Every variable-length message travels in two phases: a [`WireCount`] header
//! on the collective's tag, then the payload on `tag + 1`. All sends of a step
//! are posted before any receive is waited on, and every send handle is
//! drained before returning, even on error.
//!
//! Each function here is a synchronization point; all ranks must call the same
//! collectives in the same order.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, WireU64, cast_slice, cast_slice_mut};
use crate::forest_error::ForestError;
use std::mem::size_of;

/// Tags owned by the collectives of this module. Payload phases use `tag + 1`.
pub mod tags {
    use crate::algs::communicator::CommTag;

    pub const EXCHANGE: CommTag = CommTag::new(0x5100);
    pub const GATHER: CommTag = CommTag::new(0x5200);
    pub const BROADCAST: CommTag = CommTag::new(0x5300);
    pub const BARRIER: CommTag = CommTag::new(0x5400);
    pub const VERDICT: CommTag = CommTag::new(0x5500);
    pub const SIZES: CommTag = CommTag::new(0x5600);
}

fn post_message<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    payload: &[u8],
    pending: &mut Vec<C::SendHandle>,
) {
    let count = WireCount::new(payload.len());
    pending.push(comm.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&count))));
    pending.push(comm.isend(peer, tag.offset(1).as_u16(), payload));
}

fn receive_message<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
) -> Result<Vec<u8>, ForestError> {
    let mut cnt = WireCount::new(0);
    let header = comm
        .irecv(
            peer,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut cnt)),
        )
        .wait()
        .ok_or_else(|| ForestError::CommError {
            neighbor: peer,
            reason: "no size header received".into(),
        })?;
    if header.len() != size_of::<WireCount>() {
        return Err(ForestError::CommError {
            neighbor: peer,
            reason: format!(
                "expected {} bytes for size header, got {}",
                size_of::<WireCount>(),
                header.len()
            ),
        });
    }
    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&header);
    let n = cnt.get();
    let mut buf = vec![0u8; n];
    let data = comm
        .irecv(peer, tag.offset(1).as_u16(), &mut buf)
        .wait()
        .ok_or_else(|| ForestError::CommError {
            neighbor: peer,
            reason: format!("no payload received (expected {n} bytes)"),
        })?;
    if data.len() != n {
        return Err(ForestError::CommError {
            neighbor: peer,
            reason: format!("expected {n} payload bytes, got {}", data.len()),
        });
    }
    Ok(data)
}

fn drain<H: Wait>(pending: Vec<H>) {
    for send in pending {
        let _ = send.wait();
    }
}

/// Personalized all-to-all: `outgoing[r]` is delivered to rank `r`, and the
/// result holds what every rank sent to this one, indexed by source rank.
pub fn exchange<C: Communicator>(
    comm: &C,
    tag: CommTag,
    mut outgoing: Vec<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, ForestError> {
    let (rank, size) = (comm.rank(), comm.size());
    if outgoing.len() != size {
        return Err(ForestError::RankCountMismatch {
            expected: size,
            got: outgoing.len(),
        });
    }

    let mut pending = Vec::with_capacity(2 * size);
    for (peer, payload) in outgoing.iter().enumerate() {
        if peer != rank {
            post_message(comm, peer, tag, payload, &mut pending);
        }
    }

    let mut incoming = vec![Vec::new(); size];
    let mut maybe_err = None;
    for (peer, slot) in incoming.iter_mut().enumerate() {
        if peer == rank {
            *slot = std::mem::take(&mut outgoing[rank]);
            continue;
        }
        // Keep receiving after a failure so the peers' messages are consumed.
        match receive_message(comm, peer, tag) {
            Ok(data) => *slot = data,
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }
    drain(pending);

    match maybe_err {
        Some(err) => Err(err),
        None => {
            log::trace!(
                "rank {rank}: exchange on tag {:#x} received {} bytes",
                tag.as_u16(),
                incoming.iter().map(Vec::len).sum::<usize>()
            );
            Ok(incoming)
        }
    }
}

/// Every rank receives every rank's `mine`, indexed by source rank.
pub fn all_gather_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    mine: &[u8],
) -> Result<Vec<Vec<u8>>, ForestError> {
    exchange(comm, tag, vec![mine.to_vec(); comm.size()])
}

/// All-gather of one `u64` per rank.
pub fn all_gather_u64<C: Communicator>(
    comm: &C,
    tag: CommTag,
    value: u64,
) -> Result<Vec<u64>, ForestError> {
    let word = WireU64::of(value);
    all_gather_bytes(comm, tag, cast_slice(std::slice::from_ref(&word)))?
        .into_iter()
        .enumerate()
        .map(|(peer, bytes)| {
            let mut word = WireU64::of(0);
            if bytes.len() != size_of::<WireU64>() {
                return Err(ForestError::CommError {
                    neighbor: peer,
                    reason: format!("expected an 8-byte value, got {} bytes", bytes.len()),
                });
            }
            cast_slice_mut(std::slice::from_mut(&mut word)).copy_from_slice(&bytes);
            Ok(word.get())
        })
        .collect()
}

/// Send `data` from `root` to every rank; non-root inputs are ignored.
pub fn broadcast_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    root: usize,
    data: Vec<u8>,
) -> Result<Vec<u8>, ForestError> {
    if comm.rank() == root {
        let mut pending = Vec::with_capacity(2 * comm.size());
        for peer in (0..comm.size()).filter(|&p| p != root) {
            post_message(comm, peer, tag, &data, &mut pending);
        }
        drain(pending);
        Ok(data)
    } else {
        receive_message(comm, root, tag)
    }
}

/// Collect every rank's `mine` on `root` (indexed by source rank); other ranks get `None`.
pub fn gather_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    root: usize,
    mine: Vec<u8>,
) -> Result<Option<Vec<Vec<u8>>>, ForestError> {
    if comm.rank() != root {
        let mut pending = Vec::with_capacity(2);
        post_message(comm, root, tag, &mine, &mut pending);
        drain(pending);
        return Ok(None);
    }
    let mut mine = Some(mine);
    let mut out = Vec::with_capacity(comm.size());
    let mut maybe_err = None;
    for peer in 0..comm.size() {
        if peer == root {
            out.push(mine.take().unwrap_or_default());
            continue;
        }
        match receive_message(comm, peer, tag) {
            Ok(data) => out.push(data),
            Err(e) => {
                maybe_err.get_or_insert(e);
                out.push(Vec::new());
            }
        }
    }
    match maybe_err {
        Some(err) => Err(err),
        None => Ok(Some(out)),
    }
}

/// Block until every rank has entered the barrier.
pub fn barrier<C: Communicator>(comm: &C) -> Result<(), ForestError> {
    gather_bytes(comm, tags::BARRIER, 0, Vec::new())?;
    broadcast_bytes(comm, tags::BARRIER.offset(2), 0, Vec::new())?;
    Ok(())
}

/// Logical AND of `flag` over all ranks.
pub fn all_reduce_and<C: Communicator>(
    comm: &C,
    tag: CommTag,
    flag: bool,
) -> Result<bool, ForestError> {
    Ok(all_gather_u64(comm, tag, u64::from(flag))?
        .into_iter()
        .all(|v| v != 0))
}

/// Make a per-rank outcome collective.
///
/// Rank 0 gathers every rank's verdict and broadcasts the first failure in rank
/// order, so either every rank returns `Ok` with its own value or every rank
/// returns the same error.
pub fn agree<C: Communicator, T>(
    comm: &C,
    local: Result<T, ForestError>,
) -> Result<T, ForestError> {
    if comm.size() == 1 {
        return local;
    }
    let verdict: Option<&ForestError> = local.as_ref().err();
    let encoded = serde_json::to_vec(&verdict).map_err(|e| ForestError::CommError {
        neighbor: comm.rank(),
        reason: format!("cannot encode verdict: {e}"),
    })?;

    let decided: Option<ForestError> = match gather_bytes(comm, tags::VERDICT, 0, encoded) {
        Ok(Some(all)) => all
            .iter()
            .enumerate()
            .find_map(|(peer, bytes)| {
                match serde_json::from_slice::<Option<ForestError>>(bytes) {
                    Ok(v) => v,
                    Err(e) => Some(ForestError::CommError {
                        neighbor: peer,
                        reason: format!("undecodable verdict: {e}"),
                    }),
                }
            }),
        Ok(None) => None,
        Err(e) => Some(e),
    };

    let root_view = if comm.rank() == 0 {
        serde_json::to_vec(&decided).map_err(|e| ForestError::CommError {
            neighbor: 0,
            reason: format!("cannot encode verdict: {e}"),
        })?
    } else {
        Vec::new()
    };
    let bytes = broadcast_bytes(comm, tags::VERDICT.offset(2), 0, root_view)?;
    let global: Option<ForestError> =
        serde_json::from_slice(&bytes).map_err(|e| ForestError::CommError {
            neighbor: 0,
            reason: format!("undecodable verdict: {e}"),
        })?;

    match (global, local) {
        (Some(err), _) => Err(err),
        (None, local) => local,
    }
}
