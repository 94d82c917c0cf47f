#![allow(dead_code)]
use quadforest::algs::communicator::{CommTag, Communicator, RayonComm};
use quadforest::forest::Quadrant;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Run `f` on every rank of a fresh in-process world, one thread per rank.
/// Results are returned in rank order.
pub fn run_ranks<T: Send>(size: usize, f: impl Fn(&RayonComm) -> T + Sync) -> Vec<T> {
    let world = RayonComm::world(size);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|c| s.spawn(move || f(c))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Wraps a rank of an in-process world and replaces every size header rank 0
/// sends to rank 1 on `tag` with three junk bytes.
pub struct Garbled {
    inner: RayonComm,
    tag: u16,
}

impl Communicator for Garbled {
    type SendHandle = <RayonComm as Communicator>::SendHandle;
    type RecvHandle = <RayonComm as Communicator>::RecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        if self.inner.rank() == 0 && peer == 1 && tag == self.tag {
            self.inner.isend(peer, tag, &[1, 2, 3])
        } else {
            self.inner.isend(peer, tag, buf)
        }
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        self.inner.irecv(peer, tag, buf)
    }

    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

/// Like [`run_ranks`], with the rank 0 to rank 1 headers on `tag` garbled.
pub fn run_garbled<T: Send>(size: usize, tag: CommTag, f: impl Fn(&Garbled) -> T + Sync) -> Vec<T> {
    let world: Vec<Garbled> = RayonComm::world(size)
        .into_iter()
        .map(|inner| Garbled {
            inner,
            tag: tag.as_u16(),
        })
        .collect();
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|c| s.spawn(move || f(c))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Concatenate per-rank quadrant lists in rank order.
pub fn concat<const D: usize>(per_rank: &[Vec<Quadrant<D>>]) -> Vec<Quadrant<D>> {
    per_rank.iter().flatten().copied().collect()
}

/// Deterministic coin flip per quadrant, independent of which rank holds it.
pub fn coin<const D: usize>(q: &Quadrant<D>, seed: u64) -> bool {
    let key = (u64::from(q.tree) << 40) ^ q.position() ^ (u64::from(q.level) << 56) ^ seed;
    SmallRng::seed_from_u64(key).gen_bool(0.4)
}

pub fn assert_sorted<const D: usize>(quads: &[Quadrant<D>]) {
    for w in quads.windows(2) {
        assert!(w[0] < w[1], "{:?} !< {:?}", w[0], w[1]);
        assert!(!w[0].is_ancestor(&w[1]), "{:?} overlaps {:?}", w[0], w[1]);
    }
}

pub fn assert_balanced(counts: &[usize]) {
    let (min, max) = (counts.iter().min().unwrap(), counts.iter().max().unwrap());
    assert!(max - min <= 1, "unbalanced counts {counts:?}");
}
