//! Thin façade over intra-process (in-memory) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable**: the collective layer calls `.wait()` before
//! it trusts that a buffer is ready.
//!
//! Every collective built on top of a communicator is a synchronization point:
//! all ranks must enter the same collectives in the same order or the run
//! deadlocks. That ordering is an obligation of the caller.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Non-blocking point-to-point interface the collectives are built on.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of at most `buf.len()` bytes from `peer`.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;
    /// Rank of this process.
    fn rank(&self) -> usize;
    /// Number of ranks.
    fn size(&self) -> usize;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Typed message tag. Each collective owns a tag so that its traffic cannot be
/// mistaken for another collective's.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag for a sub-phase of a collective (size header, payload, ...).
    pub const fn offset(self, by: u16) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

/// Single-rank communicator for serial runs and unit tests.
///
/// With one rank every collective completes locally, so neither `isend` nor
/// `irecv` is ever reached.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: several ranks inside one process ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared message store of one in-process world.
#[derive(Default)]
struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    arrived: Condvar,
}

impl Mailbox {
    fn push(&self, key: Key, data: Bytes) {
        self.queues.entry(key).or_default().push_back(data);
        let _guard = self.lock.lock();
        self.arrived.notify_all();
    }

    fn try_pop(&self, key: &Key) -> Option<Bytes> {
        self.queues.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn pop_blocking(&self, key: &Key) -> Bytes {
        loop {
            if let Some(data) = self.try_pop(key) {
                return data;
            }
            let mut guard = self.lock.lock();
            // Re-check under the lock so a push between the probe and the wait is not lost.
            if let Some(data) = self.try_pop(key) {
                return data;
            }
            self.arrived.wait_for(&mut guard, Duration::from_millis(5));
        }
    }
}

/// Receive handle of [`RayonComm`]; the message is taken from the mailbox on `wait`.
pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    len: usize,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let bytes = self.mailbox.pop_blocking(&self.key);
        let n = bytes.len().min(self.len);
        Some(bytes[..n].to_vec())
    }
}

/// In-process communicator: every rank is a thread, messages travel through a
/// mailbox shared by the ranks of one world. Messages between a pair of ranks
/// with the same tag are delivered in FIFO order.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl RayonComm {
    /// Create the communicators of a fresh world of `size` ranks, ordered by rank.
    pub fn world(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .push((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
            len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::StaticScope;
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    /// Communicator over an MPI world supplied by the bootstrap layer.
    ///
    /// The caller keeps the `mpi::environment::Universe` alive for as long as
    /// this communicator is used.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    /// Completes a non-blocking send and releases its buffer.
    pub struct MpiSendHandle(Option<Box<dyn FnOnce()>>);

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(finish) = self.0.take() {
                finish();
            }
            None
        }
    }

    /// Receive handle holding a message that has already arrived.
    ///
    /// Sends are always posted non-blocking before receives in the collective
    /// layer, so receiving eagerly inside `irecv` cannot deadlock.
    pub struct MpiRecvHandle(Vec<u8>);

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            Some(self.0)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            // The buffer must outlive the request; it is reclaimed once the request completes.
            let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: `raw` is a live heap allocation, freed only after the request completes.
            let data: &'static [u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSendHandle(Some(Box::new(move || {
                req.wait();
                // SAFETY: `raw` came from `Box::into_raw` above and no request uses it any more.
                drop(unsafe { Box::from_raw(raw) });
            })))
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            let (mut data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            data.truncate(buf.len());
            MpiRecvHandle(data)
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rayon_roundtrip_two_ranks() {
        let world = RayonComm::world(2);
        let (comm0, comm1) = (&world[0], &world[1]);

        let mut recv_buf = [0u8; 4];
        let recv_handle = comm1.irecv(0, 7, &mut recv_buf);

        let send_handle = comm0.isend(1, 7, &[1, 2, 3, 4]);
        send_handle.wait();

        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
    }

    #[test]
    fn rayon_fifo_per_tag() {
        let world = RayonComm::world(2);
        for i in 0..10u8 {
            world[0].isend(1, 3, &[i]);
        }
        let got: Vec<u8> = (0..10)
            .map(|_| {
                let mut b = [0u8; 1];
                world[1].irecv(0, 3, &mut b).wait().unwrap()[0]
            })
            .collect();
        assert_eq!(got, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn rayon_worlds_are_isolated() {
        let a = RayonComm::world(2);
        let b = RayonComm::world(2);
        a[0].isend(1, 1, &[1]);
        b[0].isend(1, 1, &[2]);
        let mut buf = [0u8; 1];
        assert_eq!(b[1].irecv(0, 1, &mut buf).wait().unwrap(), vec![2]);
        assert_eq!(a[1].irecv(0, 1, &mut buf).wait().unwrap(), vec![1]);
    }

    #[test]
    fn receive_blocks_until_peer_sends() {
        let world = RayonComm::world(2);
        let sender = world[0].clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.isend(1, 9, b"late");
        });
        let mut buf = [0u8; 4];
        let got = world[1].irecv(0, 9, &mut buf).wait().unwrap();
        t.join().unwrap();
        assert_eq!(&got, b"late");
    }

    #[test]
    fn no_comm_is_single_rank() {
        let comm = NoComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
    }
}
