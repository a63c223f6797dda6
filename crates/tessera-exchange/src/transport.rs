//! In-process transport simulating a set of MPI ranks.
//!
//! Each rank gets an [`Endpoint`] with a bounded inbox of encoded frames.
//! Delivery is best effort: a full inbox, an isolated rank or a random
//! drop loses the frame, and the request protocol's retries recover.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tessera_core::Rank;
use tracing::trace;

/// What happened to a frame handed to [`Endpoint::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Placed in the destination inbox.
    Delivered,
    /// Lost by fault injection or a full inbox.
    Dropped,
    /// The destination endpoint no longer exists.
    Closed,
}

/// Fault injection shared by every endpoint of a cluster.
#[derive(Debug)]
struct Faults {
    isolated: RwLock<HashSet<Rank>>,
    drop_probability: f64,
    rng: Mutex<ChaCha8Rng>,
}

impl Faults {
    fn drops(&self, from: Rank, to: Rank) -> bool {
        {
            let isolated = self.isolated.read();
            if isolated.contains(&from) || isolated.contains(&to) {
                return true;
            }
        }
        if self.drop_probability <= 0.0 {
            return false;
        }
        let draw = self.rng.lock().next_u64() as f64 / u64::MAX as f64;
        draw < self.drop_probability
    }
}

/// A set of simulated ranks connected by in-memory channels.
#[derive(Debug)]
pub struct LocalCluster {
    endpoints: Vec<Option<Endpoint>>,
    faults: Arc<Faults>,
}

impl LocalCluster {
    /// Create `world_size` ranks with inboxes of `inbox_capacity` frames.
    pub fn new(world_size: usize, inbox_capacity: usize) -> Self {
        Self::with_drop_probability(world_size, inbox_capacity, 0.0, 0)
    }

    /// Like [`new`](Self::new), but every frame between distinct ranks is
    /// lost with probability `p`, drawn from a ChaCha8 stream seeded with
    /// `seed`.
    pub fn with_drop_probability(
        world_size: usize,
        inbox_capacity: usize,
        p: f64,
        seed: u64,
    ) -> Self {
        let faults = Arc::new(Faults {
            isolated: RwLock::new(HashSet::new()),
            drop_probability: p.clamp(0.0, 1.0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        });
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size)
            .map(|_| crossbeam_channel::bounded::<Vec<u8>>(inbox_capacity.max(1)))
            .unzip();
        let peers: Arc<[Sender<Vec<u8>>]> = senders.into();
        let endpoints = receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| {
                Some(Endpoint {
                    rank: Rank(i as u32),
                    inbox,
                    peers: Arc::clone(&peers),
                    faults: Arc::clone(&faults),
                })
            })
            .collect();
        Self { endpoints, faults }
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.endpoints.len()
    }

    /// Take the endpoint for `rank`. Each endpoint can be taken once.
    pub fn take_endpoint(&mut self, rank: Rank) -> Option<Endpoint> {
        self.endpoints.get_mut(rank.index())?.take()
    }

    /// Drop every frame to or from `rank` until [`heal`](Self::heal) is
    /// called.
    pub fn isolate(&self, rank: Rank) {
        self.faults.isolated.write().insert(rank);
    }

    /// Undo [`isolate`](Self::isolate).
    pub fn heal(&self, rank: Rank) {
        self.faults.isolated.write().remove(&rank);
    }

    /// Handle for injecting faults after the endpoints have been handed out.
    pub fn fault_handle(&self) -> FaultHandle {
        FaultHandle {
            faults: Arc::clone(&self.faults),
        }
    }
}

/// Clonable handle to a cluster's fault injection.
#[derive(Clone, Debug)]
pub struct FaultHandle {
    faults: Arc<Faults>,
}

impl FaultHandle {
    /// See [`LocalCluster::isolate`].
    pub fn isolate(&self, rank: Rank) {
        self.faults.isolated.write().insert(rank);
    }

    /// See [`LocalCluster::heal`].
    pub fn heal(&self, rank: Rank) {
        self.faults.isolated.write().remove(&rank);
    }
}

/// One rank's connection to the cluster.
#[derive(Debug)]
pub struct Endpoint {
    rank: Rank,
    inbox: Receiver<Vec<u8>>,
    peers: Arc<[Sender<Vec<u8>>]>,
    faults: Arc<Faults>,
}

impl Endpoint {
    /// This endpoint's rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the cluster.
    pub fn world_size(&self) -> usize {
        self.peers.len()
    }

    /// Incoming frames.
    pub fn inbox(&self) -> &Receiver<Vec<u8>> {
        &self.inbox
    }

    /// Sender into this endpoint's own inbox. Never subject to faults.
    pub fn loopback(&self) -> Sender<Vec<u8>> {
        self.peers[self.rank.index()].clone()
    }

    /// Send a frame without blocking. Returns `None` if `to` is not a
    /// rank of this cluster.
    pub fn send(&self, to: Rank, frame: Vec<u8>) -> Option<Delivery> {
        let peer = self.peers.get(to.index())?;
        if to != self.rank && self.faults.drops(self.rank, to) {
            trace!(
                from = %self.rank,
                to = %to,
                bytes = frame.len(),
                "frame dropped by fault injection"
            );
            return Some(Delivery::Dropped);
        }
        match peer.try_send(frame) {
            Ok(()) => Some(Delivery::Delivered),
            Err(TrySendError::Full(_)) => Some(Delivery::Dropped),
            Err(TrySendError::Disconnected(_)) => Some(Delivery::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reach_destination() {
        let mut cluster = LocalCluster::new(2, 4);
        let a = cluster.take_endpoint(Rank(0)).unwrap();
        let b = cluster.take_endpoint(Rank(1)).unwrap();
        assert_eq!(a.send(Rank(1), vec![1, 2]), Some(Delivery::Delivered));
        assert_eq!(b.inbox().try_recv().unwrap(), vec![1, 2]);
    }

    #[test]
    fn endpoint_taken_once() {
        let mut cluster = LocalCluster::new(1, 4);
        assert!(cluster.take_endpoint(Rank(0)).is_some());
        assert!(cluster.take_endpoint(Rank(0)).is_none());
        assert!(cluster.take_endpoint(Rank(5)).is_none());
    }

    #[test]
    fn unknown_rank_is_none() {
        let mut cluster = LocalCluster::new(1, 4);
        let a = cluster.take_endpoint(Rank(0)).unwrap();
        assert_eq!(a.send(Rank(3), vec![]), None);
    }

    #[test]
    fn isolated_rank_loses_frames_until_healed() {
        let mut cluster = LocalCluster::new(2, 4);
        let a = cluster.take_endpoint(Rank(0)).unwrap();
        let b = cluster.take_endpoint(Rank(1)).unwrap();
        cluster.isolate(Rank(1));
        assert_eq!(a.send(Rank(1), vec![1]), Some(Delivery::Dropped));
        assert!(b.inbox().try_recv().is_err());
        cluster.heal(Rank(1));
        assert_eq!(a.send(Rank(1), vec![1]), Some(Delivery::Delivered));
    }

    #[test]
    fn full_inbox_drops() {
        let mut cluster = LocalCluster::new(2, 1);
        let a = cluster.take_endpoint(Rank(0)).unwrap();
        let _b = cluster.take_endpoint(Rank(1)).unwrap();
        assert_eq!(a.send(Rank(1), vec![1]), Some(Delivery::Delivered));
        assert_eq!(a.send(Rank(1), vec![2]), Some(Delivery::Dropped));
    }

    #[test]
    fn seeded_drops_are_reproducible() {
        let run = || {
            let mut cluster = LocalCluster::with_drop_probability(2, 64, 0.5, 42);
            let a = cluster.take_endpoint(Rank(0)).unwrap();
            let _b = cluster.take_endpoint(Rank(1)).unwrap();
            (0..32)
                .map(|i| a.send(Rank(1), vec![i]) == Some(Delivery::Delivered))
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|d| *d));
        assert!(first.iter().any(|d| !*d));
    }
}
