//! Collective-communication boundary.
//!
//! The incremental PCA core only needs a handful of blocking collectives:
//! a barrier, a fixed-size broadcast, and variable-count scatter and gather
//! rooted at one rank. [`Communicator`] captures exactly that surface so the
//! core can run on top of any message-passing runtime. [`LocalCommunicator`]
//! implements it for workers that live in one process, one thread per rank.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::thread;
use thiserror::Error;

/// Rank that owns the running moments and performs the small factorizations.
pub const COORDINATOR_RANK: usize = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("rank {rank} lost its connection to rank {peer}")]
    Disconnected { rank: usize, peer: usize },
    #[error("rank {rank} expected a payload of {expected} values from rank {peer}, got {found}")]
    LengthMismatch {
        rank: usize,
        peer: usize,
        expected: usize,
        found: usize,
    },
    #[error("counts table has {found} entries for a group of {expected} ranks")]
    CountsMismatch { expected: usize, found: usize },
    #[error("root rank {root} is outside a group of {size} ranks")]
    InvalidRoot { root: usize, size: usize },
    #[error("root rank must supply a {0} buffer")]
    MissingRootBuffer(&'static str),
    #[error("worker thread for rank {0} panicked")]
    WorkerPanicked(usize),
}

/// Blocking collective operations over a fixed group of ranks.
///
/// Every rank must call the same sequence of collectives with compatible
/// shapes; a rank that skips a call stalls its peers.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Returns once every rank in the group has entered the barrier.
    fn barrier(&self) -> Result<(), CommError>;

    /// Copies `buffer` from `root` into the equally sized `buffer` of every
    /// other rank.
    fn broadcast(&self, root: usize, buffer: &mut [f64]) -> Result<(), CommError>;

    /// Splits the root's `send` buffer into consecutive pieces of
    /// `counts[r]` values and delivers piece `r` into rank `r`'s `recv`.
    /// Only the root's `send` is read.
    fn scatterv(
        &self,
        root: usize,
        send: Option<&[f64]>,
        counts: &[usize],
        recv: &mut [f64],
    ) -> Result<(), CommError>;

    /// Inverse of [`Communicator::scatterv`]: concatenates each rank's `send`
    /// (of `counts[rank]` values) into the root's `recv`, in rank order.
    fn gatherv(
        &self,
        root: usize,
        send: &[f64],
        counts: &[usize],
        recv: Option<&mut [f64]>,
    ) -> Result<(), CommError>;

    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR_RANK
    }
}

fn offsets(counts: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0;
    offsets.push(acc);
    for &count in counts {
        acc += count;
        offsets.push(acc);
    }
    offsets
}

/// In-process communicator backed by one FIFO channel per ordered rank pair.
///
/// Collectives are matched purely by call order, which the per-pair FIFOs
/// preserve, so no message tags are needed.
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    outboxes: Vec<Sender<Vec<f64>>>,
    inboxes: Vec<Receiver<Vec<f64>>>,
}

impl LocalCommunicator {
    /// Creates a fully connected group of `size` communicators, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        let mut outboxes: Vec<Vec<Sender<Vec<f64>>>> = (0..size).map(|_| Vec::new()).collect();
        let mut inboxes: Vec<Vec<Receiver<Vec<f64>>>> = (0..size).map(|_| Vec::new()).collect();
        for outbox in outboxes.iter_mut() {
            for inbox in inboxes.iter_mut() {
                let (tx, rx) = unbounded();
                outbox.push(tx);
                inbox.push(rx);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalCommunicator {
                rank,
                size,
                outboxes,
                inboxes,
            })
            .collect()
    }

    fn send(&self, peer: usize, payload: Vec<f64>) -> Result<(), CommError> {
        self.outboxes[peer]
            .send(payload)
            .map_err(|_| CommError::Disconnected {
                rank: self.rank,
                peer,
            })
    }

    fn recv(&self, peer: usize) -> Result<Vec<f64>, CommError> {
        self.inboxes[peer].recv().map_err(|_| CommError::Disconnected {
            rank: self.rank,
            peer,
        })
    }

    fn recv_into(&self, peer: usize, target: &mut [f64]) -> Result<(), CommError> {
        let payload = self.recv(peer)?;
        if payload.len() != target.len() {
            return Err(CommError::LengthMismatch {
                rank: self.rank,
                peer,
                expected: target.len(),
                found: payload.len(),
            });
        }
        target.copy_from_slice(&payload);
        Ok(())
    }

    fn check_root(&self, root: usize) -> Result<(), CommError> {
        if root >= self.size {
            return Err(CommError::InvalidRoot {
                root,
                size: self.size,
            });
        }
        Ok(())
    }

    fn check_counts(&self, counts: &[usize]) -> Result<(), CommError> {
        if counts.len() != self.size {
            return Err(CommError::CountsMismatch {
                expected: self.size,
                found: counts.len(),
            });
        }
        Ok(())
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        let root = COORDINATOR_RANK;
        if self.rank == root {
            for peer in (0..self.size).filter(|&peer| peer != root) {
                self.recv(peer)?;
            }
            for peer in (0..self.size).filter(|&peer| peer != root) {
                self.send(peer, Vec::new())?;
            }
        } else {
            self.send(root, Vec::new())?;
            self.recv(root)?;
        }
        Ok(())
    }

    fn broadcast(&self, root: usize, buffer: &mut [f64]) -> Result<(), CommError> {
        self.check_root(root)?;
        if self.rank == root {
            for peer in (0..self.size).filter(|&peer| peer != root) {
                self.send(peer, buffer.to_vec())?;
            }
            Ok(())
        } else {
            self.recv_into(root, buffer)
        }
    }

    fn scatterv(
        &self,
        root: usize,
        send: Option<&[f64]>,
        counts: &[usize],
        recv: &mut [f64],
    ) -> Result<(), CommError> {
        self.check_root(root)?;
        self.check_counts(counts)?;

        if self.rank != root {
            return self.recv_into(root, recv);
        }

        let send = send.ok_or(CommError::MissingRootBuffer("scatter send"))?;
        let offsets = offsets(counts);
        if send.len() != offsets[self.size] {
            return Err(CommError::LengthMismatch {
                rank: self.rank,
                peer: root,
                expected: offsets[self.size],
                found: send.len(),
            });
        }
        for peer in 0..self.size {
            let piece = &send[offsets[peer]..offsets[peer + 1]];
            if peer == root {
                if recv.len() != piece.len() {
                    return Err(CommError::LengthMismatch {
                        rank: self.rank,
                        peer,
                        expected: recv.len(),
                        found: piece.len(),
                    });
                }
                recv.copy_from_slice(piece);
            } else {
                self.send(peer, piece.to_vec())?;
            }
        }
        Ok(())
    }

    fn gatherv(
        &self,
        root: usize,
        send: &[f64],
        counts: &[usize],
        recv: Option<&mut [f64]>,
    ) -> Result<(), CommError> {
        self.check_root(root)?;
        self.check_counts(counts)?;

        if self.rank != root {
            return self.send(root, send.to_vec());
        }

        let recv = recv.ok_or(CommError::MissingRootBuffer("gather receive"))?;
        let offsets = offsets(counts);
        if recv.len() != offsets[self.size] {
            return Err(CommError::LengthMismatch {
                rank: self.rank,
                peer: root,
                expected: offsets[self.size],
                found: recv.len(),
            });
        }
        for peer in 0..self.size {
            let slot = &mut recv[offsets[peer]..offsets[peer + 1]];
            if peer == root {
                if slot.len() != send.len() {
                    return Err(CommError::LengthMismatch {
                        rank: self.rank,
                        peer,
                        expected: slot.len(),
                        found: send.len(),
                    });
                }
                slot.copy_from_slice(send);
            } else {
                self.recv_into(peer, slot)?;
            }
        }
        Ok(())
    }
}

/// Runs `worker` once per rank of a fresh [`LocalCommunicator`] group, each on
/// its own thread, and returns the results in rank order.
///
/// Blocking collectives need every rank to be scheduled at the same time, so
/// this uses dedicated OS threads rather than a work-stealing pool.
pub fn run_local_group<T, F>(size: usize, worker: F) -> Result<Vec<T>, CommError>
where
    T: Send,
    F: Fn(LocalCommunicator) -> T + Sync,
{
    let communicators = LocalCommunicator::group(size);
    thread::scope(|scope| {
        let handles: Vec<_> = communicators
            .into_iter()
            .map(|comm| {
                let worker = &worker;
                scope.spawn(move || worker(comm))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| handle.join().map_err(|_| CommError::WorkerPanicked(rank)))
            .collect()
    })
}
