// collective.rs
use std::sync::{Arc, Barrier, Mutex, PoisonError};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Cross-shard communication used by vector storage and compression. Every shard must enter each
/// call in the same order, as with MPI collectives.
pub trait Collective {
    /// Index of this shard.
    fn rank(&self) -> usize;

    /// Number of shards.
    fn size(&self) -> usize;

    /// Replace `bytes` on every shard with the bytes held by `root`.
    fn broadcast_bytes(&self, root: usize, bytes: &mut Vec<u8>);

    /// Every shard receives every shard's buffer, indexed by rank.
    fn all_gather_bytes(&self, local: &[u8]) -> Vec<Vec<u8>>;

    /// `send[i]` is delivered to shard i. The result holds one buffer per origin shard.
    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>>;
}

/// Broadcast a serialisable value from `root` to all shards.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `root`: usize, rank holding the value.
///   `value`: On `root` the value to broadcast, on any other rank overwritten with it.
pub fn broadcast<T>(comm: &impl Collective, root: usize, value: &mut T) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    let mut bytes = if comm.rank() == root { bincode::serialize(value)? } else { Vec::new() };
    comm.broadcast_bytes(root, &mut bytes);
    if comm.rank() != root {
        *value = bincode::deserialize(&bytes)?;
    }
    Ok(())
}

/// Gather one value from every shard onto every shard, ordered by rank.
pub fn all_gather<T>(comm: &impl Collective, local: &T) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = bincode::serialize(local)?;
    comm.all_gather_bytes(&bytes)
        .iter()
        .map(|b| bincode::deserialize(b).map_err(Into::into))
        .collect()
}

/// Exchange per-destination messages. `send` must hold one entry per shard.
pub fn all_to_all<T>(comm: &impl Collective, send: &[T]) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let bytes = send.iter().map(bincode::serialize).collect::<std::result::Result<Vec<_>, _>>()?;
    comm.all_to_all_bytes(&bytes)
        .iter()
        .map(|b| bincode::deserialize(b).map_err(Into::into))
        .collect()
}

/// Global sum. Contributions are summed in rank order so all shards get the identical result.
pub fn sum_f64(comm: &impl Collective, local: f64) -> Result<f64> {
    Ok(all_gather(comm, &local)?.into_iter().sum())
}

pub fn sum_usize(comm: &impl Collective, local: usize) -> Result<usize> {
    Ok(all_gather(comm, &(local as u64))?.into_iter().sum::<u64>() as usize)
}

pub fn max_usize(comm: &impl Collective, local: usize) -> Result<usize> {
    Ok(all_gather(comm, &(local as u64))?.into_iter().max().unwrap_or(0) as usize)
}

/// Single shard. Every collective is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct Loopback;

impl Collective for Loopback {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_bytes(&self, _root: usize, _bytes: &mut Vec<u8>) {}

    fn all_gather_bytes(&self, local: &[u8]) -> Vec<Vec<u8>> {
        vec![local.to_vec()]
    }

    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        send.to_vec()
    }
}

// Mailboxes shared by the threads of an in-process group, indexed [origin][destination].
struct Shared {
    n_shards: usize,
    barrier: Barrier,
    mail: Mutex<Vec<Vec<Vec<u8>>>>,
}

/// Shards running as threads of one process. Used to exercise multi-shard behaviour without MPI.
#[derive(Clone)]
pub struct InProcess {
    rank: usize,
    shared: Arc<Shared>,
}

impl InProcess {
    /// Create one communicator per shard. Each must be moved to its own thread.
    pub fn group(n_shards: usize) -> Vec<InProcess> {
        let n_shards = n_shards.max(1);
        let shared = Arc::new(Shared {
            n_shards,
            barrier: Barrier::new(n_shards),
            mail: Mutex::new(vec![vec![Vec::new(); n_shards]; n_shards]),
        });
        (0..n_shards).map(|rank| InProcess { rank, shared: Arc::clone(&shared) }).collect()
    }

    fn with_mail<R>(&self, f: impl FnOnce(&mut Vec<Vec<Vec<u8>>>) -> R) -> R {
        let mut mail = self.shared.mail.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut mail)
    }
}

impl Collective for InProcess {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.n_shards
    }

    fn broadcast_bytes(&self, root: usize, bytes: &mut Vec<u8>) {
        if self.rank == root {
            self.with_mail(|mail| mail[root][0] = bytes.clone());
        }
        self.shared.barrier.wait();
        if self.rank != root {
            *bytes = self.with_mail(|mail| mail[root][0].clone());
        }
        self.shared.barrier.wait();
    }

    fn all_gather_bytes(&self, local: &[u8]) -> Vec<Vec<u8>> {
        self.with_mail(|mail| mail[self.rank][0] = local.to_vec());
        self.shared.barrier.wait();
        let out = self.with_mail(|mail| (0..self.shared.n_shards).map(|src| mail[src][0].clone()).collect());
        self.shared.barrier.wait();
        out
    }

    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        self.with_mail(|mail| {
            for (dst, buf) in send.iter().enumerate() {
                mail[self.rank][dst] = buf.clone();
            }
        });
        self.shared.barrier.wait();
        let out = self.with_mail(|mail| {
            (0..self.shared.n_shards).map(|src| std::mem::take(&mut mail[src][self.rank])).collect()
        });
        self.shared.barrier.wait();
        out
    }
}

/// Run `f` on every shard of an in-process group and collect the results by rank.
/// # Arguments:
///   `n_shards`: usize, number of shards (threads).
///   `f`: closure run once per shard with that shard's communicator.
pub fn run_group<R, F>(n_shards: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(InProcess) -> R + Sync,
{
    let comms = InProcess::group(n_shards);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms.into_iter().map(|c| s.spawn(move || f(c))).collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}
