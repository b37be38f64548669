// adder.rs
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collective::{all_to_all, Collective};
use crate::error::{FriError, Result};
use crate::Amplitude;

/// One buffered contribution to a remote vector element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Amplitude")]
pub struct Element<T> {
    pub key: Vec<u8>,
    // One value per column the element contributes to. Usually one.
    pub vals: Vec<T>,
    // Whether the origin element is an initiator and may create new entries.
    pub ini: bool,
}

/// Outcome of merging one element on its owning shard, returned to the shard that sent it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddResult {
    // Whether the contribution was accepted under the initiator rule.
    pub accepted: bool,
    // Weight that was not added, zero if accepted.
    pub residual: f64,
}

/// Per-destination buffers for contributions to a sharded vector. Elements are exchanged by
/// `exchange`, merged by the owning vector, and their outcomes returned by `return_results`.
pub struct Adder<T> {
    capacity: usize,
    send: Vec<Vec<Element<T>>>,
    // Results for elements this shard sent, indexed [destination][buffer position].
    results: Vec<Vec<AddResult>>,
    // Number of elements sent to each destination in the last exchange.
    sent: Vec<usize>,
    // Receive storage, in elements. Doubles when an exchange delivers more.
    recv_capacity: usize,
}

impl<T: Amplitude> Adder<T> {
    /// Create empty buffers.
    /// # Arguments:
    ///   `capacity`: usize, maximum number of elements buffered per destination between flushes.
    ///   `n_shards`: usize, number of destination shards.
    pub fn new(capacity: usize, n_shards: usize) -> Self {
        Self {
            capacity,
            send: (0..n_shards).map(|_| Vec::with_capacity(capacity.min(1 << 16))).collect(),
            results: vec![Vec::new(); n_shards],
            sent: vec![0; n_shards],
            recv_capacity: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn recv_capacity(&self) -> usize {
        self.recv_capacity
    }

    pub fn n_shards(&self) -> usize {
        self.send.len()
    }

    /// Number of elements waiting to be sent, over all destinations.
    pub fn pending(&self) -> usize {
        self.send.iter().map(Vec::len).sum()
    }

    /// Buffer an element for `shard`. Returns its position in that shard's buffer, which is used to
    /// find its result after `perform_add`.
    /// # Arguments:
    ///   `shard`: usize, owning shard of the key.
    ///   `key`: [u8], bit key.
    ///   `vals`: [T], contribution for each column.
    ///   `ini`: bool, initiator flag of the origin.
    pub fn add(&mut self, shard: usize, key: &[u8], vals: &[T], ini: bool) -> Result<usize> {
        let buf = &mut self.send[shard];
        if buf.len() >= self.capacity {
            return Err(FriError::AdderOverflow { shard, capacity: self.capacity });
        }
        buf.push(Element { key: key.to_vec(), vals: vals.to_vec(), ini });
        Ok(buf.len() - 1)
    }

    /// Send every buffered element to its owner and return the batches received here, ordered by
    /// origin shard. Send buffers are emptied.
    pub fn exchange(&mut self, comm: &impl Collective) -> Result<Vec<Vec<Element<T>>>> {
        for (dst, buf) in self.send.iter().enumerate() {
            self.sent[dst] = buf.len();
        }
        let recv = all_to_all(comm, &self.send)?;
        for buf in self.send.iter_mut() {
            buf.clear();
        }
        let received: usize = recv.iter().map(Vec::len).sum();
        if received > self.recv_capacity {
            let old = self.recv_capacity;
            while self.recv_capacity < received {
                self.recv_capacity = (2 * self.recv_capacity).max(1);
            }
            info!(rank = comm.rank(), old, new = self.recv_capacity, "growing adder receive storage");
        }
        debug!(rank = comm.rank(), sent = self.sent.iter().sum::<usize>(), received, "adder exchange");
        Ok(recv)
    }

    /// Send merge outcomes back to the shards the elements came from.
    /// # Arguments:
    ///   `comm`: Collective, communicator.
    ///   `results`: per-origin outcomes, in the order the batches were received.
    pub fn return_results(&mut self, comm: &impl Collective, results: Vec<Vec<AddResult>>) -> Result<()> {
        let back = all_to_all(comm, &results)?;
        for (dst, res) in back.iter().enumerate() {
            if res.len() != self.sent[dst] {
                return Err(FriError::DimensionMismatch { context: "adder results", left: res.len(), right: self.sent[dst] });
            }
        }
        self.results = back;
        Ok(())
    }

    /// Outcome of the element buffered at `pos` for `shard` in the last completed add cycle.
    pub fn add_result(&self, shard: usize, pos: usize) -> Option<AddResult> {
        self.results.get(shard).and_then(|r| r.get(pos)).copied()
    }
}
