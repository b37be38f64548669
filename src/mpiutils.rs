// mpiutils.rs
use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;

use crate::collective::Collective;

// Largest single broadcast message, to avoid overflowing MPI's int counts.
const CHUNK: usize = 256 * 1024 * 1024;

/// MPI transport for the `Collective` interface. One shard per rank.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    /// Wrap an MPI communicator, usually MPI_COMM_WORLD.
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }
}

/// Turn per-rank counts into displacements of a contiguous buffer.
fn displacements(counts: &[i32]) -> Vec<i32> {
    let mut displs = vec![0i32; counts.len()];
    for i in 1..counts.len() {
        displs[i] = displs[i - 1] + counts[i - 1];
    }
    displs
}

/// Split a contiguous receive buffer back into per-rank messages.
fn split(contig: &[u8], counts: &[i32]) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(counts.len());
    let mut off = 0usize;
    for &c in counts {
        let end = off + c as usize;
        out.push(contig[off..end].to_vec());
        off = end;
    }
    out
}

impl Collective for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    /// Broadcast the length first, then the payload in chunks.
    fn broadcast_bytes(&self, root: usize, bytes: &mut Vec<u8>) {
        let root_proc = self.world.process_at_rank(root as i32);

        let mut len: u64 = bytes.len() as u64;
        root_proc.broadcast_into(&mut len);

        // Non-root ranks allocate the receive buffer to the correct size.
        if self.rank() != root {
            bytes.resize(len as usize, 0u8);
        }

        let mut off = 0usize;
        while off < bytes.len() {
            let end = (off + CHUNK).min(bytes.len());
            root_proc.broadcast_into(&mut bytes[off..end]);
            off = end;
        }
    }

    fn all_gather_bytes(&self, local: &[u8]) -> Vec<Vec<u8>> {
        let nranks = self.size();

        // Number of bytes each rank contributes.
        let send_count = local.len() as i32;
        let mut recv_counts = vec![0i32; nranks];
        self.world.all_gather_into(&send_count, &mut recv_counts[..]);

        let recv_displacements = displacements(&recv_counts);
        let total_recv: usize = recv_counts.iter().map(|&c| c as usize).sum();
        let mut recv_contig = vec![0u8; total_recv];

        {
            let mut recv_part = PartitionMut::new(&mut recv_contig[..], &recv_counts[..], &recv_displacements[..]);
            self.world.all_gather_varcount_into(local, &mut recv_part);
        }
        split(&recv_contig, &recv_counts)
    }

    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let nranks = self.size();

        // Contiguous send buffer with counts and displacements per destination.
        let mut send_counts = vec![0i32; nranks];
        let mut send_displacements = vec![0i32; nranks];
        let mut send_contig: Vec<u8> = Vec::new();
        for i in 0..nranks {
            send_displacements[i] = send_contig.len() as i32;
            send_contig.extend_from_slice(&send[i]);
            send_counts[i] = send[i].len() as i32;
        }

        // Once exchanged recv_counts[i] is the number of bytes rank i sends here.
        let mut recv_counts = vec![0i32; nranks];
        self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let recv_displacements = displacements(&recv_counts);
        let total_recv: usize = recv_counts.iter().map(|&x| x as usize).sum();
        let mut recv_contig = vec![0u8; total_recv];

        {
            let send_part = Partition::new(&send_contig[..], &send_counts[..], &send_displacements[..]);
            let mut recv_part = PartitionMut::new(&mut recv_contig[..], &recv_counts[..], &recv_displacements[..]);
            self.world.all_to_all_varcount_into(&send_part, &mut recv_part);
        }
        split(&recv_contig, &recv_counts)
    }
}
