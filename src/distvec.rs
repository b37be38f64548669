// distvec.rs
use std::fs;
use std::path::Path;

use ndarray::Array2;
use tracing::{debug, info};

use crate::adder::{AddResult, Adder, Element};
use crate::bits::{decode_checked, Orb};
use crate::collective::{all_gather, broadcast, max_usize, sum_f64, sum_usize, Collective};
use crate::error::{FriError, Result};
use crate::hash::{HashIndex, Scrambler, ShardRouter, PENDING};
use crate::io::{read_dense_sizes, write_dense_sizes};
use crate::Amplitude;

// Values below this magnitude are dropped when loading a checkpoint.
const LOAD_TOL: f64 = 1e-9;

/// Diagonal matrix element of a basis state, given its occupied orbitals.
pub type DiagFn = Box<dyn Fn(&[Orb]) -> f64 + Send + Sync>;

/// Sizes fixed when a `DistVec` is constructed.
#[derive(Clone, Debug)]
pub struct DistVecConfig {
    // Initial number of slots on this shard. Also the number of hash buckets.
    pub capacity: usize,
    // Elements buffered per destination shard between flushes.
    pub adder_capacity: usize,
    // Number of single-particle basis functions (bits per key).
    pub n_bits: usize,
    // Number of particles (set bits per key).
    pub n_elec: usize,
    // Number of value columns sharing the key set.
    pub n_vecs: usize,
}

/// One shard of a sparse vector distributed over shards by key. Elements live in slots of parallel
/// arrays; a hash index maps keys to slots and freed slots are reused before the arrays grow.
pub struct DistVec<T: Amplitude> {
    // One column per vector, each `capacity` long.
    values: Vec<Vec<T>>,
    curr_vec: usize,
    // Keys, `n_bytes` per slot.
    keys: Vec<u8>,
    n_bytes: usize,
    // Occupied orbitals, `n_elec` per slot.
    occ: Vec<Orb>,
    // Cached diagonal elements, NaN until computed.
    diag: Vec<f64>,
    active: Vec<bool>,
    capacity: usize,
    // One past the highest slot ever used.
    curr_size: usize,
    // Number of active slots.
    n_nonz: usize,
    n_dense: usize,
    min_del_idx: usize,
    free: Vec<usize>,
    index: HashIndex,
    router: ShardRouter,
    adder: Adder<T>,
    dot_adder: Adder<f64>,
    n_bits: usize,
    n_elec: usize,
    // Non-initiator contributions accepted into occupied slots.
    nonini_occ_add: usize,
    diag_fn: Option<DiagFn>,
    rank: usize,
}

impl<T: Amplitude> DistVec<T> {
    /// Construct an empty vector shard.
    /// # Arguments:
    ///   `config`: DistVecConfig, storage sizes.
    ///   `comm`: Collective, communicator the vector is distributed over.
    ///   `router_salt`: Scrambler, salt assigning keys to shards. Must be identical on all shards.
    ///   `index_salt`: Scrambler, salt for the local hash index.
    pub fn new(config: DistVecConfig, comm: &impl Collective, router_salt: Scrambler, index_salt: Scrambler) -> Self {
        let capacity = config.capacity.max(1);
        let n_bytes = crate::bits::n_bytes(config.n_bits);
        let n_vecs = config.n_vecs.max(1);
        let n_shards = comm.size();
        Self {
            values: vec![vec![T::zero(); capacity]; n_vecs],
            curr_vec: 0,
            keys: vec![0; capacity * n_bytes],
            n_bytes,
            occ: vec![0; capacity * config.n_elec],
            diag: vec![f64::NAN; capacity],
            active: vec![false; capacity],
            capacity,
            curr_size: 0,
            n_nonz: 0,
            n_dense: 0,
            min_del_idx: 0,
            free: Vec::new(),
            index: HashIndex::new(capacity, index_salt),
            router: ShardRouter::new(router_salt, n_shards),
            adder: Adder::new(config.adder_capacity, n_shards),
            dot_adder: Adder::new(config.adder_capacity, n_shards),
            n_bits: config.n_bits,
            n_elec: config.n_elec,
            nonini_occ_add: 0,
            diag_fn: None,
            rank: comm.rank(),
        }
    }

    /// Install the callback computing diagonal matrix elements.
    pub fn with_diag(mut self, diag_fn: DiagFn) -> Self {
        self.diag_fn = Some(diag_fn);
        self
    }

    pub fn n_bits(&self) -> usize {
        self.n_bits
    }

    pub fn n_elec(&self) -> usize {
        self.n_elec
    }

    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn curr_size(&self) -> usize {
        self.curr_size
    }

    pub fn n_nonz(&self) -> usize {
        self.n_nonz
    }

    pub fn n_dense(&self) -> usize {
        self.n_dense
    }

    pub fn num_vecs(&self) -> usize {
        self.values.len()
    }

    pub fn curr_vec_idx(&self) -> usize {
        self.curr_vec
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn index_salt(&self) -> &Scrambler {
        self.index.scrambler()
    }

    fn check_col(&self, idx: usize) -> Result<()> {
        if idx >= self.values.len() {
            return Err(FriError::ColumnOutOfBounds { idx, n_vecs: self.values.len() });
        }
        Ok(())
    }

    /// Select the column that `add`, `values` and the norms operate on.
    pub fn set_curr_vec_idx(&mut self, idx: usize) -> Result<()> {
        self.check_col(idx)?;
        self.curr_vec = idx;
        Ok(())
    }

    pub fn min_del_idx(&self) -> usize {
        self.min_del_idx
    }

    /// Slots below `idx` are never deleted.
    pub fn set_min_del_idx(&mut self, idx: usize) {
        self.min_del_idx = idx;
    }

    /// Protect every slot currently in use from deletion.
    pub fn fix_min_del_idx(&mut self) {
        self.min_del_idx = self.curr_size;
    }

    /// Accepted non-initiator contributions on this shard.
    pub fn nonini_occ_add(&self) -> usize {
        self.nonini_occ_add
    }

    /// Accepted non-initiator contributions summed over all shards.
    pub fn tot_sgn_coh(&self, comm: &impl Collective) -> Result<usize> {
        sum_usize(comm, self.nonini_occ_add)
    }

    /// Decode a key and compute its local hash. Fails if the particle count is wrong.
    /// # Arguments:
    ///   `key`: [u8], bit key.
    ///   `orbs`: Vec<Orb>, buffer receiving the occupied orbitals.
    pub fn idx_to_hash(&self, key: &[u8], orbs: &mut Vec<Orb>) -> Result<u64> {
        decode_checked(key, self.n_bits, self.n_elec, orbs)?;
        Ok(self.index.hash(orbs))
    }

    /// Shard owning a key. Fails if the particle count is wrong.
    pub fn idx_to_proc(&self, key: &[u8]) -> Result<usize> {
        let mut orbs = Vec::with_capacity(self.n_elec);
        decode_checked(key, self.n_bits, self.n_elec, &mut orbs)?;
        Ok(self.router.shard_of(&orbs))
    }

    /// Slot holding `key` on this shard, if any.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<usize>> {
        let mut orbs = Vec::with_capacity(self.n_elec);
        let hash = self.idx_to_hash(key, &mut orbs)?;
        Ok(self.index.lookup(key, hash))
    }

    pub fn key_at(&self, pos: usize) -> &[u8] {
        &self.keys[pos * self.n_bytes..(pos + 1) * self.n_bytes]
    }

    pub fn orbs_at(&self, pos: usize) -> &[Orb] {
        &self.occ[pos * self.n_elec..(pos + 1) * self.n_elec]
    }

    pub fn is_active(&self, pos: usize) -> bool {
        pos < self.curr_size && self.active[pos]
    }

    /// Positions of all active slots in ascending order.
    pub fn active_positions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.curr_size).filter(move |&p| self.active[p])
    }

    /// Current column, up to `curr_size`. Free slots read as zero.
    pub fn values(&self) -> &[T] {
        &self.values[self.curr_vec][..self.curr_size]
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values[self.curr_vec][..self.curr_size]
    }

    /// Column `idx`, up to `curr_size`.
    pub fn column(&self, idx: usize) -> Result<&[T]> {
        self.check_col(idx)?;
        Ok(&self.values[idx][..self.curr_size])
    }

    pub fn value(&self, pos: usize) -> T {
        self.values[self.curr_vec][pos]
    }

    pub fn set_value(&mut self, pos: usize, val: T) {
        self.values[self.curr_vec][pos] = val;
    }

    /// Diagonal matrix element at a slot, computed on first access. `None` without a callback.
    pub fn matr_el_at_pos(&mut self, pos: usize) -> Option<f64> {
        let f = self.diag_fn.as_ref()?;
        if self.diag[pos].is_nan() {
            self.diag[pos] = f(&self.occ[pos * self.n_elec..(pos + 1) * self.n_elec]);
        }
        Some(self.diag[pos])
    }

    /// Buffer a contribution to `key` in the current column. Zero contributions are skipped.
    /// Returns the buffer position of the element, used with `add_result`.
    /// # Arguments:
    ///   `key`: [u8], bit key.
    ///   `val`: T, contribution.
    ///   `ini`: bool, whether the contribution may create a new element.
    pub fn add(&mut self, key: &[u8], val: T, ini: bool) -> Result<Option<usize>> {
        if val == T::zero() {
            return Ok(None);
        }
        let shard = self.idx_to_proc(key)?;
        self.adder.add(shard, key, &[val], ini).map(Some)
    }

    /// As `add`, also returning the owning shard so the result can be found with `add_result`.
    pub fn add_routed(&mut self, key: &[u8], val: T, ini: bool) -> Result<Option<(usize, usize)>> {
        if val == T::zero() {
            return Ok(None);
        }
        let shard = self.idx_to_proc(key)?;
        Ok(Some((shard, self.adder.add(shard, key, &[val], ini)?)))
    }

    /// Elements buffered and not yet sent.
    pub fn pending_adds(&self) -> usize {
        self.adder.pending()
    }

    /// Exchange buffered contributions and merge the ones this shard owns. `origin` is the column
    /// consulted by the initiator rule.
    pub fn perform_add(&mut self, comm: &impl Collective, origin: usize) -> Result<()> {
        self.check_col(origin)?;
        let batches = self.adder.exchange(comm)?;
        let mut results = Vec::with_capacity(batches.len());
        for batch in &batches {
            results.push(self.add_elements(batch, origin)?);
        }
        self.adder.return_results(comm, results)
    }

    /// Outcome of an element buffered for `shard` at `pos` in the last `perform_add`.
    pub fn add_result(&self, shard: usize, pos: usize) -> Option<AddResult> {
        self.adder.add_result(shard, pos)
    }

    /// Merge a batch of elements owned by this shard into the current column.
    ///
    /// An element is accepted if it is an initiator or if its slot already holds a nonzero value
    /// in column `origin`. Only initiators create slots. A slot whose columns all become zero is
    /// deleted if it is not protected.
    pub fn add_elements(&mut self, batch: &[Element<T>], origin: usize) -> Result<Vec<AddResult>> {
        self.check_col(origin)?;
        let mut orbs = Vec::with_capacity(self.n_elec);
        let mut out = Vec::with_capacity(batch.len());
        for el in batch {
            let val = el.vals.first().copied().unwrap_or_else(T::zero);
            if val == T::zero() {
                out.push(AddResult { accepted: true, residual: 0.0 });
                continue;
            }
            let hash = self.idx_to_hash(&el.key, &mut orbs)?;
            let Some(entry) = self.index.locate(&el.key, hash, el.ini) else {
                out.push(AddResult { accepted: false, residual: val.as_weight() });
                continue;
            };
            let slot = self.index.slot(entry);
            let pos = if slot == PENDING {
                let pos = self.claim_slot();
                self.index.assign(entry, pos as isize);
                self.init_slot(pos, &el.key, &orbs);
                pos
            } else {
                slot as usize
            };

            if el.ini || self.values[origin][pos] != T::zero() {
                if !el.ini {
                    self.nonini_occ_add += 1;
                }
                self.values[self.curr_vec][pos] += val;
                if self.values[self.curr_vec][pos] == T::zero() {
                    self.del_at_pos(pos);
                }
                out.push(AddResult { accepted: true, residual: 0.0 });
            } else {
                out.push(AddResult { accepted: false, residual: val.as_weight() });
            }
        }
        Ok(out)
    }

    // Next free slot, growing the arrays if none is left.
    fn claim_slot(&mut self) -> usize {
        if let Some(pos) = self.free.pop() {
            return pos;
        }
        if self.curr_size >= self.capacity {
            self.expand();
        }
        self.curr_size += 1;
        self.curr_size - 1
    }

    fn init_slot(&mut self, pos: usize, key: &[u8], orbs: &[Orb]) {
        self.keys[pos * self.n_bytes..(pos + 1) * self.n_bytes].copy_from_slice(key);
        self.occ[pos * self.n_elec..(pos + 1) * self.n_elec].copy_from_slice(orbs);
        self.diag[pos] = f64::NAN;
        for col in self.values.iter_mut() {
            col[pos] = T::zero();
        }
        self.active[pos] = true;
        self.n_nonz += 1;
    }

    fn all_zero(&self, pos: usize) -> bool {
        self.values.iter().all(|col| col[pos] == T::zero())
    }

    /// Delete the element at `pos` if it is active, not protected, and zero in every column.
    /// Returns whether it was deleted.
    pub fn del_at_pos(&mut self, pos: usize) -> bool {
        if !self.is_active(pos) || pos < self.min_del_idx || pos < self.n_dense || !self.all_zero(pos) {
            return false;
        }
        let hash = self.index.hash(&self.occ[pos * self.n_elec..(pos + 1) * self.n_elec]);
        self.index.delete(&self.keys[pos * self.n_bytes..(pos + 1) * self.n_bytes], hash);
        self.active[pos] = false;
        self.free.push(pos);
        self.n_nonz -= 1;
        true
    }

    /// Delete every deletable zero element.
    pub fn cleanup(&mut self) {
        for pos in 0..self.curr_size {
            self.del_at_pos(pos);
        }
    }

    /// Double the storage. Slot indices and the hash index are unchanged.
    pub fn expand(&mut self) {
        let new_cap = self.capacity * 2;
        info!(rank = self.rank, from = self.capacity, to = new_cap, "Increasing storage capacity of vector");
        self.keys.resize(new_cap * self.n_bytes, 0);
        self.occ.resize(new_cap * self.n_elec, 0);
        self.diag.resize(new_cap, f64::NAN);
        self.active.resize(new_cap, false);
        for col in self.values.iter_mut() {
            col.resize(new_cap, T::zero());
        }
        self.capacity = new_cap;
    }

    /// Drop every element, keeping capacity and salts.
    pub fn clear(&mut self) {
        for col in self.values.iter_mut() {
            col.iter_mut().for_each(|v| *v = T::zero());
        }
        self.active.iter_mut().for_each(|a| *a = false);
        self.index.clear();
        self.free.clear();
        self.curr_size = 0;
        self.n_nonz = 0;
        self.n_dense = 0;
    }

    /// Hashes of a flat array of keys, for repeated calls to `dot_hashed`.
    pub fn hashes_for(&self, keys: &[u8]) -> Result<Vec<u64>> {
        let mut orbs = Vec::with_capacity(self.n_elec);
        keys.chunks_exact(self.n_bytes).map(|k| self.idx_to_hash(k, &mut orbs)).collect()
    }

    /// Dot product of the current column with a foreign sparse vector, over keys stored on this
    /// shard only.
    /// # Arguments:
    ///   `keys`: [u8], foreign keys stored flat, `n_bytes` each.
    ///   `vals`: [f64], foreign values.
    pub fn dot(&self, keys: &[u8], vals: &[f64]) -> Result<f64> {
        let hashes = self.hashes_for(keys)?;
        self.dot_hashed(keys, vals, &hashes)
    }

    /// As `dot`, with precomputed hashes.
    pub fn dot_hashed(&self, keys: &[u8], vals: &[f64], hashes: &[u64]) -> Result<f64> {
        let n = keys.len() / self.n_bytes;
        if vals.len() != n || hashes.len() != n {
            return Err(FriError::DimensionMismatch { context: "dot", left: n, right: vals.len().min(hashes.len()) });
        }
        let col = &self.values[self.curr_vec];
        let mut sum = 0.0;
        for (i, key) in keys.chunks_exact(self.n_bytes).enumerate() {
            if let Some(pos) = self.index.lookup(key, hashes[i]) {
                sum += vals[i] * col[pos].as_weight();
            }
        }
        Ok(sum)
    }

    /// Dot product of columns `i` and `j` on this shard.
    pub fn internal_dot(&self, i: usize, j: usize) -> Result<f64> {
        self.check_col(i)?;
        self.check_col(j)?;
        Ok(self.active_positions().map(|p| self.values[i][p].as_weight() * self.values[j][p].as_weight()).sum())
    }

    /// Buffer a multi-column foreign element for `perform_dot`.
    pub fn add_dot(&mut self, key: &[u8], vals: &[f64]) -> Result<usize> {
        let shard = self.idx_to_proc(key)?;
        self.dot_adder.add(shard, key, vals, false)
    }

    /// Route buffered foreign elements to their owners and accumulate
    /// `results[(r, c)] += foreign[r] . column[c]` over the keys owned by this shard.
    /// # Arguments:
    ///   `comm`: Collective, communicator.
    ///   `results`: Array2<f64>, shape (foreign columns, `num_vecs`).
    pub fn perform_dot(&mut self, comm: &impl Collective, results: &mut Array2<f64>) -> Result<()> {
        if results.ncols() != self.values.len() {
            return Err(FriError::DimensionMismatch { context: "perform_dot columns", left: results.ncols(), right: self.values.len() });
        }
        let batches = self.dot_adder.exchange(comm)?;
        let mut orbs = Vec::with_capacity(self.n_elec);
        for el in batches.iter().flatten() {
            if el.vals.len() > results.nrows() {
                return Err(FriError::DimensionMismatch { context: "perform_dot rows", left: el.vals.len(), right: results.nrows() });
            }
            let hash = self.idx_to_hash(&el.key, &mut orbs)?;
            if let Some(pos) = self.index.lookup(&el.key, hash) {
                for (r, v) in el.vals.iter().enumerate() {
                    for (c, col) in self.values.iter().enumerate() {
                        results[(r, c)] += v * col[pos].as_weight();
                    }
                }
            }
        }
        Ok(())
    }

    /// Global dot product of the current column with a foreign vector whose elements may live on
    /// any shard. Elements are sent to their owners in rounds no larger than the buffer capacity.
    /// # Arguments:
    ///   `comm`: Collective, communicator.
    ///   `keys`: [u8], foreign keys held by this shard, `n_bytes` each.
    ///   `vals`: [f64], foreign values.
    pub fn multi_dot(&mut self, comm: &impl Collective, keys: &[u8], vals: &[f64]) -> Result<f64> {
        let n = keys.len() / self.n_bytes;
        if vals.len() != n {
            return Err(FriError::DimensionMismatch { context: "multi_dot", left: n, right: vals.len() });
        }
        let chunk = self.dot_adder.capacity().max(1);
        let n_rounds = max_usize(comm, n.div_ceil(chunk))?;
        let mut results = Array2::<f64>::zeros((1, self.values.len()));
        for round in 0..n_rounds {
            let start = (round * chunk).min(n);
            let end = ((round + 1) * chunk).min(n);
            for i in start..end {
                self.add_dot(&keys[i * self.n_bytes..(i + 1) * self.n_bytes], &vals[i..i + 1])?;
            }
            self.perform_dot(comm, &mut results)?;
        }
        sum_f64(comm, results[(0, self.curr_vec)])
    }

    /// Sum of |value| over the current column on this shard.
    pub fn local_norm(&self) -> f64 {
        self.values().iter().map(|v| v.as_weight().abs()).sum()
    }

    /// Sum of squared values over the current column on this shard.
    pub fn two_norm(&self) -> f64 {
        self.values().iter().map(|v| v.as_weight().powi(2)).sum()
    }

    /// Sum of |value| over the dense subspace on this shard.
    pub fn dense_norm(&self) -> f64 {
        self.values[self.curr_vec][..self.n_dense].iter().map(|v| v.as_weight().abs()).sum()
    }

    /// Column `dst` += column `src`.
    pub fn add_vecs(&mut self, dst: usize, src: usize) -> Result<()> {
        self.check_col(dst)?;
        self.check_col(src)?;
        for p in 0..self.curr_size {
            let v = self.values[src][p];
            self.values[dst][p] += v;
        }
        Ok(())
    }

    pub fn copy_vec(&mut self, src: usize, dst: usize) -> Result<()> {
        self.check_col(src)?;
        self.check_col(dst)?;
        if src != dst {
            let n = self.curr_size;
            let tmp = self.values[src][..n].to_vec();
            self.values[dst][..n].copy_from_slice(&tmp);
        }
        Ok(())
    }

    /// Multiply column `idx` by `c`.
    pub fn weight_vec(&mut self, idx: usize, c: T) -> Result<()> {
        self.check_col(idx)?;
        let n = self.curr_size;
        self.values[idx][..n].iter_mut().for_each(|v| *v = *v * c);
        Ok(())
    }

    pub fn zero_vec(&mut self, idx: usize) -> Result<()> {
        self.check_col(idx)?;
        let n = self.curr_size;
        self.values[idx][..n].iter_mut().for_each(|v| *v = T::zero());
        Ok(())
    }

    /// Replicate every shard's elements on every shard. Afterwards local dot products need no
    /// communication.
    pub fn collect_procs(&mut self, comm: &impl Collective) -> Result<()> {
        let local: Vec<Element<T>> = self
            .active_positions()
            .map(|p| Element {
                key: self.key_at(p).to_vec(),
                vals: self.values.iter().map(|col| col[p]).collect(),
                ini: true,
            })
            .collect();
        let gathered = all_gather(comm, &local)?;
        let mut orbs = Vec::with_capacity(self.n_elec);
        for (src, batch) in gathered.iter().enumerate() {
            if src == self.rank {
                continue;
            }
            for el in batch {
                let hash = self.idx_to_hash(&el.key, &mut orbs)?;
                let pos = self.insert_local(&el.key, hash, &orbs);
                for (col, v) in self.values.iter_mut().zip(el.vals.iter()) {
                    col[pos] += *v;
                }
            }
        }
        debug!(rank = self.rank, n_nonz = self.n_nonz, "collected vector on all shards");
        Ok(())
    }

    // Slot for `key` on this shard, creating it if absent.
    fn insert_local(&mut self, key: &[u8], hash: u64, orbs: &[Orb]) -> usize {
        let entry = self.index.entry(key, hash);
        let slot = self.index.slot(entry);
        if slot != PENDING {
            return slot as usize;
        }
        let pos = self.claim_slot();
        self.index.assign(entry, pos as isize);
        self.init_slot(pos, key, orbs);
        pos
    }

    /// Load the dense subspace. Keys are read by rank 0 and sent to their owners, where they are
    /// stored with zero value at the front of the arrays and protected from deletion.
    /// # Arguments:
    ///   `comm`: Collective, communicator.
    ///   `keys`: [u8], dense keys stored flat; only rank 0's are used.
    ///   `save_dir`: optional directory receiving `dense.txt`.
    pub fn init_dense(&mut self, comm: &impl Collective, keys: &[u8], save_dir: Option<&Path>) -> Result<usize> {
        if self.curr_size != 0 {
            return Err(FriError::Config("dense subspace must be loaded into an empty vector".into()));
        }
        let keys = if comm.rank() == 0 { keys } else { &[] };
        let n = keys.len() / self.n_bytes;
        let chunk = self.adder.capacity().max(1);
        let n_rounds = max_usize(comm, n.div_ceil(chunk))?;
        for round in 0..n_rounds {
            let start = (round * chunk).min(n);
            let end = ((round + 1) * chunk).min(n);
            for i in start..end {
                self.add(&keys[i * self.n_bytes..(i + 1) * self.n_bytes], T::one(), true)?;
            }
            self.perform_add(comm, self.curr_vec)?;
        }

        self.n_dense = self.curr_size;
        for col in self.values.iter_mut() {
            col[..self.n_dense].iter_mut().for_each(|v| *v = T::zero());
        }
        self.min_del_idx = self.min_del_idx.max(self.n_dense);

        let sizes = all_gather(comm, &self.n_dense)?;
        if comm.rank() == 0 {
            if let Some(dir) = save_dir {
                write_dense_sizes(&dir.join("dense.txt"), &sizes)?;
            }
        }
        Ok(self.n_dense)
    }

    /// Write this shard's keys and values to `dir/dets{rank}.dat` and `dir/vals{rank}.dat`, and
    /// the dense subspace sizes of all shards to `dir/dense.txt`.
    pub fn save(&self, comm: &impl Collective, dir: &Path) -> Result<()> {
        let dets_path = dir.join(format!("dets{}.dat", self.rank));
        fs::write(&dets_path, &self.keys[..self.curr_size * self.n_bytes]).map_err(|e| FriError::io(&dets_path, e))?;

        let mut bytes = Vec::with_capacity(self.values.len() * self.curr_size * T::WIDTH);
        for col in self.values.iter() {
            for v in &col[..self.curr_size] {
                v.put_le(&mut bytes);
            }
        }
        let vals_path = dir.join(format!("vals{}.dat", self.rank));
        fs::write(&vals_path, &bytes).map_err(|e| FriError::io(&vals_path, e))?;

        let sizes = all_gather(comm, &self.n_dense)?;
        if comm.rank() == 0 {
            write_dense_sizes(&dir.join("dense.txt"), &sizes)?;
        }
        Ok(())
    }

    /// Replace the contents with a checkpoint written by `save` under the same configuration and
    /// shard count. Elements that are zero in every column and unprotected are dropped. Returns the
    /// dense subspace size of this shard.
    pub fn load(&mut self, comm: &impl Collective, dir: &Path) -> Result<usize> {
        let mut sizes: Vec<usize> = if comm.rank() == 0 { read_dense_sizes(&dir.join("dense.txt"))? } else { Vec::new() };
        broadcast(comm, 0, &mut sizes)?;
        let n_dense = *sizes.get(self.rank).ok_or_else(|| FriError::Parse {
            path: dir.join("dense.txt"),
            line: 1,
            reason: format!("{} entries for {} shards", sizes.len(), comm.size()),
        })?;

        let dets_path = dir.join(format!("dets{}.dat", self.rank));
        let dets = fs::read(&dets_path).map_err(|e| FriError::io(&dets_path, e))?;
        let n_dets = dets.len() / self.n_bytes;
        let vals_path = dir.join(format!("vals{}.dat", self.rank));
        let vals = fs::read(&vals_path).map_err(|e| FriError::io(&vals_path, e))?;
        let n_vecs = self.values.len();
        if vals.len() != n_vecs * n_dets * T::WIDTH {
            return Err(FriError::Parse {
                path: vals_path,
                line: 0,
                reason: format!("expected {} bytes, found {}", n_vecs * n_dets * T::WIDTH, vals.len()),
            });
        }

        self.clear();
        while n_dets > self.capacity {
            self.expand();
        }
        let val_at = |col: usize, det: usize| T::get_le(&vals[(col * n_dets + det) * T::WIDTH..]);
        let mut orbs = Vec::with_capacity(self.n_elec);
        for det in 0..n_dets {
            let keep = det < n_dense
                || det < self.min_del_idx
                || (0..n_vecs).any(|c| val_at(c, det).as_weight().abs() > LOAD_TOL);
            if !keep {
                continue;
            }
            let key = &dets[det * self.n_bytes..(det + 1) * self.n_bytes];
            let hash = self.idx_to_hash(key, &mut orbs)?;
            let pos = self.insert_local(key, hash, &orbs);
            for c in 0..n_vecs {
                self.values[c][pos] = val_at(c, det);
            }
        }
        self.n_dense = n_dense;
        Ok(n_dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::key_from_orbs;
    use crate::collective::Loopback;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn vec_f64(capacity: usize, n_vecs: usize) -> DistVec<f64> {
        let mut rng = SmallRng::seed_from_u64(11);
        let cfg = DistVecConfig { capacity, adder_capacity: 64, n_bits: 12, n_elec: 2, n_vecs };
        let router = Scrambler::random(12, &mut rng);
        let index = Scrambler::random(12, &mut rng);
        DistVec::new(cfg, &Loopback, router, index)
    }

    fn key(a: u16, b: u16) -> Vec<u8> {
        key_from_orbs(&[a, b], 2)
    }

    #[test]
    fn add_merges_duplicates() {
        let mut v = vec_f64(4, 1);
        v.add(&key(0, 1), 1.5, true).unwrap();
        v.add(&key(0, 1), 0.5, true).unwrap();
        v.add(&key(2, 3), -1.0, true).unwrap();
        assert_eq!(v.add(&key(2, 5), 0.0, true).unwrap(), None);
        v.perform_add(&Loopback, 0).unwrap();
        assert_eq!(v.n_nonz(), 2);
        let p = v.lookup(&key(0, 1)).unwrap().unwrap();
        assert_eq!(v.value(p), 2.0);
        assert_eq!(v.local_norm(), 3.0);
    }

    #[test]
    fn initiator_rule() {
        let mut v = vec_f64(4, 1);
        v.add(&key(0, 1), 1.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();

        // Non-initiators may add to occupied elements but not create new ones.
        let accepted = v.add(&key(0, 1), 2.0, false).unwrap().unwrap();
        let (shard, rejected) = v.add_routed(&key(4, 5), 3.0, false).unwrap().unwrap();
        assert_eq!(v.add_routed(&key(4, 5), 0.0, false).unwrap(), None);
        assert_eq!(shard, 0);
        assert_eq!(v.pending_adds(), 2);
        v.perform_add(&Loopback, 0).unwrap();
        assert_eq!(v.pending_adds(), 0);
        assert_eq!(v.add_result(0, accepted), Some(AddResult { accepted: true, residual: 0.0 }));
        assert_eq!(v.add_result(shard, rejected), Some(AddResult { accepted: false, residual: 3.0 }));
        assert_eq!(v.lookup(&key(4, 5)).unwrap(), None);
        assert_eq!(v.n_nonz(), 1);
        assert_eq!(v.curr_size(), 1);
        assert_eq!(v.nonini_occ_add(), 1);
        assert_eq!(v.tot_sgn_coh(&Loopback).unwrap(), 1);
    }

    #[test]
    fn cancellation_deletes_and_slot_is_reused() {
        let mut v = vec_f64(4, 1);
        v.add(&key(0, 1), 1.0, true).unwrap();
        v.add(&key(2, 3), 1.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        let p = v.lookup(&key(0, 1)).unwrap().unwrap();

        v.add(&key(0, 1), -1.0, false).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        assert_eq!(v.lookup(&key(0, 1)).unwrap(), None);
        assert!(!v.is_active(p));

        v.add(&key(6, 7), 4.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        assert_eq!(v.lookup(&key(6, 7)).unwrap(), Some(p));
        assert_eq!(v.curr_size(), 2);
    }

    #[test]
    fn expansion_keeps_elements() {
        let mut v = vec_f64(2, 1);
        let keys: Vec<Vec<u8>> = (0..6).map(|i| key(i, 11)).collect();
        for (i, k) in keys.iter().enumerate() {
            v.add(k, i as f64 + 1.0, true).unwrap();
        }
        v.perform_add(&Loopback, 0).unwrap();
        assert!(v.capacity() >= 6);
        for (i, k) in keys.iter().enumerate() {
            let p = v.lookup(k).unwrap().unwrap();
            assert_eq!(v.value(p), i as f64 + 1.0);
            assert_eq!(v.orbs_at(p), &[i as u16, 11]);
        }
    }

    #[test]
    fn protected_slots_survive_deletion() {
        let mut v = vec_f64(4, 1);
        v.add(&key(0, 1), 1.0, true).unwrap();
        v.add(&key(2, 3), 1.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        v.fix_min_del_idx();
        v.values_mut().iter_mut().for_each(|x| *x = 0.0);
        assert!(!v.del_at_pos(0));
        v.cleanup();
        assert_eq!(v.n_nonz(), 2);
        v.set_min_del_idx(0);
        v.cleanup();
        assert_eq!(v.n_nonz(), 0);
    }

    #[test]
    fn other_columns_keep_element_alive() {
        let mut v = vec_f64(4, 2);
        v.add(&key(0, 1), 1.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        v.copy_vec(0, 1).unwrap();
        v.weight_vec(1, 3.0).unwrap();
        assert_eq!(v.internal_dot(0, 1).unwrap(), 3.0);
        v.zero_vec(0).unwrap();
        assert!(!v.del_at_pos(0));
        v.add_vecs(0, 1).unwrap();
        assert_eq!(v.value(0), 3.0);
        assert!(matches!(v.set_curr_vec_idx(2), Err(FriError::ColumnOutOfBounds { idx: 2, n_vecs: 2 })));
    }

    #[test]
    fn diagonal_is_cached_lazily() {
        let mut v = vec_f64(4, 1).with_diag(Box::new(|orbs: &[Orb]| orbs.iter().map(|&o| o as f64).sum()));
        v.add(&key(3, 5), 1.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        assert_eq!(v.matr_el_at_pos(0), Some(8.0));
        assert_eq!(v.matr_el_at_pos(0), Some(8.0));
        assert_eq!(vec_f64(1, 1).matr_el_at_pos(0), None);
    }

    #[test]
    fn wrong_particle_count_is_corruption() {
        let mut v = vec_f64(4, 1);
        let bad = key_from_orbs(&[0, 1, 2], 2);
        assert!(matches!(v.add(&bad, 1.0, true), Err(FriError::ParticleCount { found: 3, expected: 2, .. })));
    }

    #[test]
    fn orbital_past_basis_is_corruption() {
        let mut v = vec_f64(4, 1);
        let bad = key_from_orbs(&[0, 13], 2);
        assert!(matches!(v.add(&bad, 1.0, true), Err(FriError::OrbitalOutOfRange { orb: 13, .. })));
        assert!(matches!(v.lookup(&bad), Err(FriError::OrbitalOutOfRange { .. })));
    }

    #[test]
    fn dot_with_foreign_keys() {
        let mut v = vec_f64(4, 1);
        v.add(&key(0, 1), 2.0, true).unwrap();
        v.add(&key(2, 3), -1.0, true).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        let mut keys = key(2, 3);
        keys.extend(key(8, 9));
        keys.extend(key(0, 1));
        let vals = [4.0, 100.0, 0.5];
        assert_eq!(v.dot(&keys, &vals).unwrap(), -3.0);
        assert_eq!(v.multi_dot(&Loopback, &keys, &vals).unwrap(), -3.0);
    }

    #[test]
    fn dense_subspace_is_zeroed_and_protected() {
        let mut v = vec_f64(4, 1);
        let mut keys = key(0, 1);
        keys.extend(key(2, 3));
        assert_eq!(v.init_dense(&Loopback, &keys, None).unwrap(), 2);
        assert_eq!(v.values(), &[0.0, 0.0]);
        assert!(!v.del_at_pos(0));
        v.add(&key(0, 1), 1.0, false).unwrap();
        v.perform_add(&Loopback, 0).unwrap();
        // Dense element is zero so the non-initiator is rejected, but the slot remains.
        assert_eq!(v.n_nonz(), 2);
        assert_eq!(v.dense_norm(), 0.0);
    }
}
