// compress.rs
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::Rng;
use tracing::debug;

use crate::collective::{all_gather, broadcast, sum_f64, sum_usize, Collective};
use crate::distvec::DistVec;
use crate::error::{FriError, Result};
use crate::stochastic::AliasTable;

// Below this global one-norm there is nothing left to sample.
const MIN_NORM: f64 = 1e-9;

/// Outcome of the threshold search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Preserved {
    // Samples left for the residual after exact preservation.
    pub n_samp: usize,
    // Residual one-norm on this shard.
    pub loc_norm: f64,
    // Global one-norm before preservation.
    pub glob_norm: f64,
    // Elements preserved exactly on this shard.
    pub n_kept: usize,
}

// Max-heap entry. Ties in magnitude pop the lower index first.
#[derive(PartialEq)]
struct HeapEl {
    mag: f64,
    idx: usize,
}

impl Eq for HeapEl {}

impl Ord for HeapEl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mag.total_cmp(&other.mag).then_with(|| other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for HeapEl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Select the elements large enough to be preserved exactly. With `R` the remaining global
/// one-norm and `m` the remaining budget, the largest element is preserved while its magnitude is
/// at least `R / m`. Shards search in rounds and agree on `R` and `m` between rounds.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `values`: [f64], local elements.
///   `keep`: [bool], set to true for preserved elements; reset on entry.
///   `n_samp`: usize, global budget of nonzero elements.
pub fn find_preserve(comm: &impl Collective, values: &[f64], keep: &mut [bool], n_samp: usize) -> Result<Preserved> {
    if keep.len() != values.len() {
        return Err(FriError::DimensionMismatch { context: "find_preserve", left: keep.len(), right: values.len() });
    }
    keep.iter_mut().for_each(|k| *k = false);
    let mut heap: BinaryHeap<HeapEl> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != 0.0)
        .map(|(idx, v)| HeapEl { mag: v.abs(), idx })
        .collect();

    let mut loc_norm: f64 = values.iter().map(|v| v.abs()).sum();
    let glob_norm = sum_f64(comm, loc_norm)?;
    let mut remaining = n_samp;
    let mut n_kept = 0usize;
    loop {
        let mut glob = sum_f64(comm, loc_norm)?;
        let mut loc_sampled = 0usize;
        while let Some(top) = heap.peek() {
            let (mag, idx) = (top.mag, top.idx);
            let left = remaining.saturating_sub(loc_sampled);
            if left == 0 || glob <= 0.0 || mag < glob / left as f64 {
                break;
            }
            heap.pop();
            keep[idx] = true;
            loc_norm -= mag;
            glob -= mag;
            loc_sampled += 1;
        }
        n_kept += loc_sampled;
        let glob_sampled = sum_usize(comm, loc_sampled)?;
        remaining = remaining.saturating_sub(glob_sampled);
        if glob_sampled == 0 {
            break;
        }
    }

    // Residual recomputed from scratch to avoid drift from repeated subtraction.
    let loc_norm: f64 = values.iter().zip(keep.iter()).filter(|(_, k)| !**k).map(|(v, _)| v.abs()).sum();
    if sum_f64(comm, loc_norm)? < MIN_NORM {
        remaining = 0;
    }
    Ok(Preserved { n_samp: remaining, loc_norm, glob_norm, n_kept })
}

/// Starting point of this shard on the global cumulative axis and the first pivot at or after it.
/// Pivots are `rn * step + k * step` with `step = sum(norms) / n_samp`.
/// # Arguments:
///   `norms`: [f64], residual one-norm of every shard, identical on all shards.
///   `rank`: usize, this shard.
///   `rn`: f64, shared uniform number in [0, 1).
///   `n_samp`: usize, number of pivots.
pub fn seed_sys(norms: &[f64], rank: usize, rn: f64, n_samp: usize) -> (f64, f64) {
    let lbound: f64 = norms[..rank].iter().sum();
    let global: f64 = norms.iter().sum();
    let step = global / n_samp as f64;
    let mut rn_sys = rn * step + step * (lbound / step).floor();
    if rn_sys < lbound {
        rn_sys += step;
    }
    (lbound, rn_sys)
}

/// Systematic resampling of the residual. Preserved elements are left unchanged; each residual
/// element becomes `sign * step` times the number of pivots in its interval, or zero. `rn` is
/// broadcast from rank 0 first, so only rank 0's value matters.
///
/// On return `keep` is cleared and `norms` holds every shard's new one-norm. Returns the indices
/// of elements that were set to zero.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `values`: [f64], local elements, modified in place.
///   `keep`: [bool], elements preserved by `find_preserve`.
///   `norms`: [f64], residual one-norm of every shard.
///   `n_samp`: usize, number of pivots over all shards.
///   `rn`: f64, uniform number in [0, 1).
pub fn sys_comp(comm: &impl Collective, values: &mut [f64], keep: &mut [bool], norms: &mut [f64], n_samp: usize, rn: f64) -> Result<Vec<usize>> {
    if keep.len() != values.len() {
        return Err(FriError::DimensionMismatch { context: "sys_comp keep", left: keep.len(), right: values.len() });
    }
    if norms.len() != comm.size() {
        return Err(FriError::DimensionMismatch { context: "sys_comp norms", left: norms.len(), right: comm.size() });
    }
    let mut rn = rn;
    broadcast(comm, 0, &mut rn)?;

    let global: f64 = norms.iter().sum();
    let step = if n_samp > 0 { global / n_samp as f64 } else { 0.0 };
    let (mut lbound, mut rn_sys) = if step > 0.0 { seed_sys(norms, comm.rank(), rn, n_samp) } else { (0.0, f64::INFINITY) };

    let mut new_norm = 0.0;
    let mut zeroed = Vec::new();
    for (i, v) in values.iter_mut().enumerate() {
        if keep[i] {
            new_norm += v.abs();
            keep[i] = false;
            continue;
        }
        if *v == 0.0 {
            continue;
        }
        lbound += v.abs();
        let mut hits = 0usize;
        while rn_sys < lbound {
            hits += 1;
            rn_sys += step;
        }
        if hits > 0 {
            *v = v.signum() * step * hits as f64;
            new_norm += step * hits as f64;
        } else {
            *v = 0.0;
            zeroed.push(i);
        }
    }
    let gathered = all_gather(comm, &new_norm)?;
    norms.copy_from_slice(&gathered);
    Ok(zeroed)
}

/// Expected value of `sum_i obs(i) * w'[i]^2` on this shard after `sys_comp`, for each
/// `rn = k / n_rns`. Pivots are located by bisection of the cumulative residual weights, so this
/// checks `sys_comp` against an independent computation. Callers sum the results over shards.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `values`: [f64], local elements before `sys_comp`.
///   `keep`: [bool], elements preserved by `find_preserve`.
///   `norms`: [f64], residual one-norm of every shard.
///   `n_samp`: usize, number of pivots over all shards.
///   `obs`: per-element observable.
///   `n_rns`: usize, number of evenly spaced random numbers.
pub fn sys_obs(comm: &impl Collective, values: &[f64], keep: &[bool], norms: &[f64], n_samp: usize, obs: impl Fn(usize) -> f64,
               n_rns: usize) -> Vec<f64> {
    let kept: f64 = values.iter().enumerate().filter(|(i, _)| keep[*i]).map(|(i, v)| obs(i) * v * v).sum();

    // Cumulative weight at the end of each residual element, starting from this shard's offset.
    let lbound: f64 = norms[..comm.rank()].iter().sum();
    let mut resid_idx = Vec::new();
    let mut cumu = Vec::new();
    let mut acc = lbound;
    for (i, v) in values.iter().enumerate() {
        if !keep[i] && *v != 0.0 {
            acc += v.abs();
            resid_idx.push(i);
            cumu.push(acc);
        }
    }

    let global: f64 = norms.iter().sum();
    (0..n_rns)
        .map(|k| {
            if n_samp == 0 || global <= 0.0 {
                return kept;
            }
            let rn = k as f64 / n_rns as f64;
            let step = global / n_samp as f64;
            let (_, first) = seed_sys(norms, comm.rank(), rn, n_samp);
            let mut hits = vec![0usize; resid_idx.len()];
            let mut j = 0usize;
            loop {
                let pivot = first + j as f64 * step;
                let el = cumu.partition_point(|&c| c <= pivot);
                if el >= cumu.len() {
                    break;
                }
                hits[el] += 1;
                j += 1;
            }
            kept + resid_idx.iter().zip(hits.iter()).map(|(&i, &h)| obs(i) * (h as f64 * step).powi(2)).sum::<f64>()
        })
        .collect()
}

/// Summary of one compression of a `DistVec`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Compressed {
    // Elements preserved exactly on this shard.
    pub n_kept: usize,
    // Pivots placed over all shards.
    pub n_sampled: usize,
    // Global one-norm of the stochastic part before compression.
    pub norm_before: f64,
    // Global one-norm of the stochastic part after compression.
    pub norm_after: f64,
}

/// Compress the current column of a vector to `n_samp` nonzero elements over all shards. The
/// dense subspace is left alone; emptied slots are deleted.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `vec`: DistVec<f64>, vector to compress.
///   `n_samp`: usize, global budget of nonzero elements outside the dense subspace.
///   `rng`: Rng, used on rank 0 for the shared random number.
pub fn compress_vec(comm: &impl Collective, vec: &mut DistVec<f64>, n_samp: usize, rng: &mut impl Rng) -> Result<Compressed> {
    let start = vec.n_dense().min(vec.curr_size());
    let n_local = vec.curr_size() - start;
    let mut keep = vec![false; n_local];
    let pres = find_preserve(comm, &vec.values()[start..], &mut keep, n_samp)?;
    let mut norms = all_gather(comm, &pres.loc_norm)?;
    let rn: f64 = if comm.rank() == 0 { rng.gen() } else { 0.0 };
    let zeroed = sys_comp(comm, &mut vec.values_mut()[start..], &mut keep, &mut norms, pres.n_samp, rn)?;
    for i in zeroed {
        vec.del_at_pos(start + i);
    }
    let out = Compressed { n_kept: pres.n_kept, n_sampled: pres.n_samp, norm_before: pres.glob_norm, norm_after: norms.iter().sum() };
    debug!(rank = comm.rank(), n_kept = out.n_kept, n_sampled = out.n_sampled, norm_before = out.norm_before,
           norm_after = out.norm_after, "compressed vector");
    Ok(out)
}

/// Multinomial compression of a single-shard vector: `n_samp` independent draws from the alias
/// table of |w| / ||w||, each adding `sign * ||w|| / n_samp` to the drawn element.
/// # Arguments:
///   `values`: [f64], elements to compress.
///   `n_samp`: usize, number of draws.
///   `rng`: Rng, random number generator.
pub fn compress_all(values: &[f64], n_samp: usize, rng: &mut impl Rng) -> Vec<f64> {
    let norm: f64 = values.iter().map(|v| v.abs()).sum();
    let mut out = vec![0.0; values.len()];
    if norm < MIN_NORM || n_samp == 0 {
        return out;
    }
    let probs: Vec<f64> = values.iter().map(|v| v.abs() / norm).collect();
    let table = AliasTable::new(&probs);
    let weight = norm / n_samp as f64;
    for _ in 0..n_samp {
        let i = table.sample(rng);
        out[i] += values[i].signum() * weight;
    }
    out
}
