// subcompress.rs
use ndarray::Array2;
use rand::Rng;
use tracing::debug;

use crate::collective::{all_gather, broadcast, sum_f64, sum_usize, Collective};
use crate::compress::seed_sys;
use crate::error::{FriError, Result};

// Residual global weight below which nothing is sampled.
const MIN_NORM: f64 = 1e-9;
// Sub-elements lighter than this are never preserved exactly.
const MIN_SUB: f64 = 1e-10;

/// One surviving (element, sub-choice) pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubSample {
    pub weight: f64,
    // Row of the parent element.
    pub parent: usize,
    // Column of the sub-choice.
    pub sub: usize,
}

// Number of sub-choices considered for row `i`.
fn n_sub_of(sub_sizes: Option<&[usize]>, i: usize, n_cols: usize) -> usize {
    sub_sizes.map_or(n_cols, |s| s[i].min(n_cols))
}

fn check_shapes(values: &[f64], n_div: &[usize], sub_weights: &Array2<f64>, keep: &Array2<bool>, sub_sizes: Option<&[usize]>,
                wt_remain: &[f64]) -> Result<()> {
    let n = values.len();
    if keep.dim() != sub_weights.dim() {
        return Err(FriError::DimensionMismatch { context: "keep columns", left: keep.ncols(), right: sub_weights.ncols() });
    }
    for (context, len) in [("n_div", n_div.len()), ("wt_remain", wt_remain.len()), ("sub_weights rows", sub_weights.nrows())] {
        if len != n {
            return Err(FriError::DimensionMismatch { context, left: len, right: n });
        }
    }
    if let Some(s) = sub_sizes {
        if s.len() != n {
            return Err(FriError::DimensionMismatch { context: "sub_sizes", left: s.len(), right: n });
        }
    }
    Ok(())
}

/// Preserve large elements of a vector whose elements are split into sub-choices.
///
/// Element `i` has non-negative weight `values[i]`. If `n_div[i] > 0` it splits into `n_div[i]`
/// equal parts which are preserved together once `values[i] / n_div[i]` reaches the threshold.
/// Otherwise its sub-choice `j` has weight `values[i] * sub_weights[(i, j)]` and is preserved on
/// its own. The threshold is the remaining global weight over the remaining budget, recomputed in
/// rounds until no shard preserves anything. On return `wt_remain[i]` holds the undecided weight
/// of row `i` and `n_samp` the budget left for sampling. Returns the undecided weight on this shard.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `values`: [f64], non-negative element weights.
///   `n_div`: [usize], number of equal parts per element, 0 to use `sub_weights`.
///   `sub_weights`: Array2<f64>, relative weight of each sub-choice, one row per element.
///   `keep`: Array2<bool>, preserved sub-choices, same shape as `sub_weights`. Reset on entry.
///   `sub_sizes`: optional number of columns considered per row.
///   `n_samp`: usize, global budget, reduced by the number of preserved samples.
///   `wt_remain`: [f64], undecided weight per row.
#[allow(clippy::too_many_arguments)]
pub fn find_keep_sub(comm: &impl Collective, values: &[f64], n_div: &[usize], sub_weights: &Array2<f64>, keep: &mut Array2<bool>,
                     sub_sizes: Option<&[usize]>, n_samp: &mut usize, wt_remain: &mut [f64]) -> Result<f64> {
    check_shapes(values, n_div, sub_weights, keep, sub_sizes, wt_remain)?;
    keep.fill(false);
    let n_cols = sub_weights.ncols();
    for (i, &el) in values.iter().enumerate() {
        wt_remain[i] = if n_div[i] > 0 {
            el
        } else {
            (0..n_sub_of(sub_sizes, i, n_cols)).map(|j| el * sub_weights[(i, j)]).sum()
        };
    }

    loop {
        let mut loc_norm: f64 = wt_remain.iter().sum();
        let mut glob = sum_f64(comm, loc_norm)?;
        let mut loc_sampled = 0usize;
        for (i, &el) in values.iter().enumerate() {
            let left = n_samp.saturating_sub(loc_sampled);
            if left == 0 || glob <= 0.0 {
                break;
            }
            let thresh = glob / left as f64;
            if el < thresh {
                continue;
            }
            if n_div[i] > 0 {
                if !keep[(i, 0)] && el / n_div[i] as f64 >= thresh {
                    keep[(i, 0)] = true;
                    wt_remain[i] = 0.0;
                    loc_sampled += n_div[i];
                    loc_norm -= el;
                    glob -= el;
                }
                continue;
            }
            let mut remain = 0.0;
            for j in 0..n_sub_of(sub_sizes, i, n_cols) {
                if keep[(i, j)] {
                    continue;
                }
                let sub = el * sub_weights[(i, j)];
                let left = n_samp.saturating_sub(loc_sampled);
                if left > 0 && glob > 0.0 && sub >= glob / left as f64 && sub > MIN_SUB {
                    keep[(i, j)] = true;
                    loc_sampled += 1;
                    loc_norm -= sub;
                    glob -= sub;
                } else {
                    remain += sub;
                }
            }
            wt_remain[i] = remain;
        }
        let glob_sampled = sum_usize(comm, loc_sampled)?;
        *n_samp = n_samp.saturating_sub(glob_sampled);
        debug!(rank = comm.rank(), loc_sampled, residual = loc_norm, "preservation round");
        if glob_sampled == 0 {
            break;
        }
    }

    let loc_norm: f64 = wt_remain.iter().sum();
    if sum_f64(comm, loc_norm)? < MIN_NORM {
        *n_samp = 0;
    }
    Ok(loc_norm)
}

/// Systematic sampling of the undecided weight left by `find_keep_sub`. Preserved sub-choices are
/// emitted with their exact weight, an element preserved whole emits all `n_div` parts, and every
/// pivot landing in the undecided weight emits a sample of weight `step`. A pivot landing in an
/// `n_div` element picks the part by its position within the element. `rn` is broadcast from
/// rank 0. On return `keep` is cleared and `norms` holds every shard's new weight.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `values`, `n_div`, `sub_weights`, `keep`, `sub_sizes`, `wt_remain`: as left by `find_keep_sub`.
///   `norms`: [f64], undecided weight of every shard.
///   `n_samp`: usize, number of pivots over all shards.
///   `rn`: f64, uniform number in [0, 1).
#[allow(clippy::too_many_arguments)]
pub fn sys_sub(comm: &impl Collective, values: &[f64], n_div: &[usize], sub_weights: &Array2<f64>, keep: &mut Array2<bool>,
               sub_sizes: Option<&[usize]>, norms: &mut [f64], n_samp: usize, wt_remain: &[f64], rn: f64) -> Result<Vec<SubSample>> {
    check_shapes(values, n_div, sub_weights, keep, sub_sizes, wt_remain)?;
    if norms.len() != comm.size() {
        return Err(FriError::DimensionMismatch { context: "sys_sub norms", left: norms.len(), right: comm.size() });
    }
    let mut rn = rn;
    broadcast(comm, 0, &mut rn)?;

    let global: f64 = norms.iter().sum();
    let step = if n_samp > 0 { global / n_samp as f64 } else { 0.0 };
    let (mut lbound, mut rn_sys) = if step > 0.0 { seed_sys(norms, comm.rank(), rn, n_samp) } else { (0.0, f64::INFINITY) };

    let n_cols = sub_weights.ncols();
    let mut new_norm = 0.0;
    let mut out = Vec::new();
    for (i, &el) in values.iter().enumerate() {
        let row_end = lbound + wt_remain[i];
        if n_div[i] > 0 {
            let parts = n_div[i];
            if keep[(i, 0)] {
                keep[(i, 0)] = false;
                out.extend((0..parts).map(|sub| SubSample { weight: el / parts as f64, parent: i, sub }));
                new_norm += el;
            } else if wt_remain[i] > 0.0 {
                while rn_sys < row_end {
                    let frac = (rn_sys - lbound) / wt_remain[i];
                    let sub = ((frac * parts as f64) as usize).min(parts - 1);
                    out.push(SubSample { weight: step, parent: i, sub });
                    new_norm += step;
                    rn_sys += step;
                }
            }
            lbound = row_end;
            continue;
        }

        let n_sub = n_sub_of(sub_sizes, i, n_cols);
        let mut sub_lbound = lbound;
        let mut last_open = None;
        for j in 0..n_sub {
            if keep[(i, j)] {
                keep[(i, j)] = false;
                let weight = el * sub_weights[(i, j)];
                out.push(SubSample { weight, parent: i, sub: j });
                new_norm += weight;
                continue;
            }
            let w = el * sub_weights[(i, j)];
            if w <= 0.0 {
                continue;
            }
            last_open = Some(j);
            sub_lbound += w;
            while rn_sys < sub_lbound && rn_sys < row_end {
                out.push(SubSample { weight: step, parent: i, sub: j });
                new_norm += step;
                rn_sys += step;
            }
        }
        // Pivots lost to round-off between the running sum and the row total go to the last open choice.
        if let Some(j) = last_open {
            while rn_sys < row_end {
                out.push(SubSample { weight: step, parent: i, sub: j });
                new_norm += step;
                rn_sys += step;
            }
        }
        lbound = row_end;
    }
    let gathered = all_gather(comm, &new_norm)?;
    norms.copy_from_slice(&gathered);
    Ok(out)
}

/// Hierarchical compression: `find_keep_sub`, a global gather of the undecided weights, then
/// `sys_sub` with a random number drawn on rank 0.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `values`: [f64], non-negative element weights.
///   `n_div`: [usize], number of equal parts per element, 0 to use `sub_weights`.
///   `sub_weights`: Array2<f64>, relative weight of each sub-choice.
///   `keep`: Array2<bool>, scratch space of the same shape as `sub_weights`.
///   `sub_sizes`: optional number of columns considered per row.
///   `n_samp`: usize, global number of samples.
///   `wt_remain`: [f64], scratch space, one entry per element.
///   `rng`: Rng, used on rank 0.
#[allow(clippy::too_many_arguments)]
pub fn comp_sub(comm: &impl Collective, values: &[f64], n_div: &[usize], sub_weights: &Array2<f64>, keep: &mut Array2<bool>,
                sub_sizes: Option<&[usize]>, n_samp: usize, wt_remain: &mut [f64], rng: &mut impl Rng) -> Result<Vec<SubSample>> {
    let mut remaining = n_samp;
    let loc_norm = find_keep_sub(comm, values, n_div, sub_weights, keep, sub_sizes, &mut remaining, wt_remain)?;
    let mut norms = all_gather(comm, &loc_norm)?;
    let rn: f64 = if comm.rank() == 0 { rng.gen() } else { 0.0 };
    sys_sub(comm, values, n_div, sub_weights, keep, sub_sizes, &mut norms, remaining, wt_remain, rn)
}
