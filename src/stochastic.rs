// stochastic.rs
use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};

use crate::error::{FriError, Result};

/// Per-rank random number generator. If a seed is given it is turned into distinct per-rank seeds
/// using golden ratio hashing via 0x9E3779B9, otherwise the seed is random.
/// # Arguments:
///   `seed`: Option<u64>, user supplied base seed.
///   `irank`: usize, rank of this shard.
pub fn rank_rng(seed: Option<u64>, irank: usize) -> SmallRng {
    let base: u64 = seed.unwrap_or_else(rand::random::<u64>);
    SmallRng::seed_from_u64(base.wrapping_add((irank as u64).wrapping_mul(0x9E3779B9)))
}

/// Stochastically round `p * n` to an integer with the correct expectation, as `floor(p) * n`
/// plus a binomial draw of `n` trials with success probability `p - floor(p)`.
/// # Arguments:
///   `p`: f64, real number of events per trial.
///   `n`: u32, number of trials.
///   `rng`: Rng, random number generator.
pub fn round_binomially(p: f64, n: u32, rng: &mut impl Rng) -> Result<i64> {
    if !p.is_finite() {
        return Err(FriError::InvalidProbability(p));
    }
    let flr = p.floor();
    let frac = p - flr;
    let base = flr as i64 * n as i64;
    // Rather than sampling every trial we can sample the binomial distribution.
    let extra = if frac > 0.0 && n > 0 {
        Binomial::new(n as u64, frac).map_err(|_| FriError::InvalidProbability(frac))?.sample(rng) as i64
    } else {
        0
    };
    Ok(base + extra)
}

/// Alias table for O(1) sampling from a discrete distribution.
#[derive(Clone, Debug)]
pub struct AliasTable {
    // Index returned when the bucket's own probability test fails.
    aliases: Vec<usize>,
    // Probability of returning the bucket itself.
    alias_probs: Vec<f64>,
}

impl AliasTable {
    /// Build the table. `probs` should sum to one.
    ///
    /// States are split into piles smaller and bigger than the uniform share 1/n. The top of each
    /// pile is paired repeatedly: the smaller state's deficit is covered by a slice of the bigger
    /// state's surplus, which then moves piles if it drops below its share.
    pub fn new(probs: &[f64]) -> Self {
        let n = probs.len();
        let mut aliases: Vec<usize> = (0..n).collect();
        let mut alias_probs: Vec<f64> = probs.iter().map(|p| p * n as f64).collect();
        let mut smaller: Vec<usize> = Vec::with_capacity(n);
        let mut bigger: Vec<usize> = Vec::with_capacity(n);
        for (i, &ap) in alias_probs.iter().enumerate() {
            if ap < 1.0 {
                smaller.push(i);
            } else {
                bigger.push(i);
            }
        }
        while let (Some(&s), Some(&b)) = (smaller.last(), bigger.last()) {
            aliases[s] = b;
            alias_probs[b] += alias_probs[s] - 1.0;
            if alias_probs[b] < 1.0 {
                // b replaces s on the smaller pile.
                smaller.pop();
                smaller.push(b);
                bigger.pop();
            } else {
                smaller.pop();
            }
        }
        // Round-off leftovers.
        for i in smaller.into_iter().chain(bigger) {
            alias_probs[i] = 1.0;
        }
        Self { aliases, alias_probs }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Draw one state: a uniform bucket, then a Bernoulli test against that bucket's probability.
    pub fn sample(&self, rng: &mut impl Rng) -> usize {
        let bucket = rng.gen_range(0..self.aliases.len());
        if rng.gen::<f64>() < self.alias_probs[bucket] {
            bucket
        } else {
            self.aliases[bucket]
        }
    }

    /// Fill `out` with independent draws.
    pub fn sample_into(&self, rng: &mut impl Rng, out: &mut [usize]) {
        for o in out.iter_mut() {
            *o = self.sample(rng);
        }
    }
}

/// Proportional control of the energy shift. Control starts when the norm first exceeds
/// `target_norm`; afterwards `shift -= damping * ln(norm / last_norm)`.
/// # Arguments:
///   `shift`: f64, energy shift updated in place.
///   `one_norm`: f64, current global one-norm.
///   `last_norm`: f64, norm at the last update, zero before control starts.
///   `target_norm`: f64, norm at which control starts.
///   `damping`: f64, damping factor.
pub fn adjust_shift(shift: &mut f64, one_norm: f64, last_norm: &mut f64, target_norm: f64, damping: f64) {
    if *last_norm != 0.0 {
        *shift -= damping * (one_norm / *last_norm).ln();
        *last_norm = one_norm;
    }
    if *last_norm == 0.0 && one_norm > target_norm {
        *last_norm = one_norm;
    }
}

/// State carried between shift updates.
#[derive(Clone, Debug)]
pub struct ShiftController {
    pub shift: f64,
    pub last_norm: f64,
    pub target_norm: f64,
    pub damping: f64,
}

impl ShiftController {
    pub fn new(initial_shift: f64, target_norm: f64, damping: f64) -> Self {
        Self { shift: initial_shift, last_norm: 0.0, target_norm, damping }
    }

    /// Whether the norm has reached the target and the shift is being varied.
    pub fn active(&self) -> bool {
        self.last_norm != 0.0
    }

    /// Update the shift from the current global one-norm and return it.
    pub fn update(&mut self, one_norm: f64) -> f64 {
        adjust_shift(&mut self.shift, one_norm, &mut self.last_norm, self.target_norm, self.damping);
        self.shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_marginals_match_probabilities() {
        let probs = [0.10125, 0.05625, 0.0875, 0.03, 0.095, 0.05375, 0.095, 0.0875, 0.0625, 0.33125];
        let table = AliasTable::new(&probs);
        let mut rng = SmallRng::seed_from_u64(20190401);
        let n_iter = 1_000_000;
        let mut counts = [0usize; 10];
        let mut batch = [0usize; 10];
        for _ in 0..n_iter {
            table.sample_into(&mut rng, &mut batch);
            for &s in &batch {
                counts[s] += 1;
            }
        }
        let total = (n_iter * batch.len()) as f64;
        for (c, p) in counts.iter().zip(probs.iter()) {
            assert!((*c as f64 / total - p).abs() < 1e-3, "frequency {} vs {}", *c as f64 / total, p);
        }
    }

    #[test]
    fn alias_table_is_exact_in_expectation() {
        // The probability of each state implied by the table equals the input.
        let probs = [0.5, 0.25, 0.125, 0.125];
        let table = AliasTable::new(&probs);
        let n = probs.len() as f64;
        let mut implied = vec![0.0; probs.len()];
        for b in 0..probs.len() {
            implied[b] += table.alias_probs[b] / n;
            implied[table.aliases[b]] += (1.0 - table.alias_probs[b]) / n;
        }
        for (a, p) in implied.iter().zip(probs.iter()) {
            assert!((a - p).abs() < 1e-12);
        }
    }

    #[test]
    fn binomial_rounding_preserves_mean() {
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(round_binomially(2.0, 5, &mut rng).unwrap(), 10);
        let n_trials = 20000;
        let mut sum = 0i64;
        for _ in 0..n_trials {
            let r = round_binomially(-1.3, 4, &mut rng).unwrap();
            assert!((-8..=-4).contains(&r));
            sum += r;
        }
        let mean = sum as f64 / n_trials as f64;
        assert!((mean + 5.2).abs() < 0.05, "mean {}", mean);
        assert!(round_binomially(f64::NAN, 1, &mut rng).is_err());
    }

    #[test]
    fn shift_control_law() {
        let mut ctl = ShiftController::new(-1.0, 100.0, 0.1);
        assert_eq!(ctl.update(50.0), -1.0);
        assert!(!ctl.active());
        assert_eq!(ctl.update(150.0), -1.0);
        assert!(ctl.active());
        let s = ctl.update(300.0);
        assert!((s - (-1.0 - 0.1 * 2f64.ln())).abs() < 1e-12);
        assert_eq!(ctl.last_norm, 300.0);
    }
}
