use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fri_rs::collective::{all_gather, broadcast, run_group, Collective, Loopback};
use fri_rs::compress::{compress_all, find_preserve, sys_comp, sys_obs};
use fri_rs::subcompress::comp_sub;

fn random_signed(rng: &mut SmallRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| if rng.gen::<bool>() { rng.gen::<f64>() } else { -rng.gen::<f64>() }).collect()
}

// Preserve then resample on one shard.
fn compress_once(values: &[f64], n_samp: usize, rn: f64) -> Vec<f64> {
    let mut out = values.to_vec();
    let mut keep = vec![false; out.len()];
    let pres = find_preserve(&Loopback, &out, &mut keep, n_samp).unwrap();
    let mut norms = vec![pres.loc_norm];
    sys_comp(&Loopback, &mut out, &mut keep, &mut norms, pres.n_samp, rn).unwrap();
    out
}

#[test]
fn systematic_compression_is_unbiased() {
    let mut rng = SmallRng::seed_from_u64(2019);
    let values = random_signed(&mut rng, 10);
    let n_trials = 20000;
    let mut mean = vec![0.0; values.len()];
    for _ in 0..n_trials {
        let out = compress_once(&values, 5, rng.gen());
        assert_eq!(out.iter().filter(|v| **v != 0.0).count(), 5);
        for (m, v) in mean.iter_mut().zip(out.iter()) {
            *m += v / n_trials as f64;
        }
    }
    for (m, v) in mean.iter().zip(values.iter()) {
        assert!((m - v).abs() < 0.03, "mean {} vs {}", m, v);
    }
}

#[test]
fn large_elements_survive_unchanged() {
    let mut rng = SmallRng::seed_from_u64(4);
    let mut values = random_signed(&mut rng, 30);
    values[7] = 25.0;
    values[19] = -40.0;
    for _ in 0..100 {
        let out = compress_once(&values, 6, rng.gen());
        assert_eq!(out[7], 25.0);
        assert_eq!(out[19], -40.0);
        assert_eq!(out.iter().filter(|v| **v != 0.0).count(), 6);
        // Signs never flip.
        for (o, v) in out.iter().zip(values.iter()) {
            assert!(*o == 0.0 || o.signum() == v.signum());
        }
    }
}

#[test]
fn expected_observable_matches_systematic_sampling() {
    let mut rng = SmallRng::seed_from_u64(77);
    let obs = |i: usize| (i + 1) as f64;
    for t in 0..100 {
        let values = random_signed(&mut rng, 10);
        let n_samp = t % 5 + 1;
        let mut keep = vec![false; values.len()];
        let pres = find_preserve(&Loopback, &values, &mut keep, n_samp).unwrap();
        let norms = vec![pres.loc_norm];
        let n_rns = 10;
        let expected = sys_obs(&Loopback, &values, &keep, &norms, pres.n_samp, obs, n_rns);
        for (k, e) in expected.iter().enumerate() {
            let mut out = values.clone();
            let mut keep_k = keep.clone();
            let mut norms_k = norms.clone();
            sys_comp(&Loopback, &mut out, &mut keep_k, &mut norms_k, pres.n_samp, k as f64 / n_rns as f64).unwrap();
            let got: f64 = out.iter().enumerate().map(|(i, w)| obs(i) * w * w).sum();
            assert!((got - e).abs() < 1e-7, "trial {} rn {}: {} vs {}", t, k, got, e);
        }
    }
}

#[test]
fn multi_shard_compression_hits_exact_count() {
    let n_samp = 17;
    for trial in 0..5u64 {
        let counts = run_group(3, |comm| {
            let mut rng = SmallRng::seed_from_u64(1000 * trial + comm.rank() as u64);
            let mut values = random_signed(&mut rng, 10 + 5 * comm.rank());
            let mut keep = vec![false; values.len()];
            let pres = find_preserve(&comm, &values, &mut keep, n_samp).unwrap();
            let mut norms = all_gather(&comm, &pres.loc_norm).unwrap();
            let rn: f64 = rng.gen();
            sys_comp(&comm, &mut values, &mut keep, &mut norms, pres.n_samp, rn).unwrap();
            let nonz = values.iter().filter(|v| **v != 0.0).count();
            let total: f64 = values.iter().map(|v| v.abs()).sum();
            assert!((norms[comm.rank()] - total).abs() < 1e-12);
            nonz
        });
        assert_eq!(counts.iter().sum::<usize>(), n_samp);
    }
}

#[test]
fn multi_shard_agrees_on_random_number() {
    let rns = run_group(4, |comm| {
        let mut rn = if comm.rank() == 0 { 0.625 } else { comm.rank() as f64 / 10.0 };
        broadcast(&comm, 0, &mut rn).unwrap();
        rn
    });
    assert!(rns.iter().all(|&r| r == 0.625));
}

#[test]
fn multinomial_compression_is_unbiased() {
    let mut rng = SmallRng::seed_from_u64(8);
    let values = random_signed(&mut rng, 6);
    let n_trials = 20000;
    let mut mean = vec![0.0; values.len()];
    for _ in 0..n_trials {
        let out = compress_all(&values, 4, &mut rng);
        for (m, v) in mean.iter_mut().zip(out.iter()) {
            *m += v / n_trials as f64;
        }
    }
    for (m, v) in mean.iter().zip(values.iter()) {
        assert!((m - v).abs() < 0.03, "mean {} vs {}", m, v);
    }
}

fn sub_problem() -> (Vec<f64>, Vec<usize>, Array2<f64>) {
    let values = vec![1.0, 0.5, 2.0, 0.3, 0.8];
    let n_div = vec![0, 3, 0, 0, 2];
    let sub_weights = ndarray::array![
        [0.2, 0.3, 0.5],
        [0.0, 0.0, 0.0],
        [0.7, 0.2, 0.1],
        [0.6, 0.4, 0.0],
        [0.0, 0.0, 0.0],
    ];
    (values, n_div, sub_weights)
}

#[test]
fn hierarchical_compression_is_unbiased() {
    let (values, n_div, sub_weights) = sub_problem();
    let mut keep = Array2::from_elem(sub_weights.dim(), false);
    let mut wt_remain = vec![0.0; values.len()];
    let mut rng = SmallRng::seed_from_u64(31);
    let n_samp = 4;
    let n_trials = 40000;
    let mut mean = Array2::<f64>::zeros(sub_weights.dim());
    for _ in 0..n_trials {
        let samples = comp_sub(&Loopback, &values, &n_div, &sub_weights, &mut keep, None, n_samp, &mut wt_remain, &mut rng).unwrap();
        assert_eq!(samples.len(), n_samp);
        for s in samples {
            mean[(s.parent, s.sub)] += s.weight / n_trials as f64;
        }
    }
    for i in 0..values.len() {
        for j in 0..sub_weights.ncols() {
            let expected = if n_div[i] > 0 {
                if j < n_div[i] { values[i] / n_div[i] as f64 } else { 0.0 }
            } else {
                values[i] * sub_weights[(i, j)]
            };
            assert!((mean[(i, j)] - expected).abs() < 0.03, "({}, {}): {} vs {}", i, j, mean[(i, j)], expected);
        }
    }
}

#[test]
fn hierarchical_compression_over_shards_hits_exact_count() {
    let n_samp = 9;
    for trial in 0..5u64 {
        let counts = run_group(2, |comm| {
            let mut rng = SmallRng::seed_from_u64(50 + trial * 7 + comm.rank() as u64);
            let n_rows = 8;
            let values: Vec<f64> = (0..n_rows).map(|_| rng.gen::<f64>() + 0.05).collect();
            let n_div: Vec<usize> = (0..n_rows).map(|i| if i % 3 == 0 { 4 } else { 0 }).collect();
            let mut sub_weights = Array2::<f64>::zeros((n_rows, 3));
            for i in 0..n_rows {
                sub_weights[(i, 0)] = 0.5;
                sub_weights[(i, 1)] = 0.3;
                sub_weights[(i, 2)] = 0.2;
            }
            let mut keep = Array2::from_elem((n_rows, 3), false);
            let mut wt_remain = vec![0.0; n_rows];
            comp_sub(&comm, &values, &n_div, &sub_weights, &mut keep, None, n_samp, &mut wt_remain, &mut rng).unwrap().len()
        });
        assert_eq!(counts.iter().sum::<usize>(), n_samp);
    }
}
