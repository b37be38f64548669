use std::collections::HashMap;

use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use fri_rs::bits::key_from_orbs;
use fri_rs::collective::{run_group, Collective, Loopback};
use fri_rs::compress::compress_vec;
use fri_rs::distvec::{DistVec, DistVecConfig};
use fri_rs::hash::Scrambler;
use fri_rs::Amplitude;

const N_BITS: usize = 12;

fn config(capacity: usize, adder_capacity: usize, n_vecs: usize) -> DistVecConfig {
    DistVecConfig { capacity, adder_capacity, n_bits: N_BITS, n_elec: 2, n_vecs }
}

// Every shard derives the same router salt; index salts differ per shard.
fn new_vec<T: Amplitude>(comm: &impl Collective, cfg: DistVecConfig) -> DistVec<T> {
    let router = Scrambler::random(N_BITS, &mut SmallRng::seed_from_u64(42));
    let index = Scrambler::random(N_BITS, &mut SmallRng::seed_from_u64(100 + comm.rank() as u64));
    DistVec::new(cfg, comm, router, index)
}

// All two-particle keys over N_BITS orbitals, in a fixed order.
fn all_keys() -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    for a in 0..N_BITS as u16 {
        for b in a + 1..N_BITS as u16 {
            keys.push(key_from_orbs(&[a, b], 2));
        }
    }
    keys
}

proptest! {
    #[test]
    fn index_stays_bijective(ops in prop::collection::vec((0usize..20, -3i64..=3), 1..80)) {
        let keys = all_keys();
        let mut v: DistVec<i64> = new_vec(&Loopback, config(4, 8, 1));
        let mut model: HashMap<usize, i64> = HashMap::new();
        for (k, val) in ops {
            v.add(&keys[k], val, true).unwrap();
            v.perform_add(&Loopback, 0).unwrap();
            let e = model.entry(k).or_insert(0);
            *e += val;
            if *e == 0 {
                model.remove(&k);
            }
        }
        prop_assert_eq!(v.n_nonz(), model.len());
        for p in v.active_positions() {
            prop_assert_eq!(v.lookup(v.key_at(p)).unwrap(), Some(p));
        }
        for (k, key) in keys.iter().enumerate().take(20) {
            match model.get(&k) {
                Some(val) => {
                    let p = v.lookup(key).unwrap().unwrap();
                    prop_assert_eq!(v.value(p), *val);
                }
                None => prop_assert_eq!(v.lookup(key).unwrap(), None),
            }
        }
    }
}

#[test]
fn compression_leaves_dense_subspace_alone() {
    let keys = all_keys();
    let mut v: DistVec<f64> = new_vec(&Loopback, config(8, 64, 1));
    let dense: Vec<u8> = keys[..3].concat();
    assert_eq!(v.init_dense(&Loopback, &dense, None).unwrap(), 3);

    let mut rng = SmallRng::seed_from_u64(3);
    for (i, k) in keys.iter().enumerate().take(23) {
        let val = if i < 3 { 0.01 * (i + 1) as f64 } else { rng.gen::<f64>() * 0.9 + 0.1 };
        v.add(k, val, true).unwrap();
    }
    v.perform_add(&Loopback, 0).unwrap();
    let dense_before: Vec<f64> = v.values()[..3].to_vec();

    for _ in 0..10 {
        let comp = compress_vec(&Loopback, &mut v, 5, &mut rng).unwrap();
        assert_eq!(v.values()[..3], dense_before[..]);
        let outside = (3..v.curr_size()).filter(|&p| v.is_active(p) && v.value(p) != 0.0).count();
        assert_eq!(outside, 5);
        assert_eq!(v.n_nonz(), 8);
        assert!((comp.norm_after - v.local_norm() + v.dense_norm()).abs() < 1e-9);
    }
}

#[test]
fn checkpoint_round_trip() {
    let keys = all_keys();
    let dir = tempfile::tempdir().unwrap();
    let mut v: DistVec<f64> = new_vec(&Loopback, config(4, 32, 2));
    for (i, k) in keys.iter().enumerate().take(10) {
        v.add(k, i as f64 + 0.5, true).unwrap();
    }
    v.perform_add(&Loopback, 0).unwrap();
    v.copy_vec(0, 1).unwrap();
    v.weight_vec(1, -2.0).unwrap();
    // A slot that is zero in every column is dropped on load.
    let dropped = v.lookup(&keys[4]).unwrap().unwrap();
    v.set_value(dropped, 0.0);
    v.set_curr_vec_idx(1).unwrap();
    v.set_value(dropped, 0.0);
    v.set_curr_vec_idx(0).unwrap();
    v.save(&Loopback, dir.path()).unwrap();

    let mut w: DistVec<f64> = new_vec(&Loopback, config(2, 32, 2));
    assert_eq!(w.load(&Loopback, dir.path()).unwrap(), 0);
    assert_eq!(w.n_nonz(), 9);
    assert_eq!(w.lookup(&keys[4]).unwrap(), None);
    for (i, k) in keys.iter().enumerate().take(10).filter(|(i, _)| *i != 4) {
        let p = w.lookup(k).unwrap().unwrap();
        assert_eq!(w.column(0).unwrap()[p], i as f64 + 0.5);
        assert_eq!(w.column(1).unwrap()[p], -2.0 * (i as f64 + 0.5));
    }
}

#[test]
fn cross_shard_addition_routes_to_owners() {
    let keys = all_keys();
    let n_keys = 30;
    let n_shards = 3;
    let results = run_group(n_shards, |comm| {
        let mut v: DistVec<f64> = new_vec(&comm, config(8, 64, 1));
        for k in keys.iter().take(n_keys) {
            v.add(k, 1.0, true).unwrap();
        }
        v.perform_add(&comm, 0).unwrap();
        for p in v.active_positions() {
            assert_eq!(v.idx_to_proc(v.key_at(p)).unwrap(), comm.rank());
            assert_eq!(v.value(p), n_shards as f64);
        }
        let owned = v.n_nonz();

        v.collect_procs(&comm).unwrap();
        for k in keys.iter().take(n_keys) {
            let p = v.lookup(k).unwrap().unwrap();
            assert_eq!(v.value(p), n_shards as f64);
        }
        (owned, v.n_nonz())
    });
    assert_eq!(results.iter().map(|r| r.0).sum::<usize>(), n_keys);
    assert!(results.iter().all(|r| r.1 == n_keys));
}

#[test]
fn distributed_dot_matches_serial() {
    let keys = all_keys();
    let n_keys = 40;
    let f = |i: usize| (i as f64 * 0.37).sin();
    let g = |i: usize| 1.0 + (i % 5) as f64;
    // Foreign vector covers every other key plus some the vector does not hold.
    let foreign: Vec<usize> = (0..keys.len()).filter(|i| i % 2 == 0).collect();
    let expected: f64 = foreign.iter().filter(|&&i| i < n_keys).map(|&i| f(i) * g(i)).sum();

    let results = run_group(2, |comm| {
        let chunk = 4;
        let mut v: DistVec<f64> = new_vec(&comm, config(8, chunk, 1));
        // Rank 0 feeds the vector in rounds no larger than the buffer.
        let mine: Vec<usize> = if comm.rank() == 0 { (0..n_keys).collect() } else { Vec::new() };
        for round in 0..n_keys.div_ceil(chunk) {
            for &i in mine.iter().skip(round * chunk).take(chunk) {
                v.add(&keys[i], f(i), true).unwrap();
            }
            v.perform_add(&comm, 0).unwrap();
        }
        let held: Vec<usize> = foreign.iter().copied().filter(|i| i % 4 == 2 * comm.rank()).collect();
        let flat: Vec<u8> = held.iter().flat_map(|&i| keys[i].clone()).collect();
        let vals: Vec<f64> = held.iter().map(|&i| g(i)).collect();
        v.multi_dot(&comm, &flat, &vals).unwrap()
    });
    for r in results {
        assert!((r - expected).abs() < 1e-12, "{} vs {}", r, expected);
    }
}

#[test]
fn multi_shard_vector_compression_hits_target() {
    let keys = all_keys();
    let n_samp = 12;
    let counts = run_group(3, |comm| {
        let mut v: DistVec<f64> = new_vec(&comm, config(8, 64, 1));
        let mut rng = SmallRng::seed_from_u64(comm.rank() as u64);
        if comm.rank() == 0 {
            for (i, k) in keys.iter().enumerate().take(50) {
                v.add(k, if i % 2 == 0 { 0.5 } else { -0.25 }, true).unwrap();
            }
        }
        v.perform_add(&comm, 0).unwrap();
        compress_vec(&comm, &mut v, n_samp, &mut rng).unwrap();
        v.n_nonz()
    });
    assert_eq!(counts.iter().sum::<usize>(), n_samp);
}
