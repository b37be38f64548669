// main.rs
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fri_rs::bits::{self, key_from_orbs, read_bit, Orb};
use fri_rs::collective::{broadcast, max_usize, sum_f64, sum_usize, Collective};
use fri_rs::compress::compress_vec;
use fri_rs::distvec::{DistVec, DistVecConfig};
use fri_rs::hash::Scrambler;
use fri_rs::input::{load_input, Input};
use fri_rs::io::{load_proc_hash, load_vec_txt, read_dets, save_proc_hash};
use fri_rs::stochastic::{rank_rng, ShiftController};
use fri_rs::{FriError, Result};

// Column receiving off-diagonal contributions during a step.
const SPAWN_COL: usize = 1;

/// One-dimensional Hubbard chain with periodic boundaries. Orbital `s` is the spin-up electron on
/// site `s`, orbital `n_sites + s` the spin-down electron on the same site.
#[derive(Clone, Copy)]
struct Hubbard {
    n_sites: usize,
    n_bytes: usize,
    hopping: f64,
    interaction: f64,
}

impl Hubbard {
    /// On-site repulsion: U times the number of doubly occupied sites.
    fn diag(&self, orbs: &[Orb]) -> f64 {
        let n_sites = self.n_sites as Orb;
        let n_double = orbs.iter().filter(|&&o| o < n_sites && orbs.binary_search(&(o + n_sites)).is_ok()).count();
        self.interaction * n_double as f64
    }

    /// Off-diagonal elements connected to a key by a single nearest-neighbour hop, as
    /// `(new key, -t * fermion sign)`.
    fn hops(&self, key: &[u8], orbs: &[Orb], out: &mut Vec<(Vec<u8>, f64)>) {
        out.clear();
        let l = self.n_sites;
        for &o in orbs {
            let o = o as usize;
            let (block, site) = (o / l * l, o % l);
            let mut targets = [(site + 1) % l, (site + l - 1) % l];
            if targets[0] == targets[1] {
                targets[1] = site;
            }
            for t in targets {
                let dest = block + t;
                if t == site || read_bit(key, dest) {
                    continue;
                }
                let (lo, hi) = (o.min(dest), o.max(dest));
                let n_between = (lo + 1..hi).filter(|&b| read_bit(key, b)).count();
                let sign = if n_between % 2 == 0 { 1.0 } else { -1.0 };
                let mut new_key = key.to_vec();
                bits::zero_bit(&mut new_key, o);
                bits::set_bit(&mut new_key, dest);
                out.push((new_key, -self.hopping * sign));
            }
        }
    }

    /// Lowest `n_elec / 2` sites filled in each spin.
    fn reference(&self, n_elec: usize) -> Vec<u8> {
        let half = n_elec / 2;
        let orbs: Vec<Orb> = (0..half).chain(self.n_sites..self.n_sites + half).map(|o| o as Orb).collect();
        key_from_orbs(&orbs, self.n_bytes)
    }
}

// Append-only text trace of one quantity, one value per line.
struct Trace {
    path: PathBuf,
    out: BufWriter<File>,
}

impl Trace {
    fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path).map_err(|e| FriError::io(&path, e))?;
        Ok(Self { path, out: BufWriter::new(file) })
    }

    fn line(&mut self, v: impl Display) -> Result<()> {
        writeln!(self.out, "{}", v).map_err(|e| FriError::io(&self.path, e))
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| FriError::io(&self.path, e))
    }
}

// Output files written by rank 0.
struct Recorder {
    num: Trace,
    den: Trace,
    shift: Trace,
    norm: Trace,
    nonz: Trace,
}

impl Recorder {
    fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            num: Trace::open(dir, "projnum.txt")?,
            den: Trace::open(dir, "projden.txt")?,
            shift: Trace::open(dir, "S.txt")?,
            norm: Trace::open(dir, "norm.txt")?,
            nonz: Trace::open(dir, "nnonz.txt")?,
        })
    }

    fn flush(&mut self) -> Result<()> {
        for t in [&mut self.num, &mut self.den, &mut self.shift, &mut self.norm, &mut self.nonz] {
            t.flush()?;
        }
        Ok(())
    }
}

fn write_params(dir: &Path, input: &Input, origin: &str) -> Result<()> {
    let path = dir.join("params.txt");
    let text = format!(
        "FRI calculation\nHubbard chain: {} sites, {} electrons, t = {}, U = {}\nepsilon (imaginary time step): {}\nTarget norm: {}\nInitiator threshold: {}\nVector nonzero: {}\n{}\n",
        input.system.n_sites, input.system.n_elec, input.system.hopping, input.system.interaction, input.fri.eps,
        input.fri.target_norm, input.fri.init_thresh, input.fri.target_nonz, origin
    );
    fs::write(&path, text).map_err(|e| FriError::io(&path, e))
}

/// Add `vals` at flat `keys` in rounds small enough for the adder. Collective.
fn add_chunked(comm: &impl Collective, vec: &mut DistVec<f64>, keys: &[u8], vals: &[f64], chunk: usize) -> Result<()> {
    let n = vals.len();
    let n_bytes = vec.n_bytes();
    let n_rounds = max_usize(comm, n.div_ceil(chunk))?;
    for round in 0..n_rounds {
        let start = (round * chunk).min(n);
        let end = ((round + 1) * chunk).min(n);
        for i in start..end {
            vec.add(&keys[i * n_bytes..(i + 1) * n_bytes], vals[i], true)?;
        }
        vec.perform_add(comm, vec.curr_vec_idx())?;
    }
    Ok(())
}

/// Apply `1 - eps (H - shift)` to column 0. Off-diagonal contributions are routed through the
/// adder into the spawn column, subject to the initiator rule against column 0, then merged.
/// # Arguments:
///   `comm`: Collective, communicator.
///   `sol`: DistVec<f64>, solution vector with a spawn column.
///   `hub`: Hubbard, Hamiltonian.
///   `shift`: f64, energy shift.
///   `eps`: f64, time step.
///   `init_thresh`: f64, magnitude above which an element is an initiator.
///   `chunk`: usize, parent elements processed between flushes.
fn propagate(comm: &impl Collective, sol: &mut DistVec<f64>, hub: &Hubbard, shift: f64, eps: f64, init_thresh: f64,
             chunk: usize) -> Result<()> {
    let parents: Vec<usize> = sol.active_positions().filter(|&p| sol.column(0).map_or(false, |c| c[p] != 0.0)).collect();
    let n = parents.len();
    let n_rounds = max_usize(comm, n.div_ceil(chunk))?;
    let mut hops = Vec::new();
    sol.set_curr_vec_idx(SPAWN_COL)?;
    for round in 0..n_rounds {
        let start = (round * chunk).min(n);
        let end = ((round + 1) * chunk).min(n);
        for &p in &parents[start..end] {
            let x = sol.column(0)?[p];
            let ini = x.abs() > init_thresh;
            hub.hops(sol.key_at(p), sol.orbs_at(p), &mut hops);
            for (key, el) in hops.drain(..) {
                sol.add(&key, -eps * el * x, ini)?;
            }
        }
        sol.perform_add(comm, 0)?;
    }

    sol.set_curr_vec_idx(0)?;
    let active: Vec<usize> = sol.active_positions().collect();
    for p in active {
        let x = sol.value(p);
        if x != 0.0 {
            let d = sol.matr_el_at_pos(p).unwrap_or(0.0);
            sol.set_value(p, x * (1.0 - eps * (d - shift)));
        }
    }
    sol.add_vecs(0, SPAWN_COL)?;
    sol.zero_vec(SPAWN_COL)?;
    sol.cleanup();
    Ok(())
}

fn run(comm: &impl Collective, input_path: &str) -> Result<()> {
    let input = load_input(input_path)?;
    let irank = comm.rank();
    let n_orb = input.n_orb();
    let n_elec = input.system.n_elec;
    let hub = Hubbard {
        n_sites: input.system.n_sites,
        n_bytes: bits::n_bytes(n_orb),
        hopping: input.system.hopping,
        interaction: input.system.interaction,
    };
    let max_hops = 2 * n_elec;
    if input.vector.adder_capacity < max_hops + 1 {
        return Err(FriError::Config(format!("vector.adder_capacity must be at least {}", max_hops + 1)));
    }
    let chunk = input.vector.adder_capacity / max_hops;

    let result_dir = PathBuf::from(&input.io.result_dir);
    if irank == 0 {
        fs::create_dir_all(&result_dir).map_err(|e| FriError::io(&result_dir, e))?;
    }
    let mut rng = rank_rng(input.fri.seed, irank);

    // Every shard must route keys with the same salt.
    let mut router_salt = if irank == 0 {
        match &input.io.load_dir {
            Some(dir) => load_proc_hash(Path::new(dir), n_orb)?,
            None => Scrambler::random(n_orb, &mut rng),
        }
    } else {
        Scrambler::from_vec(Vec::new())
    };
    broadcast(comm, 0, &mut router_salt)?;
    if irank == 0 {
        save_proc_hash(&result_dir, &router_salt)?;
    }

    let config = DistVecConfig {
        capacity: input.vector.capacity,
        adder_capacity: input.vector.adder_capacity,
        n_bits: n_orb,
        n_elec,
        n_vecs: 2,
    };
    let mut sol = DistVec::<f64>::new(config.clone(), comm, router_salt.clone(), Scrambler::random(n_orb, &mut rng))
        .with_diag(Box::new(move |orbs: &[Orb]| hub.diag(orbs)));

    let ref_key = hub.reference(n_elec);
    let origin = match &input.io.load_dir {
        Some(dir) => {
            sol.load(comm, Path::new(dir))?;
            format!("Restarting calculation from {}", dir)
        }
        None => {
            if let Some(path) = &input.io.dense {
                let keys = if irank == 0 { read_dets(Path::new(path), hub.n_bytes)? } else { Vec::new() };
                let n_dense = sol.init_dense(comm, &keys, Some(result_dir.as_path()))?;
                info!(rank = irank, n_dense, "loaded dense subspace");
            }
            let origin = match &input.io.ini_vec {
                Some(prefix) => format!("Initializing calculation from vector at path {}", prefix),
                None => "Initializing calculation from reference unit vector".to_string(),
            };
            // Rank 0 reads the initial elements; perform_add routes them to their owners.
            let (keys, vals) = match (&input.io.ini_vec, irank) {
                (Some(prefix), 0) => {
                    let v = load_vec_txt::<f64>(prefix, hub.n_bytes)?;
                    (v.keys, v.vals)
                }
                (None, 0) => (ref_key.clone(), vec![1.0]),
                _ => (Vec::new(), Vec::new()),
            };
            add_chunked(comm, &mut sol, &keys, &vals, input.vector.adder_capacity)?;
            origin
        }
    };
    if sum_usize(comm, sol.n_nonz())? == 0 {
        return Err(FriError::Config("initial vector is empty".into()));
    }

    // Trial vector in column 0 and H times trial in column 1, replicated on every shard.
    let trial_cfg = DistVecConfig { capacity: max_hops + 1, adder_capacity: max_hops + 1, n_vecs: 2, ..config };
    let mut trial = DistVec::<f64>::new(trial_cfg, comm, router_salt, Scrambler::random(n_orb, &mut rng));
    let mut ref_orbs = Vec::new();
    bits::find_bits(&ref_key, &mut ref_orbs);
    let mut hops = Vec::new();
    hub.hops(&ref_key, &ref_orbs, &mut hops);
    if irank == 0 {
        trial.add(&ref_key, 1.0, true)?;
    }
    trial.perform_add(comm, 0)?;
    trial.set_curr_vec_idx(1)?;
    if irank == 0 {
        trial.add(&ref_key, hub.diag(&ref_orbs), true)?;
        for (key, el) in &hops {
            trial.add(key, *el, true)?;
        }
    }
    trial.perform_add(comm, 1)?;
    trial.collect_procs(comm)?;
    let trial_pos: Vec<usize> = trial.active_positions().collect();
    let trial_keys: Vec<u8> = trial_pos.iter().flat_map(|&p| trial.key_at(p).to_vec()).collect();
    let trial_vals: Vec<f64> = trial_pos.iter().map(|&p| trial.column(0).map(|c| c[p])).collect::<Result<_>>()?;
    let htrial_vals: Vec<f64> = trial_pos.iter().map(|&p| trial.column(1).map(|c| c[p])).collect::<Result<_>>()?;
    let trial_hashes = sol.hashes_for(&trial_keys)?;

    let n_dense = sum_usize(comm, sol.n_dense())?;
    let budget = input.fri.target_nonz.saturating_sub(n_dense).max(1);
    let damping = input.fri.shift_damping / input.fri.shift_interval as f64 / input.fri.eps;
    let mut ctl = ShiftController::new(input.fri.initial_shift, input.fri.target_norm, damping);

    let mut rec = if irank == 0 {
        write_params(&result_dir, &input, &origin)?;
        Some(Recorder::open(&result_dir)?)
    } else {
        None
    };
    if irank == 0 {
        println!("{}", "=".repeat(72));
        println!("{:<8} {:>14} {:>14} {:>14} {:>10}", "iter", "E", "S", "||v||_1", "nonz");
    }

    let t_start = Instant::now();
    for it in 0..input.fri.max_iter {
        propagate(comm, &mut sol, &hub, ctl.shift, input.fri.eps, input.fri.init_thresh, chunk)?;
        let comp = compress_vec(comm, &mut sol, budget, &mut rng)?;
        let glob_norm = comp.norm_before + sum_f64(comm, sol.dense_norm())?;

        let shift_step = (it + 1) % input.fri.shift_interval == 0;
        if shift_step {
            ctl.update(glob_norm);
        }

        let num = sum_f64(comm, sol.dot_hashed(&trial_keys, &htrial_vals, &trial_hashes)?)?;
        let den = sum_f64(comm, sol.dot_hashed(&trial_keys, &trial_vals, &trial_hashes)?)?;
        let n_nonz = sum_usize(comm, sol.n_nonz())?;
        if let Some(r) = rec.as_mut() {
            r.num.line(num)?;
            r.den.line(den)?;
            r.nonz.line(n_nonz)?;
            if shift_step {
                r.shift.line(ctl.shift)?;
                r.norm.line(glob_norm)?;
            }
            println!("{:<8} {:>14.8} {:>14.8} {:>14.6} {:>10}", it, num / den, ctl.shift, glob_norm, n_nonz);
        }

        if (it + 1) % input.io.save_interval == 0 {
            sol.save(comm, &result_dir)?;
            if let Some(r) = rec.as_mut() {
                r.flush()?;
            }
        }
    }
    sol.save(comm, &result_dir)?;
    if let Some(r) = rec.as_mut() {
        r.flush()?;
    }
    let n_coh = sol.tot_sgn_coh(comm)?;
    if irank == 0 {
        println!("{}", "=".repeat(72));
        println!("Non-initiator additions accepted: {}", n_coh);
        println!("Total time: {:?}", t_start.elapsed());
    }
    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let input_path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("Usage: fri-rs <input.lua>");
            std::process::exit(1);
        }
    };

    #[cfg(feature = "mpi")]
    let universe = match mpi::initialize() {
        Some(u) => u,
        None => {
            eprintln!("Failed to initialise MPI");
            std::process::exit(1);
        }
    };
    #[cfg(feature = "mpi")]
    let comm = fri_rs::mpiutils::MpiComm::new(universe.world());
    #[cfg(not(feature = "mpi"))]
    let comm = fri_rs::collective::Loopback;

    if let Err(e) = run(&comm, &input_path) {
        eprintln!("Error on rank {}: {}", comm.rank(), e);
        std::process::exit(1);
    }
}
