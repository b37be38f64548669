use rlua::{Lua, Table};
use std::fs;

use crate::error::{FriError, Result};

// Storage for the model Hamiltonian: a Hubbard chain with periodic boundaries.
pub struct SystemOptions {
    pub n_sites: usize,
    pub n_elec: usize,
    pub hopping: f64,
    pub interaction: f64,
}

// Storage for vector sizes.
pub struct VectorOptions {
    pub capacity: usize,
    pub adder_capacity: usize,
}

// Storage for FRI iteration options.
pub struct FriOptions {
    pub target_nonz: usize,
    pub eps: f64,
    pub max_iter: usize,
    pub init_thresh: f64,
    pub shift_interval: usize,
    pub shift_damping: f64,
    pub target_norm: f64,
    pub initial_shift: f64,
    pub seed: Option<u64>,
}

// Storage for input and output locations.
pub struct IoOptions {
    pub result_dir: String,
    pub load_dir: Option<String>,
    pub ini_vec: Option<String>,
    pub dense: Option<String>,
    pub save_interval: usize,
}

/// Storage for Input file parameters.
pub struct Input {
    pub system: SystemOptions,
    pub vector: VectorOptions,
    pub fri: FriOptions,
    pub io: IoOptions,
}

impl Input {
    /// Number of single-particle basis functions, one per site and spin.
    pub fn n_orb(&self) -> usize {
        2 * self.system.n_sites
    }
}

/// Read input parameters from lua file and assign to Input object.
/// # Arguments
///   path: str, file path to input file.
pub fn load_input(path: &str) -> Result<Input> {
    let src = fs::read_to_string(path).map_err(|e| FriError::io(path, e))?;
    parse_input(&src)
}

/// Evaluate Lua source and read the `system`, `vector`, `fri` and `io` tables.
/// # Arguments
///   src: str, Lua source.
pub fn parse_input(src: &str) -> Result<Input> {
    let lua = Lua::new();
    lua.load(src).exec()?;
    let globals = lua.globals();

    // Table headers.
    let sys_tbl: Table = globals.get("system")?;
    let vec_tbl: Table = globals.get("vector")?;
    let fri_tbl: Table = globals.get("fri")?;
    let io_tbl: Table = globals.get("io")?;

    // System table.
    let system = SystemOptions {
        n_sites: sys_tbl.get("n_sites")?,
        n_elec: sys_tbl.get("n_elec")?,
        hopping: sys_tbl.get::<_, Option<f64>>("hopping")?.unwrap_or(1.0),
        interaction: sys_tbl.get("interaction")?,
    };
    if system.n_sites < 2 || 2 * system.n_sites > u16::MAX as usize {
        return Err(FriError::Config(format!("system.n_sites must be between 2 and {}", u16::MAX / 2)));
    }
    if system.n_elec % 2 != 0 || system.n_elec == 0 || system.n_elec > 2 * system.n_sites {
        return Err(FriError::Config("system.n_elec must be even, positive and at most 2 * n_sites".into()));
    }

    // Vector table. The adder defaults to a quarter of the vector.
    let capacity: usize = vec_tbl.get("capacity")?;
    let adder_capacity = vec_tbl.get::<_, Option<usize>>("adder_capacity")?.unwrap_or((capacity / 4).max(1));
    if capacity == 0 {
        return Err(FriError::Config("vector.capacity must be positive".into()));
    }
    let vector = VectorOptions { capacity, adder_capacity };

    // FRI table.
    let fri = FriOptions {
        target_nonz: fri_tbl.get("target_nonz")?,
        eps: fri_tbl.get("eps")?,
        max_iter: fri_tbl.get("max_iter")?,
        init_thresh: fri_tbl.get::<_, Option<f64>>("init_thresh")?.unwrap_or(0.0),
        shift_interval: fri_tbl.get::<_, Option<usize>>("shift_interval")?.unwrap_or(10),
        shift_damping: fri_tbl.get::<_, Option<f64>>("shift_damping")?.unwrap_or(0.05),
        target_norm: fri_tbl.get::<_, Option<f64>>("target_norm")?.unwrap_or(0.0),
        initial_shift: fri_tbl.get::<_, Option<f64>>("initial_shift")?.unwrap_or(0.0),
        seed: fri_tbl.get("seed")?,
    };
    if fri.target_nonz == 0 || !(fri.eps > 0.0) || fri.shift_interval == 0 {
        return Err(FriError::Config("fri.target_nonz, fri.eps and fri.shift_interval must be positive".into()));
    }

    // IO table.
    let io = IoOptions {
        result_dir: io_tbl.get("result_dir")?,
        load_dir: io_tbl.get("load_dir")?,
        ini_vec: io_tbl.get("ini_vec")?,
        dense: io_tbl.get("dense")?,
        save_interval: io_tbl.get::<_, Option<usize>>("save_interval")?.unwrap_or(1000),
    };

    Ok(Input { system, vector, fri, io })
}
