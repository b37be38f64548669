// error.rs
use std::io;
use std::path::PathBuf;

/// Errors raised by vector storage, compression and the surrounding I/O.
#[derive(Debug, thiserror::Error)]
pub enum FriError {
    /// A key decoded to the wrong number of occupied orbitals. Storage is corrupt.
    #[error("determinant {key} has {found} occupied orbitals, expected {expected}")]
    ParticleCount { key: String, found: usize, expected: usize },

    /// A key has an orbital set beyond the basis. Storage is corrupt.
    #[error("determinant {key} occupies orbital {orb}, outside a basis of {n_bits}")]
    OrbitalOutOfRange { key: String, orb: usize, n_bits: usize },

    #[error("too many elements added to buffer for shard {shard} (capacity {capacity}); perform_add must be called more frequently")]
    AdderOverflow { shard: usize, capacity: usize },

    #[error("value column {idx} out of bounds for vector with {n_vecs} columns")]
    ColumnOutOfBounds { idx: usize, n_vecs: usize },

    #[error("dimension mismatch in {context}: {left} vs {right}")]
    DimensionMismatch { context: &'static str, left: usize, right: usize },

    #[error("invalid probability {0}")]
    InvalidProbability(f64),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {path} at entry {line}: {reason}")]
    Parse { path: PathBuf, line: usize, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("input file error: {0}")]
    Lua(#[from] rlua::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FriError>;

impl FriError {
    /// Wrap an `io::Error` with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FriError::Io { path: path.into(), source }
    }
}
