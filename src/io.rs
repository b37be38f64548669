// io.rs
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::bits::key_from_u64;
use crate::error::{FriError, Result};
use crate::hash::Scrambler;
use crate::Amplitude;

/// A small sparse vector read from text files.
#[derive(Clone, Debug, PartialEq)]
pub struct TextVector<T> {
    // Keys stored flat, `n_bytes` each.
    pub keys: Vec<u8>,
    pub vals: Vec<T>,
    pub n_bytes: usize,
}

impl<T> TextVector<T> {
    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    pub fn key(&self, i: usize) -> &[u8] {
        &self.keys[i * self.n_bytes..(i + 1) * self.n_bytes]
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| FriError::io(path, e))
}

// Parse whitespace separated tokens, reporting the failing token's position.
fn parse_tokens<V: std::str::FromStr>(path: &Path, text: &str) -> Result<Vec<V>> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(i, t)| {
            t.parse::<V>().map_err(|_| FriError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                reason: format!("cannot parse '{}'", t),
            })
        })
        .collect()
}

/// Read keys stored as decimal integers of at most 64 bits, whitespace separated.
/// # Arguments:
///   `path`: Path, file to read.
///   `n_bytes`: usize, key width in bytes.
pub fn read_dets(path: &Path, n_bytes: usize) -> Result<Vec<u8>> {
    let ints: Vec<u64> = parse_tokens(path, &read_text(path)?)?;
    let mut keys = Vec::with_capacity(ints.len() * n_bytes);
    for v in ints {
        keys.extend(key_from_u64(v, n_bytes));
    }
    Ok(keys)
}

/// Load a vector from `<prefix>dets` (decimal keys) and `<prefix>vals`. Entries are paired in
/// order until either file runs out. A missing file yields an empty vector with a warning.
/// # Arguments:
///   `prefix`: str, path prefix of the two files.
///   `n_bytes`: usize, key width in bytes.
pub fn load_vec_txt<T: Amplitude>(prefix: &str, n_bytes: usize) -> Result<TextVector<T>> {
    let dets_path = PathBuf::from(format!("{}dets", prefix));
    let vals_path = PathBuf::from(format!("{}vals", prefix));
    let mut empty = TextVector { keys: Vec::new(), vals: Vec::new(), n_bytes };
    for p in [&dets_path, &vals_path] {
        if !p.exists() {
            warn!(path = %p.display(), "could not find text vector file");
            return Ok(empty);
        }
    }
    let ints: Vec<u64> = parse_tokens(&dets_path, &read_text(&dets_path)?)?;
    let vals: Vec<T> = parse_tokens(&vals_path, &read_text(&vals_path)?)?;
    let n = ints.len().min(vals.len());
    empty.keys.reserve(n * n_bytes);
    for &v in &ints[..n] {
        empty.keys.extend(key_from_u64(v, n_bytes));
    }
    empty.vals = vals[..n].to_vec();
    Ok(empty)
}

/// Write the dense subspace size of every shard as one comma separated line.
pub fn write_dense_sizes(path: &Path, sizes: &[usize]) -> Result<()> {
    let line = sizes.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",");
    fs::write(path, format!("{}\n", line)).map_err(|e| FriError::io(path, e))
}

pub fn read_dense_sizes(path: &Path) -> Result<Vec<usize>> {
    parse_tokens(path, &read_text(path)?)
}

/// Save the shard routing salt to `dir/hash.dat` as little-endian u32 values.
pub fn save_proc_hash(dir: &Path, salt: &Scrambler) -> Result<()> {
    let path = dir.join("hash.dat");
    let bytes: Vec<u8> = salt.as_slice().iter().flat_map(|s| s.to_le_bytes()).collect();
    fs::write(&path, bytes).map_err(|e| FriError::io(&path, e))
}

/// Load a salt saved by `save_proc_hash`. Fails if it holds fewer than `n_bits` entries.
pub fn load_proc_hash(dir: &Path, n_bits: usize) -> Result<Scrambler> {
    let path = dir.join("hash.dat");
    let bytes = fs::read(&path).map_err(|e| FriError::io(&path, e))?;
    let salt: Vec<u32> = bytes
        .chunks_exact(4)
        .take(n_bits)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if salt.len() < n_bits {
        return Err(FriError::Parse { path, line: salt.len(), reason: format!("expected {} salt entries", n_bits) });
    }
    Ok(Scrambler::from_vec(salt))
}
