// bits.rs
use std::fmt::Write;

use crate::error::{FriError, Result};

// Index of a single-particle basis function (orbital) within a key.
pub type Orb = u16;

/// Number of bytes needed to store a key of `n_bits` orbitals.
/// # Arguments:
///   `n_bits`: usize, number of single-particle basis functions.
pub fn n_bytes(n_bits: usize) -> usize {
    n_bits.div_ceil(8)
}

/// Whether orbital `idx` is occupied in `key`.
pub fn read_bit(key: &[u8], idx: usize) -> bool {
    key[idx / 8] & (1 << (idx % 8)) != 0
}

pub fn set_bit(key: &mut [u8], idx: usize) {
    key[idx / 8] |= 1 << (idx % 8);
}

pub fn zero_bit(key: &mut [u8], idx: usize) {
    key[idx / 8] &= !(1 << (idx % 8));
}

/// Decode a key into the ascending list of its occupied orbitals. The list is cleared first.
/// Returns the number of occupied orbitals found.
/// # Arguments:
///   `key`: [u8], bit key, bit i stored in byte i / 8.
///   `out`: Vec<Orb>, buffer receiving the occupied orbitals.
pub fn find_bits(key: &[u8], out: &mut Vec<Orb>) -> usize {
    out.clear();
    for (byte_idx, &byte) in key.iter().enumerate() {
        let mut rem = byte;
        while rem != 0 {
            let bit = rem.trailing_zeros() as usize;
            out.push((byte_idx * 8 + bit) as Orb);
            // Clear lowest set bit.
            rem &= rem - 1;
        }
    }
    out.len()
}

/// Decode a key and fail if it does not hold exactly `n_elec` particles, all below `n_bits`.
/// # Arguments:
///   `key`: [u8], bit key.
///   `n_bits`: usize, number of single-particle basis functions.
///   `n_elec`: usize, expected particle count.
///   `out`: Vec<Orb>, buffer receiving the occupied orbitals.
pub fn decode_checked(key: &[u8], n_bits: usize, n_elec: usize, out: &mut Vec<Orb>) -> Result<()> {
    let found = find_bits(key, out);
    if found != n_elec {
        return Err(FriError::ParticleCount { key: key_to_hex(key), found, expected: n_elec });
    }
    // Orbitals are ascending, so only the last can overflow.
    if let Some(&orb) = out.last().filter(|&&o| o as usize >= n_bits) {
        return Err(FriError::OrbitalOutOfRange { key: key_to_hex(key), orb: orb as usize, n_bits });
    }
    Ok(())
}

/// Hex rendering of a key, highest byte first.
pub fn key_to_hex(key: &[u8]) -> String {
    let mut s = String::with_capacity(2 * key.len());
    for byte in key.iter().rev() {
        let _ = write!(s, "{:02x}", byte);
    }
    s
}

/// Build a key from an integer, least significant byte first. Keys wider than 8 bytes have their
/// upper bytes zeroed.
/// # Arguments:
///   `val`: u64, integer encoding of the key.
///   `n_bytes`: usize, key width in bytes.
pub fn key_from_u64(val: u64, n_bytes: usize) -> Vec<u8> {
    let mut key = vec![0u8; n_bytes];
    for (i, b) in val.to_le_bytes().iter().enumerate().take(n_bytes) {
        key[i] = *b;
    }
    key
}

/// Build a key with the given orbitals occupied.
pub fn key_from_orbs(orbs: &[Orb], n_bytes: usize) -> Vec<u8> {
    let mut key = vec![0u8; n_bytes];
    for &o in orbs {
        set_bit(&mut key, o as usize);
    }
    key
}
