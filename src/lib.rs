pub mod error;
pub mod bits;
pub mod hash;
pub mod collective;
#[cfg(feature = "mpi")]
pub mod mpiutils;
pub mod adder;
pub mod distvec;
pub mod compress;
pub mod subcompress;
pub mod stochastic;
pub mod io;
pub mod input;

use std::fmt::{Debug, Display};
use std::ops::AddAssign;
use std::str::FromStr;

use num_traits::{NumCast, Signed};
use serde::{de::DeserializeOwned, Serialize};

pub use error::{FriError, Result};

/// Scalar type stored in the value columns of a `DistVec`. Compression works on `f64` weights, so
/// every amplitude must convert to and from `f64` explicitly.
pub trait Amplitude:
    Copy + Default + PartialEq + PartialOrd + Signed + NumCast + AddAssign + Debug + Display + FromStr
    + Serialize + DeserializeOwned + Send + Sync + 'static
{
    // Number of bytes in the on-disk representation.
    const WIDTH: usize;

    /// Append the little-endian bytes of `self` to `out`.
    fn put_le(self, out: &mut Vec<u8>);

    /// Read a value from exactly `WIDTH` little-endian bytes.
    fn get_le(bytes: &[u8]) -> Self;

    /// Convert to a compression weight.
    fn as_weight(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }

    /// Convert from a compression weight. Integers round to nearest, values out of range become
    /// zero.
    fn from_weight(x: f64) -> Self {
        <Self as NumCast>::from(x).unwrap_or_default()
    }
}

macro_rules! impl_amplitude_float {
    ($($t:ty),*) => {$(
        impl Amplitude for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();
            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn get_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..Self::WIDTH]);
                <$t>::from_le_bytes(buf)
            }
            fn from_weight(x: f64) -> Self {
                x as $t
            }
        }
    )*};
}

macro_rules! impl_amplitude_int {
    ($($t:ty),*) => {$(
        impl Amplitude for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();
            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn get_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..Self::WIDTH]);
                <$t>::from_le_bytes(buf)
            }
            fn from_weight(x: f64) -> Self {
                <$t as NumCast>::from(x.round()).unwrap_or_default()
            }
        }
    )*};
}

impl_amplitude_float!(f32, f64);
impl_amplitude_int!(i32, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_cross_the_cast_boundary() {
        assert_eq!(i64::from_weight(2.6), 3);
        assert_eq!(i32::from_weight(-1.5), -2);
        assert_eq!(i32::from_weight(1e12), 0);
        assert_eq!(f32::from_weight(0.25), 0.25);
        assert_eq!((-7i32).as_weight(), -7.0);
    }

    #[test]
    fn little_endian_encoding() {
        let mut bytes = Vec::new();
        (-2.5f64).put_le(&mut bytes);
        258i32.put_le(&mut bytes);
        assert_eq!(bytes.len(), f64::WIDTH + i32::WIDTH);
        assert_eq!(&bytes[8..], &[2, 1, 0, 0]);
        assert_eq!(f64::get_le(&bytes), -2.5);
        assert_eq!(i32::get_le(&bytes[8..]), 258);
    }
}
