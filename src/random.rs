//! Random number generation with explicit, splittable PRNG keys.
//!
//! Keys are `uint32[..., 2]` arrays; generation is counter-based
//! (threefry2x32), so the same key and shape always produce the same bits,
//! on every backend.

use crate::error::{Error, Result};
use crate::trace::{bind1, Value};
use crate::{AbstractValue, Array, DType, Shape};

const ROTATIONS: [[u32; 4]; 2] = [[13, 15, 26, 6], [17, 29, 16, 24]];
const PARITY: u32 = 0x1BD1_1BDA;

/// The threefry2x32 block cipher: five double-rounds with key injection.
fn threefry2x32(key: [u32; 2], ctr: [u32; 2]) -> [u32; 2] {
    let ks = [key[0], key[1], key[0] ^ key[1] ^ PARITY];
    let mut x = [ctr[0].wrapping_add(ks[0]), ctr[1].wrapping_add(ks[1])];
    for round in 0..5 {
        let rots = ROTATIONS[round % 2];
        for &rot in &rots {
            x[0] = x[0].wrapping_add(x[1]);
            x[1] = x[1].rotate_left(rot) ^ x[0];
        }
        let inject = round as u32 + 1;
        x[0] = x[0].wrapping_add(ks[(round + 1) % 3]);
        x[1] = x[1].wrapping_add(ks[(round + 2) % 3]).wrapping_add(inject);
    }
    x
}

/// Uniform `uint32` stream for a key: element `i` is the first output word
/// of the cipher applied to counter `i`.
fn bits_from_key(key: [u32; 2], n: usize) -> Vec<u32> {
    (0..n)
        .map(|i| threefry2x32(key, [(i as u64 >> 32) as u32, i as u32])[0])
        .collect()
}

/// Bits for a raw key byte buffer; used by compiled program steps.
pub(crate) fn bits_bytes_from_key(key_bytes: &[u8], n: usize) -> Result<Vec<u8>> {
    if key_bytes.len() < 8 {
        return Err(Error::Type(format!(
            "PRNG key has {} bytes, expected at least 8",
            key_bytes.len()
        )));
    }
    let k0 = u32::from_le_bytes(key_bytes[0..4].try_into().unwrap());
    let k1 = u32::from_le_bytes(key_bytes[4..8].try_into().unwrap());
    let words = bits_from_key([k0, k1], n);
    Ok(bytemuck::cast_slice(&words).to_vec())
}

/// Concrete implementation of the `random_bits` primitive.
pub(crate) fn eval_random_bits(key: &Array, shape: &[usize]) -> Result<Array> {
    let key_bytes = key.to_bytes()?;
    let size: usize = shape.iter().product();
    let bytes = bits_bytes_from_key(&key_bytes, size)?;
    let aval = AbstractValue::new(Shape::new(shape.to_vec()), DType::Uint32);
    let backend = key.backend().clone();
    let slot = backend.malloc(bytes.len(), Some(&bytes))?;
    Ok(Array::from_parts(slot, aval, backend))
}

/// Create a root key from a seed.
///
/// # Examples
///
/// ```
/// # use microjax::random;
/// let key = random::key(42);
/// assert_eq!(key.shape().as_slice(), &[2]);
/// ```
pub fn key(seed: u64) -> Array {
    Array::from_u32_vec(vec![(seed >> 32) as u32, seed as u32], Shape::new(vec![2]))
}

/// Split a key into `n` independent keys: `uint32[n, 2]`.
pub fn split(key: &Value, n: usize) -> Result<Value> {
    bind1(
        crate::trace::jaxpr::Primitive::RandomBits { shape: vec![n, 2] },
        &[key.clone()],
    )
}

/// Uniform `uint32` bits of the requested shape.
pub fn bits(key: &Value, shape: &[usize]) -> Result<Value> {
    bind1(
        crate::trace::jaxpr::Primitive::RandomBits { shape: shape.to_vec() },
        &[key.clone()],
    )
}

/// Uniform float32 samples in `[0, 1)`, converted on the host from the top
/// 24 bits of each word.
pub fn uniform(key: &Array, shape: &[usize]) -> Result<Array> {
    let raw = eval_random_bits(key, shape)?;
    let words = raw.to_u32_vec();
    let floats: Vec<f32> = words
        .iter()
        .map(|&w| (w >> 8) as f32 / (1u32 << 24) as f32)
        .collect();
    Ok(Array::from_vec(floats, Shape::new(shape.to_vec())))
}
