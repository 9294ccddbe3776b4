//! Bucketer implementation.
//!
//! The hash is part of the definition file contract: changing it re-buckets every live experiment.

/// Maps a `(seed, identity)` pair to a uniformly distributed value in `[0, 1)`.
pub trait Bucketer {
    /// Return the bucket value of `identity` under `seed`.
    fn bucket(&self, seed: &str, identity: &str) -> f64;
}

/// The default (and only) bucketer.
///
/// Computes md5 over the UTF-8 bytes of `seed + ":" + identity`, reads the first 4 bytes of the
/// digest as a big-endian `u32` and divides by 2^32.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Bucketer;

const HASH_SPACE: f64 = 4_294_967_296.0; // 2^32

impl Bucketer for Md5Bucketer {
    fn bucket(&self, seed: &str, identity: &str) -> f64 {
        let mut context = md5::Context::new();
        context.consume(seed.as_bytes());
        context.consume(b":");
        context.consume(identity.as_bytes());
        let digest = context.compute();
        let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        f64::from(value) / HASH_SPACE
    }
}
