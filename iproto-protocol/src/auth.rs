//! `chap-sha1` challenge-response scramble.
//!
//! ```text
//! hash1    = sha1(password)
//! hash2    = sha1(hash1)
//! scramble = sha1(salt[..20] ++ hash2) XOR hash1
//! ```

use crate::greeting::SCRAMBLE_SALT_SIZE;
use sha1::{Digest, Sha1};

/// Authentication method name sent in `IPROTO_AUTH`.
pub const CHAP_SHA1: &str = "chap-sha1";

/// Length of a scramble in bytes.
pub const SCRAMBLE_SIZE: usize = 20;

/// Computes the scramble for `password` using the greeting salt.
///
/// Only the first [`SCRAMBLE_SALT_SIZE`] salt bytes are used.
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SALT_SIZE.min(salt.len())]);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = hash1[i] ^ hash3[i];
    }
    out
}

/// Checks a scramble the way the server does: recover `hash1` from the
/// scramble and compare `sha1(hash1)` with the stored `hash2`.
pub fn verify(salt: &[u8], scramble: &[u8], password: &str) -> bool {
    if scramble.len() != SCRAMBLE_SIZE {
        return false;
    }
    let hash2 = Sha1::digest(Sha1::digest(password.as_bytes()));

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SALT_SIZE.min(salt.len())]);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    let hash1: Vec<u8> = scramble.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect();
    Sha1::digest(&hash1)[..] == hash2[..]
}
