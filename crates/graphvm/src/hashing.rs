use serde::Serialize;

use crate::error::{Error, Result};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Stable fingerprint of any serialisable value (bincode encoding, then FNV-1a).
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<u64> {
    let bytes = bincode::serialize(value)
        .map_err(|err| Error::kernel(format!("failed to encode plan signature: {err}")))?;
    Ok(fnv1a_hash(&bytes))
}
