//! Stable partition routing
//!
//! FNV-1a rather than `DefaultHasher`: the mapping must not change between
//! builds or processes, or per-account ordering breaks across restarts.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition a key is routed to. `partitions` of zero is treated as one.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    (fnv1a(key.as_bytes()) % u64::from(partitions)) as u32
}
