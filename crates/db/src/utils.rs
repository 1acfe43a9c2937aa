use strata_primitives::BlockNumber;

/// Fixed-width big-endian key for a block number.
///
/// The key form of every bucket keyed by block number; big-endian keeps the
/// buckets ordered by height.
pub fn block_number_key(number: BlockNumber) -> [u8; 8] {
    number.to_be_bytes()
}
