/// Computes the CRC32 of a block payload salted with the block id.
///
/// Salting with the id catches a valid block image written at the wrong
/// offset.
pub fn block_crc32(block: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
