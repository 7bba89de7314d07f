use blake2::{
    digest::generic_array::{typenum::U32, GenericArray},
    Blake2b, Digest,
};

/// Computes the `BLAKE2b` hash of the provided data
///
/// # Arguments
/// * `slice` - A byte slice containing the data to be hashed
/// # Returns
/// The 32-byte `BLAKE2b` hash
#[must_use]
pub fn blake2b_hash(slice: &[u8]) -> GenericArray<u8, U32> {
    blake2b_hash_parts(&[slice])
}

/// Computes the `BLAKE2b` hash of several byte slices, fed in order
#[must_use]
pub fn blake2b_hash_parts(parts: &[&[u8]]) -> GenericArray<u8, U32> {
    let mut hasher = Blake2b::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_match_concatenation() {
        let whole = blake2b_hash(b"shroud-cluster");
        let parts = blake2b_hash_parts(&[b"shroud".as_slice(), b"-".as_slice(), b"cluster".as_slice()]);
        assert_eq!(whole, parts);
        assert_ne!(whole, blake2b_hash(b"shroud-clusteR"));
    }
}
