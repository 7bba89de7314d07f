/// Size of a per-message nonce, in bytes
pub const NONCE_SIZE: usize = 16;

/// Size of an x25519 public key, in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a single encrypted field element, in bytes
pub const CIPHERTEXT_BLOCK_SIZE: usize = 32;

/// Size of the little-endian halves a 256-bit value is split into
pub const U128_PART_SIZE: usize = 16;

/// HKDF info used to expand a shared secret into the cipher key
pub const CIPHER_KEY_INFO: &[u8] = b"shroud/cipher-key/v1";

/// HKDF info prefix used to expand a per-position keystream element
pub const KEYSTREAM_INFO: &[u8] = b"shroud/keystream/v1";

/// Domain tag prepended to the pairwise secrets of a multi-party fold
pub const CLUSTER_FOLD_DOMAIN: &[u8] = b"shroud/cluster-fold/v1";
