use std::fmt;

use shroud_utils::{
    constants::{CLUSTER_FOLD_DOMAIN, PUBLIC_KEY_SIZE},
    encryption::EncryptionError,
    hashing::blake2b_hash_parts,
    Cipher,
};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

type Result<T> = std::result::Result<T, KeyManagementError>;

/// An X25519 key pair owned by one protocol participant.
///
/// The secret never leaves the value: callers only get the public key and
/// the outputs of key exchanges. Clients create a fresh pair per request
/// unless they deliberately keep a session key, in which case
/// [`X25519KeyPair::rotate_keys`] replaces it.
pub struct X25519KeyPair {
    /// The X25519 static secret used for key exchanges.
    /// This secret key can be rotated using the `rotate_keys()` method.
    secret_key: StaticSecret,
}

impl X25519KeyPair {
    /// Generates a key pair from the thread-local CSPRNG
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            secret_key: StaticSecret::random_from_rng(&mut rng),
        }
    }

    /// Restores a key pair from previously stored secret bytes
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret_key: StaticSecret::from(bytes),
        }
    }

    /// Returns the public key matching the current secret.
    ///
    /// The public key changes when `rotate_keys()` is called.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret_key)
    }

    /// Replaces the secret with a freshly generated one.
    ///
    /// Shared secrets derived before rotation stay valid for decrypting
    /// results of requests already in flight, but new requests use the new
    /// key.
    pub fn rotate_keys(&mut self) {
        let mut rng = rand::thread_rng();
        self.secret_key = StaticSecret::random_from_rng(&mut rng);
    }

    /// Raw two-party X25519 exchange with `peer`
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::InvalidKey` if `peer` is a low-order point,
    /// which would make the output independent of our secret
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<[u8; 32]> {
        let shared = self.secret_key.diffie_hellman(peer);
        if !shared.was_contributory() {
            return Err(KeyManagementError::InvalidKey(format!(
                "non-contributory exchange with {}",
                hex::encode(peer.as_bytes())
            )));
        }
        Ok(shared.to_bytes())
    }

    /// Derives the secret shared with the ordered set of `peers`.
    ///
    /// See [`derive_shared_secret`].
    ///
    /// # Errors
    ///
    /// Fails on an empty peer set or an invalid peer key
    pub fn shared_secret(&self, peers: &[PublicKey]) -> Result<SharedSecret> {
        let exchanges = peers
            .iter()
            .map(|peer| self.diffie_hellman(peer))
            .collect::<Result<Vec<_>>>()?;
        fold_exchanges(&exchanges)
    }
}

impl fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X25519KeyPair")
            .field("public_key", &hex::encode(self.public_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generates a fresh key pair
#[must_use]
pub fn generate_keypair() -> X25519KeyPair {
    X25519KeyPair::generate()
}

/// Derives the secret `keypair` shares with `peers`.
///
/// With a single peer this is plain X25519. With several peers, each pairwise
/// exchange is computed in the order given and the results are folded with
/// `BLAKE2b` under a domain tag and the peer count. The order is part of the
/// protocol: both sides must use the same one.
///
/// # Errors
///
/// Returns `KeyManagementError::EmptyPeerSet` if `peers` is empty and
/// `KeyManagementError::InvalidKey` for a low-order peer key
pub fn derive_shared_secret(keypair: &X25519KeyPair, peers: &[PublicKey]) -> Result<SharedSecret> {
    keypair.shared_secret(peers)
}

/// Combines ordered pairwise exchange outputs into one shared secret
///
/// # Errors
///
/// Returns `KeyManagementError::EmptyPeerSet` if `exchanges` is empty
pub(crate) fn fold_exchanges(exchanges: &[[u8; 32]]) -> Result<SharedSecret> {
    match exchanges {
        [] => Err(KeyManagementError::EmptyPeerSet),
        [single] => Ok(SharedSecret(*single)),
        many => {
            let count = u32::try_from(many.len())
                .map_err(|_| KeyManagementError::TooManyPeers(many.len()))?
                .to_le_bytes();
            let mut parts: Vec<&[u8]> = Vec::with_capacity(many.len() + 2);
            parts.push(CLUSTER_FOLD_DOMAIN);
            parts.push(&count);
            parts.extend(many.iter().map(|dh| &dh[..]));
            let mut folded = [0u8; 32];
            folded.copy_from_slice(&blake2b_hash_parts(&parts));
            Ok(SharedSecret(folded))
        }
    }
}

/// Parses a 32-byte public key
///
/// # Errors
///
/// Returns `KeyManagementError::InvalidKey` if `bytes` has the wrong length
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
        KeyManagementError::InvalidKey(format!(
            "expected {PUBLIC_KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

/// Parses a hex-encoded public key, with or without a `0x` prefix
///
/// # Errors
///
/// Returns `KeyManagementError::InvalidKey` if the string is not hex or does
/// not decode to 32 bytes
pub fn parse_public_key_hex(value: &str) -> Result<PublicKey> {
    let trimmed = value.trim_start_matches("0x");
    let bytes = hex::decode(trimmed)
        .map_err(|e| KeyManagementError::InvalidKey(format!("`{value}` is not hex: {e}")))?;
    parse_public_key(&bytes)
}

/// The 32-byte secret two parties agree on after a key exchange
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Builds the symmetric cipher keyed by this secret
    ///
    /// # Errors
    ///
    /// Returns `KeyManagementError::Encryption` if key expansion fails
    pub fn cipher(&self) -> Result<Cipher> {
        Ok(Cipher::new(&self.0)?)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

#[derive(Debug, Error)]
pub enum KeyManagementError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
    #[error("Cannot derive a shared secret without any peer public key")]
    EmptyPeerSet,
    #[error("Too many peers to fold: {0}")]
    TooManyPeers(usize),
    #[error("Failed to build cipher: {0}")]
    Encryption(#[from] EncryptionError),
}
