use shroud_utils::{Cipher, Nonce, PlaintextElement};
use x25519_dalek::PublicKey;

use crate::types::{Argument, ComputationRequest, EnvelopeError, Recipient, REQUEST_VERSION};

type Result<T> = std::result::Result<T, EnvelopeError>;

/// Encrypts `elements` and wraps them in a request for `computation`.
///
/// The request gets a random `computation_offset`, which is also what its
/// result event is correlated by. Plaintext arguments and a recipient can be
/// attached afterwards with [`ComputationRequest::with_plaintext_arguments`]
/// and [`ComputationRequest::with_recipient`].
///
/// # Errors
///
/// Returns `EnvelopeError::Encryption` if the keystream cannot be expanded
pub fn build_request(
    cipher: &Cipher,
    elements: &[PlaintextElement],
    nonce: Nonce,
    sender_public_key: &PublicKey,
    computation: impl Into<String>,
) -> Result<ComputationRequest> {
    let ciphertexts = cipher.encrypt(elements, &nonce)?;
    Ok(ComputationRequest {
        version: REQUEST_VERSION,
        computation_offset: rand::random(),
        computation: computation.into(),
        sender_public_key: sender_public_key.to_bytes(),
        nonce,
        ciphertexts,
        plaintext_arguments: Vec::new(),
        recipient: None,
    })
}

impl ComputationRequest {
    #[must_use]
    pub fn with_plaintext_arguments(mut self, arguments: Vec<Argument>) -> Self {
        self.plaintext_arguments = arguments;
        self
    }

    /// Asks the cluster to re-encrypt the output to `public_key` under `nonce`
    #[must_use]
    pub fn with_recipient(mut self, public_key: &PublicKey, nonce: Nonce) -> Self {
        self.recipient = Some(Recipient {
            public_key: public_key.to_bytes(),
            nonce,
        });
        self
    }

    #[must_use]
    pub const fn with_computation_offset(mut self, computation_offset: u64) -> Self {
        self.computation_offset = computation_offset;
        self
    }
}
