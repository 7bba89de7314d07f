use std::fmt;

use serde::{Deserialize, Serialize};
use shroud_utils::{
    constants::PUBLIC_KEY_SIZE, encoding::EncodingError, encryption::EncryptionError,
    CiphertextBlock, Nonce, PlaintextElement,
};
use thiserror::Error;

type Result<T> = std::result::Result<T, EnvelopeError>;

/// Current encoding version of [`ComputationRequest`]
pub const REQUEST_VERSION: u8 = 1;

/// A party that should receive the computation output instead of (or in
/// addition to) the sender, such as a record receiver or an observer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Public key the output is re-encrypted to
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Nonce the recipient expects the output to be encrypted under, unless
    /// the cluster announces a fresh one with the result
    pub nonce: Nonce,
}

/// One positional argument as the remote computation receives it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Argument {
    PublicKey([u8; PUBLIC_KEY_SIZE]),
    PlaintextBool(bool),
    PlaintextU8(u8),
    PlaintextU64(u64),
    PlaintextU128(u128),
    EncryptedBlock(CiphertextBlock),
}

/// A request for confidential computation.
///
/// This struct carries all the client contributes:
/// * Ciphertext blocks encrypted under the client/cluster shared secret
/// * The nonce used for that encryption
/// * The client's public key, from which the cluster derives the same secret
/// * Plaintext routing arguments and an optional output recipient
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRequest {
    /// Encoding version, see [`REQUEST_VERSION`]
    pub version: u8,

    /// Random identifier correlating the request with its result event
    pub computation_offset: u64,

    /// Name of the remote computation to run
    pub computation: String,

    /// Public key component for the key exchange from the client
    pub sender_public_key: [u8; PUBLIC_KEY_SIZE],

    /// Nonce used to encrypt `ciphertexts`
    pub nonce: Nonce,

    /// Encrypted inputs, in the order the computation expects them
    pub ciphertexts: Vec<CiphertextBlock>,

    /// Unencrypted inputs, appended after the encrypted ones
    pub plaintext_arguments: Vec<Argument>,

    /// Party the output is re-encrypted to, if not the sender
    pub recipient: Option<Recipient>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u8,
}

impl ComputationRequest {
    /// Returns the ordered argument list the remote computation receives:
    /// sender key, nonce, encrypted blocks, plaintext arguments, and finally
    /// the recipient key and nonce when present
    #[must_use]
    pub fn arguments(&self) -> Vec<Argument> {
        let mut arguments = Vec::with_capacity(self.ciphertexts.len() + 4);
        arguments.push(Argument::PublicKey(self.sender_public_key));
        arguments.push(Argument::PlaintextU128(self.nonce.to_u128()));
        arguments.extend(self.ciphertexts.iter().copied().map(Argument::EncryptedBlock));
        arguments.extend(self.plaintext_arguments.iter().cloned());
        if let Some(recipient) = &self.recipient {
            arguments.push(Argument::PublicKey(recipient.public_key));
            arguments.push(Argument::PlaintextU128(recipient.nonce.to_u128()));
        }
        arguments
    }

    /// Nonce the result for this request is encrypted under when the result
    /// event does not carry its own
    #[must_use]
    pub fn result_nonce(&self) -> Nonce {
        self.recipient.map_or(self.nonce, |r| r.nonce)
    }

    /// Encodes the request as CBOR
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Encode` if serialization fails
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)?;
        Ok(buffer)
    }

    /// Decodes a request produced by [`ComputationRequest::to_cbor`]
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::UnsupportedVersion` for any version other than
    /// [`REQUEST_VERSION`], or `EnvelopeError::Decode` for malformed bytes
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let header: VersionHeader = ciborium::from_reader(bytes)?;
        if header.version != REQUEST_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                found: header.version,
                expected: REQUEST_VERSION,
            });
        }
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// Lifecycle of a request as seen by the client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestState {
    #[default]
    Built,
    Submitted,
    ResultReceived,
    TimedOut,
    /// The transport rejected the request or the result channel closed
    Failed,
}

impl RequestState {
    /// Moves to `next` if the lifecycle allows it.
    ///
    /// Allowed: `Built -> Submitted` and `Submitted` to any of
    /// `ResultReceived`, `TimedOut` or `Failed`. Terminal requests are never
    /// resubmitted; retries build a new request with a fresh nonce.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::InvalidTransition` for anything else
    pub fn transition(self, next: Self) -> Result<Self> {
        match (self, next) {
            (Self::Built, Self::Submitted)
            | (Self::Submitted, Self::ResultReceived | Self::TimedOut | Self::Failed) => Ok(next),
            (from, to) => Err(EnvelopeError::InvalidTransition { from, to }),
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ResultReceived | Self::TimedOut | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Built => "built",
            Self::Submitted => "submitted",
            Self::ResultReceived => "result_received",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A result event after decryption
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedResult {
    /// Name of the event that carried the result
    pub event_name: String,
    /// Identifier of the computation, when the event carried one
    pub computation_offset: Option<u64>,
    /// Public key the output was encrypted to, when announced
    pub encryption_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    /// Nonce that was used for decryption
    pub nonce: Option<Nonce>,
    /// Decrypted elements, in output order
    pub values: Vec<PlaintextElement>,
    /// Fields the computation revealed in the clear
    pub revealed: serde_json::Map<String, serde_json::Value>,
}

impl DecryptedResult {
    /// Range-checks and converts the element at `index`.
    ///
    /// Decrypted elements carry no integrity guarantee, so every read goes
    /// through a checked conversion.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::EncodingMismatch` if the element is missing or
    /// out of range for `T`
    pub fn value<T>(&self, index: usize) -> Result<T>
    where
        T: TryFrom<PlaintextElement, Error = EncodingError>,
    {
        let element = self
            .values
            .get(index)
            .copied()
            .ok_or_else(|| EncodingError::PartCountMismatch {
                expected: index.saturating_add(1),
                actual: self.values.len(),
            })?;
        Ok(T::try_from(element)?)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Failed to encode request: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("Failed to decode request: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
    #[error("Unsupported request version {found}, expected {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("Invalid request state transition from {from} to {to}")]
    InvalidTransition { from: RequestState, to: RequestState },
    #[error("Decrypted value does not match the expected encoding: {0}")]
    EncodingMismatch(#[from] EncodingError),
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}
