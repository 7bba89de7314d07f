use std::fmt;

use curve25519_dalek::Scalar;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{
    constants::{CIPHERTEXT_BLOCK_SIZE, CIPHER_KEY_INFO, KEYSTREAM_INFO, NONCE_SIZE},
    encoding::{deserialize_le, serialize_le, EncodingError},
};

type Result<T> = std::result::Result<T, EncryptionError>;

/// A 16-byte, single-use value mixed into every keystream element.
///
/// A nonce must never be used twice with the same shared secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Generates a fresh random nonce from the thread-local CSPRNG
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random::<[u8; NONCE_SIZE]>())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Interprets the nonce as a little-endian unsigned integer, which is how
    /// it travels in numeric transport fields
    #[must_use]
    pub fn to_u128(&self) -> u128 {
        deserialize_le(&self.0)
    }

    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(serialize_le(value))
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

/// One unit of cipher input: an element of the Curve25519 scalar field.
///
/// Callers build elements from unsigned integers up to `u128::MAX`, booleans
/// and signed integers (negatives map to field negation). Converting back is
/// fallible because a decrypted element is untrusted until range-checked.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PlaintextElement(Scalar);

impl PlaintextElement {
    pub const ZERO: Self = Self(Scalar::ZERO);

    /// Parses a canonical little-endian field element
    ///
    /// # Errors
    ///
    /// Returns `EncodingError::NonCanonicalElement` if the bytes encode a value
    /// outside the field.
    pub fn from_canonical_bytes(bytes: [u8; 32]) -> std::result::Result<Self, EncodingError> {
        Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes))
            .map(Self)
            .ok_or(EncodingError::NonCanonicalElement)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Returns the value if it fits the unsigned 128-bit domain
    #[must_use]
    pub fn as_u128(&self) -> Option<u128> {
        let bytes = self.0.to_bytes();
        if bytes[16..].iter().any(|b| *b != 0) {
            return None;
        }
        let mut low = [0u8; 16];
        low.copy_from_slice(&bytes[..16]);
        Some(u128::from_le_bytes(low))
    }

    /// Returns the value if it fits the signed 128-bit domain
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        const NEGATIVE_LIMIT: u128 = 1u128 << 127;
        if let Some(value) = self.as_u128() {
            if let Ok(value) = i128::try_from(value) {
                return Some(value);
            }
        }
        let magnitude = Self(-self.0).as_u128()?;
        match magnitude {
            NEGATIVE_LIMIT => Some(i128::MIN),
            m if m < NEGATIVE_LIMIT => i128::try_from(m).ok().map(|m| -m),
            _ => None,
        }
    }

    pub(crate) const fn scalar(&self) -> Scalar {
        self.0
    }
}

impl fmt::Debug for PlaintextElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u128() {
            Some(value) => write!(f, "PlaintextElement({value})"),
            None => write!(f, "PlaintextElement(0x{})", hex_le(&self.0.to_bytes())),
        }
    }
}

fn hex_le(bytes: &[u8]) -> String {
    bytes.iter().rev().map(|b| format!("{b:02x}")).collect()
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(
            impl From<$t> for PlaintextElement {
                fn from(value: $t) -> Self {
                    Self(Scalar::from(value))
                }
            }

            impl TryFrom<PlaintextElement> for $t {
                type Error = EncodingError;

                fn try_from(element: PlaintextElement) -> std::result::Result<Self, Self::Error> {
                    element
                        .as_u128()
                        .and_then(|value| <$t>::try_from(value).ok())
                        .ok_or(EncodingError::ValueOutOfRange {
                            target: stringify!($t),
                        })
                }
            }
        )*
    };
}

impl_from_unsigned!(u8, u16, u32, u64, u128);

impl From<bool> for PlaintextElement {
    fn from(value: bool) -> Self {
        Self::from(u8::from(value))
    }
}

impl TryFrom<PlaintextElement> for bool {
    type Error = EncodingError;

    fn try_from(element: PlaintextElement) -> std::result::Result<Self, Self::Error> {
        match element.as_u128() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(EncodingError::ValueOutOfRange { target: "bool" }),
        }
    }
}

impl From<i128> for PlaintextElement {
    fn from(value: i128) -> Self {
        let magnitude = Scalar::from(value.unsigned_abs());
        if value < 0 {
            Self(-magnitude)
        } else {
            Self(magnitude)
        }
    }
}

impl From<i64> for PlaintextElement {
    fn from(value: i64) -> Self {
        Self::from(i128::from(value))
    }
}

impl TryFrom<PlaintextElement> for i128 {
    type Error = EncodingError;

    fn try_from(element: PlaintextElement) -> std::result::Result<Self, Self::Error> {
        element
            .as_i128()
            .ok_or(EncodingError::ValueOutOfRange { target: "i128" })
    }
}

/// Fixed-size encrypted output for one plaintext element
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CiphertextBlock(pub [u8; CIPHERTEXT_BLOCK_SIZE]);

impl CiphertextBlock {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CIPHERTEXT_BLOCK_SIZE] {
        &self.0
    }
}

impl From<[u8; CIPHERTEXT_BLOCK_SIZE]> for CiphertextBlock {
    fn from(bytes: [u8; CIPHERTEXT_BLOCK_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Counter-mode cipher over the Curve25519 scalar field.
///
/// The block at position `i` is `m_i + k_i`, where `k_i` is expanded with
/// HKDF-SHA256 from the cipher key, the nonce and `i`. There is no
/// authentication tag: a wrong key, a wrong nonce or a tampered block all
/// decrypt to well-formed but meaningless elements.
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    /// Derives the cipher key from a 32-byte shared secret
    ///
    /// # Errors
    ///
    /// Returns `EncryptionError::KeyExpansionFailed` if HKDF expansion fails
    pub fn new(shared_secret: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
        let mut key = [0u8; 32];
        hkdf.expand(CIPHER_KEY_INFO, &mut key)
            .map_err(EncryptionError::KeyExpansionFailed)?;
        Ok(Self { key })
    }

    /// Encrypts `plaintext` element by element, preserving order
    ///
    /// # Arguments
    /// * `plaintext` - The ordered elements to encrypt
    /// * `nonce` - A nonce never used before with this cipher's secret
    ///
    /// # Returns
    /// One `CiphertextBlock` per input element
    ///
    /// # Errors
    /// Returns an error if keystream expansion fails
    pub fn encrypt(
        &self,
        plaintext: &[PlaintextElement],
        nonce: &Nonce,
    ) -> Result<Vec<CiphertextBlock>> {
        let keystream = self.keystream(nonce, plaintext.len())?;
        Ok(plaintext
            .iter()
            .zip(keystream)
            .map(|(element, k)| CiphertextBlock((element.scalar() + k).to_bytes()))
            .collect())
    }

    /// Inverse of [`Cipher::encrypt`] for the same secret and nonce.
    ///
    /// Non-canonical blocks are reduced modulo the field order rather than
    /// rejected.
    ///
    /// # Errors
    /// Returns an error if keystream expansion fails
    pub fn decrypt(
        &self,
        ciphertext: &[CiphertextBlock],
        nonce: &Nonce,
    ) -> Result<Vec<PlaintextElement>> {
        let keystream = self.keystream(nonce, ciphertext.len())?;
        Ok(ciphertext
            .iter()
            .zip(keystream)
            .map(|(block, k)| PlaintextElement(Scalar::from_bytes_mod_order(block.0) - k))
            .collect())
    }

    fn keystream(&self, nonce: &Nonce, len: usize) -> Result<Vec<Scalar>> {
        let hkdf = Hkdf::<Sha256>::new(Some(&nonce.as_bytes()[..]), &self.key);
        (0..len as u64)
            .map(|position| {
                let mut wide = [0u8; 64];
                hkdf.expand_multi_info(&[KEYSTREAM_INFO, &position.to_le_bytes()[..]], &mut wide)
                    .map_err(EncryptionError::KeyExpansionFailed)?;
                Ok(Scalar::from_bytes_mod_order_wide(&wide))
            })
            .collect()
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

/// Errors that can occur during encryption/decryption operations
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Failed to expand key, with error: `{0}`")]
    KeyExpansionFailed(hkdf::InvalidLength),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elements<T: Into<PlaintextElement> + Copy>(values: &[T]) -> Vec<PlaintextElement> {
        values.iter().map(|v| (*v).into()).collect()
    }

    fn cipher(seed: u8) -> Cipher {
        Cipher::new(&[seed; 32]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let cipher = cipher(7);
        let nonce = Nonce::random();
        let plaintext = elements(&[420u64, 69, 1, 1, 70, 170, 0, 1, 0, 1, 0]);
        let ciphertext = cipher.encrypt(&plaintext, &nonce).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_eq!(cipher.decrypt(&ciphertext, &nonce).unwrap(), plaintext);
    }

    #[test]
    fn test_boundary_values_round_trip() {
        let cipher = cipher(3);
        let nonce = Nonce::from_bytes([9; 16]);
        let plaintext = elements(&[0u128, u128::MAX, 1, u128::MAX - 1]);
        let ciphertext = cipher.encrypt(&plaintext, &nonce).unwrap();
        let decrypted = cipher.decrypt(&ciphertext, &nonce).unwrap();
        let values: Vec<u128> = decrypted
            .into_iter()
            .map(|e| u128::try_from(e).unwrap())
            .collect();
        assert_eq!(values, vec![0, u128::MAX, 1, u128::MAX - 1]);
    }

    #[test]
    fn test_nonce_sensitivity() {
        let cipher = cipher(1);
        let plaintext = elements(&[5u8, 5, 5]);
        let first = cipher.encrypt(&plaintext, &Nonce::from_bytes([1; 16])).unwrap();
        let second = cipher.encrypt(&plaintext, &Nonce::from_bytes([2; 16])).unwrap();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_ne!(a, b);
        }
    }

    #[test]
    fn test_keystream_depends_on_position() {
        let cipher = cipher(1);
        let nonce = Nonce::from_bytes([4; 16]);
        let ciphertext = cipher.encrypt(&elements(&[8u8, 8]), &nonce).unwrap();
        assert_ne!(ciphertext[0], ciphertext[1]);
    }

    #[test]
    fn test_prefix_is_stable_across_lengths() {
        let cipher = cipher(2);
        let nonce = Nonce::from_bytes([6; 16]);
        let short = cipher.encrypt(&elements(&[1u8, 2]), &nonce).unwrap();
        let long = cipher.encrypt(&elements(&[1u8, 2, 3]), &nonce).unwrap();
        assert_eq!(short[..], long[..2]);
    }

    #[test]
    fn test_wrong_key_or_nonce_yields_garbage_not_error() {
        let nonce = Nonce::from_bytes([1; 16]);
        let plaintext = elements(&[1u8]);
        let ciphertext = cipher(1).encrypt(&plaintext, &nonce).unwrap();

        let wrong_key = cipher(2).decrypt(&ciphertext, &nonce).unwrap();
        assert_ne!(wrong_key, plaintext);

        let wrong_nonce = cipher(1)
            .decrypt(&ciphertext, &Nonce::from_bytes([2; 16]))
            .unwrap();
        assert_ne!(wrong_nonce, plaintext);
    }

    #[test]
    fn test_tampered_block_decrypts_without_error() {
        let cipher = cipher(5);
        let nonce = Nonce::from_bytes([5; 16]);
        let mut ciphertext = cipher.encrypt(&elements(&[2u8]), &nonce).unwrap();
        ciphertext[0].0 = [0xff; 32];
        let decrypted = cipher.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(decrypted.len(), 1);
        assert!(bool::try_from(decrypted[0]).is_err());
    }

    #[test]
    fn test_signed_elements() {
        for value in [0i128, 1, -1, i128::MAX, i128::MIN, -42] {
            let element = PlaintextElement::from(value);
            assert_eq!(i128::try_from(element).unwrap(), value);
        }
        assert!(u128::try_from(PlaintextElement::from(-1i64)).is_err());
    }

    #[test]
    fn test_bool_coercion() {
        assert!(bool::try_from(PlaintextElement::from(1u8)).unwrap());
        assert!(!bool::try_from(PlaintextElement::from(0u8)).unwrap());
        assert!(bool::try_from(PlaintextElement::from(2u8)).is_err());
    }

    #[test]
    fn test_narrowing_conversion_checks_range() {
        assert_eq!(u8::try_from(PlaintextElement::from(255u64)).unwrap(), 255);
        assert!(u8::try_from(PlaintextElement::from(256u64)).is_err());
    }

    #[test]
    fn test_non_canonical_bytes_rejected() {
        assert!(PlaintextElement::from_canonical_bytes([0xff; 32]).is_err());
        let element = PlaintextElement::from_canonical_bytes(PlaintextElement::from(9u8).to_bytes())
            .unwrap();
        assert_eq!(u8::try_from(element).unwrap(), 9);
    }

    #[test]
    fn test_nonce_le_integer() {
        let mut bytes = [0u8; 16];
        bytes[0] = 1;
        bytes[1] = 2;
        let nonce = Nonce::from_bytes(bytes);
        assert_eq!(nonce.to_u128(), 0x0201);
        assert_eq!(Nonce::from_u128(0x0201), nonce);
    }
}
