//! Sequential reader for raw computation outputs.
//!
//! A finalized computation hands back one byte string. Its layout is fixed by
//! the computation's return type: typically a 16-byte nonce followed by one
//! 32-byte ciphertext block per encrypted field, sometimes preceded by public
//! keys or small counters. The reader consumes it front to back and reports a
//! typed error instead of reading out of bounds.

use shroud_utils::{
    constants::{CIPHERTEXT_BLOCK_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE},
    CiphertextBlock, Nonce,
};
use thiserror::Error;

type Result<T> = std::result::Result<T, OutputParseError>;

#[derive(Debug)]
pub struct OutputReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> OutputReader<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn take<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N]> {
        let end = self.position + N;
        let chunk = self
            .bytes
            .get(self.position..end)
            .ok_or(OutputParseError::UnexpectedEnd {
                field,
                needed: N,
                remaining: self.remaining(),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        self.position = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let [byte] = self.take::<1>("u8")?;
        Ok(byte)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take::<8>("u64")?))
    }

    pub fn read_nonce(&mut self) -> Result<Nonce> {
        Ok(Nonce::from_bytes(self.take::<NONCE_SIZE>("nonce")?))
    }

    pub fn read_public_key(&mut self) -> Result<[u8; PUBLIC_KEY_SIZE]> {
        self.take::<PUBLIC_KEY_SIZE>("public_key")
    }

    pub fn read_ciphertext(&mut self) -> Result<CiphertextBlock> {
        Ok(CiphertextBlock(
            self.take::<CIPHERTEXT_BLOCK_SIZE>("ciphertext")?,
        ))
    }

    pub fn read_ciphertexts(&mut self, count: usize) -> Result<Vec<CiphertextBlock>> {
        (0..count).map(|_| self.read_ciphertext()).collect()
    }

    /// Consumes the reader, failing if any bytes were left unread
    ///
    /// # Errors
    ///
    /// Returns `OutputParseError::TrailingBytes` with the unread length
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            trailing => Err(OutputParseError::TrailingBytes(trailing)),
        }
    }
}

/// Parses the common `nonce || block_count * ciphertext` layout
///
/// # Errors
///
/// Fails if the output is shorter or longer than the layout requires
pub fn parse_encrypted_output(
    bytes: &[u8],
    block_count: usize,
) -> Result<(Nonce, Vec<CiphertextBlock>)> {
    let mut reader = OutputReader::new(bytes);
    let nonce = reader.read_nonce()?;
    let ciphertexts = reader.read_ciphertexts(block_count)?;
    reader.finish()?;
    Ok((nonce, ciphertexts))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputParseError {
    #[error("Output ended while reading `{field}`: needed {needed} bytes, {remaining} left")]
    UnexpectedEnd {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("Output has {0} unread trailing bytes")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(nonce: u128, blocks: &[[u8; 32]]) -> Vec<u8> {
        let mut bytes = nonce.to_le_bytes().to_vec();
        for block in blocks {
            bytes.extend_from_slice(block);
        }
        bytes
    }

    #[test]
    fn test_parse_encrypted_output() {
        let bytes = output(7, &[[1; 32], [2; 32]]);
        let (nonce, blocks) = parse_encrypted_output(&bytes, 2).unwrap();
        assert_eq!(nonce.to_u128(), 7);
        assert_eq!(blocks, vec![CiphertextBlock([1; 32]), CiphertextBlock([2; 32])]);
    }

    #[test]
    fn test_short_output() {
        let bytes = output(7, &[[1; 32]]);
        assert_eq!(
            parse_encrypted_output(&bytes, 2),
            Err(OutputParseError::UnexpectedEnd {
                field: "ciphertext",
                needed: 32,
                remaining: 0
            })
        );
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = output(7, &[[1; 32]]);
        bytes.push(0);
        assert_eq!(
            parse_encrypted_output(&bytes, 1),
            Err(OutputParseError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_mixed_layout() {
        let mut bytes = vec![3u8];
        bytes.extend_from_slice(&[9; 32]);
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(&output(1, &[[5; 32]]));

        let mut reader = OutputReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 3);
        assert_eq!(reader.read_public_key().unwrap(), [9; 32]);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_nonce().unwrap().to_u128(), 1);
        assert_eq!(reader.read_ciphertext().unwrap(), CiphertextBlock([5; 32]));
        assert_eq!(reader.remaining(), 0);
        reader.finish().unwrap();
    }
}
