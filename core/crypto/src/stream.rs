//! Streaming encryption for large files.
//!
//! Data is processed in fixed-size chunks so memory use stays bounded by
//! the chunk size regardless of file size. Each chunk is sealed with
//! AES-256-GCM under a nonce derived from the per-encryption IV and the
//! chunk index; the stream header, the index and a final-chunk flag are
//! authenticated, so reordering, truncation and extension are detected.
//!
//! # Format
//! - Header: magic `VVS` (3 bytes) + version (1 byte) + chunk_size (u32 LE)
//! - Frames: final flag (1 byte) + ciphertext length (u32 LE) + ciphertext
//!   with tag

use std::io::{ErrorKind, Read, Write};

use crate::aead::{self, NONCE_SIZE, TAG_SIZE};
use crate::keys::{EncryptionKey, Iv};
use veilvault_common::{Error, Result};

/// Default chunk size for streaming encryption (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk size accepted when reading a stream header (64 MiB).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Header size: magic (3) + version (1) + chunk_size (4).
pub const HEADER_SIZE: usize = 8;

/// Stream encryption version.
pub const STREAM_VERSION: u8 = 1;

const MAGIC: &[u8; 3] = b"VVS";
const FRAME_HEADER_SIZE: usize = 5;
const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

fn encode_header(chunk_size: usize) -> Result<[u8; HEADER_SIZE]> {
    let size = u32::try_from(chunk_size)
        .map_err(|_| Error::InvalidInput("Chunk size exceeds u32".to_string()))?;
    let mut header = [0u8; HEADER_SIZE];
    header[..3].copy_from_slice(MAGIC);
    header[3] = STREAM_VERSION;
    header[4..].copy_from_slice(&size.to_le_bytes());
    Ok(header)
}

fn chunk_nonce(iv: &Iv, index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *iv.as_bytes();
    for (n, i) in nonce[4..].iter_mut().zip(index.to_be_bytes()) {
        *n ^= i;
    }
    nonce
}

fn chunk_aad(header: &[u8; HEADER_SIZE], index: u64, flag: u8) -> [u8; HEADER_SIZE + 9] {
    let mut aad = [0u8; HEADER_SIZE + 9];
    aad[..HEADER_SIZE].copy_from_slice(header);
    aad[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&index.to_le_bytes());
    aad[HEADER_SIZE + 8] = flag;
    aad
}

/// Fill `buf` as far as the reader allows. Returns bytes read; fewer than
/// `buf.len()` means end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Encrypting stream that processes data in chunks.
pub struct EncryptingStream<'a> {
    key: &'a EncryptionKey,
    chunk_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream with the default chunk size.
    pub fn new(key: &'a EncryptionKey) -> Self {
        Self {
            key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set custom chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// # Postconditions
    /// - At most two chunks of plaintext are held in memory
    /// - An empty input produces a single empty final chunk
    ///
    /// # Errors
    /// - I/O errors from reader/writer
    /// - `InvalidInput` for a zero or oversized chunk size
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        iv: &Iv,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "Chunk size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        let header = encode_header(self.chunk_size)?;
        writer.write_all(&header)?;

        let mut current = vec![0u8; self.chunk_size];
        let mut current_len = read_full(&mut reader, &mut current)?;
        let mut next = vec![0u8; self.chunk_size];
        let mut index: u64 = 0;
        let mut total = 0u64;

        loop {
            // One chunk of lookahead tells us whether `current` is the last.
            let (next_len, is_final) = if current_len < self.chunk_size {
                (0, true)
            } else {
                let n = read_full(&mut reader, &mut next)?;
                (n, n == 0)
            };

            let flag = if is_final { FLAG_FINAL } else { FLAG_MORE };
            let ciphertext = aead::seal(
                self.key,
                &chunk_nonce(iv, index),
                &chunk_aad(&header, index, flag),
                &current[..current_len],
            )?;
            let frame_len = u32::try_from(ciphertext.len())
                .map_err(|_| Error::Crypto("Chunk too large".to_string()))?;
            writer.write_all(&[flag])?;
            writer.write_all(&frame_len.to_le_bytes())?;
            writer.write_all(&ciphertext)?;
            total += current_len as u64;

            if is_final {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            index += 1;
        }

        writer.flush()?;
        Ok(total)
    }
}

/// Decrypting stream that processes data in chunks.
pub struct DecryptingStream<'a> {
    key: &'a EncryptionKey,
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    pub fn new(key: &'a EncryptionKey) -> Self {
        Self { key }
    }

    /// Decrypt data from reader and write plaintext to writer.
    ///
    /// Plaintext of earlier chunks may already be written when a later chunk
    /// fails authentication; callers write into staging and discard it on
    /// error.
    ///
    /// # Errors
    /// - `Crypto` on a bad header, wrong key, tampering, reordering,
    ///   truncation or trailing data
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        iv: &Iv,
        mut reader: R,
        mut writer: W,
    ) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        if read_full(&mut reader, &mut header)? != HEADER_SIZE {
            return Err(Error::Crypto("Stream header truncated".to_string()));
        }
        if &header[..3] != MAGIC {
            return Err(Error::Crypto("Not an encrypted stream".to_string()));
        }
        if header[3] != STREAM_VERSION {
            return Err(Error::Crypto(format!(
                "Unsupported stream version: {}",
                header[3]
            )));
        }
        let chunk_size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Crypto("Invalid chunk size in header".to_string()));
        }

        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        let mut ciphertext = Vec::with_capacity(chunk_size + TAG_SIZE);
        let mut index: u64 = 0;
        let mut total = 0u64;

        loop {
            if read_full(&mut reader, &mut frame_header)? != FRAME_HEADER_SIZE {
                return Err(Error::Crypto("Stream truncated".to_string()));
            }
            let flag = frame_header[0];
            if flag != FLAG_MORE && flag != FLAG_FINAL {
                return Err(Error::Crypto("Invalid chunk flag".to_string()));
            }
            let len = u32::from_le_bytes([
                frame_header[1],
                frame_header[2],
                frame_header[3],
                frame_header[4],
            ]) as usize;
            if !(TAG_SIZE..=chunk_size + TAG_SIZE).contains(&len) {
                return Err(Error::Crypto("Invalid chunk length".to_string()));
            }

            ciphertext.resize(len, 0);
            if read_full(&mut reader, &mut ciphertext)? != len {
                return Err(Error::Crypto("Stream truncated".to_string()));
            }

            let plaintext = aead::open(
                self.key,
                &chunk_nonce(iv, index),
                &chunk_aad(&header, index, flag),
                &ciphertext,
            )?;
            writer.write_all(&plaintext)?;
            total += plaintext.len() as u64;

            if flag == FLAG_FINAL {
                break;
            }
            index += 1;
        }

        let mut trailing = [0u8; 1];
        if read_full(&mut reader, &mut trailing)? != 0 {
            return Err(Error::Crypto("Trailing data after final chunk".to_string()));
        }

        writer.flush()?;
        Ok(total)
    }
}

/// Encrypt a buffer with a fresh random IV.
///
/// # Postconditions
/// - Returns the IV and the framed ciphertext
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey, chunk_size: usize) -> Result<(Iv, Vec<u8>)> {
    let iv = Iv::generate();
    let mut out = Vec::with_capacity(plaintext.len() + HEADER_SIZE + FRAME_HEADER_SIZE + TAG_SIZE);
    EncryptingStream::new(key)
        .with_chunk_size(chunk_size)
        .encrypt_stream(&iv, plaintext, &mut out)?;
    Ok((iv, out))
}

/// Decrypt a buffer produced by [`encrypt`].
///
/// # Errors
/// - `Crypto` if authentication fails anywhere in the stream. No partial
///   plaintext is returned.
pub fn decrypt(iv: &Iv, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ciphertext.len());
    DecryptingStream::new(key).decrypt_stream(iv, ciphertext, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: usize = 16;
    const FULL_FRAME: usize = FRAME_HEADER_SIZE + SMALL + TAG_SIZE;

    #[test]
    fn test_stream_encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let data = b"Hello, streaming world!";

        let (iv, ct) = encrypt(data, &key, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(decrypt(&iv, &ct, &key).unwrap(), data);
    }

    #[test]
    fn test_stream_multiple_chunks() {
        let key = EncryptionKey::generate();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let (iv, ct) = encrypt(&data, &key, 100).unwrap();
        assert_eq!(decrypt(&iv, &ct, &key).unwrap(), data);
    }

    #[test]
    fn test_stream_exact_multiple_of_chunk_size() {
        let key = EncryptionKey::generate();
        let data = vec![9u8; SMALL * 3];

        let (iv, ct) = encrypt(&data, &key, SMALL).unwrap();
        assert_eq!(ct.len(), HEADER_SIZE + 3 * FULL_FRAME);
        assert_eq!(decrypt(&iv, &ct, &key).unwrap(), data);
    }

    #[test]
    fn test_stream_empty_data() {
        let key = EncryptionKey::generate();
        let (iv, ct) = encrypt(b"", &key, SMALL).unwrap();
        assert_eq!(ct.len(), HEADER_SIZE + FRAME_HEADER_SIZE + TAG_SIZE);
        assert!(decrypt(&iv, &ct, &key).unwrap().is_empty());
    }

    #[test]
    fn test_stream_wrong_key_fails() {
        let (iv, ct) = encrypt(b"secret", &EncryptionKey::generate(), SMALL).unwrap();
        assert!(decrypt(&iv, &ct, &EncryptionKey::generate()).is_err());
    }

    #[test]
    fn test_stream_wrong_iv_fails() {
        let key = EncryptionKey::generate();
        let (_, ct) = encrypt(b"secret", &key, SMALL).unwrap();
        assert!(decrypt(&Iv::generate(), &ct, &key).is_err());
    }

    #[test]
    fn test_stream_truncation_detected() {
        let key = EncryptionKey::generate();
        let data = vec![1u8; SMALL * 2 + 8];
        let (iv, ct) = encrypt(&data, &key, SMALL).unwrap();

        let truncated = &ct[..HEADER_SIZE + 2 * FULL_FRAME];
        assert!(decrypt(&iv, truncated, &key).is_err());
    }

    #[test]
    fn test_stream_reordering_detected() {
        let key = EncryptionKey::generate();
        let data: Vec<u8> = (0..(SMALL * 2 + 4) as u8).collect();
        let (iv, ct) = encrypt(&data, &key, SMALL).unwrap();

        let mut swapped = ct[..HEADER_SIZE].to_vec();
        swapped.extend_from_slice(&ct[HEADER_SIZE + FULL_FRAME..HEADER_SIZE + 2 * FULL_FRAME]);
        swapped.extend_from_slice(&ct[HEADER_SIZE..HEADER_SIZE + FULL_FRAME]);
        swapped.extend_from_slice(&ct[HEADER_SIZE + 2 * FULL_FRAME..]);
        assert!(decrypt(&iv, &swapped, &key).is_err());
    }

    #[test]
    fn test_stream_final_flag_forgery_detected() {
        let key = EncryptionKey::generate();
        let data = vec![5u8; SMALL * 2];
        let (iv, ct) = encrypt(&data, &key, SMALL).unwrap();

        // Mark the first chunk final and drop the rest.
        let mut forged = ct[..HEADER_SIZE + FULL_FRAME].to_vec();
        forged[HEADER_SIZE] = FLAG_FINAL;
        assert!(decrypt(&iv, &forged, &key).is_err());
    }

    #[test]
    fn test_stream_trailing_data_rejected() {
        let key = EncryptionKey::generate();
        let (iv, mut ct) = encrypt(b"abc", &key, SMALL).unwrap();
        ct.push(0);
        assert!(decrypt(&iv, &ct, &key).is_err());
    }

    #[test]
    fn test_stream_header_format() {
        let key = EncryptionKey::generate();
        let (_, ct) = encrypt(b"x", &key, 4096).unwrap();
        assert_eq!(&ct[..3], b"VVS");
        assert_eq!(ct[3], STREAM_VERSION);
        assert_eq!(u32::from_le_bytes([ct[4], ct[5], ct[6], ct[7]]), 4096);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let key = EncryptionKey::generate();
        assert!(encrypt(b"x", &key, 0).is_err());
    }

    #[test]
    fn test_chunk_nonces_distinct() {
        let iv = Iv::generate();
        assert_ne!(chunk_nonce(&iv, 0), chunk_nonce(&iv, 1));
        assert_eq!(chunk_nonce(&iv, 0), *iv.as_bytes());
    }
}
