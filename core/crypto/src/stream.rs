//! Chunked payload encryption for large media files.
//!
//! The payload is cut into fixed-size chunks, each sealed as an independent
//! AEAD blob. The associated data of every chunk binds the stream header, the
//! chunk index, and whether it is the final chunk, so reordered, dropped,
//! duplicated, or appended chunks all fail with [`Error::Integrity`].
//!
//! # Format
//! - Header: version (1 byte) + chunk_size (4 bytes LE)
//! - Chunks: frame (4 bytes LE, high bit = final) + nonce + ciphertext + tag
//!
//! A stream always ends with exactly one final chunk, which may be empty.

use std::io::{self, Read, Write};

use crate::aead::{decrypt_with_aad, encrypt_with_aad, MIN_BLOB_SIZE};
use crate::keys::DataKey;
use mediaguard_common::{Error, Result};

/// Default chunk size for streaming encryption (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size accepted from a header (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Header size: version (1) + chunk_size (4).
pub const HEADER_SIZE: usize = 5;

/// Stream encryption version.
pub const STREAM_VERSION: u8 = 1;

const FINAL_FLAG: u32 = 1 << 31;

fn chunk_aad(header: &[u8; HEADER_SIZE], index: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(HEADER_SIZE + 9);
    aad.extend_from_slice(header);
    aad.extend_from_slice(&index.to_le_bytes());
    aad.push(is_final as u8);
    aad
}

fn encode_header(chunk_size: usize) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = STREAM_VERSION;
    header[1..].copy_from_slice(&(chunk_size as u32).to_le_bytes());
    header
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// A truncated stream is a tamper case, not an I/O failure.
fn read_exact_or_integrity<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Integrity,
        _ => Error::Io(e),
    })
}

/// Encrypting stream that processes data in chunks.
pub struct EncryptingStream<'a> {
    key: &'a DataKey,
    chunk_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream with the default chunk size.
    pub fn new(key: &'a DataKey) -> Self {
        Self {
            key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set custom chunk size.
    ///
    /// # Errors
    /// - `Error::Validation` if the size is zero or above MAX_CHUNK_SIZE
    pub fn with_chunk_size(mut self, size: usize) -> Result<Self> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(Error::Validation(format!(
                "Chunk size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        self.chunk_size = size;
        Ok(self)
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// Returns the number of plaintext bytes consumed.
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let header = encode_header(self.chunk_size);
        writer.write_all(&header)?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_bytes = 0u64;
        let mut index = 0u64;

        loop {
            let n = read_full(&mut reader, &mut buffer)?;
            let is_final = n < self.chunk_size;
            total_bytes += n as u64;

            let sealed = encrypt_with_aad(
                &buffer[..n],
                &chunk_aad(&header, index, is_final),
                self.key,
            )?;

            let mut frame = sealed.len() as u32;
            if is_final {
                frame |= FINAL_FLAG;
            }
            writer.write_all(&frame.to_le_bytes())?;
            writer.write_all(&sealed)?;

            if is_final {
                break;
            }
            index += 1;
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypting stream that processes encrypted chunks.
pub struct DecryptingStream<'a> {
    key: &'a DataKey,
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    pub fn new(key: &'a DataKey) -> Self {
        Self { key }
    }

    /// Decrypt data from reader and write to writer.
    ///
    /// Plaintext of a chunk is written only after that chunk authenticates,
    /// but earlier chunks may already be written when a later one fails.
    /// Callers writing to durable storage should write to a temporary
    /// location and discard it on error.
    ///
    /// # Errors
    /// - `Error::Integrity` for a bad header or any authentication, ordering,
    ///   or length failure
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut header = [0u8; HEADER_SIZE];
        read_exact_or_integrity(&mut reader, &mut header)?;

        // The header is authenticated through every chunk's AAD, so a bad
        // header is tampering, not a format choice.
        if header[0] != STREAM_VERSION {
            return Err(Error::Integrity);
        }
        let chunk_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Integrity);
        }

        let max_sealed = chunk_size + MIN_BLOB_SIZE;
        let mut sealed = vec![0u8; max_sealed];
        let mut total_bytes = 0u64;
        let mut index = 0u64;

        loop {
            let mut frame_bytes = [0u8; 4];
            read_exact_or_integrity(&mut reader, &mut frame_bytes)?;
            let frame = u32::from_le_bytes(frame_bytes);
            let is_final = frame & FINAL_FLAG != 0;
            let len = (frame & !FINAL_FLAG) as usize;

            if !(MIN_BLOB_SIZE..=max_sealed).contains(&len) {
                return Err(Error::Integrity);
            }
            read_exact_or_integrity(&mut reader, &mut sealed[..len])?;

            let plaintext =
                decrypt_with_aad(&sealed[..len], &chunk_aad(&header, index, is_final), self.key)?;
            if !is_final && plaintext.len() != chunk_size {
                return Err(Error::Integrity);
            }

            writer.write_all(&plaintext)?;
            total_bytes += plaintext.len() as u64;

            if is_final {
                break;
            }
            index += 1;
        }

        let mut trailing = [0u8; 1];
        if read_full(&mut reader, &mut trailing)? != 0 {
            return Err(Error::Integrity);
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Encrypt a complete byte slice using chunked encryption.
pub fn encrypt_bytes(key: &DataKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(data.len() + HEADER_SIZE + MIN_BLOB_SIZE + 4);
    EncryptingStream::new(key).encrypt_stream(data, &mut output)?;
    Ok(output)
}

/// Decrypt a complete byte slice produced by chunked encryption.
pub fn decrypt_bytes(key: &DataKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    DecryptingStream::new(key).decrypt_stream(data, &mut output)?;
    Ok(output)
}
