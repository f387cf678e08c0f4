//! Log record framing.
//!
//! Every [`WriteBatch`] is persisted as one self-checking record:
//!
//! ```text
//! | magic (4) | version (2) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of the batch. The CRC covers the header
//! and the payload.

use crate::error::{StorageError, StorageResult};
use crate::store::WriteBatch;

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"OBXL";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
pub(crate) const HEADER_SIZE: usize = 10;

pub(crate) const CRC_SIZE: usize = 4;

/// Result of decoding the bytes at a record boundary.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A complete, verified record and its total encoded size.
    Record { batch: WriteBatch, size: usize },
    /// The record runs past the end of the available bytes.
    Truncated,
}

/// Encodes a batch into a framed record.
pub(crate) fn encode_record(batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(batch, &mut payload)
        .map_err(|e| StorageError::Codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Codec("batch payload too large".into()))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&LOG_MAGIC);
    data.extend_from_slice(&LOG_VERSION.to_le_bytes());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Decodes the record starting at the beginning of `buf`.
///
/// `offset` is only used for error reporting. A short header or payload is
/// reported as [`Decoded::Truncated`]; a complete record that fails
/// validation is an error.
pub(crate) fn decode_record(buf: &[u8], offset: u64) -> StorageResult<Decoded> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::Truncated);
    }

    if buf[0..4] != LOG_MAGIC {
        return Err(StorageError::corrupted(offset, "invalid magic"));
    }

    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version > LOG_VERSION {
        return Err(StorageError::corrupted(
            offset,
            format!("unsupported version {version}"),
        ));
    }

    let payload_len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    let size = HEADER_SIZE + payload_len + CRC_SIZE;
    if buf.len() < size {
        return Ok(Decoded::Truncated);
    }

    let payload_end = HEADER_SIZE + payload_len;
    let stored_crc = u32::from_le_bytes([
        buf[payload_end],
        buf[payload_end + 1],
        buf[payload_end + 2],
        buf[payload_end + 3],
    ]);
    let computed_crc = compute_crc32(&buf[..payload_end]);
    if stored_crc != computed_crc {
        return Err(StorageError::ChecksumMismatch {
            offset,
            expected: stored_crc,
            actual: computed_crc,
        });
    }

    let batch: WriteBatch = ciborium::de::from_reader(&buf[HEADER_SIZE..payload_end])
        .map_err(|e| StorageError::corrupted(offset, format!("undecodable batch: {e}")))?;

    Ok(Decoded::Record { batch, size })
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, table built at compile time
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
