//! Length-prefix encoding/decoding
//!
//! Every frame on a control connection is a base-128 variable-length byte
//! count followed by exactly that many bytes of message body. The count is
//! written least-significant 7-bit group first; the last (most significant)
//! group carries the 0x80 terminal marker. Zero encodes as the single byte
//! `0x80`.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

/// Maximum frame body size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of bytes a length prefix may occupy.
///
/// Five 7-bit groups cover 35 bits, comfortably above `MAX_FRAME_SIZE`;
/// anything longer is a framing error rather than a longer read.
pub const MAX_LENGTH_PREFIX_BYTES: usize = 5;

/// Encode a byte count into `dst`.
pub fn encode_length(mut n: u64, dst: &mut BytesMut) {
    loop {
        let mut byte = (n & 0x7F) as u8;
        n >>= 7;

        if n == 0 {
            byte |= 0x80;
        }

        dst.put_u8(byte);

        if n == 0 {
            break;
        }
    }
}

/// Decode a byte count from a collected prefix.
///
/// `bytes` must be the full prefix, i.e. end with the terminal byte. The
/// groups are reassembled from last (most significant) to first.
pub fn decode_length(bytes: &[u8]) -> Result<u64, ProtocolError> {
    match bytes.last() {
        Some(last) if last & 0x80 != 0 => {}
        _ => return Err(ProtocolError::UnterminatedLength(bytes.len())),
    }

    let mut n: u64 = 0;
    for byte in bytes.iter().rev() {
        n = (n << 7) | u64::from(byte & 0x7F);
    }
    Ok(n)
}

/// Read a length prefix from a stream, one byte at a time.
///
/// Fails with `UnterminatedLength` if no terminal byte appears within
/// `MAX_LENGTH_PREFIX_BYTES`.
pub async fn read_length<R>(reader: &mut R) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; MAX_LENGTH_PREFIX_BYTES];
    for i in 0..MAX_LENGTH_PREFIX_BYTES {
        let byte = reader.read_u8().await?;
        prefix[i] = byte;
        if byte & 0x80 != 0 {
            return decode_length(&prefix[..=i]);
        }
    }
    Err(ProtocolError::UnterminatedLength(MAX_LENGTH_PREFIX_BYTES))
}
