//! Self-describing layout for one encrypted payload.
//!
//! A frame is a single buffer: a 4-byte header of field lengths, the
//! ciphertext, then three trailing fields read backward from the end:
//!
//! ```text
//! [0]      len(additional_data)
//! [1]      len(message_hash)
//! [2]      len(version)
//! [3]      reserved, written as zero
//! [4..N]   encrypted_data (fills the remaining space)
//! [N..]    additional_data | message_hash | version
//! ```
//!
//! There is no total-length field: decode subtracts the three trailing
//! lengths from the buffer end and treats everything between the header and
//! the first trailing field as ciphertext. Trailing lengths that do not fit
//! in the buffer are a hard decode error, never a silent misread.

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("trailing fields ({trailing} bytes) exceed frame body ({body} bytes)")]
    TrailingOverflow { trailing: usize, body: usize },
    #[error("field {0} exceeds 255 bytes")]
    FieldTooLong(&'static str),
    #[error("version is not valid utf-8")]
    InvalidVersion,
    #[error("message hash is not valid utf-8")]
    InvalidHash,
}

/// Output of the tunnel cipher, input to [`encode`]. Transient only; frames
/// are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFrame {
    pub encrypted_data: Vec<u8>,
    pub additional_data: Vec<u8>,
    pub message_hash: String,
    pub version: String,
}

pub fn encode(frame: &EncryptedFrame) -> Result<Vec<u8>, FrameError> {
    if frame.additional_data.len() > u8::MAX as usize {
        return Err(FrameError::FieldTooLong("additional_data"));
    }
    if frame.message_hash.len() > u8::MAX as usize {
        return Err(FrameError::FieldTooLong("message_hash"));
    }
    if frame.version.len() > u8::MAX as usize {
        return Err(FrameError::FieldTooLong("version"));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + frame.encrypted_data.len() + frame.additional_data.len() + frame.message_hash.len() + frame.version.len());
    buf.push(frame.additional_data.len() as u8);
    buf.push(frame.message_hash.len() as u8);
    buf.push(frame.version.len() as u8);
    buf.push(0);
    buf.extend_from_slice(&frame.encrypted_data);
    buf.extend_from_slice(&frame.additional_data);
    buf.extend_from_slice(frame.message_hash.as_bytes());
    buf.extend_from_slice(frame.version.as_bytes());
    Ok(buf)
}

pub fn decode(buf: &[u8]) -> Result<EncryptedFrame, FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort(buf.len()));
    }

    let additional_len = buf[0] as usize;
    let hash_len = buf[1] as usize;
    let version_len = buf[2] as usize;

    let body = buf.len() - FRAME_HEADER_LEN;
    let trailing = additional_len + hash_len + version_len;
    if trailing > body {
        return Err(FrameError::TrailingOverflow { trailing, body });
    }

    let version_start = buf.len() - version_len;
    let hash_start = version_start - hash_len;
    let additional_start = hash_start - additional_len;

    Ok(EncryptedFrame {
        encrypted_data: buf[FRAME_HEADER_LEN..additional_start].to_vec(),
        additional_data: buf[additional_start..hash_start].to_vec(),
        message_hash: String::from_utf8(buf[hash_start..version_start].to_vec()).map_err(|_| FrameError::InvalidHash)?,
        version: String::from_utf8(buf[version_start..].to_vec()).map_err(|_| FrameError::InvalidVersion)?,
    })
}
