//! Stateless encode/decode between [`TenuredCommand`] and the wire frame
//! described in `SPEC_FULL.md` §4.1. Big-endian throughout.
//!
//! ```text
//! offset  width  field
//! 0       4      total length (excludes these 4 bytes)
//! 4       4      id
//! 8       2      code
//! 10      1      flag
//! 11      2      headerLen
//! 13      2      errorCodeLen
//! 15      2      errorMessageLen
//! 17      4      bodyLen
//! 21      ...    header, errorCode (utf-8), errorMessage (utf-8), body
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::command::TenuredCommand;
use crate::error::ProtocolError;

/// Bytes preceding the variable-length sections (id..bodyLen inclusive).
const FIXED_HEADER_LEN: usize = 17;
/// Default cap on total frame size: 16 MiB (spec §5 resource bounds).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode `cmd` onto `out`, prefixed with the 4-byte total-length field.
/// Fails if `header`, `errorCode`, or `errorMessage` don't fit in their
/// 16-bit length-prefix field rather than silently truncating it.
pub fn encode(cmd: &TenuredCommand, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let error_code = cmd.error_code.as_bytes();
    let error_message = cmd.error_message.as_bytes();

    if cmd.header.len() > u16::MAX as usize {
        return Err(ProtocolError::SectionTooLarge("header", cmd.header.len()));
    }
    if error_code.len() > u16::MAX as usize {
        return Err(ProtocolError::SectionTooLarge("errorCode", error_code.len()));
    }
    if error_message.len() > u16::MAX as usize {
        return Err(ProtocolError::SectionTooLarge("errorMessage", error_message.len()));
    }

    let total_len = FIXED_HEADER_LEN
        + cmd.header.len()
        + error_code.len()
        + error_message.len()
        + cmd.body.len();

    out.reserve(4 + total_len);
    out.put_u32(total_len as u32);
    out.put_u32(cmd.id);
    out.put_u16(cmd.code);
    out.put_u8(cmd.flag());
    out.put_u16(cmd.header.len() as u16);
    out.put_u16(error_code.len() as u16);
    out.put_u16(error_message.len() as u16);
    out.put_u32(cmd.body.len() as u32);
    out.put_slice(&cmd.header);
    out.put_slice(error_code);
    out.put_slice(error_message);
    out.put_slice(&cmd.body);
    Ok(())
}

/// Decode a single frame's body (everything after the 4-byte length
/// prefix) that a transport has already assembled in full.
///
/// `total_len` is the value read from the length prefix; `buf` must
/// contain exactly `total_len` bytes.
pub fn decode(total_len: u32, mut buf: &[u8], max_frame_size: u32) -> Result<TenuredCommand, ProtocolError> {
    if total_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge(total_len, max_frame_size));
    }
    if buf.len() < FIXED_HEADER_LEN {
        return Err(ProtocolError::Truncated(FIXED_HEADER_LEN, buf.len()));
    }
    if (total_len as usize) < FIXED_HEADER_LEN {
        return Err(ProtocolError::LengthMismatch(total_len, FIXED_HEADER_LEN as u32));
    }

    let id = buf.get_u32();
    let code = buf.get_u16();
    let flag = buf.get_u8();
    let header_len = buf.get_u16() as usize;
    let error_code_len = buf.get_u16() as usize;
    let error_message_len = buf.get_u16() as usize;
    let body_len = buf.get_u32() as usize;

    let declared_sections = header_len + error_code_len + error_message_len + body_len;
    let available_sections = total_len as usize - FIXED_HEADER_LEN;
    if declared_sections != available_sections || buf.len() != available_sections {
        return Err(ProtocolError::LengthMismatch(
            declared_sections as u32,
            available_sections as u32,
        ));
    }

    let header = take(&mut buf, header_len);
    let error_code = utf8(take(&mut buf, error_code_len), "errorCode")?;
    let error_message = utf8(take(&mut buf, error_message_len), "errorMessage")?;
    let body = take(&mut buf, body_len);

    Ok(TenuredCommand::from_raw_flag(
        id,
        code,
        flag,
        error_code,
        error_message,
        header,
        body,
    ))
}

fn take(buf: &mut &[u8], n: usize) -> Vec<u8> {
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    head.to_vec()
}

fn utf8(bytes: Vec<u8>, section: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(section))
}

/// Incremental frame assembler for a byte stream: buffers partial reads and
/// yields whole [`TenuredCommand`]s as they complete. The transport reader
/// task owns one of these per connection; the codec itself stays stateless.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Feed freshly-read bytes in.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if one is ready.
    pub fn next_frame(&mut self) -> Result<Option<TenuredCommand>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes(self.buf[..4].try_into().unwrap());
        if total_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(total_len, self.max_frame_size));
        }
        let frame_end = 4 + total_len as usize;
        if self.buf.len() < frame_end {
            return Ok(None);
        }
        self.buf.advance(4);
        let frame = self.buf.split_to(total_len as usize);
        decode(total_len, &frame, self.max_frame_size).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_request() {
        let cmd = TenuredCommand::request(42, 0x1000, b"hdr".to_vec(), b"ping".to_vec());
        let mut out = BytesMut::new();
        encode(&cmd, &mut out).unwrap();

        let total_len = u32::from_be_bytes(out[..4].try_into().unwrap());
        let decoded = decode(total_len, &out[4..], DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn encode_decode_roundtrip_error_response() {
        let cmd = TenuredCommand::error_response(7, 0x1000, "1000", "not found auth info.");
        let mut out = BytesMut::new();
        encode(&cmd, &mut out).unwrap();
        let total_len = u32::from_be_bytes(out[..4].try_into().unwrap());
        let decoded = decode(total_len, &out[4..], DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, cmd);
        assert!(decoded.is_error());
        assert!(decoded.is_ack());
    }

    #[test]
    fn rejects_oversized_frame() {
        let cmd = TenuredCommand::request(1, 1, vec![0; 10], vec![0; 10]);
        let mut out = BytesMut::new();
        encode(&cmd, &mut out).unwrap();
        let total_len = u32::from_be_bytes(out[..4].try_into().unwrap());
        let err = decode(total_len, &out[4..], 8).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge(total_len, 8));
    }

    #[test]
    fn encode_rejects_a_header_too_large_for_its_length_prefix() {
        let cmd = TenuredCommand::request(1, 1, vec![0; u16::MAX as usize + 1], vec![]);
        let mut out = BytesMut::new();
        let err = encode(&cmd, &mut out).unwrap_err();
        assert!(matches!(err, ProtocolError::SectionTooLarge("header", _)));
    }

    #[test]
    fn rejects_length_mismatch() {
        let cmd = TenuredCommand::request(1, 1, vec![1, 2, 3], vec![4, 5]);
        let mut out = BytesMut::new();
        encode(&cmd, &mut out).unwrap();
        let total_len = u32::from_be_bytes(out[..4].try_into().unwrap());
        // Corrupt the bodyLen field (offset 4 + 17 - 4 = 17 within the frame body).
        let mut frame = out[4..].to_vec();
        frame[13] = 0xFF; // bodyLen high byte garbage
        let err = decode(total_len, &frame, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch(_, _)));
    }

    #[test]
    fn rejects_a_total_len_shorter_than_the_fixed_header() {
        let buf = vec![0u8; 20];
        let err = decode(5, &buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch(_, _)));
    }

    #[test]
    fn frame_decoder_assembles_partial_reads() {
        let cmd = TenuredCommand::request(9, 2, vec![], b"split me".to_vec());
        let mut out = BytesMut::new();
        encode(&cmd, &mut out).unwrap();

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let (first, second) = out.split_at(out.len() / 2);
        decoder.feed(first);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.feed(second);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn frame_decoder_rejects_oversized_before_buffering_whole_frame() {
        let mut decoder = FrameDecoder::new(4);
        let mut len_prefix = BytesMut::new();
        len_prefix.put_u32(100);
        decoder.feed(&len_prefix);
        assert!(decoder.next_frame().is_err());
    }
}
