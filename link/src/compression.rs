//! Decoding of binary WebSocket frames.
//!
//! Servers may gzip large frames and send them as binary messages; plain
//! binary frames are treated as UTF-8 text.

use crate::error::{EdenLinkError, Result};

/// Upper bound on an inflated frame.
pub const MAX_INFLATED_FRAME_BYTES: usize = 64 * 1024 * 1024;

const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FHCRC: u8 = 0x02;

/// Check the gzip magic bytes.
#[inline]
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn skip_cstr(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() && data[pos] != 0 {
        pos += 1;
    }
    pos + 1
}

/// Inflate a gzip member (header, raw DEFLATE body, 8 byte trailer).
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let invalid = |what: &str| EdenLinkError::SerializationError(format!("Invalid gzip frame: {}", what));

    if !is_gzip(data) {
        return Err(invalid("missing magic bytes"));
    }
    if data.len() < 18 {
        return Err(invalid("truncated"));
    }

    let flags = data[3];
    let mut pos = 10;
    if flags & FEXTRA != 0 {
        let xlen = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    if flags & FNAME != 0 {
        pos = skip_cstr(data, pos);
    }
    if flags & FCOMMENT != 0 {
        pos = skip_cstr(data, pos);
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }
    if pos > data.len() - 8 {
        return Err(invalid("header overruns body"));
    }

    miniz_oxide::inflate::decompress_to_vec_with_limit(&data[pos..data.len() - 8], MAX_INFLATED_FRAME_BYTES)
        .map_err(|e| invalid(&format!("{:?}", e.status)))
}

/// Turn a binary frame into text, inflating it first when gzipped.
pub fn decode_binary_frame(data: &[u8]) -> Result<String> {
    let bytes = if is_gzip(data) {
        gunzip(data)?
    } else {
        data.to_vec()
    };
    String::from_utf8(bytes)
        .map_err(|e| EdenLinkError::SerializationError(format!("Binary frame is not UTF-8: {}", e)))
}

#[cfg(test)]
pub(crate) fn gzip_for_tests(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];
    out.extend(miniz_oxide::deflate::compress_to_vec(data, 6));
    // CRC is not verified on decode.
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_gzip() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzip(&[0x1f]));
        assert!(!is_gzip(&[]));
    }

    #[test]
    fn test_plain_binary_frame() {
        assert_eq!(decode_binary_frame(b"[1,2]").unwrap(), "[1,2]");
    }

    #[test]
    fn test_gzipped_binary_frame() {
        let text = r#"[{"id":1,"result":{"type":"data","data":"hello"}}]"#.repeat(20);
        let frame = gzip_for_tests(text.as_bytes());
        assert!(frame.len() < text.len());
        assert_eq!(decode_binary_frame(&frame).unwrap(), text);
    }

    #[test]
    fn test_truncated_gzip_is_error() {
        assert!(matches!(
            decode_binary_frame(&[0x1f, 0x8b, 0x08, 0, 0]),
            Err(EdenLinkError::SerializationError(_))
        ));
    }
}
