use crate::err::{DecodeError, DecodeResult};
use crate::utils::bytes;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Utf16LeDecodeError {
    OddLength,
    InvalidData,
}

/// Decode a UTF-16LE byte slice until the first NUL (0x0000), if present.
pub(crate) fn decode_utf16le_bytes_z(bytes: &[u8]) -> Result<String, Utf16LeDecodeError> {
    if !bytes.len().is_multiple_of(2) {
        return Err(Utf16LeDecodeError::OddLength);
    }

    let mut units = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }

    decode_utf16_units_z(&units)
}

/// Decode UTF-16 code units until the first NUL (0x0000), if present.
pub(crate) fn decode_utf16_units_z(units: &[u16]) -> Result<String, Utf16LeDecodeError> {
    let end = units.iter().position(|&c| c == 0).unwrap_or(units.len());
    let slice = &units[..end];

    // Fast path: pure ASCII converts without surrogate handling.
    if slice.iter().all(|&c| c <= 0x7F) {
        return Ok(slice.iter().map(|&c| c as u8 as char).collect());
    }

    String::from_utf16(slice).map_err(|_| Utf16LeDecodeError::InvalidData)
}

/// Read a NUL-terminated UTF-16LE string starting at `offset`, never reading past `limit`.
///
/// Returns the decoded string and the number of bytes consumed, terminator included.
pub(crate) fn read_utf16z_r(
    buf: &[u8],
    offset: usize,
    limit: usize,
    what: &'static str,
) -> DecodeResult<(String, usize)> {
    let limit = limit.min(buf.len());
    let mut pos = offset;
    loop {
        if pos + 2 > limit {
            return Err(bytes::truncated(what, offset, pos + 2 - offset, limit));
        }
        if buf[pos] == 0 && buf[pos + 1] == 0 {
            break;
        }
        pos += 2;
    }

    let s = decode_utf16le_bytes_z(&buf[offset..pos]).map_err(|e| {
        DecodeError::malformed(format!("{what} at offset {offset} is not valid UTF-16 ({e:?})"))
    })?;
    Ok((s, pos + 2 - offset))
}

/// Append `s` as UTF-16LE followed by a NUL terminator.
pub(crate) fn push_utf16le_z(out: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_terminated_strings_back_to_back() {
        let mut buf = Vec::new();
        push_utf16le_z(&mut buf, "Integration Test");
        push_utf16le_z(&mut buf, "HOST-\u{00e9}");

        let (first, used) = read_utf16z_r(&buf, 0, buf.len(), "source").unwrap();
        assert_eq!(first, "Integration Test");
        let (second, _) = read_utf16z_r(&buf, used, buf.len(), "computer").unwrap();
        assert_eq!(second, "HOST-\u{00e9}");
    }

    #[test]
    fn test_missing_terminator_is_truncated() {
        let mut buf = Vec::new();
        push_utf16le_z(&mut buf, "abc");
        buf.truncate(buf.len() - 2);

        assert!(matches!(
            read_utf16z_r(&buf, 0, buf.len(), "source"),
            Err(DecodeError::Truncated { what: "source", .. })
        ));
    }

    #[test]
    fn test_lone_surrogate_is_rejected() {
        let buf = [0x00, 0xd8, 0x00, 0x00];
        assert!(matches!(
            read_utf16z_r(&buf, 0, buf.len(), "source"),
            Err(DecodeError::Malformed { .. })
        ));
    }
}
