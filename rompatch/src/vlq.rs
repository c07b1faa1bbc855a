//! Variable-length integers used by BPS patches.
//!
//! Values are split into 7-bit groups, least significant first. Every byte
//! except the last has its high bit set.

use crate::cursor::ByteCursor;
use crate::{ParseError, parse_error::*};
use snafu::{OptionExt, ResultExt};

/// A `u64` never needs more than ten groups.
pub const MAX_VLQ_LEN: usize = 10;

/// Reads one unsigned VLQ. `what` names the field for error messages.
pub fn read_vlq(cursor: &mut ByteCursor<'_>, what: &'static str) -> Result<u64, ParseError> {
    let mut value = 0u64;

    for index in 0..MAX_VLQ_LEN {
        let byte = cursor.read_u8().context(TruncatedSnafu { what })?;
        let payload = u64::from(byte & 0x7F);
        let shift = 7 * index as u32;

        let group = payload
            .checked_shl(shift)
            .filter(|group| group >> shift == payload)
            .context(MalformedSnafu {
                reason: format!("{what} does not fit in 64 bits"),
            })?;
        value |= group;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    MalformedSnafu {
        reason: format!("{what} is longer than {MAX_VLQ_LEN} bytes"),
    }
    .fail()
}

/// Appends `value` as an unsigned VLQ.
pub fn write_vlq(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;

        if value == 0 {
            out.push(byte);
            return;
        }

        out.push(byte | 0x80);
    }
}

/// Maps a sign-and-magnitude VLQ value to a signed displacement.
///
/// The low bit is the sign, the rest is the magnitude.
#[must_use]
pub const fn decode_signed(value: u64) -> i64 {
    let magnitude = (value >> 1) as i64;

    if value & 1 != 0 { -magnitude } else { magnitude }
}

/// Inverse of [`decode_signed`]. Returns `None` for `i64::MIN`, whose
/// magnitude does not fit.
#[must_use]
pub const fn encode_signed(value: i64) -> Option<u64> {
    match value.unsigned_abs().checked_mul(2) {
        Some(shifted) => Some(shifted | (value < 0) as u64),
        None => None,
    }
}

/// Reads a signed displacement.
pub fn read_signed(cursor: &mut ByteCursor<'_>, what: &'static str) -> Result<i64, ParseError> {
    read_vlq(cursor, what).map(decode_signed)
}

/// Appends a signed displacement.
///
/// Returns `None`, writing nothing, for `i64::MIN`.
pub fn write_signed(out: &mut Vec<u8>, value: i64) -> Option<()> {
    write_vlq(out, encode_signed(value)?);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use proptest::prelude::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_vlq(&mut out, value);
        out
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(127), [0x7F]);
        assert_eq!(encode(128), [0x80, 0x01]);
        assert_eq!(encode(300), [0xAC, 0x02]);
        assert_eq!(encode(u64::MAX).len(), MAX_VLQ_LEN);
    }

    #[test]
    fn unterminated_vlq_is_truncated() {
        let data = [0x80, 0x80];
        let err = read_vlq(&mut ByteCursor::new(&data), "length").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedPatch);
    }

    #[test]
    fn overlong_vlq_is_malformed() {
        let data = [0xFF; 11];
        let err = read_vlq(&mut ByteCursor::new(&data), "length").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPatch);

        let mut overflow = vec![0x80; 9];
        overflow.push(0x02);
        let err = read_vlq(&mut ByteCursor::new(&overflow), "length").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPatch);
    }

    #[test]
    fn signed_edges() {
        assert_eq!(decode_signed(0), 0);
        assert_eq!(decode_signed(1), 0);
        assert_eq!(decode_signed(2), 1);
        assert_eq!(decode_signed(3), -1);
        assert_eq!(encode_signed(0), Some(0));
        assert_eq!(encode_signed(-1), Some(3));
        assert_eq!(encode_signed(i64::MAX), Some(u64::MAX - 1));
        assert_eq!(encode_signed(i64::MIN), None);
    }

    #[test]
    fn unencodable_displacement_writes_nothing() {
        let mut out = vec![0xAA];
        assert_eq!(write_signed(&mut out, i64::MIN), None);
        assert_eq!(out, [0xAA]);

        assert_eq!(write_signed(&mut out, -i64::MAX), Some(()));
        assert_eq!(out.len(), 1 + MAX_VLQ_LEN);
    }

    proptest! {
        #[test]
        fn unsigned_roundtrip(value in any::<u32>()) {
            let bytes = encode(u64::from(value));
            let mut cursor = ByteCursor::new(&bytes);
            prop_assert_eq!(read_vlq(&mut cursor, "value").unwrap(), u64::from(value));
            prop_assert!(cursor.is_eof());
        }

        #[test]
        fn wide_roundtrip(value in any::<u64>()) {
            let bytes = encode(value);
            prop_assert_eq!(read_vlq(&mut ByteCursor::new(&bytes), "value").unwrap(), value);
        }

        #[test]
        fn signed_roundtrip(value in (i64::MIN + 1)..=i64::MAX) {
            let mut bytes = Vec::new();
            prop_assert!(write_signed(&mut bytes, value).is_some());
            prop_assert_eq!(read_signed(&mut ByteCursor::new(&bytes), "delta").unwrap(), value);
        }
    }
}
