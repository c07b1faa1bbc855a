use snafu::{OptionExt, ResultExt, Snafu};
use std::fmt;
use std::str::FromStr;

/// Computes the CRC-32 of `data[start..]`.
///
/// With `skip_trailing_4` the last four bytes are left out, which is how a
/// file that stores its own checksum at the very end is hashed. Ranges that
/// collapse to nothing hash as the empty buffer.
#[must_use]
pub fn checksum(data: &[u8], start: usize, skip_trailing_4: bool) -> u32 {
    let end = if skip_trailing_4 {
        data.len().saturating_sub(4)
    } else {
        data.len()
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data.get(start..end).unwrap_or_default());
    hasher.finalize()
}

/// A CRC-32 value.
///
/// Displayed as eight lowercase hex digits (`0a1b2c3d`), compared as an integer.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Crc32(u32);

impl Crc32 {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Hashes a whole buffer.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(checksum(data, 0, false))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for Crc32 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Crc32> for u32 {
    fn from(value: Crc32) -> Self {
        value.0
    }
}

impl fmt::Display for Crc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Crc32({:08x})", self.0)
    }
}

/// Eight digits unless the caller asks for a width.
impl fmt::LowerHex for Crc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (f.width(), f.alternate()) {
            (Some(_), _) => fmt::LowerHex::fmt(&self.0, f),
            (None, true) => write!(f, "{:#010x}", self.0),
            (None, false) => write!(f, "{:08x}", self.0),
        }
    }
}

/// Errors when parsing a checksum from text.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseCrcError {
    #[snafu(display("checksum '{text}' must have 1 to 8 hex digits"))]
    InvalidLength { text: String },

    #[snafu(display("checksum '{text}' is not hexadecimal"))]
    InvalidDigits {
        text: String,
        source: std::num::ParseIntError,
    },
}

impl FromStr for Crc32 {
    type Err = ParseCrcError;

    /// Parses `0a1b2c3d`, `0x0A1B2C3D` and shorter forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        (1..=8)
            .contains(&digits.len())
            .then_some(())
            .context(InvalidLengthSnafu { text: s })?;

        u32::from_str_radix(digits, 16)
            .map(Self)
            .context(InvalidDigitsSnafu { text: s })
    }
}
