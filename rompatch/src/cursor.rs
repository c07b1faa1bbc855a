//! Sequential reader over an in-memory patch buffer.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use snafu::Snafu;
use std::io::Cursor;
use zerocopy::FromBytes;

/// Errors when reading past the end of the buffer.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display(
        "unexpected end of data at offset {offset} (wanted {wanted} bytes, {available} available)"
    ))]
    UnexpectedEof {
        offset: usize,
        wanted: usize,
        available: usize,
    },
}

type Result<T, E = ReadError> = std::result::Result<T, E>;

/// A positioned, bounds-checked reader over a byte slice.
///
/// Every read either consumes exactly the requested number of bytes or fails
/// with [`ReadError::UnexpectedEof`] without moving the position.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    inner: Cursor<&'a [u8]>,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            inner: Cursor::new(data),
        }
    }

    /// Returns the whole underlying buffer, regardless of position.
    #[must_use]
    pub fn get_ref(&self) -> &'a [u8] {
        *self.inner.get_ref()
    }

    /// Returns the current read position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.inner.position() as usize
    }

    /// Returns the total length of the underlying buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.get_ref().len()
    }

    /// Returns `true` if the underlying buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position())
    }

    /// Returns `true` once every byte has been consumed.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    /// Moves to an absolute position. Seeking to the very end is allowed.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.len() {
            return Err(ReadError::UnexpectedEof {
                offset: pos,
                wanted: 0,
                available: 0,
            });
        }

        self.inner.set_position(pos as u64);
        Ok(())
    }

    /// Builds the error a read of `wanted` bytes at the current position would produce.
    #[must_use]
    pub fn truncated(&self, wanted: usize) -> ReadError {
        ReadError::UnexpectedEof {
            offset: self.position(),
            wanted,
            available: self.remaining(),
        }
    }

    fn require(&self, wanted: usize) -> Result<()> {
        if self.remaining() < wanted {
            return Err(self.truncated(wanted));
        }

        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        self.inner.read_u8().map_err(|_| self.truncated(1))
    }

    /// Reads `n` bytes, borrowing them from the underlying buffer.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.require(n)?;

        let start = self.position();
        let data = self.get_ref();
        self.inner.set_position((start + n) as u64);

        Ok(&data[start..start + n])
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        self.require(2)?;
        self.inner
            .read_u16::<BigEndian>()
            .map_err(|_| self.truncated(2))
    }

    pub fn read_u24_be(&mut self) -> Result<u32> {
        self.require(3)?;
        self.inner
            .read_u24::<BigEndian>()
            .map_err(|_| self.truncated(3))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.require(4)?;
        self.inner
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated(4))
    }

    /// Reads `n` bytes as text. Invalid UTF-8 sequences are replaced.
    pub fn read_string(&mut self, n: usize) -> Result<String> {
        let bytes = self.read_bytes(n)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Reads a fixed-layout structure.
    pub fn read_struct<T: FromBytes>(&mut self) -> Result<T> {
        let wanted = size_of::<T>();
        let bytes = self.read_bytes(wanted)?;

        T::read_from_bytes(bytes).map_err(|_| ReadError::UnexpectedEof {
            offset: self.position() - wanted,
            wanted,
            available: wanted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_mixed_endianness() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x78, 0x56, 0x34, 0x12];
        let mut cursor = ByteCursor::new(&data);

        assert_eq!(cursor.read_u16_be().unwrap(), 0x0102);
        assert_eq!(cursor.read_u24_be().unwrap(), 0x030405);
        assert_eq!(cursor.read_u32_le().unwrap(), 0x12345678);
        assert!(cursor.is_eof());
    }

    #[test]
    fn short_read_does_not_move() {
        let data = [0xAA, 0xBB];
        let mut cursor = ByteCursor::new(&data);
        cursor.read_u8().unwrap();

        let err = cursor.read_u24_be().unwrap_err();
        let ReadError::UnexpectedEof {
            offset,
            wanted,
            available,
        } = err;

        assert_eq!((offset, wanted, available), (1, 3, 1));
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.read_u8().unwrap(), 0xBB);
    }

    #[test]
    fn seek_and_strings() {
        let data = b"xxBPS1";
        let mut cursor = ByteCursor::new(data);

        cursor.seek(2).unwrap();
        assert_eq!(cursor.read_string(4).unwrap(), "BPS1");
        assert!(cursor.seek(7).is_err());
        cursor.seek(6).unwrap();
        assert!(cursor.read_bytes(1).is_err());
    }
}
