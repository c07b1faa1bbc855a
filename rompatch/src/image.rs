use crate::checksum::{Crc32, checksum};
use snafu::{Snafu, ensure};

/// Size of the copier header some SNES dumps carry.
pub const COPIER_HEADER_SIZE: usize = 512;

/// Guesses the copier header size of a file `len` bytes long.
///
/// Dumps whose length leaves 512 bytes over a 1 KiB boundary almost always
/// carry a copier header.
#[must_use]
pub const fn suggested_header_size(len: usize) -> usize {
    if len % 1024 == COPIER_HEADER_SIZE {
        COPIER_HEADER_SIZE
    } else {
        0
    }
}

/// Errors when attaching a header to an image.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum HeaderError {
    #[snafu(display("header of {header_size} bytes does not fit in a {len} byte image"))]
    HeaderTooLarge { header_size: usize, len: usize },
}

/// An owned ROM image.
///
/// The first `header_size` bytes are a copier header that patches do not
/// address; [`Image::body()`] is everything after it. Patching never mutates
/// an image, it always produces a new one without a header.
#[derive(Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct Image {
    data: Vec<u8>,
    header_size: usize,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("len", &self.data.len())
            .field("header_size", &self.header_size)
            .finish_non_exhaustive()
    }
}

impl Image {
    /// Creates a headerless image.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            header_size: 0,
        }
    }

    /// Marks the first `header_size` bytes as a header.
    pub fn with_header(self, header_size: usize) -> Result<Self, HeaderError> {
        ensure!(
            header_size <= self.data.len(),
            HeaderTooLargeSnafu {
                header_size,
                len: self.data.len(),
            }
        );

        Ok(Self {
            data: self.data,
            header_size,
        })
    }

    /// Drops the header bytes, keeping only the body.
    pub fn without_header(mut self) -> Self {
        self.data.drain(..self.header_size);
        self.header_size = 0;
        self
    }

    /// Prepends `header` to the image and marks it as the header.
    ///
    /// An existing header stays in front of the body, behind the new one.
    pub fn prepend_header(self, header: &[u8]) -> Self {
        let mut data = Vec::with_capacity(header.len() + self.data.len());
        data.extend_from_slice(header);
        data.extend_from_slice(&self.data);

        Self {
            data,
            header_size: header.len() + self.header_size,
        }
    }

    /// Prepends a zero-filled temporary header of `size` bytes.
    pub fn add_header(self, size: usize) -> Self {
        self.prepend_header(&vec![0u8; size])
    }

    /// Guesses the header size from the image length.
    #[must_use]
    pub fn suggested_header_size(&self) -> usize {
        suggested_header_size(self.data.len())
    }

    #[must_use]
    pub const fn header_size(&self) -> usize {
        self.header_size
    }

    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.data[..self.header_size]
    }

    /// Returns the patch-relevant bytes after the header.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.data[self.header_size..]
    }

    /// Returns every byte, header included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// CRC-32 of the body.
    #[must_use]
    pub fn checksum(&self) -> Crc32 {
        Crc32::new(checksum(&self.data, self.header_size, false))
    }
}

impl From<Vec<u8>> for Image {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl AsRef<[u8]> for Image {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_excluded_from_body_and_checksum() {
        let image = Image::new(b"HDRabc".to_vec()).with_header(3).unwrap();

        assert_eq!(image.header(), b"HDR");
        assert_eq!(image.body(), b"abc");
        assert_eq!(image.checksum(), Crc32::new(0x352441c2));
        assert_eq!(image.len(), 6);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let err = Image::new(vec![0; 4]).with_header(5).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::HeaderTooLarge {
                header_size: 5,
                len: 4
            }
        ));
    }

    #[test]
    fn add_and_remove_header() {
        let image = Image::new(vec![1, 2, 3]).add_header(2);
        assert_eq!(image.as_bytes(), &[0, 0, 1, 2, 3]);
        assert_eq!(image.body(), &[1, 2, 3]);

        let stripped = image.without_header();
        assert_eq!(stripped.as_bytes(), &[1, 2, 3]);
        assert_eq!(stripped.header_size(), 0);
    }

    #[test]
    fn copier_header_detection() {
        assert_eq!(Image::new(vec![0; 1024 * 4 + 512]).suggested_header_size(), 512);
        assert_eq!(Image::new(vec![0; 1024 * 4]).suggested_header_size(), 0);
        assert_eq!(Image::new(Vec::new()).suggested_header_size(), 0);
    }
}
