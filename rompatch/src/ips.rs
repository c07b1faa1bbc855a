//! IPS patches: offset-addressed literal and run-length records.
//!
//! ```text
//! "PATCH"
//! { offset:u24be size:u16be (size > 0: data[size] | size == 0: run:u16be value:u8) }*
//! "EOF" [truncate:u24be]
//! ```

use crate::cursor::ByteCursor;
use crate::{ApplyError, Limits, ParseError, apply_error, parse_error::*};
use snafu::{ResultExt, Snafu, ensure};

pub const IPS_MAGIC: &[u8; 5] = b"PATCH";

/// The offset value that ends the record stream ("EOF").
pub const EOF_MARKER: u32 = 0x454F46;

/// Largest offset a 24-bit field can hold.
pub const MAX_OFFSET: usize = 0xFF_FFFF;

/// Largest payload a single record can carry.
pub const MAX_RECORD_SIZE: usize = 0xFFFF;

/// Errors when encoding an IPS patch.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EncodeError {
    #[snafu(display("record offset {offset:#x} does not fit in 24 bits"))]
    OffsetOutOfRange { offset: usize },

    #[snafu(display("record offset {offset:#x} collides with the EOF marker"))]
    OffsetIsEofMarker { offset: usize },

    #[snafu(display("record at {offset:#x} is {len} bytes, more than a record can hold"))]
    RecordTooLong { offset: usize, len: usize },

    #[snafu(display("record at {offset:#x} is empty"))]
    EmptyRecord { offset: usize },

    #[snafu(display("truncation length {len} does not fit in 24 bits"))]
    TruncateOutOfRange { len: usize },
}

/// One IPS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpsRecord {
    /// Write `data` at `offset`.
    Replace { offset: usize, data: Vec<u8> },
    /// Write `length` copies of `value` at `offset`.
    Fill {
        offset: usize,
        length: usize,
        value: u8,
    },
}

impl IpsRecord {
    #[must_use]
    pub const fn offset(&self) -> usize {
        match self {
            Self::Replace { offset, .. } | Self::Fill { offset, .. } => *offset,
        }
    }

    /// Returns the number of bytes the record writes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Replace { data, .. } => data.len(),
            Self::Fill { length, .. } => *length,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns one past the last offset the record writes.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset().saturating_add(self.len())
    }
}

/// A parsed IPS patch.
///
/// Records are kept in file order; later records overwrite earlier ones
/// where they overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct IpsPatch {
    records: Vec<IpsRecord>,
    truncate: Option<usize>,
}

impl IpsPatch {
    pub fn new(records: Vec<IpsRecord>, truncate: Option<usize>) -> Self {
        Self { records, truncate }
    }

    #[must_use]
    pub fn records(&self) -> &[IpsRecord] {
        &self.records
    }

    /// Returns the length the target is cut (or padded) to, if the patch sets one.
    #[must_use]
    pub const fn truncate(&self) -> Option<usize> {
        self.truncate
    }

    /// Parses an IPS patch, starting at its magic.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Malformed`] on a wrong magic and
    /// [`ParseError::Truncated`] if the data ends inside a record or before
    /// the EOF marker.
    pub fn parse(cursor: &mut ByteCursor<'_>) -> Result<Self, ParseError> {
        let magic = cursor
            .read_bytes(IPS_MAGIC.len())
            .context(TruncatedSnafu { what: "IPS magic" })?;
        ensure!(
            magic == IPS_MAGIC,
            MalformedSnafu {
                reason: "missing IPS magic"
            }
        );

        let mut records = Vec::new();
        let mut truncate = None;

        loop {
            let offset = cursor.read_u24_be().context(TruncatedSnafu {
                what: "IPS record offset",
            })?;

            if offset == EOF_MARKER {
                if !cursor.is_eof() {
                    let len = cursor.read_u24_be().context(TruncatedSnafu {
                        what: "IPS truncation length",
                    })?;
                    truncate = Some(len as usize);
                }

                if !cursor.is_eof() {
                    log::warn!(
                        "ignoring {} bytes after the IPS EOF marker",
                        cursor.remaining()
                    );
                }

                break;
            }

            let offset = offset as usize;
            let size = cursor.read_u16_be().context(TruncatedSnafu {
                what: "IPS record size",
            })?;

            let record = if size == 0 {
                let length = cursor.read_u16_be().context(TruncatedSnafu {
                    what: "IPS run length",
                })?;
                let value = cursor.read_u8().context(TruncatedSnafu {
                    what: "IPS run value",
                })?;

                IpsRecord::Fill {
                    offset,
                    length: length.into(),
                    value,
                }
            } else {
                let data = cursor.read_bytes(size.into()).context(TruncatedSnafu {
                    what: "IPS record data",
                })?;

                IpsRecord::Replace {
                    offset,
                    data: data.to_vec(),
                }
            };

            log::trace!(
                "IPS record #{} at {:#08x}, {} bytes",
                records.len(),
                offset,
                record.len()
            );
            records.push(record);
        }

        log::debug!(
            "parsed IPS patch: {} records, truncate {:?}",
            records.len(),
            truncate
        );

        Ok(Self { records, truncate })
    }

    /// Serializes the patch.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        out.extend_from_slice(IPS_MAGIC);

        for record in &self.records {
            let offset = record.offset();
            ensure!(offset <= MAX_OFFSET, OffsetOutOfRangeSnafu { offset });
            ensure!(offset != EOF_MARKER as usize, OffsetIsEofMarkerSnafu { offset });

            let len = record.len();
            ensure!(len <= MAX_RECORD_SIZE, RecordTooLongSnafu { offset, len });

            if let IpsRecord::Replace { data, .. } = record {
                ensure!(!data.is_empty(), EmptyRecordSnafu { offset });
            }

            push_u24(&mut out, offset as u32);

            match record {
                IpsRecord::Replace { data, .. } => {
                    out.extend_from_slice(&(len as u16).to_be_bytes());
                    out.extend_from_slice(data);
                }
                IpsRecord::Fill { length, value, .. } => {
                    out.extend_from_slice(&0u16.to_be_bytes());
                    out.extend_from_slice(&(*length as u16).to_be_bytes());
                    out.push(*value);
                }
            }
        }

        push_u24(&mut out, EOF_MARKER);

        if let Some(len) = self.truncate {
            ensure!(len <= MAX_OFFSET, TruncateOutOfRangeSnafu { len });
            push_u24(&mut out, len as u32);
        }

        Ok(out)
    }

    /// Replays the records over a copy of `source`.
    ///
    /// Writes past the end grow the output, zero-filling any gap. A record
    /// that would grow it beyond `limits.max_image_size` is refused.
    pub(crate) fn replay(&self, source: &[u8], limits: &Limits) -> Result<Vec<u8>, ApplyError> {
        let mut out = source.to_vec();

        for (num, record) in self.records.iter().enumerate() {
            let (start, end) = (record.offset(), record.end());

            if end > out.len() {
                ensure!(
                    end <= limits.max_image_size,
                    apply_error::MalformedSnafu {
                        reason: format!(
                            "record #{num} ends at {end}, beyond the {} byte size limit",
                            limits.max_image_size
                        ),
                    }
                );
                out.resize(end, 0);
            }

            match record {
                IpsRecord::Replace { data, .. } => out[start..end].copy_from_slice(data),
                IpsRecord::Fill { value, .. } => out[start..end].fill(*value),
            }
        }

        if let Some(len) = self.truncate {
            ensure!(
                len <= limits.max_image_size,
                apply_error::MalformedSnafu {
                    reason: format!(
                        "truncation length {len} is beyond the {} byte size limit",
                        limits.max_image_size
                    ),
                }
            );
            out.resize(len, 0);
        }

        Ok(out)
    }
}

fn push_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes()[1..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;

    fn parse(data: &[u8]) -> Result<IpsPatch, ParseError> {
        IpsPatch::parse(&mut ByteCursor::new(data))
    }

    #[test]
    fn parses_literal_and_run_records() {
        let data = b"PATCH\x00\x00\x02\x00\x02AB\x00\x00\x10\x00\x00\x00\x04\xFFEOF";
        let patch = parse(data).unwrap();

        assert_eq!(
            patch.records(),
            &[
                IpsRecord::Replace {
                    offset: 2,
                    data: b"AB".to_vec()
                },
                IpsRecord::Fill {
                    offset: 0x10,
                    length: 4,
                    value: 0xFF
                },
            ]
        );
        assert_eq!(patch.truncate(), None);
    }

    #[test]
    fn parses_truncation_extension() {
        let patch = parse(b"PATCHEOF\x00\x01\x00").unwrap();
        assert!(patch.records().is_empty());
        assert_eq!(patch.truncate(), Some(0x100));
    }

    #[test]
    fn bytes_after_truncation_field_are_ignored() {
        let patch = parse(b"PATCHEOF\x00\x01\x00\xAA\xBB").unwrap();
        assert!(patch.records().is_empty());
        assert_eq!(patch.truncate(), Some(0x100));
    }

    #[test]
    fn partial_truncation_field_is_truncated() {
        let err = parse(b"PATCHEOF\x00\x01").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedPatch);
    }

    #[test]
    fn cut_records_are_truncated() {
        let full = b"PATCH\x00\x00\x02\x00\x04ABCDEOF";

        for cut in IPS_MAGIC.len()..full.len() - 3 {
            let err = parse(&full[..cut]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TruncatedPatch, "cut at {cut}");
        }
    }

    #[test]
    fn wrong_magic_is_malformed() {
        let err = parse(b"PATCX\x00").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPatch);
    }

    #[test]
    fn replay_grows_and_overwrites_in_order() {
        let patch = IpsPatch::new(
            vec![
                IpsRecord::Fill {
                    offset: 1,
                    length: 3,
                    value: 0xEE,
                },
                IpsRecord::Replace {
                    offset: 2,
                    data: vec![1, 2],
                },
                IpsRecord::Replace {
                    offset: 6,
                    data: vec![9],
                },
            ],
            None,
        );

        let out = patch.replay(&[0xAA; 3], &Limits::default()).unwrap();
        assert_eq!(out, vec![0xAA, 0xEE, 1, 2, 0, 0, 9]);
    }

    #[test]
    fn replay_applies_truncation_last() {
        let patch = IpsPatch::new(
            vec![IpsRecord::Replace {
                offset: 4,
                data: vec![7, 7],
            }],
            Some(5),
        );

        let out = patch.replay(&[1, 2, 3], &Limits::default()).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0, 7]);
    }

    #[test]
    fn replay_refuses_growth_beyond_limit() {
        let patch = IpsPatch::new(
            vec![IpsRecord::Fill {
                offset: 100,
                length: 10,
                value: 0,
            }],
            None,
        );
        let limits = Limits::default().with_max_image_size(64);

        let err = patch.replay(&[], &limits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPatch);

        // Records inside the existing image never hit the cap.
        assert!(patch.replay(&[0; 200], &limits).is_ok());
    }

    #[test]
    fn encode_matches_parse() {
        let patch = IpsPatch::new(
            vec![
                IpsRecord::Replace {
                    offset: 0x123456,
                    data: b"xyz".to_vec(),
                },
                IpsRecord::Fill {
                    offset: 0,
                    length: 0x300,
                    value: 0x42,
                },
            ],
            Some(0x20),
        );

        let bytes = patch.encode().unwrap();
        assert_eq!(&bytes[..5], IPS_MAGIC);
        assert_eq!(parse(&bytes).unwrap(), patch);
    }

    #[test]
    fn encode_rejects_unrepresentable_records() {
        let eof = IpsPatch::new(
            vec![IpsRecord::Replace {
                offset: EOF_MARKER as usize,
                data: vec![1],
            }],
            None,
        );
        assert!(matches!(
            eof.encode(),
            Err(EncodeError::OffsetIsEofMarker { .. })
        ));

        let long = IpsPatch::new(
            vec![IpsRecord::Replace {
                offset: 0,
                data: vec![0; MAX_RECORD_SIZE + 1],
            }],
            None,
        );
        assert!(matches!(
            long.encode(),
            Err(EncodeError::RecordTooLong { .. })
        ));

        let empty = IpsPatch::new(
            vec![IpsRecord::Replace {
                offset: 3,
                data: Vec::new(),
            }],
            None,
        );
        assert!(matches!(
            empty.encode(),
            Err(EncodeError::EmptyRecord { offset: 3 })
        ));
    }

    #[test]
    fn encodes_big_endian_fields() {
        let patch = IpsPatch::new(
            vec![IpsRecord::Fill {
                offset: 0x010203,
                length: 0x0405,
                value: 0x06,
            }],
            Some(0x0A0B0C),
        );

        assert_eq!(
            patch.encode().unwrap(),
            b"PATCH\x01\x02\x03\x00\x00\x04\x05\x06EOF\x0A\x0B\x0C"
        );
    }
}
