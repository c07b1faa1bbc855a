//! BPS patches: a delta-copy action stream over persistent copy cursors.
//!
//! ```text
//! "BPS1" source_size:vlq target_size:vlq metadata_size:vlq metadata[metadata_size]
//! { action:vlq [data | displacement:vlq] }*      until target_size bytes are produced
//! source_crc:u32le target_crc:u32le patch_crc:u32le
//! ```

use crate::checksum::{Crc32, checksum};
use crate::cursor::ByteCursor;
use crate::vlq::{encode_signed, read_signed, read_vlq, write_signed, write_vlq};
use crate::{ApplyError, Limits, ParseError, apply_error, parse_error::*};
use snafu::{OptionExt, ResultExt, ensure};
use std::borrow::Cow;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const BPS_MAGIC: &[u8; 4] = b"BPS1";

/// Size of the trailing checksum block.
pub const FOOTER_SIZE: usize = size_of::<BpsFooter>();

const SOURCE_READ: u64 = 0;
const TARGET_READ: u64 = 1;
const SOURCE_COPY: u64 = 2;
const TARGET_COPY: u64 = 3;

/// The three checksums closing a BPS patch.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub struct BpsFooter {
    source_crc: U32, // 0x00
    target_crc: U32, // 0x04
    patch_crc: U32,  // 0x08
}

impl BpsFooter {
    #[must_use]
    pub fn source_crc(&self) -> Crc32 {
        Crc32::new(self.source_crc.get())
    }

    #[must_use]
    pub fn target_crc(&self) -> Crc32 {
        Crc32::new(self.target_crc.get())
    }

    /// Checksum of the patch file up to, but excluding, this field.
    #[must_use]
    pub fn patch_crc(&self) -> Crc32 {
        Crc32::new(self.patch_crc.get())
    }
}

/// One BPS action. Lengths are always at least 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BpsAction {
    /// Copy from the source at the current output position.
    SourceRead { length: usize },
    /// Copy literal bytes stored in the patch.
    TargetRead { data: Vec<u8> },
    /// Move the source copy cursor, then copy from the source.
    SourceCopy { length: usize, displacement: i64 },
    /// Move the target copy cursor, then copy from the output already written.
    TargetCopy { length: usize, displacement: i64 },
}

impl BpsAction {
    /// Returns the number of output bytes the action produces.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::SourceRead { length }
            | Self::SourceCopy { length, .. }
            | Self::TargetCopy { length, .. } => *length,
            Self::TargetRead { data } => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    const fn kind(&self) -> u64 {
        match self {
            Self::SourceRead { .. } => SOURCE_READ,
            Self::TargetRead { .. } => TARGET_READ,
            Self::SourceCopy { .. } => SOURCE_COPY,
            Self::TargetCopy { .. } => TARGET_COPY,
        }
    }
}

/// A parsed BPS patch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct BpsPatch {
    source_size: usize,
    target_size: usize,
    metadata: Vec<u8>,
    actions: Vec<BpsAction>,
    footer: BpsFooter,
    actual_patch_crc: Crc32,
}

impl BpsPatch {
    /// Declared length of the source body.
    #[must_use]
    pub const fn source_size(&self) -> usize {
        self.source_size
    }

    /// Length of the image the actions produce.
    #[must_use]
    pub const fn target_size(&self) -> usize {
        self.target_size
    }

    /// Free-form metadata, usually an XML manifest. Often empty.
    ///
    /// Invalid UTF-8 sequences are replaced; [`BpsPatch::metadata_bytes()`]
    /// has the bytes as stored.
    #[must_use]
    pub fn metadata(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.metadata)
    }

    #[must_use]
    pub fn metadata_bytes(&self) -> &[u8] {
        &self.metadata
    }

    #[must_use]
    pub fn actions(&self) -> &[BpsAction] {
        &self.actions
    }

    #[must_use]
    pub const fn footer(&self) -> &BpsFooter {
        &self.footer
    }

    /// Parses a BPS patch that starts at the cursor and runs to the end of
    /// its buffer.
    ///
    /// # Errors
    ///
    /// - [`ParseError::Malformed`] on a wrong magic, an overlong VLQ, or an
    ///   action that writes past the declared target size.
    /// - [`ParseError::Truncated`] if the header or an action runs into the
    ///   checksum footer.
    /// - [`ParseError::AllocationLimit`] if a declared size exceeds `limits`.
    pub fn parse(cursor: &mut ByteCursor<'_>, limits: &Limits) -> Result<Self, ParseError> {
        let data = cursor.get_ref();
        let start = cursor.position();

        let magic = cursor
            .read_bytes(BPS_MAGIC.len())
            .context(TruncatedSnafu { what: "BPS magic" })?;
        ensure!(
            magic == BPS_MAGIC,
            MalformedSnafu {
                reason: "missing BPS magic"
            }
        );

        // The body must leave room for the footer.
        let footer_start = data
            .len()
            .checked_sub(FOOTER_SIZE)
            .filter(|&footer_start| footer_start >= cursor.position())
            .ok_or_else(|| cursor.truncated(FOOTER_SIZE))
            .context(TruncatedSnafu { what: "BPS footer" })?;

        let mut body = ByteCursor::new(&data[..footer_start]);
        body.seek(cursor.position())
            .context(TruncatedSnafu { what: "BPS header" })?;

        let source_size = check_limit(
            "declared source size",
            read_vlq(&mut body, "BPS source size")?,
            limits.max_image_size,
        )?;
        let target_size = check_limit(
            "declared target size",
            read_vlq(&mut body, "BPS target size")?,
            limits.max_image_size,
        )?;
        let metadata_size = check_limit(
            "metadata",
            read_vlq(&mut body, "BPS metadata size")?,
            limits.max_metadata_size,
        )?;

        let metadata = body
            .read_bytes(metadata_size)
            .context(TruncatedSnafu {
                what: "BPS metadata",
            })?
            .to_vec();

        let actions = read_actions(&mut body, target_size)?;

        if !body.is_eof() {
            log::warn!(
                "ignoring {} bytes between the last BPS action and the footer",
                body.remaining()
            );
        }

        cursor
            .seek(footer_start)
            .context(TruncatedSnafu { what: "BPS footer" })?;
        let footer: BpsFooter = cursor
            .read_struct()
            .context(TruncatedSnafu { what: "BPS footer" })?;

        let actual_patch_crc = Crc32::new(checksum(data, start, true));
        if actual_patch_crc != footer.patch_crc() {
            log::warn!(
                "BPS patch checksum is {actual_patch_crc}, footer says {}",
                footer.patch_crc()
            );
        }

        log::debug!(
            "parsed BPS patch: {} -> {} bytes, {} actions, {} bytes of metadata",
            source_size,
            target_size,
            actions.len(),
            metadata.len()
        );

        Ok(Self {
            source_size,
            target_size,
            metadata,
            actions,
            footer,
            actual_patch_crc,
        })
    }

    /// Builds a patch from hand-written actions.
    ///
    /// The actions are replayed against `source` to derive the target size
    /// and both image checksums; the patch checksum is that of the encoded
    /// container.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Malformed`] for empty actions, unencodable
    /// displacements, or actions that read outside their buffers, and
    /// [`ApplyError::AllocationLimit`] if a size exceeds `limits`.
    pub fn from_actions(
        source: &[u8],
        metadata: impl Into<Vec<u8>>,
        actions: Vec<BpsAction>,
        limits: &Limits,
    ) -> Result<Self, ApplyError> {
        let metadata = metadata.into();

        for (num, action) in actions.iter().enumerate() {
            ensure!(
                !action.is_empty(),
                apply_error::MalformedSnafu {
                    reason: format!("action #{num} is empty"),
                }
            );

            if let BpsAction::SourceCopy { displacement, .. }
            | BpsAction::TargetCopy { displacement, .. } = action
            {
                ensure!(
                    encode_signed(*displacement).is_some(),
                    apply_error::MalformedSnafu {
                        reason: format!("action #{num} has an unencodable displacement"),
                    }
                );
            }
        }

        let target_size = actions
            .iter()
            .try_fold(0usize, |total, action| total.checked_add(action.len()))
            .unwrap_or(usize::MAX);

        for (what, requested, limit) in [
            ("source", source.len(), limits.max_image_size),
            ("target", target_size, limits.max_image_size),
            ("metadata", metadata.len(), limits.max_metadata_size),
        ] {
            ensure!(
                requested <= limit,
                apply_error::AllocationLimitSnafu {
                    what,
                    requested: requested as u64,
                    limit: limit as u64,
                }
            );
        }

        let mut patch = Self {
            source_size: source.len(),
            target_size,
            metadata,
            actions,
            footer: BpsFooter::default(),
            actual_patch_crc: Crc32::default(),
        };

        let target = patch.replay(source)?;
        patch.footer.source_crc = U32::new(Crc32::of(source).get());
        patch.footer.target_crc = U32::new(Crc32::of(&target).get());

        let crc = Crc32::of(&patch.encode_without_patch_crc());
        patch.footer.patch_crc = U32::new(crc.get());
        patch.actual_patch_crc = crc;

        Ok(patch)
    }

    /// Reports whether the patch file matched its own checksum when parsed.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::PatchChecksum`] on a mismatch.
    pub fn integrity(&self) -> Result<(), ApplyError> {
        let expected = self.footer.patch_crc();
        let actual = self.actual_patch_crc;

        ensure!(
            expected == actual,
            apply_error::PatchChecksumSnafu { expected, actual }
        );

        Ok(())
    }

    /// Serializes the patch, footer included.
    ///
    /// The patch checksum is computed over the bytes written, so the result
    /// always passes its own integrity check.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_without_patch_crc();
        let crc = U32::new(Crc32::of(&out).get());
        out.extend_from_slice(crc.as_bytes());
        out
    }

    fn encode_without_patch_crc(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BPS_MAGIC);
        write_vlq(&mut out, self.source_size as u64);
        write_vlq(&mut out, self.target_size as u64);
        write_vlq(&mut out, self.metadata.len() as u64);
        out.extend_from_slice(&self.metadata);

        for action in &self.actions {
            let length = action.len() as u64;
            write_vlq(&mut out, ((length - 1) << 2) | action.kind());

            match action {
                BpsAction::SourceRead { .. } => {}
                BpsAction::TargetRead { data } => out.extend_from_slice(data),
                BpsAction::SourceCopy { displacement, .. }
                | BpsAction::TargetCopy { displacement, .. } => {
                    // Parsing and `from_actions` never yield `i64::MIN`.
                    let written = write_signed(&mut out, *displacement);
                    debug_assert!(written.is_some());
                }
            }
        }

        out.extend_from_slice(self.footer.source_crc.as_bytes());
        out.extend_from_slice(self.footer.target_crc.as_bytes());
        out
    }

    /// Replays the actions against `source` (the image body).
    ///
    /// The two copy cursors are plain indices carried through the loop: the
    /// source cursor into `source`, the target cursor into the output.
    pub(crate) fn replay(&self, source: &[u8]) -> Result<Vec<u8>, ApplyError> {
        let mut out = Vec::with_capacity(self.target_size);
        let mut source_cursor = 0usize;
        let mut target_cursor = 0usize;

        for (num, action) in self.actions.iter().enumerate() {
            log::trace!("BPS action #{num} at output {:#x}: {action:?}", out.len());

            match action {
                BpsAction::SourceRead { length } => {
                    let start = out.len();
                    let bytes = source
                        .get(start..start.saturating_add(*length))
                        .with_context(|| apply_error::MalformedSnafu {
                            reason: format!(
                                "action #{num} reads {} bytes at {}, past the {} byte source",
                                length,
                                start,
                                source.len()
                            ),
                        })?;
                    out.extend_from_slice(bytes);
                }
                BpsAction::TargetRead { data } => out.extend_from_slice(data),
                BpsAction::SourceCopy {
                    length,
                    displacement,
                } => {
                    source_cursor = move_cursor(source_cursor, *displacement, num)?;
                    let bytes = source
                        .get(source_cursor..source_cursor.saturating_add(*length))
                        .with_context(|| apply_error::MalformedSnafu {
                            reason: format!(
                                "action #{num} copies {} bytes from {}, past the {} byte source",
                                length,
                                source_cursor,
                                source.len()
                            ),
                        })?;
                    out.extend_from_slice(bytes);
                    source_cursor += length;
                }
                BpsAction::TargetCopy {
                    length,
                    displacement,
                } => {
                    target_cursor = move_cursor(target_cursor, *displacement, num)?;
                    ensure!(
                        target_cursor < out.len(),
                        apply_error::MalformedSnafu {
                            reason: format!(
                                "action #{num} copies from unwritten output offset {}",
                                target_cursor
                            ),
                        }
                    );

                    // Byte by byte: the copy may overlap what it writes.
                    for _ in 0..*length {
                        let byte = out[target_cursor];
                        out.push(byte);
                        target_cursor += 1;
                    }
                }
            }
        }

        Ok(out)
    }
}

fn check_limit(what: &'static str, requested: u64, limit: usize) -> Result<usize, ParseError> {
    let limit = limit as u64;
    ensure!(
        requested <= limit,
        AllocationLimitSnafu {
            what,
            requested,
            limit,
        }
    );

    Ok(requested as usize)
}

fn read_actions(
    body: &mut ByteCursor<'_>,
    target_size: usize,
) -> Result<Vec<BpsAction>, ParseError> {
    let mut actions = Vec::new();
    let mut produced = 0usize;

    while produced < target_size {
        let header = read_vlq(body, "BPS action")?;
        let length = (header >> 2) + 1;
        let left = (target_size - produced) as u64;

        ensure!(
            length <= left,
            MalformedSnafu {
                reason: format!(
                    "action #{} writes {length} bytes with only {left} left in the target",
                    actions.len()
                ),
            }
        );
        let length = length as usize;

        let action = match header & 3 {
            SOURCE_READ => BpsAction::SourceRead { length },
            TARGET_READ => BpsAction::TargetRead {
                data: body
                    .read_bytes(length)
                    .context(TruncatedSnafu {
                        what: "BPS literal data",
                    })?
                    .to_vec(),
            },
            SOURCE_COPY => BpsAction::SourceCopy {
                length,
                displacement: read_signed(body, "BPS copy displacement")?,
            },
            _ => BpsAction::TargetCopy {
                length,
                displacement: read_signed(body, "BPS copy displacement")?,
            },
        };

        produced += length;
        actions.push(action);
    }

    Ok(actions)
}

fn move_cursor(cursor: usize, displacement: i64, num: usize) -> Result<usize, ApplyError> {
    isize::try_from(displacement)
        .ok()
        .and_then(|displacement| cursor.checked_add_signed(displacement))
        .with_context(|| apply_error::MalformedSnafu {
            reason: format!("action #{num} moves its copy cursor from {cursor} by {displacement}"),
        })
}
