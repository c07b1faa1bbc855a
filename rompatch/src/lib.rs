//! A library for parsing and applying ROM patches.
//!
//! Two container formats are supported:
//!
//! - **IPS** (`PATCH` magic): offset-addressed literal and run-length records,
//!   with the common truncation extension.
//! - **BPS** (`BPS1` magic): a delta-copy action stream over persistent
//!   source/target cursors, with CRC-32 checks of the source, the target and
//!   the patch itself.
//!
//! Parsing produces a [`Patch`]; applying it to an [`Image`] produces a new
//! image. Nothing here computes patches from two images.
//!
//! # Example
//!
//! ```no_run
//! use rompatch::{Image, Patch};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rom = Image::new(std::fs::read("game.sfc")?);
//! let patch = Patch::parse(&std::fs::read("translation.bps")?)?;
//!
//! if patch.validate_source(&rom) == Some(false) {
//!     eprintln!("warning: this ROM is not the one the patch was made for");
//! }
//!
//! let patched = patch.apply(&rom, true)?;
//! std::fs::write("game (patched).sfc", patched.as_bytes())?;
//! # Ok(())
//! # }
//! ```

use self::bps::BpsPatch;
use self::cursor::ByteCursor;
use self::ips::IpsPatch;
use snafu::Snafu;
use std::fmt;

use parse_error::*;

pub mod apply;
pub mod bps;
pub mod checksum;
pub mod cursor;
pub mod image;
pub mod ips;
pub mod vlq;

pub use self::apply::{ApplyOptions, apply, apply_with};
pub use self::checksum::{Crc32, checksum};
pub use self::image::Image;

/// Patch container formats, as told apart by their magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchFormat {
    Ips,
    Bps,
    /// The leading bytes match no known format.
    Unrecognized,
}

impl PatchFormat {
    /// Identifies a patch from its leading bytes.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(ips::IPS_MAGIC) {
            Self::Ips
        } else if data.starts_with(bps::BPS_MAGIC) {
            Self::Bps
        } else {
            Self::Unrecognized
        }
    }

    /// Returns the conventional name of the format.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ips => "IPS",
            Self::Bps => "BPS",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for PatchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies a patch from its leading bytes.
pub fn detect_format(data: &[u8]) -> PatchFormat {
    PatchFormat::detect(data)
}

/// Size caps applied while parsing and applying.
///
/// Declared lengths in a patch are untrusted; anything above these caps is
/// refused before memory is reserved for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest image a patch may declare or grow to.
    pub max_image_size: usize,
    /// Largest BPS metadata block.
    pub max_metadata_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_image_size: 256 * 1024 * 1024,
            max_metadata_size: 16 * 1024 * 1024,
        }
    }
}

impl Limits {
    #[must_use]
    pub const fn with_max_image_size(mut self, size: usize) -> Self {
        self.max_image_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_metadata_size(mut self, size: usize) -> Self {
        self.max_metadata_size = size;
        self
    }
}

/// The decoded edit script of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditScript {
    Ips(IpsPatch),
    Bps(BpsPatch),
}

impl EditScript {
    #[must_use]
    pub const fn format(&self) -> PatchFormat {
        match self {
            Self::Ips(_) => PatchFormat::Ips,
            Self::Bps(_) => PatchFormat::Bps,
        }
    }
}

/// A predicate deciding whether an image is the input a patch expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceValidator {
    /// Checksum stored in the patch itself.
    Embedded(Crc32),
    /// Checksums supplied alongside the patch; any of them is accepted.
    AnyOf(Vec<Crc32>),
}

impl SourceValidator {
    #[must_use]
    pub fn accepts(&self, crc: Crc32) -> bool {
        self.expected().contains(&crc)
    }

    /// Returns every checksum this validator accepts.
    #[must_use]
    pub fn expected(&self) -> &[Crc32] {
        match self {
            Self::Embedded(crc) => std::slice::from_ref(crc),
            Self::AnyOf(crcs) => crcs,
        }
    }
}

/// A parsed patch, ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Patch {
    script: EditScript,
    validators: Vec<SourceValidator>,
}

impl Patch {
    /// Parses a patch of any supported format with the default [`Limits`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnrecognizedFormat`] if the magic matches no
    /// format, or the codec's error otherwise.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Self::parse_with(data, &Limits::default())
    }

    /// Parses a patch of any supported format.
    pub fn parse_with(data: &[u8], limits: &Limits) -> Result<Self, ParseError> {
        let format = PatchFormat::detect(data);
        Self::parse_as(format, &mut ByteCursor::new(data), limits)
    }

    /// Parses a patch of a known format from the cursor's current position.
    ///
    /// The cursor is left after the last byte consumed.
    pub fn parse_as(
        format: PatchFormat,
        cursor: &mut ByteCursor<'_>,
        limits: &Limits,
    ) -> Result<Self, ParseError> {
        let script = match format {
            PatchFormat::Ips => EditScript::Ips(IpsPatch::parse(cursor)?),
            PatchFormat::Bps => EditScript::Bps(BpsPatch::parse(cursor, limits)?),
            PatchFormat::Unrecognized => return UnrecognizedFormatSnafu.fail(),
        };

        Ok(Self::from_script(script))
    }

    /// Wraps an edit script, picking up any checksums it embeds.
    pub fn from_script(script: EditScript) -> Self {
        let validators = match &script {
            EditScript::Ips(_) => Vec::new(),
            EditScript::Bps(bps) => vec![SourceValidator::Embedded(bps.footer().source_crc())],
        };

        Self { script, validators }
    }

    #[must_use]
    pub const fn format(&self) -> PatchFormat {
        self.script.format()
    }

    #[must_use]
    pub const fn script(&self) -> &EditScript {
        &self.script
    }

    #[must_use]
    pub fn validators(&self) -> &[SourceValidator] {
        &self.validators
    }

    /// Adds a set of acceptable source checksums, e.g. from a patch catalog.
    ///
    /// An empty set is ignored.
    pub fn attach_source_checksums(&mut self, crcs: impl IntoIterator<Item = Crc32>) {
        let crcs: Vec<_> = crcs.into_iter().collect();

        if !crcs.is_empty() {
            self.validators.push(SourceValidator::AnyOf(crcs));
        }
    }

    /// Checks a source checksum against the validators.
    ///
    /// Returns `None` if the patch carries no validators at all.
    #[must_use]
    pub fn validate_source_checksum(&self, crc: Crc32) -> Option<bool> {
        if self.validators.is_empty() {
            return None;
        }

        Some(self.validators.iter().any(|v| v.accepts(crc)))
    }

    /// Checks whether `image` (minus its header) is the expected input.
    #[must_use]
    pub fn validate_source(&self, image: &Image) -> Option<bool> {
        self.validate_source_checksum(image.checksum())
    }

    /// Returns the checksum the produced image must have, if the format stores one.
    #[must_use]
    pub fn target_checksum(&self) -> Option<Crc32> {
        match &self.script {
            EditScript::Ips(_) => None,
            EditScript::Bps(bps) => Some(bps.footer().target_crc()),
        }
    }

    /// Reports whether the patch file matched its own checksum.
    ///
    /// Formats without a self-checksum always pass.
    pub fn integrity(&self) -> Result<(), ApplyError> {
        match &self.script {
            EditScript::Ips(_) => Ok(()),
            EditScript::Bps(bps) => bps.integrity(),
        }
    }

    /// Applies the patch. See [`apply()`].
    pub fn apply(&self, source: &Image, verify_checksums: bool) -> Result<Image, ApplyError> {
        apply(self, source, verify_checksums)
    }

    /// Applies the patch with explicit options. See [`apply_with()`].
    pub fn apply_with(&self, source: &Image, options: &ApplyOptions) -> Result<Image, ApplyError> {
        apply_with(self, source, options)
    }
}

/// Stable, machine-checkable classification of every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    UnrecognizedFormat,
    TruncatedPatch,
    MalformedPatch,
    SourceMismatch,
    TargetMismatch,
    AllocationLimitExceeded,
}

impl ErrorKind {
    /// Returns a stable identifier suitable for message lookup tables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnrecognizedFormat => "unrecognized_format",
            Self::TruncatedPatch => "truncated_patch",
            Self::MalformedPatch => "malformed_patch",
            Self::SourceMismatch => "source_mismatch",
            Self::TargetMismatch => "target_mismatch",
            Self::AllocationLimitExceeded => "allocation_limit_exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("not an IPS or BPS patch"))]
    UnrecognizedFormat,

    #[snafu(display("patch ends in the middle of the {what}"))]
    Truncated {
        what: &'static str,
        source: cursor::ReadError,
    },

    #[snafu(display("malformed patch: {reason}"))]
    Malformed { reason: String },

    #[snafu(display("{what} of {requested} bytes exceeds the limit of {limit} bytes"))]
    AllocationLimit {
        what: &'static str,
        requested: u64,
        limit: u64,
    },
}

impl ParseError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnrecognizedFormat => ErrorKind::UnrecognizedFormat,
            Self::Truncated { .. } => ErrorKind::TruncatedPatch,
            Self::Malformed { .. } => ErrorKind::MalformedPatch,
            Self::AllocationLimit { .. } => ErrorKind::AllocationLimitExceeded,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ApplyError {
    #[snafu(display(
        "source checksum mismatch: image is {actual}, patch expects {}",
        join_crcs(expected)
    ))]
    SourceMismatch { expected: Vec<Crc32>, actual: Crc32 },

    #[snafu(display("target checksum mismatch: produced {actual}, patch expects {expected}"))]
    TargetMismatch {
        expected: Crc32,
        actual: Crc32,
        /// The image that was produced anyway.
        output: Image,
    },

    #[snafu(display("patch checksum mismatch: file is {actual}, footer says {expected}"))]
    PatchChecksum { expected: Crc32, actual: Crc32 },

    #[snafu(display("malformed patch: {reason}"))]
    Malformed { reason: String },

    #[snafu(display("{what} of {requested} bytes exceeds the limit of {limit} bytes"))]
    AllocationLimit {
        what: &'static str,
        requested: u64,
        limit: u64,
    },
}

impl ApplyError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceMismatch { .. } => ErrorKind::SourceMismatch,
            Self::TargetMismatch { .. } => ErrorKind::TargetMismatch,
            Self::PatchChecksum { .. } | Self::Malformed { .. } => ErrorKind::MalformedPatch,
            Self::AllocationLimit { .. } => ErrorKind::AllocationLimitExceeded,
        }
    }

    /// Recovers the produced image from a target checksum failure.
    pub fn into_unverified_output(self) -> Option<Image> {
        match self {
            Self::TargetMismatch { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn join_crcs(crcs: &[Crc32]) -> String {
    let parts: Vec<_> = crcs.iter().map(Crc32::to_string).collect();
    parts.join(" or ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_magic() {
        assert_eq!(detect_format(b"PATCHEOF"), PatchFormat::Ips);
        assert_eq!(detect_format(b"BPS1\x00"), PatchFormat::Bps);
        assert_eq!(detect_format(b"UPS1"), PatchFormat::Unrecognized);
        assert_eq!(detect_format(b"PAT"), PatchFormat::Unrecognized);
        assert_eq!(detect_format(b""), PatchFormat::Unrecognized);
    }

    #[test]
    fn unknown_magic_is_reported() {
        let err = Patch::parse(b"NOTAPATCH").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnrecognizedFormat);
        assert!(matches!(err, ParseError::UnrecognizedFormat));
    }

    #[test]
    fn ips_patch_has_no_validators_until_attached() {
        let mut patch = Patch::parse(b"PATCHEOF").unwrap();
        let rom = Image::new(b"abc".to_vec());

        assert_eq!(patch.validate_source(&rom), None);

        patch.attach_source_checksums(Vec::<Crc32>::new());
        assert!(patch.validators().is_empty());

        patch.attach_source_checksums([Crc32::new(1), Crc32::new(0x352441c2)]);
        assert_eq!(patch.validate_source(&rom), Some(true));
        assert_eq!(
            patch.validate_source(&Image::new(b"abd".to_vec())),
            Some(false)
        );
    }

    #[test]
    fn error_kinds_have_stable_names() {
        assert_eq!(ErrorKind::TruncatedPatch.as_str(), "truncated_patch");
        assert_eq!(
            ErrorKind::AllocationLimitExceeded.to_string(),
            "allocation_limit_exceeded"
        );
    }
}
