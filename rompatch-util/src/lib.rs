//! Library for applying ROM patches from disk.
//!
//! This crate wraps the [`rompatch`] codecs with file loading, copier header
//! handling and background workers that keep patching and checksumming off
//! the calling thread.
//!
//! # Example
//!
//! ```no_run
//! use rompatch_util::worker::{ApplyRequest, ApplyWorker};
//! use rompatch_util::{HeaderMode, SilentProgress, open_image, read_patch};
//!
//! let rom = open_image("game.sfc".as_ref(), HeaderMode::Auto).expect("failed to open ROM");
//! let patch = read_patch("hack.bps".as_ref()).expect("failed to read patch");
//!
//! let worker = ApplyWorker::spawn().expect("failed to start worker");
//! let response = worker
//!     .submit(ApplyRequest::new(rom, patch))
//!     .wait_with(&SilentProgress)
//!     .expect("worker stopped");
//! let patched = response.result.expect("patching failed");
//! ```

pub mod progress;
pub mod worker;

pub use self::progress::{ApplyProgress, SilentProgress};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use rompatch::image::{HeaderError, suggested_header_size};
use rompatch::{Crc32, Image, checksum};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Errors that can occur when loading a file from disk.
#[derive(Debug, Snafu)]
pub enum OpenError {
    #[snafu(display("failed to read file"))]
    ReadFile { source: std::io::Error },

    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("copier header is larger than the file"))]
    HeaderTooLarge { source: HeaderError },
}

/// How many leading bytes of a ROM are a copier header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeaderMode {
    /// The whole file is patch-relevant.
    #[default]
    None,
    /// Exactly this many bytes.
    Fixed(usize),
    /// Guess from the file length.
    Auto,
}

impl HeaderMode {
    /// Returns the header size for a file `len` bytes long.
    #[must_use]
    pub const fn resolve(self, len: usize) -> usize {
        match self {
            Self::None => 0,
            Self::Fixed(size) => size,
            Self::Auto => suggested_header_size(len),
        }
    }
}

/// Errors when parsing a [`HeaderMode`] from text.
#[derive(Debug, Snafu)]
#[snafu(display("header must be a byte count or 'auto', not '{text}'"))]
pub struct ParseHeaderModeError {
    text: String,
    source: std::num::ParseIntError,
}

impl FromStr for HeaderMode {
    type Err = ParseHeaderModeError;

    /// Parses `auto`, `none` or a byte count.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            _ => s
                .parse::<usize>()
                .map(|size| if size == 0 { Self::None } else { Self::Fixed(size) })
                .context(ParseHeaderModeSnafu { text: s }),
        }
    }
}

/// Loads a ROM, marking its copier header (if any).
pub fn open_image(path: &Path, header: HeaderMode) -> Result<Image, OpenError> {
    let data = std::fs::read(path).context(ReadFileSnafu)?;
    let header_size = header.resolve(data.len());

    if header_size > 0 {
        log::info!("treating the first {header_size} bytes of {} as a header", path.display());
    }

    Image::new(data)
        .with_header(header_size)
        .context(HeaderTooLargeSnafu)
}

/// Loads a patch file.
pub fn read_patch(path: &Path) -> Result<Vec<u8>, OpenError> {
    std::fs::read(path).context(ReadFileSnafu)
}

/// Computes the CRC-32 of a file (minus its header) through a memory map.
///
/// A header larger than the file leaves nothing to hash.
///
/// # Safety
///
/// This function uses `unsafe` internally to create a memory map. The caller
/// must ensure the file is not modified or truncated while it is hashed.
pub unsafe fn checksum_file(path: &Path, header: HeaderMode) -> Result<Crc32, OpenError> {
    let file = std::fs::File::open(path).context(OpenFileSnafu)?;

    // Mapping an empty file fails on some platforms.
    if file.metadata().context(OpenFileSnafu)?.len() == 0 {
        return Ok(Crc32::of(&[]));
    }

    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };
    let start = header.resolve(raw.len());

    Ok(Crc32::new(checksum(&raw, start, false)))
}

/// Checksums several files in parallel, keeping the input order.
///
/// # Safety
///
/// Same as [`checksum_file()`], for every path.
pub unsafe fn checksum_files(
    paths: &[PathBuf],
    header: HeaderMode,
) -> Vec<Result<Crc32, OpenError>> {
    paths
        .par_iter()
        .map(|path| unsafe { checksum_file(path, header) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_modes() {
        assert_eq!("auto".parse::<HeaderMode>().unwrap(), HeaderMode::Auto);
        assert_eq!("512".parse::<HeaderMode>().unwrap(), HeaderMode::Fixed(512));
        assert_eq!("0".parse::<HeaderMode>().unwrap(), HeaderMode::None);
        assert!("big".parse::<HeaderMode>().is_err());

        assert_eq!(HeaderMode::Auto.resolve(1024 + 512), 512);
        assert_eq!(HeaderMode::Auto.resolve(2048), 0);
        assert_eq!(HeaderMode::Fixed(16).resolve(2048), 16);
    }

    #[test]
    fn checksums_files_with_and_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.bin");
        let headered = dir.path().join("headered.bin");
        let empty = dir.path().join("empty.bin");

        std::fs::write(&plain, b"abc").unwrap();
        std::fs::write(&headered, b"HDRabc").unwrap();
        std::fs::write(&empty, b"").unwrap();

        let results = unsafe {
            checksum_files(
                &[plain.clone(), headered.clone(), empty, dir.path().join("missing")],
                HeaderMode::None,
            )
        };

        assert_eq!(*results[0].as_ref().unwrap(), Crc32::new(0x352441c2));
        assert_ne!(*results[1].as_ref().unwrap(), Crc32::new(0x352441c2));
        assert_eq!(*results[2].as_ref().unwrap(), Crc32::new(0));
        assert!(matches!(results[3], Err(OpenError::OpenFile { .. })));

        let crc = unsafe { checksum_file(&headered, HeaderMode::Fixed(3)).unwrap() };
        assert_eq!(crc, Crc32::new(0x352441c2));

        let image = open_image(&headered, HeaderMode::Fixed(3)).unwrap();
        assert_eq!(image.body(), b"abc");
        assert!(matches!(
            open_image(&plain, HeaderMode::Fixed(4)),
            Err(OpenError::HeaderTooLarge { .. })
        ));
    }
}
