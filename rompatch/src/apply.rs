//! Replaying a parsed patch against a source image.

use crate::{ApplyError, EditScript, Image, Limits, Patch, apply_error::*};
use snafu::ensure;

/// Options for [`apply_with()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Check the source before and the target after replaying.
    pub verify_checksums: bool,
    pub limits: Limits,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            limits: Limits::default(),
        }
    }
}

impl ApplyOptions {
    #[must_use]
    pub const fn with_verify(mut self, verify_checksums: bool) -> Self {
        self.verify_checksums = verify_checksums;
        self
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// Applies `patch` to `source` with the default [`Limits`].
///
/// See [`apply_with()`].
pub fn apply(patch: &Patch, source: &Image, verify_checksums: bool) -> Result<Image, ApplyError> {
    apply_with(
        patch,
        source,
        &ApplyOptions::default().with_verify(verify_checksums),
    )
}

/// Applies `patch` to the body of `source`, producing a new headerless image.
///
/// The source is never modified and identical inputs always produce identical
/// output.
///
/// # Errors
///
/// - [`ApplyError::SourceMismatch`] if verifying and no source validator
///   accepts the checksum of the source body.
/// - [`ApplyError::TargetMismatch`] if verifying and the output does not have
///   the checksum the patch expects. The error carries the output.
/// - [`ApplyError::Malformed`] or [`ApplyError::AllocationLimit`] if the
///   edit script cannot be replayed against this source.
pub fn apply_with(
    patch: &Patch,
    source: &Image,
    options: &ApplyOptions,
) -> Result<Image, ApplyError> {
    let body = source.body();
    let actual = source.checksum();

    match patch.validate_source_checksum(actual) {
        Some(false) if options.verify_checksums => {
            let expected = patch
                .validators()
                .iter()
                .flat_map(|v| v.expected())
                .copied()
                .collect::<Vec<_>>();

            return SourceMismatchSnafu { expected, actual }.fail();
        }
        Some(false) => log::warn!("source checksum {actual} is not one the patch expects"),
        Some(true) => log::debug!("source checksum {actual} accepted"),
        None => log::debug!("patch carries no source checksum"),
    }

    let output = match patch.script() {
        EditScript::Ips(ips) => ips.replay(body, &options.limits)?,
        EditScript::Bps(bps) => {
            let limit = options.limits.max_image_size;
            ensure!(
                bps.target_size() <= limit,
                AllocationLimitSnafu {
                    what: "declared target size",
                    requested: bps.target_size() as u64,
                    limit: limit as u64,
                }
            );

            if body.len() != bps.source_size() {
                log::warn!(
                    "source body is {} bytes, patch was made for {} bytes",
                    body.len(),
                    bps.source_size()
                );
            }

            bps.replay(body)?
        }
    };

    let output = Image::new(output);

    if let Some(expected) = patch.target_checksum() {
        let actual = output.checksum();

        if actual != expected {
            if options.verify_checksums {
                return TargetMismatchSnafu {
                    expected,
                    actual,
                    output,
                }
                .fail();
            }

            log::warn!("target checksum {actual} differs from the expected {expected}");
        }
    }

    log::debug!(
        "applied {} patch: {} -> {} bytes",
        patch.format(),
        body.len(),
        output.len()
    );

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bps::{BpsAction, BpsPatch};
    use crate::ips::{IpsPatch, IpsRecord};
    use crate::{Crc32, ErrorKind};
    use pretty_assertions::assert_eq;

    fn ips(records: Vec<IpsRecord>) -> Patch {
        Patch::from_script(EditScript::Ips(IpsPatch::new(records, None)))
    }

    #[test]
    fn literal_record_grows_empty_source() {
        let patch = ips(vec![IpsRecord::Replace {
            offset: 10,
            data: vec![1, 2, 3],
        }]);

        let out = patch.apply(&Image::new(Vec::new()), true).unwrap();
        assert_eq!(out.len(), 13);
        assert_eq!(&out.as_bytes()[..10], &[0; 10]);
        assert_eq!(&out.as_bytes()[10..], &[1, 2, 3]);
    }

    #[test]
    fn header_is_skipped_and_not_carried_over() {
        let patch = ips(vec![IpsRecord::Replace {
            offset: 0,
            data: b"X".to_vec(),
        }]);
        let source = Image::new(b"HHabc".to_vec()).with_header(2).unwrap();

        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), b"Xbc");
        assert_eq!(out.header_size(), 0);
        assert_eq!(source.as_bytes(), b"HHabc");
    }

    #[test]
    fn attached_checksums_gate_ips_patches() {
        let mut patch = ips(Vec::new());
        patch.attach_source_checksums([Crc32::new(0xdeadbeef)]);
        let source = Image::new(b"abc".to_vec());

        let err = patch.apply(&source, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceMismatch);
        assert!(matches!(
            err,
            ApplyError::SourceMismatch { actual, .. } if actual == Crc32::new(0x352441c2)
        ));

        assert_eq!(patch.apply(&source, false).unwrap().as_bytes(), b"abc");
    }

    #[test]
    fn bps_target_size_is_capped_at_apply_time() {
        let bps = BpsPatch::from_actions(
            b"",
            "",
            vec![BpsAction::TargetRead { data: vec![7; 32] }],
            &Limits::default(),
        )
        .unwrap();
        let patch = Patch::from_script(EditScript::Bps(bps));
        let options =
            ApplyOptions::default().with_limits(Limits::default().with_max_image_size(16));

        let err = patch.apply_with(&Image::default(), &options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationLimitExceeded);
    }

    #[test]
    fn application_is_deterministic() {
        let source = Image::new((0..=255).collect());
        let bps = BpsPatch::from_actions(
            source.body(),
            "",
            vec![
                BpsAction::SourceCopy {
                    length: 100,
                    displacement: 50,
                },
                BpsAction::TargetRead {
                    data: b"middle".to_vec(),
                },
                BpsAction::TargetCopy {
                    length: 40,
                    displacement: 3,
                },
            ],
            &Limits::default(),
        )
        .unwrap();
        let patch = Patch::from_script(EditScript::Bps(bps));

        let first = patch.apply(&source, true).unwrap();
        let second = patch.apply(&source, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 146);
    }
}
