use rompatch::ErrorKind;
use snafu::Snafu;

/// Errors reported by a background worker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
#[non_exhaustive]
pub enum WorkerError {
    #[snafu(display("cannot parse patch: {source}"))]
    ParsePatch { source: rompatch::ParseError },

    #[snafu(display("cannot apply patch: {source}"))]
    ApplyPatch { source: rompatch::ApplyError },

    #[snafu(display("cannot spawn {name} worker: {source}"))]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[snafu(display("{name} worker stopped before replying"))]
    Disconnected { name: &'static str },
}

impl WorkerError {
    /// Returns the classification of a patch failure, or `None` if the
    /// worker itself failed.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::ParsePatch { source } => Some(source.kind()),
            Self::ApplyPatch { source } => Some(source.kind()),
            Self::Spawn { .. } | Self::Disconnected { .. } => None,
        }
    }
}
