/// Trait for receiving progress updates while a worker is busy.
///
/// Workers give no incremental progress, so reporters only learn when a job
/// starts, that it is still running, and when it ends.
pub trait ApplyProgress {
    /// Called before a job is submitted.
    fn started(&self, _message: &str) {}

    /// Called periodically while waiting for the reply.
    fn waiting(&self) {}

    /// Called once the reply has arrived.
    fn finished(&self) {}
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl ApplyProgress for SilentProgress {}

/// Console progress reporter using an indicatif spinner on stderr.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    spinner: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            spinner: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ApplyProgress for ConsoleProgress {
    fn started(&self, message: &str) {
        self.spinner
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.spinner.set_style(
            indicatif::ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
        );
        self.spinner.set_message(message.to_owned());
        self.spinner.reset();
    }

    fn waiting(&self) {
        self.spinner.tick();
    }

    fn finished(&self) {
        self.spinner.finish_and_clear();
    }
}
