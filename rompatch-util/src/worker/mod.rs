//! Background threads for patching and checksumming.
//!
//! Each worker owns one thread and one request queue, so at most one job per
//! worker runs at a time and later submissions wait their turn. Requests move
//! their buffers into the worker and the response hands them back, so nothing
//! is copied across the boundary. There is no cancellation or timeout: a
//! submitted job always runs to completion.
//!
//! ```text
//!   caller                          worker thread
//!   submit(request) ──── queue ───▶ run(request)
//!   Pending::wait() ◀─── reply ──── response { buffers, result }
//! ```

mod error;

pub use self::error::WorkerError;

use self::error::*;
use crate::progress::ApplyProgress;
use rompatch::{ApplyOptions, Crc32, Image, Patch, checksum};
use snafu::{OptionExt, ResultExt};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often [`Pending::wait_with()`] wakes up to report progress.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// A patch to apply on the [`ApplyWorker`].
#[derive(Debug)]
pub struct ApplyRequest {
    pub source: Image,
    /// Raw patch file contents; parsed on the worker.
    pub patch: Vec<u8>,
    pub options: ApplyOptions,
    /// Extra acceptable source checksums, e.g. from a patch catalog.
    pub source_crcs: Vec<Crc32>,
}

impl ApplyRequest {
    pub fn new(source: Image, patch: Vec<u8>) -> Self {
        Self {
            source,
            patch,
            options: ApplyOptions::default(),
            source_crcs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_source_crcs(mut self, crcs: Vec<Crc32>) -> Self {
        self.source_crcs = crcs;
        self
    }
}

/// The outcome of an [`ApplyRequest`], with its input buffers handed back.
#[derive(Debug)]
pub struct ApplyResponse {
    pub source: Image,
    pub patch: Vec<u8>,
    pub result: Result<Image, WorkerError>,
}

/// A checksum to compute on the [`ChecksumWorker`].
#[derive(Debug)]
pub struct ChecksumRequest {
    pub image: Image,
    /// Offset the checksum starts at.
    pub start: usize,
    /// Leave out the last four bytes.
    pub skip_trailing_4: bool,
}

impl ChecksumRequest {
    /// Checksums the body of `image`, skipping its header.
    pub fn body(image: Image) -> Self {
        Self {
            start: image.header_size(),
            image,
            skip_trailing_4: false,
        }
    }
}

/// The outcome of a [`ChecksumRequest`], with its image handed back.
#[derive(Debug)]
pub struct ChecksumResponse {
    pub image: Image,
    pub checksum: Crc32,
}

/// A reply that has not necessarily arrived yet.
#[must_use]
pub struct Pending<T> {
    name: &'static str,
    receiver: Receiver<T>,
}

impl<T> Pending<T> {
    /// Blocks until the worker replies.
    pub fn wait(self) -> Result<T, WorkerError> {
        self.receiver
            .recv()
            .ok()
            .context(DisconnectedSnafu { name: self.name })
    }

    /// Blocks until the worker replies, reporting progress while waiting.
    pub fn wait_with(self, progress: &impl ApplyProgress) -> Result<T, WorkerError> {
        loop {
            if let Some(response) = self.poll(PROGRESS_INTERVAL)? {
                return Ok(response);
            }

            progress.waiting();
        }
    }

    /// Waits up to `timeout` for the reply.
    pub fn poll(&self, timeout: Duration) -> Result<Option<T>, WorkerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(response) => Ok(Some(response)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => DisconnectedSnafu { name: self.name }.fail(),
        }
    }

    /// Returns the reply if it has arrived.
    pub fn try_result(&self) -> Result<Option<T>, WorkerError> {
        match self.receiver.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => DisconnectedSnafu { name: self.name }.fail(),
        }
    }
}

struct Job<Req, Resp> {
    request: Req,
    reply: Sender<Resp>,
}

/// One thread serving one queue.
struct Worker<Req, Resp> {
    name: &'static str,
    sender: Option<Sender<Job<Req, Resp>>>,
    handle: Option<JoinHandle<()>>,
}

impl<Req: Send + 'static, Resp: Send + 'static> Worker<Req, Resp> {
    fn spawn(name: &'static str, run: fn(Req) -> Resp) -> Result<Self, WorkerError> {
        let (sender, receiver) = mpsc::channel::<Job<Req, Resp>>();

        let handle = thread::Builder::new()
            .name(format!("rompatch-{name}"))
            .spawn(move || {
                for job in receiver {
                    // The caller may have dropped its Pending.
                    let _ = job.reply.send(run(job.request));
                }

                log::debug!("{name} worker shutting down");
            })
            .context(SpawnSnafu { name })?;

        Ok(Self {
            name,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn submit(&self, request: Req) -> Pending<Resp> {
        let (reply, receiver) = mpsc::channel();

        // If the thread is gone the job is dropped with its reply sender, and
        // the Pending reports Disconnected.
        if let Some(sender) = &self.sender {
            let _ = sender.send(Job { request, reply });
        }

        Pending {
            name: self.name,
            receiver,
        }
    }
}

impl<Req, Resp> Drop for Worker<Req, Resp> {
    fn drop(&mut self) {
        // Closing the queue ends the thread's loop once queued jobs are done.
        self.sender.take();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("{} worker panicked", self.name);
            }
        }
    }
}

/// Applies patches on a dedicated thread.
pub struct ApplyWorker {
    inner: Worker<ApplyRequest, ApplyResponse>,
}

impl ApplyWorker {
    pub fn spawn() -> Result<Self, WorkerError> {
        Worker::spawn("apply", run_apply).map(|inner| Self { inner })
    }

    /// Queues a request. The buffers come back in the [`ApplyResponse`].
    pub fn submit(&self, request: ApplyRequest) -> Pending<ApplyResponse> {
        self.inner.submit(request)
    }
}

/// Computes checksums on a dedicated thread.
pub struct ChecksumWorker {
    inner: Worker<ChecksumRequest, ChecksumResponse>,
}

impl ChecksumWorker {
    pub fn spawn() -> Result<Self, WorkerError> {
        Worker::spawn("checksum", run_checksum).map(|inner| Self { inner })
    }

    /// Queues a request. The image comes back in the [`ChecksumResponse`].
    pub fn submit(&self, request: ChecksumRequest) -> Pending<ChecksumResponse> {
        self.inner.submit(request)
    }
}

fn run_apply(request: ApplyRequest) -> ApplyResponse {
    let ApplyRequest {
        source,
        patch,
        options,
        source_crcs,
    } = request;

    let result = Patch::parse_with(&patch, &options.limits)
        .context(ParsePatchSnafu)
        .and_then(|mut parsed| {
            parsed.attach_source_checksums(source_crcs);
            parsed.apply_with(&source, &options).context(ApplyPatchSnafu)
        });

    ApplyResponse {
        source,
        patch,
        result,
    }
}

fn run_checksum(request: ChecksumRequest) -> ChecksumResponse {
    let checksum = Crc32::new(checksum(
        request.image.as_bytes(),
        request.start,
        request.skip_trailing_4,
    ));

    ChecksumResponse {
        image: request.image,
        checksum,
    }
}
