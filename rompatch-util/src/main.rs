mod cli;

use clap::Parser;
use cli::{Cli, Command};
use rompatch::bps::BpsAction;
use rompatch::ips::IpsRecord;
use rompatch::{ApplyError, ApplyOptions, EditScript, Limits, Patch};
use rompatch_util::worker::{
    ApplyRequest, ApplyWorker, ChecksumRequest, ChecksumWorker, WorkerError,
};
use rompatch_util::{ApplyProgress, ConsoleProgress, HeaderMode, SilentProgress};
use snafu::{ResultExt, Snafu, ensure};
use std::path::{Path, PathBuf};

/// Top-level application errors for rompatch-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open ROM '{}'", path.display()))]
    OpenRom {
        path: PathBuf,
        source: rompatch_util::OpenError,
    },

    #[snafu(display("failed to read patch '{}'", path.display()))]
    ReadPatch {
        path: PathBuf,
        source: rompatch_util::OpenError,
    },

    #[snafu(display("failed to parse patch '{}'", path.display()))]
    ParsePatch {
        path: PathBuf,
        source: rompatch::ParseError,
    },

    #[snafu(display("failed to start worker"))]
    StartWorker { source: WorkerError },

    #[snafu(display("failed to checksum ROM"))]
    Checksum { source: WorkerError },

    #[snafu(display("failed to patch '{}'", path.display()))]
    Apply { path: PathBuf, source: WorkerError },

    #[snafu(display("output file '{}' already exists (use --force to overwrite)", path.display()))]
    OutputExists { path: PathBuf },

    #[snafu(display("failed to write '{}'", path.display()))]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to checksum {count} of the given files"))]
    ChecksumFiles { count: usize },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Options of the `apply` command.
struct ApplyArgs {
    rom_path: PathBuf,
    patch_path: PathBuf,
    output: Option<PathBuf>,
    verify: bool,
    header: HeaderMode,
    keep_header: bool,
    expect_crc: Vec<rompatch::Crc32>,
    max_size: Option<usize>,
    force: bool,
}

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Apply {
            rom_path,
            patch_path,
            output,
            no_verify,
            header,
            keep_header,
            expect_crc,
            max_size,
            force,
        } => cmd_apply(
            ApplyArgs {
                rom_path,
                patch_path,
                output,
                verify: !no_verify,
                header,
                keep_header,
                expect_crc,
                max_size,
                force,
            },
            cli.quiet,
        ),
        Command::Info { patch_path } => cmd_info(&patch_path),
        Command::Crc { paths, header } => cmd_crc(&paths, header),
    }
}

fn cmd_apply(args: ApplyArgs, quiet: bool) -> Result<()> {
    let output_path = match &args.output {
        Some(path) => path.clone(),
        None => default_output_path(&args.rom_path),
    };
    ensure!(
        args.force || !output_path.exists(),
        OutputExistsSnafu { path: &output_path }
    );

    let rom = rompatch_util::open_image(&args.rom_path, args.header).context(OpenRomSnafu {
        path: &args.rom_path,
    })?;
    let patch_bytes = rompatch_util::read_patch(&args.patch_path).context(ReadPatchSnafu {
        path: &args.patch_path,
    })?;

    let mut limits = Limits::default();
    if let Some(size) = args.max_size {
        limits = limits.with_max_image_size(size);
    }
    let options = ApplyOptions::default()
        .with_verify(args.verify)
        .with_limits(limits);

    // Parse up front so a bad patch is reported before any work is queued.
    let mut patch = Patch::parse_with(&patch_bytes, &limits).context(ParsePatchSnafu {
        path: &args.patch_path,
    })?;
    patch.attach_source_checksums(args.expect_crc.iter().copied());

    if let Err(e) = patch.integrity() {
        log::warn!("{e}");
    }

    let checksum_worker = ChecksumWorker::spawn().context(StartWorkerSnafu)?;
    let apply_worker = ApplyWorker::spawn().context(StartWorkerSnafu)?;

    let checked = wait(
        checksum_worker.submit(ChecksumRequest::body(rom)),
        "Checksumming ROM",
        quiet,
    )
    .context(ChecksumSnafu)?;

    if !quiet {
        println!(
            "{} patch, ROM CRC32 {}{}",
            patch.format(),
            checked.checksum,
            match patch.validate_source_checksum(checked.checksum) {
                Some(true) => " (matches)",
                Some(false) => " (does not match)",
                None => "",
            }
        );
    }

    let request = ApplyRequest::new(checked.image, patch_bytes)
        .with_options(options)
        .with_source_crcs(args.expect_crc);
    let response = wait(apply_worker.submit(request), "Patching", quiet).context(ApplySnafu {
        path: &args.rom_path,
    })?;

    let patched = match response.result {
        Ok(image) => image,
        Err(WorkerError::ApplyPatch {
            source:
                ApplyError::TargetMismatch {
                    expected,
                    actual,
                    output,
                },
        }) if args.force => {
            log::warn!(
                "patched ROM has CRC32 {actual}, patch expects {expected}; writing it anyway"
            );
            output
        }
        Err(e) => {
            return Err(e).context(ApplySnafu {
                path: &args.rom_path,
            });
        }
    };

    let patched = if args.keep_header {
        patched.prepend_header(response.source.header())
    } else {
        patched
    };

    std::fs::write(&output_path, patched.as_bytes()).context(WriteOutputSnafu {
        path: &output_path,
    })?;

    if !quiet {
        println!(
            "Wrote {} ({} bytes, CRC32 {}).",
            output_path.display(),
            patched.len(),
            patched.checksum()
        );
    }

    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let bytes = rompatch_util::read_patch(path).context(ReadPatchSnafu { path })?;
    let patch = Patch::parse(&bytes).context(ParsePatchSnafu { path })?;

    println!("Patch: {}", path.display());
    println!();
    println!("Format:         {}", patch.format());
    println!("Patch Size:     {} bytes", bytes.len());

    match patch.script() {
        EditScript::Ips(ips) => {
            let fills = ips
                .records()
                .iter()
                .filter(|r| matches!(r, IpsRecord::Fill { .. }))
                .count();
            let last_byte = ips
                .records()
                .iter()
                .filter(|r| !r.is_empty())
                .map(|r| r.end() - 1)
                .max();

            println!("Records:        {}", ips.records().len());
            println!("  Literal:      {}", ips.records().len() - fills);
            println!("  Run-length:   {}", fills);
            match last_byte {
                Some(offset) => println!("Highest Write:  0x{:X}", offset),
                None => println!("Highest Write:  (none)"),
            }
            match ips.truncate() {
                Some(len) => println!("Truncate To:    {} bytes", len),
                None => println!("Truncate To:    (none)"),
            }
        }
        EditScript::Bps(bps) => {
            let mut counts = [0usize; 4];
            for action in bps.actions() {
                let slot = match action {
                    BpsAction::SourceRead { .. } => 0,
                    BpsAction::TargetRead { .. } => 1,
                    BpsAction::SourceCopy { .. } => 2,
                    BpsAction::TargetCopy { .. } => 3,
                };
                counts[slot] += 1;
            }

            println!("Source Size:    {} bytes", bps.source_size());
            println!("Target Size:    {} bytes", bps.target_size());
            println!("Source CRC32:   {}", bps.footer().source_crc());
            println!("Target CRC32:   {}", bps.footer().target_crc());
            println!(
                "Patch CRC32:    {} ({})",
                bps.footer().patch_crc(),
                if patch.integrity().is_ok() { "ok" } else { "MISMATCH" }
            );
            println!("Actions:        {}", bps.actions().len());
            println!("  Source Read:  {}", counts[0]);
            println!("  Target Read:  {}", counts[1]);
            println!("  Source Copy:  {}", counts[2]);
            println!("  Target Copy:  {}", counts[3]);

            if !bps.metadata().is_empty() {
                println!("Metadata:");
                for line in bps.metadata().lines() {
                    println!("  {line}");
                }
            }
        }
    }

    Ok(())
}

fn cmd_crc(paths: &[PathBuf], header: HeaderMode) -> Result<()> {
    let results = unsafe { rompatch_util::checksum_files(paths, header) };
    let mut failed = 0usize;

    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(crc) => println!("{crc}  {}", path.display()),
            Err(e) => {
                eprintln!("{}: {}", path.display(), snafu::Report::from_error(e));
                failed += 1;
            }
        }
    }

    ensure!(failed == 0, ChecksumFilesSnafu { count: failed });
    Ok(())
}

/// Waits on a worker, with a spinner unless `quiet`.
fn wait<T>(
    pending: rompatch_util::worker::Pending<T>,
    message: &str,
    quiet: bool,
) -> Result<T, WorkerError> {
    if quiet {
        return pending.wait_with(&SilentProgress);
    }

    let progress = ConsoleProgress::new();
    progress.started(message);
    let result = pending.wait_with(&progress);
    progress.finished();

    result
}

/// `game.sfc` becomes `game (patched).sfc` next to it.
fn default_output_path(rom_path: &Path) -> PathBuf {
    let stem = rom_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name = match rom_path.extension() {
        Some(ext) => format!("{stem} (patched).{}", ext.to_string_lossy()),
        None => format!("{stem} (patched)"),
    };

    rom_path.with_file_name(name)
}
