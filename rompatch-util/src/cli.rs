use clap::{Parser, Subcommand};
use rompatch::Crc32;
use rompatch_util::HeaderMode;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "rompatch-util")]
#[command(about = "IPS and BPS ROM patch utility", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (can be repeated for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply a patch to a ROM
    Apply {
        /// Path to the ROM to patch
        #[arg(value_name = "ROM")]
        rom_path: PathBuf,

        /// Path to the IPS or BPS patch
        #[arg(value_name = "PATCH")]
        patch_path: PathBuf,

        /// Output file (defaults to "<ROM> (patched)")
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Skip source and target checksum verification
        #[arg(long)]
        no_verify: bool,

        /// Copier header size in bytes, or "auto"
        #[arg(long, value_name = "N|auto", default_value = "none")]
        header: HeaderMode,

        /// Put the ROM's header back in front of the output
        #[arg(long)]
        keep_header: bool,

        /// Accept a source ROM with this CRC-32 (can be repeated)
        #[arg(long, value_name = "HEX")]
        expect_crc: Vec<Crc32>,

        /// Largest image a patch may produce, in bytes
        #[arg(long, value_name = "BYTES")]
        max_size: Option<usize>,

        /// Overwrite an existing output file and keep output whose checksum
        /// does not match
        #[arg(short, long)]
        force: bool,
    },

    /// Display information about a patch
    Info {
        /// Path to the IPS or BPS patch
        #[arg(value_name = "PATCH")]
        patch_path: PathBuf,
    },

    /// Print the CRC-32 of files
    Crc {
        /// Files to checksum
        #[arg(value_name = "FILE", required = true)]
        paths: Vec<PathBuf>,

        /// Copier header size in bytes, or "auto"
        #[arg(long, value_name = "N|auto", default_value = "none")]
        header: HeaderMode,
    },
}
