use clap::builder::styling::AnsiColor;
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

const CLAP_STYLING: Styles = Styles::styled()
    .header(AnsiColor::BrightGreen.on_default().bold())
    .usage(AnsiColor::BrightGreen.on_default().bold())
    .literal(AnsiColor::BrightCyan.on_default().bold())
    .placeholder(AnsiColor::BrightCyan.on_default());

/// Exit codes reported by the diagnostic tool.
pub mod exit_code {
    pub const NO_ERRORS: i32 = 0;
    pub const CORRECTED: i32 = 1;
    pub const UNCORRECTED: i32 = 4;
    pub const OPERATIONAL_ERROR: i32 = 8;
    pub const USAGE_SYNTAX_ERROR: i32 = 16;
}

#[derive(Parser)]
#[command(name = "ltfstool")]
#[command(about = "Diagnostic tool for LTFS volumes: consistency check, rollback points, rollback")]
#[command(version)]
#[command(styles = CLAP_STYLING)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check medium consistency and optionally repair it
    Check {
        /// Tape device path (e.g. \\.\TAPE0)
        #[arg(short = 't', long = "tape", value_name = "DEVICE")]
        device: String,

        /// Repair recoverable damage (missing filemarks, trailing index)
        #[arg(long)]
        fix: bool,

        /// Allow recovery when both EOD marks are gone
        #[arg(long)]
        deep_recovery: bool,

        /// Collect unreferenced blocks into /_ltfs_lostandfound
        #[arg(long)]
        salvage: bool,
    },

    /// List the reachable rollback points
    Points {
        /// Tape device path (e.g. \\.\TAPE0)
        #[arg(short = 't', long = "tape", value_name = "DEVICE")]
        device: String,

        /// Traverse oldest-first instead of newest-first
        #[arg(long)]
        forward: bool,

        /// Write each index found to this directory
        #[arg(long, value_name = "DIR")]
        capture_index: Option<PathBuf>,
    },

    /// Roll the volume back to an earlier index generation
    Rollback {
        /// Tape device path (e.g. \\.\TAPE0)
        #[arg(short = 't', long = "tape", value_name = "DEVICE")]
        device: String,

        /// Target index generation
        #[arg(short, long)]
        generation: u64,

        /// Physically erase everything newer than the target
        #[arg(long, conflicts_with = "keep_history")]
        erase_history: bool,

        /// Keep newer generations reachable (default)
        #[arg(long)]
        keep_history: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
