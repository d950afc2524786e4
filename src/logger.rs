//! Logging setup for the diagnostic tool.
//!
//! An explicit `RUST_LOG` wins so operators can scope filters per run
//! (e.g. `RUST_LOG=ltfs_core::chain=trace` while debugging a recovery).
//! Otherwise the default shows operational messages only; tape motion can
//! take minutes, so `--verbose` opens the crate's per-command trail (CDB
//! issue, positioning, sense decode) without dragging in dependency noise.

use crate::error::{LtfsError, Result};
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "info";
const VERBOSE_DIRECTIVES: &str = "info,ltfs_core=debug,ltfstool=debug";

pub fn init(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_DIRECTIVES
        } else {
            DEFAULT_DIRECTIVES
        })
    });

    let fmt_layer = fmt::layer()
        .with_target(verbose)
        .with_writer(io::stderr);

    // A second init is a caller bug, not a panic: report it so main can
    // exit with its operational-error code.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            LtfsError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("logging already initialized: {}", e),
            ))
        })
}
