//! # Marlinfeed
//!
//! Feeds G-Code to a Marlin-based 3D printer at the pace the printer
//! can accept it, honoring the firmware's flow control (`ok`, `Error:`,
//! `Resend:`), recovering from transient failures, and exposing a
//! minimal Octoprint-compatible HTTP API for slicer front-ends.
//!
//! ## Architecture
//!
//! Marlinfeed is organized as a workspace:
//!
//! 1. **marlinfeed-core** - errors, clock, FIFO, printer state
//! 2. **marlinfeed-link** - byte channel, G-Code framing, send window,
//!    directory scanner, the engine loop
//! 3. **marlinfeed** - CLI driver and the API worker

pub mod api;

pub use marlinfeed_core::{
    millis, Error, ErrorClass, Fifo, JobError, PrinterState, ProtocolError, Result,
    SharedPrinterState, Status,
};
pub use marlinfeed_link::{
    run_job, Channel, DirScanner, EngineConfig, GcodeReader, JobContext, JobEnd, Line, MarlinBuf,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging for the given `-v` count.
///
/// Operator diagnostics go to standard error through `tracing`;
/// standard output stays reserved for the protocol echo stream. The
/// verbosity ladder maps 0 to warnings only, 1 to per-file and upload
/// events, 2 to headers and replies, 3+ to full tracing. `RUST_LOG`
/// overrides when set.
pub fn init_logging(verbosity: u8) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    Ok(())
}
