//! # Marlinfeed Link
//!
//! The printer link for Marlinfeed: everything between a G-Code source
//! and a Marlin-based printer firmware.
//!
//! - [`channel`] wraps file descriptors (files, TTYs, sockets,
//!   listeners) behind one sticky-error byte channel
//! - [`gcode`] frames and normalizes G-Code and reply lines
//! - [`window`] numbers and checksums commands and tracks the
//!   firmware's acknowledgments for resend support
//! - [`dirscan`] watches directories for freshly uploaded files
//! - [`engine`] couples all of it under a single poll loop
//! - [`control`] holds the process-wide pause/cancel flags

pub mod channel;
pub mod control;
pub mod dirscan;
pub mod engine;
pub mod gcode;
pub mod window;

pub use channel::{create_dir, create_file, Channel, FileInfo};
pub use dirscan::{DirScanner, MIN_AGE_MS};
pub use engine::{run_job, EngineConfig, JobContext, JobEnd, DEV_NULL};
pub use gcode::{GcodeReader, Line};
pub use window::{MarlinBuf, WRAP_AROUND_STRING, WRAP_AROUND_STRING_LENGTH};
