//! # Marlinfeed Core
//!
//! Core types shared by the Marlinfeed crates:
//! - Layered error types and the crate-wide `Result` alias
//! - The monotonic millisecond clock all deadlines are measured on
//! - An owning FIFO queue
//! - The derived printer state with its Octoprint JSON serializations
//! - Byte-level number scanning with C library semantics

pub mod clock;
pub mod error;
pub mod fifo;
pub mod scan;
pub mod state;

pub use clock::millis;
pub use error::{ChannelError, Error, ErrorClass, JobError, ProtocolError, Result};
pub use fifo::Fifo;
pub use state::{shared_state, PrinterState, SharedPrinterState, Status};
