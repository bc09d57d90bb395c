//! G-Code text handling: the line type and the normalizing reader.

pub mod line;
pub mod reader;

pub use line::{Line, BOUNDARY};
pub use reader::{GcodeReader, BUFSIZE};
