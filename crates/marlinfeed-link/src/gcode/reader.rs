//! Buffered line extraction and normalization over a byte channel.
//!
//! Frames the byte stream into lines while stripping comments,
//! compressing whitespace and harvesting slicer metadata, all in a
//! single pass over a fixed scratch buffer. Serves three masters: the
//! G-Code source, the printer reply stream and the API worker's HTTP
//! parsing.

use marlinfeed_core::scan::{is_space, parse_i64};

use crate::channel::Channel;
use crate::gcode::line::Line;

/// Size of the scratch buffer. A line that exceeds this (e.g. through
/// excessive whitespace) is split, which will probably produce at least
/// one illegal line; the unterminated prefix is handed to the caller
/// as-is.
pub const BUFSIZE: usize = 1024;

/// Size of the buffer for slicer comments that get parsed.
const COMMENT_BUFSIZE: usize = 64;

/// Upper bound (exclusive) on believable slicer time estimates, 100 days
/// in seconds.
const MAX_PRINT_TIME: i64 = 8_640_000;

/// Extracts normalized lines from a [`Channel`].
///
/// The reader holds only buffering state; every call that may need more
/// data takes the channel it should read from. A would-block condition
/// encountered while reading is cleared transparently; other errors stay
/// on the channel for the caller to inspect.
pub struct GcodeReader {
    buf: [u8; BUFSIZE],
    combuf: [u8; COMMENT_BUFSIZE],
    /// Write position in `combuf`.
    comidx: usize,
    /// Index of the next empty spot in `buf`, i.e. where reading
    /// continues. Never exceeds `BUFSIZE`.
    bufidx: usize,
    /// If > 0, `buf[..ready]` is one complete normalized line.
    ready: usize,
    ws_comp: u8,
    /// Tells the scanner to reprocess the buffer from the start because
    /// a line was extracted in front of the remaining bytes.
    full_scan: bool,
    /// Everything from this byte up to the next newline is discarded.
    /// A newline here preserves comments.
    comment: u8,
    in_comment: bool,
    bytes_read: i64,
    print_time: i64,
}

impl GcodeReader {
    /// Creates a reader with whitespace compression 3 and `;` comments.
    pub fn new() -> Self {
        GcodeReader {
            buf: [0; BUFSIZE],
            combuf: [0; COMMENT_BUFSIZE],
            comidx: 0,
            bufidx: 0,
            ready: 0,
            ws_comp: 3,
            full_scan: false,
            comment: b';',
            in_comment: false,
            bytes_read: 0,
            print_time: 0,
        }
    }

    /// Sets the whitespace compression level, affecting subsequent
    /// reads:
    /// - 0: keep all whitespace
    /// - 1: collapse runs to a single space, trim line edges (except
    ///   for the single trailing newline)
    /// - 2: strip all whitespace except one trailing newline
    /// - 3: strip all whitespace
    pub fn set_whitespace_compression(&mut self, level: u8) {
        self.ws_comp = level;
    }

    /// Sets the byte that starts a comment. `\n` preserves comments.
    pub fn set_comment_char(&mut self, ch: u8) {
        self.comment = ch;
    }

    /// Bytes consumed from the channel so far, whether or not they
    /// survived normalization.
    pub fn total_bytes_read(&self) -> i64 {
        self.bytes_read
    }

    /// Estimated print time in seconds as parsed from slicer comments;
    /// 0 if none seen yet.
    pub fn estimated_print_time(&self) -> i64 {
        self.print_time
    }

    /// Drops all buffered bytes. The next read starts a new line at
    /// whatever position the channel is at. Returns how many bytes were
    /// discarded.
    pub fn discard(&mut self) -> usize {
        let discarded = self.bufidx;
        self.comidx = 0;
        self.bufidx = 0;
        self.ready = 0;
        self.full_scan = false;
        self.in_comment = false;
        discarded
    }

    /// Extracts up to `dest.len()` buffered bytes verbatim, without
    /// normalization. Returns the byte count; repeat until 0 to drain
    /// everything buffered. Used for byte-accurate HTTP bodies after
    /// the headers have been read line-wise.
    pub fn raw(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.bufidx);
        dest[..n].copy_from_slice(&self.buf[..n]);
        self.buf.copy_within(n..self.bufidx, 0);
        self.bufidx -= n;
        self.comidx = 0;
        self.ready = 0;
        self.full_scan = self.bufidx > 0;
        self.in_comment = false;
        n
    }

    /// Returns true if a complete line is ready for [`GcodeReader::next`],
    /// reading from the channel first if necessary. With a blocking
    /// channel this blocks until data arrives.
    pub fn has_next(&mut self, ch: &mut Channel) -> bool {
        if self.ready == 0 {
            self.try_read(ch);
        }
        self.ready > 0
    }

    /// Extracts the next line, or `None` if no complete line can be
    /// produced right now (check the channel for errors or EOF).
    pub fn next(&mut self, ch: &mut Channel) -> Option<Line> {
        if !self.has_next(ch) {
            return None;
        }
        let line = Line::from_bytes(self.buf[..self.ready].to_vec());
        self.buf.copy_within(self.ready..self.bufidx, 0);
        self.bufidx -= self.ready;
        self.ready = 0;
        self.full_scan = true;
        Some(line)
    }

    fn parse_comment(&mut self) {
        let comment = &self.combuf[..self.comidx];
        if let Some(rest) = comment.strip_prefix(b"TIME:") {
            let (value, _) = parse_i64(rest, 10);
            if value > 0 && value < MAX_PRINT_TIME {
                self.print_time = value;
            }
        }
        self.comidx = 0;
    }

    /// Reads and scans until a line is ready or the channel has nothing
    /// more to give. Must not be called while `ready > 0`.
    fn try_read(&mut self, ch: &mut Channel) {
        loop {
            let mut retval: isize = 0;
            if !self.full_scan {
                retval = ch.read(&mut self.buf[self.bufidx..], 0, -1);
            }

            if retval > 0 || self.full_scan {
                // i is the write position of the compressed line under
                // construction, k the read position in raw bytes.
                let mut i = self.bufidx;
                if self.full_scan {
                    self.in_comment = false;
                    i = 0;
                }
                self.full_scan = false;

                let got = retval.max(0) as usize;
                self.bytes_read += got as i64;
                self.bufidx += got;

                let mut k = i;
                while k < self.bufidx {
                    let byte = self.buf[k];
                    k += 1;

                    if byte == b'\n' {
                        if self.in_comment {
                            self.parse_comment();
                        }
                        self.in_comment = false;
                        if self.ws_comp == 1 && i > 0 && self.buf[i - 1] == b' ' {
                            i -= 1;
                        }
                        if self.ws_comp < 3 {
                            self.buf[i] = byte;
                            i += 1;
                        }

                        // A line compressed down to nothing is skipped.
                        if i == 0 {
                            continue;
                        }

                        self.ready = i;
                        self.buf.copy_within(k..self.bufidx, i);
                        i += self.bufidx - k;
                        break;
                    }

                    if self.in_comment || byte == self.comment {
                        if self.in_comment && self.comidx < COMMENT_BUFSIZE - 1 {
                            self.combuf[self.comidx] = byte;
                            self.comidx += 1;
                        } else {
                            self.comidx = 0;
                        }
                        self.in_comment = true;
                        continue;
                    }

                    if self.ws_comp == 0 || !is_space(byte) {
                        self.buf[i] = byte;
                        i += 1;
                    } else if self.ws_comp == 1 && i > 0 && self.buf[i - 1] != b' ' {
                        self.buf[i] = b' ';
                        i += 1;
                    }
                }

                self.bufidx = i;

                if self.ready != 0 {
                    break;
                }
            }

            if self.bufidx == BUFSIZE || ch.eof() || ch.has_error() {
                if ch.is_would_block() {
                    ch.clear_error();
                } else {
                    // Deliver whatever has accumulated as an
                    // unterminated line (overlong line or final line
                    // before EOF).
                    self.ready = self.bufidx;
                }
                break;
            }
        }
    }
}

impl Default for GcodeReader {
    fn default() -> Self {
        GcodeReader::new()
    }
}
