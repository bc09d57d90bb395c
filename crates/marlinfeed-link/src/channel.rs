//! Byte channel over a raw file descriptor
//!
//! Provides a uniform wrapper for every descriptor Marlinfeed touches:
//! regular files, TTYs, Unix domain sockets, TCP listeners, pipes and the
//! standard streams. One type means the reader, the engine and the API
//! worker can treat all of them the same way.
//!
//! Supports:
//! - Timed reads with three independent budgets (first byte, idle, total)
//! - Tail reads that keep only the freshest bytes
//! - Full writes that resume through partial writes and interrupts
//! - Non-blocking toggling and poll-based readiness
//! - TTY bring-up at 115200 8N1 without flow control
//!
//! # Sticky errors
//!
//! Once an operation fails, the error sticks to the channel and further
//! operations are no-ops until [`Channel::clear_error`] is called. This
//! lets callers run a sequence of operations and check once at the end;
//! the recorded error is the one that stopped the sequence. End of file
//! is a separate sticky flag and not an error.

use std::ffi::CString;
use std::fs;
use std::io;
use std::net::{Ipv6Addr, SocketAddrV6, TcpListener};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::net::UnixStream;

use marlinfeed_core::millis;
use serialport::SerialPort as _;

/// What `stat` reported about a path or descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    mode: u32,
    /// Size in bytes.
    pub size: i64,
}

impl FileInfo {
    pub fn is_socket(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFSOCK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// A file descriptor with a path, an action tag for error messages, and
/// the sticky error state described in the module documentation.
pub struct Channel {
    /// Filesystem path this channel was constructed with. Not guaranteed
    /// to correspond to the descriptor; some constructors take both.
    path: String,

    /// Phrase inserted into error messages, e.g. "opening printer device".
    action: String,

    /// The sticky error. While set, operations are skipped.
    err: Option<io::Error>,

    /// Descriptor all operations run on. Negative when closed.
    fd: RawFd,

    /// Set when a read hits end of file.
    eof: bool,

    close_on_drop: bool,
}

impl Channel {
    /// Creates a channel for `path` without opening anything yet.
    pub fn new(path: impl Into<String>) -> Self {
        Channel {
            path: path.into(),
            action: String::new(),
            err: None,
            fd: -1,
            eof: false,
            close_on_drop: false,
        }
    }

    /// Wraps an already open descriptor. The descriptor is not closed on
    /// drop; see [`Channel::set_auto_close`].
    pub fn from_raw_fd(path: impl Into<String>, fd: RawFd) -> Self {
        let mut ch = Channel::new(path);
        ch.fd = fd;
        ch
    }

    /// Takes ownership of a descriptor; it is closed when the channel is
    /// dropped or reopened.
    pub fn from_owned_fd(path: impl Into<String>, fd: OwnedFd) -> Self {
        let mut ch = Channel::from_raw_fd(path, fd.into_raw_fd());
        ch.close_on_drop = true;
        ch
    }

    /// Sets whether the descriptor is closed automatically on drop.
    /// Constructors that open descriptors themselves set this.
    pub fn set_auto_close(&mut self, on: bool) {
        self.close_on_drop = on;
    }

    /// The path this channel was constructed with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw descriptor, for poll sets. Negative when closed.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Sets the action tag included in subsequent error messages, e.g.
    /// "opening printer device".
    pub fn set_action(&mut self, action: impl Into<String>) {
        self.action = action.into();
    }

    /// Message describing the pending error, or the empty string.
    pub fn error_message(&self) -> String {
        match &self.err {
            Some(e) => format!("Error {} {}: {}", self.action, self.path, e),
            None => String::new(),
        }
    }

    /// The pending error's kind, if any.
    pub fn err_kind(&self) -> Option<io::ErrorKind> {
        self.err.as_ref().map(|e| e.kind())
    }

    pub fn has_error(&self) -> bool {
        self.err.is_some()
    }

    /// True if the pending error is the would-block condition.
    pub fn is_would_block(&self) -> bool {
        self.err_kind() == Some(io::ErrorKind::WouldBlock)
    }

    /// Clears the pending error and the EOF flag so further operations
    /// run again. Only useful for errors that leave the descriptor in a
    /// working state, e.g. would-block.
    pub fn clear_error(&mut self) {
        self.err = None;
        self.eof = false;
    }

    /// True if a read hit end of file. Not an error condition.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// The pending error in reportable form, with the action tag and
    /// path baked in. The sticky state is left untouched.
    pub fn sticky_error(&self) -> Option<marlinfeed_core::ChannelError> {
        self.err.as_ref().map(|e| marlinfeed_core::ChannelError::Io {
            action: self.action.clone(),
            path: self.path.clone(),
            source: match e.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(e.kind(), e.to_string()),
            },
        })
    }

    pub fn is_closed(&self) -> bool {
        self.fd < 0
    }

    /// Records `err` as the sticky error. EAGAIN is normalized to the
    /// would-block kind so callers only check one condition.
    fn record(&mut self, err: io::Error) {
        self.err = Some(err);
    }

    fn record_errno(&mut self) {
        self.record(io::Error::last_os_error());
    }

    fn c_path(&mut self) -> Option<CString> {
        match CString::new(self.path.as_bytes()) {
            Ok(p) => Some(p),
            Err(_) => {
                self.record(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "path contains NUL",
                ));
                None
            }
        }
    }

    /// Sets or clears the non-blocking flag. Returns false on error.
    pub fn set_nonblock(&mut self, on: bool) -> bool {
        if self.has_error() {
            return false;
        }
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            self.record_errno();
            return false;
        }
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            self.record_errno();
            return false;
        }
        self.err = None;
        true
    }

    fn nonblock_flag_set(&self) -> bool {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        flags >= 0 && flags & libc::O_NONBLOCK != 0
    }

    /// Stats the descriptor if open, the path otherwise.
    pub fn stat(&mut self) -> Option<FileInfo> {
        if self.has_error() {
            return None;
        }
        let mut statbuf = std::mem::MaybeUninit::<libc::stat>::uninit();
        let retval = if self.fd >= 0 {
            unsafe { libc::fstat(self.fd, statbuf.as_mut_ptr()) }
        } else {
            let path = self.c_path()?;
            unsafe { libc::stat(path.as_ptr(), statbuf.as_mut_ptr()) }
        };
        if retval < 0 {
            self.record_errno();
            return None;
        }
        self.err = None;
        let statbuf = unsafe { statbuf.assume_init() };
        Some(FileInfo {
            mode: statbuf.st_mode as u32,
            size: statbuf.st_size as i64,
        })
    }

    /// Opens the path with the given flags, closing any previous
    /// descriptor first. Unlike most operations this runs even with a
    /// pending error. The descriptor is closed on drop afterwards.
    pub fn open(&mut self, flags: i32) -> bool {
        self.close();
        self.err = None;
        let Some(path) = self.c_path() else {
            return false;
        };
        let fd = unsafe { libc::open(path.as_ptr(), flags) };
        self.close_on_drop = true;
        if fd < 0 {
            self.record_errno();
            return false;
        }
        self.fd = fd;
        true
    }

    /// Opens read/write, non-blocking, without becoming the controlling
    /// terminal. The standard way to attach to a printer device.
    pub fn open_rdwr(&mut self) -> bool {
        self.open(libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK)
    }

    /// Opens read-only, non-blocking.
    pub fn open_read(&mut self) -> bool {
        self.open(libc::O_RDONLY | libc::O_NONBLOCK)
    }

    /// Opens write-only.
    pub fn open_write(&mut self) -> bool {
        self.open(libc::O_WRONLY)
    }

    /// Opens the path as a serial port configured for Marlin: 115200
    /// baud, 8 data bits, 1 stop bit, no parity, no flow control, raw.
    /// Pending data in both directions is discarded.
    pub fn open_tty(&mut self) -> bool {
        self.close();
        self.err = None;
        let built = serialport::new(self.path.clone(), 115_200)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open_native();
        match built {
            Ok(port) => {
                let _ = port.clear(serialport::ClearBuffer::All);
                self.fd = port.into_raw_fd();
                self.close_on_drop = true;
                true
            }
            Err(e) => {
                self.record(io::Error::other(e));
                false
            }
        }
    }

    /// Connects to the Unix domain stream socket at the path. Closes any
    /// previous descriptor first.
    pub fn connect(&mut self) -> bool {
        if self.has_error() {
            return false;
        }
        self.close();
        match UnixStream::connect(&self.path) {
            Ok(stream) => {
                self.fd = stream.into_raw_fd();
                self.close_on_drop = true;
                self.err = None;
                true
            }
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    /// Starts listening on the path.
    ///
    /// A path of the form `host:port` binds a TCP listener on the IPv6
    /// wildcard address, or on loopback if `host` is one of the literals
    /// `localhost`, `127.0.0.1` or `::1`. A path without a colon binds a
    /// Unix domain socket at that filesystem location.
    pub fn listen(&mut self) -> bool {
        if self.has_error() {
            return false;
        }
        self.close();

        if let Some(colon) = self.path.rfind(':') {
            if let Ok(port) = self.path[colon + 1..].parse::<u16>() {
                let host = &self.path[..colon];
                let addr = match host {
                    "localhost" | "127.0.0.1" | "::1" => Ipv6Addr::LOCALHOST,
                    _ => Ipv6Addr::UNSPECIFIED,
                };
                match TcpListener::bind(SocketAddrV6::new(addr, port, 0, 0)) {
                    Ok(listener) => {
                        self.fd = listener.into_raw_fd();
                        self.close_on_drop = true;
                        self.err = None;
                        return true;
                    }
                    Err(e) => {
                        self.record(e);
                        return false;
                    }
                }
            }
        }

        match std::os::unix::net::UnixListener::bind(&self.path) {
            Ok(listener) => {
                self.fd = listener.into_raw_fd();
                self.close_on_drop = true;
                self.err = None;
                true
            }
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    /// Accepts a pending connection on a listening channel. Interrupts
    /// are retried transparently. Returns `None` and records the error
    /// if nothing can be accepted (would-block when non-blocking).
    pub fn accept(&mut self) -> Option<OwnedFd> {
        if self.has_error() {
            return None;
        }
        loop {
            let fd = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                self.err = None;
                return Some(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            self.record(e);
            return None;
        }
    }

    /// Removes the filesystem entry at the path. Does not close.
    pub fn unlink(&mut self) -> bool {
        if self.has_error() {
            return false;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                self.err = None;
                true
            }
            Err(e) => {
                self.record(e);
                false
            }
        }
    }

    /// Closes the descriptor. Clears the EOF flag but not a pending
    /// error.
    pub fn close(&mut self) -> bool {
        self.eof = false;
        self.close_on_drop = false;
        if self.fd < 0 {
            return true;
        }
        let fd = self.fd;
        self.fd = -1;
        if unsafe { libc::close(fd) } < 0 {
            self.record_errno();
            false
        } else {
            true
        }
    }

    /// Polls this descriptor for `events`. Returns the ready revents, or
    /// 0 on timeout. Interrupts are retried.
    pub fn poll(&mut self, events: i16, timeout_ms: i32) -> i16 {
        let mut fds = [libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        }];
        loop {
            let retval = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
            if retval < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if retval <= 0 {
                return 0;
            }
            return fds[0].revents;
        }
    }

    /// Writes all of `buf`, resuming through interrupts and partial
    /// writes. Returns the number of unwritten bytes: 0 means success,
    /// anything else means the sticky error stopped the write. A
    /// non-blocking descriptor that runs dry reports would-block.
    pub fn write_all(&mut self, buf: &[u8]) -> usize {
        if self.has_error() {
            return buf.len();
        }
        let mut rest = buf;
        while !rest.is_empty() {
            let retval =
                unsafe { libc::write(self.fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
            if retval < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.record(e);
                break;
            }
            rest = &rest[retval as usize..];
        }
        rest.len()
    }

    /// Reads up to `buf.len()` bytes. See [`Channel::read_with_budgets`]
    /// for the meaning of the waits; the time to the first byte defaults
    /// from the blocking mode and `max_time_ms`.
    pub fn read(&mut self, buf: &mut [u8], more_wait_ms: i64, max_time_ms: i64) -> isize {
        self.read_tail(buf, more_wait_ms, max_time_ms, -1, true, false)
    }

    /// Reads up to `buf.len()` bytes with all three time budgets
    /// explicit.
    ///
    /// - `more_wait_ms`: once at least one byte has arrived, how long to
    ///   wait for more data after the descriptor runs dry.
    /// - `max_time_ms`: absolute cap on the whole call. Negative means
    ///   unbounded; 0 means take only what is immediately available,
    ///   reporting would-block if that is nothing, regardless of the
    ///   blocking mode.
    /// - `initial_wait_ms`: how long to wait for the first byte.
    ///   Negative derives it: `max_time_ms` if bounded, else 0 for a
    ///   non-blocking descriptor and unbounded for a blocking one.
    ///
    /// Returns the byte count, or -1 with the error recorded. Would-block
    /// is only an error when zero bytes were read; with at least one byte
    /// the call returns cleanly.
    pub fn read_with_budgets(
        &mut self,
        buf: &mut [u8],
        more_wait_ms: i64,
        max_time_ms: i64,
        initial_wait_ms: i64,
    ) -> isize {
        self.read_tail(buf, more_wait_ms, max_time_ms, initial_wait_ms, true, false)
    }

    /// Reads until the time budgets run out and keeps the last bytes
    /// read, rotating through `buf` as a circular region. Returns the
    /// number of bytes in `buf`; equal to `buf.len()` if overflow
    /// happened. Unlike [`Channel::read`], a timeout with nothing read is
    /// 0, not an error.
    pub fn tail(&mut self, buf: &mut [u8], more_wait_ms: i64, max_time_ms: i64) -> isize {
        self.read_tail(buf, more_wait_ms, max_time_ms, -1, false, true)
    }

    fn read_tail(
        &mut self,
        buf: &mut [u8],
        more_wait_ms: i64,
        max_time_ms: i64,
        initial_wait_ms: i64,
        report_wouldblock: bool,
        do_tail: bool,
    ) -> isize {
        const UNBOUNDED: i64 = i64::MAX / 2;

        if self.has_error() {
            return -1;
        }
        if buf.is_empty() {
            return 0;
        }

        let mut max_time = if max_time_ms < 0 {
            UNBOUNDED
        } else {
            max_time_ms
        };
        let stop = millis().saturating_add(max_time);
        let more_wait = more_wait_ms.max(0);

        let initial_wait = if initial_wait_ms >= 0 {
            initial_wait_ms
        } else if max_time < UNBOUNDED {
            max_time
        } else if self.nonblock_flag_set() {
            0
        } else {
            UNBOUNDED
        };

        // On EOF poll always reports an event, so a timeout here never
        // masks end of file.
        let revents = self.poll(libc::POLLIN, clamp_timeout(initial_wait));
        if revents == 0 {
            if report_wouldblock {
                self.record(io::Error::new(io::ErrorKind::WouldBlock, "no data within wait"));
                return -1;
            }
            return 0;
        }

        let cap = buf.len();
        let mut pos = 0; // next write offset into buf
        let mut full_buffers = 0;

        loop {
            let retval = loop {
                let r = unsafe {
                    libc::read(
                        self.fd,
                        buf[pos..].as_mut_ptr() as *mut libc::c_void,
                        cap - pos,
                    )
                };
                if r < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break r;
            };

            if retval == 0 {
                self.eof = true;
                break;
            } else if retval < 0 {
                self.record_errno();
                return -1;
            }
            pos += retval as usize;
            if pos == cap {
                full_buffers += 1;
                if !do_tail {
                    break;
                }
                pos = 0;
            }

            let now = millis();
            if now > stop {
                break;
            }
            max_time = stop - now;

            let poll_millis = max_time.min(more_wait);
            if self.poll(libc::POLLIN, clamp_timeout(poll_millis)) == 0 {
                break;
            }
        }

        if full_buffers == 0 {
            return pos as isize;
        }

        // The region after pos was read earlier than the region before
        // it; rotate so the buffer is in chronological order.
        buf.rotate_left(pos);
        cap as isize
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.close_on_drop && self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn clamp_timeout(ms: i64) -> i32 {
    ms.clamp(0, i32::MAX as i64) as i32
}

/// Polls a whole descriptor set at once. Thin wrapper so only this
/// module talks to the OS. Returns at the first interrupt so signal
/// flags get rechecked by the caller.
pub fn poll_fds(fds: &mut [libc::pollfd], timeout_ms: i32) -> i32 {
    unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) }
}

/// Builds a pollfd entry.
pub fn poll_entry(fd: RawFd, events: i16) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn expand_template(template: &str, counter: u64, digits: usize) -> String {
    if digits == 0 {
        return template.to_string();
    }
    let stem = &template[..template.len() - digits];
    format!("{stem}{counter:0width$}", width = digits)
}

fn template_digits(template: &str) -> usize {
    template.bytes().rev().take_while(|&b| b == b'?').count()
}

/// Creates a new file from a template path. A tail of `?` characters is
/// replaced by a decimal counter that starts at zero and increments
/// until creation succeeds. Returns the chosen path, or `None` when the
/// counter space is exhausted or a non-collision error occurs.
pub fn create_file(template: &str, mode: u32) -> Option<String> {
    let digits = template_digits(template);
    let tries = if digits == 0 {
        1
    } else {
        10u64.saturating_pow(digits as u32)
    };
    for counter in 0..tries {
        let path = expand_template(template, counter, digits);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
        {
            Ok(_) => return Some(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(_) => return None,
        }
    }
    None
}

/// Like [`create_file`] but creates a directory.
pub fn create_dir(template: &str, mode: u32) -> Option<String> {
    let digits = template_digits(template);
    let tries = if digits == 0 {
        1
    } else {
        10u64.saturating_pow(digits as u32)
    };
    for counter in 0..tries {
        let path = expand_template(template, counter, digits);
        match fs::DirBuilder::new().mode(mode).create(&path) {
            Ok(()) => return Some(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(_) => return None,
        }
    }
    None
}
