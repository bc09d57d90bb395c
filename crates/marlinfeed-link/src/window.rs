//! Numbered, checksummed send window for the Marlin serial protocol.
//!
//! Performs the following functions:
//! - line numbering and checksumming
//! - tracking which lines have been acknowledged with `ok`
//! - rewinding to a sent but unacknowledged line for `Resend` support
//! - tracking the serial buffer fill state to prevent overflowing it

/// The command that rolls the firmware's line counter around so that
/// line numbers 0 to 98 can be reused. Preinstalled in slot 99.
pub const WRAP_AROUND_STRING: &[u8] = b"N99M110N-1*97\n";

/// Byte length of [`WRAP_AROUND_STRING`].
pub const WRAP_AROUND_STRING_LENGTH: usize = 14;

/// Default size of the serial port transfer buffer. This is the
/// limiting factor, because pushing more than this causes data loss and
/// forces resends. The buffers Marlin manages internally (e.g. the
/// planner buffer) matter less: when they fill up Marlin stops sending
/// `ok` and stops reading from the serial connection, with no data loss
/// as long as the serial buffer itself is not overflowed. 128 is the
/// buffer size of the FTDI FT232R USB-UART chip common on 8-bit boards.
pub const DEFAULT_BUF_SIZE: isize = 128;

/// A window of G-Code commands on their way to Marlin.
///
/// Each slot holds one command prefixed with `Nxx` (the line number,
/// 0 to 98) and suffixed with `*chk` where `chk` is the Marlin checksum
/// (XOR of all bytes preceding the `*`). Each line ends in `\n`.
/// Slot 99 permanently holds the wrap-around command; when slot 98 is
/// filled, slot 99 is automatically queued after it.
pub struct MarlinBuf {
    /// The 100 slots. Only the contents change; slot 99 never does.
    line: Vec<Vec<u8>>,

    /// The next line appended goes into this slot.
    i_in: usize,

    /// `line[i_out]` is the next line to transmit. `i_out == i_in`
    /// means nothing is queued.
    i_out: usize,

    /// The next slot to be acknowledged. Trails `i_out` because slots
    /// free up when Marlin acks them with `ok`.
    i_free: usize,

    /// Sum of line lengths of unacknowledged slots.
    sz: isize,

    buf_size: isize,
}

impl MarlinBuf {
    pub fn new() -> Self {
        let mut line: Vec<Vec<u8>> = vec![Vec::new(); 100];
        line[99] = WRAP_AROUND_STRING.to_vec();
        MarlinBuf {
            line,
            i_in: 0,
            i_out: 0,
            i_free: 0,
            sz: 0,
            buf_size: DEFAULT_BUF_SIZE,
        }
    }

    /// Changes the assumed size of the firmware's serial buffer. Affects
    /// future [`MarlinBuf::max_append_len`] calls; shrinking below what
    /// is currently outstanding makes that return a negative value.
    pub fn set_buf_size(&mut self, new_buf_size: isize) {
        self.buf_size = new_buf_size;
    }

    /// The longest G-Code command that still fits, accounting for the
    /// line number, the checksum, the newline, and the wrap-around
    /// command if the next slot is 98. Returns 0 when all 98 usable
    /// slots are taken regardless of byte space.
    pub fn max_append_len(&self) -> isize {
        if (self.i_in + 1) % 99 == self.i_free {
            return 0;
        }

        let mut remain = self.buf_size - self.sz;
        remain -= if self.i_in < 10 { 2 } else { 3 }; // Nx or Nxx
        if self.i_in == 98 {
            remain -= WRAP_AROUND_STRING_LENGTH as isize;
        }
        remain -= 4; // *chk
        remain -= 1; // \n
        remain
    }

    /// Appends a G-Code command, which must not already carry a line
    /// number or checksum; both are added here. Leading and trailing
    /// whitespace and a `;` comment are stripped; if nothing remains the
    /// call does nothing. Check [`MarlinBuf::max_append_len`] first.
    pub fn append(&mut self, gcode: &[u8]) {
        let mut start = 0;
        while start < gcode.len() && gcode[start].is_ascii_whitespace() {
            start += 1;
        }
        let mut end = start;
        while end < gcode.len() && gcode[end] != 0 && gcode[end] != b';' {
            end += 1;
        }
        while end > start && gcode[end - 1].is_ascii_whitespace() {
            end -= 1;
        }
        let payload = &gcode[start..end];
        if payload.is_empty() {
            return;
        }

        let mut framed = Vec::with_capacity(payload.len() + 8);
        framed.push(b'N');
        framed.extend_from_slice(self.i_in.to_string().as_bytes());
        framed.extend_from_slice(payload);
        let checksum = framed.iter().fold(0u8, |chk, &b| chk ^ b);
        framed.push(b'*');
        framed.extend_from_slice(checksum.to_string().as_bytes());
        framed.push(b'\n');

        self.sz += framed.len() as isize;
        self.line[self.i_in] = framed;
        self.i_in += 1;

        // Appending slot 98 implicitly queues the wrap-around command.
        if self.i_in == 99 {
            self.i_in = 0;
            self.sz += WRAP_AROUND_STRING_LENGTH as isize;
        }

        debug_assert!(self.i_in != self.i_free);
        debug_assert!(self.i_in != self.i_out);
        debug_assert!(self.sz <= self.buf_size);
    }

    /// True if a line is waiting to be sent over the wire.
    pub fn has_next(&self) -> bool {
        self.i_out != self.i_in
    }

    /// True if a sent line has not been acknowledged yet.
    pub fn needs_ack(&self) -> bool {
        self.i_free != self.i_out
    }

    /// The next line to send over the wire. The slot keeps ownership;
    /// copy the bytes out before the slot is reused. Panics if nothing
    /// is queued; check [`MarlinBuf::has_next`] first.
    pub fn next(&mut self) -> &[u8] {
        assert!(self.has_next());
        let slot = self.i_out;
        self.i_out += 1;
        if self.i_out == 100 {
            self.i_out = 0;
        }
        &self.line[slot]
    }

    /// Acknowledges the oldest outstanding line, freeing its bytes.
    /// Returns false if there is nothing to acknowledge.
    pub fn ack(&mut self) -> bool {
        if self.i_free == self.i_out {
            return false;
        }
        self.sz -= self.line[self.i_free].len() as isize;
        debug_assert!(self.sz >= 0);
        self.i_free += 1;
        if self.i_free == 100 {
            self.i_free = 0;
        }
        true
    }

    /// Makes slot `l` the next line returned by [`MarlinBuf::next`].
    /// The slot must hold a line that was appended and not acknowledged
    /// yet. Returns false otherwise. This is the resend primitive.
    pub fn seek(&mut self, l: i64) -> bool {
        // window empty
        if self.i_free == self.i_in {
            return false;
        }

        if l < 0 || l >= 100 {
            return false;
        }
        let l = l as usize;

        if self.i_free < self.i_in {
            if l < self.i_free || l >= self.i_in {
                return false;
            }
        } else if l < self.i_free && l >= self.i_in {
            return false;
        }
        self.i_out = l;
        true
    }
}

impl Default for MarlinBuf {
    fn default() -> Self {
        MarlinBuf::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_drain_and_wrap() {
        let mut buf = MarlinBuf::new();
        buf.set_buf_size(1000);
        assert!(!buf.has_next());
        assert!(!buf.ack());
        assert!(!buf.seek(0));

        let initial_max = buf.max_append_len();
        assert!(initial_max > 100);

        for i in 0..98 {
            let before = buf.max_append_len();
            assert!(before > 10);
            let gcode = format!("G{}", i);
            buf.append(gcode.as_bytes());
            let consumed = before - buf.max_append_len();
            assert!(consumed >= 7 && consumed <= before);

            assert!(buf.has_next());
            assert!(buf.seek(i as i64));
        }
        assert_eq!(buf.max_append_len(), 0);

        assert!(buf.seek(0));
        assert!(!buf.ack());

        assert_eq!(buf.next(), b"N0G0*9\n");
        assert_eq!(buf.next(), b"N1G1*9\n");
        assert!(buf.seek(0));
        assert_eq!(buf.next(), b"N0G0*9\n");
        assert_eq!(buf.next(), b"N1G1*9\n");
        assert_eq!(buf.max_append_len(), 0);
        assert!(buf.ack());
        assert!(buf.max_append_len() > 10);
        assert!(!buf.seek(0));
        buf.append(b"G98");
        assert_eq!(buf.max_append_len(), 0);
        assert!(!buf.seek(0));

        // The wrap-around slot is seekable while unacknowledged.
        assert!(buf.seek(99));
        assert!(buf.seek(1));

        for _ in 1..=98 {
            buf.next();
        }
        assert_eq!(buf.next(), WRAP_AROUND_STRING);

        for _ in 1..=99 {
            assert!(buf.ack());
        }

        assert!(!buf.has_next());
        assert_eq!(buf.max_append_len(), initial_max);
    }

    #[test]
    fn append_strips_whitespace_and_comments() {
        let mut buf = MarlinBuf::new();
        buf.set_buf_size(1000);
        buf.append(b"   G452   \n\n");
        buf.append(b"   G452   ; This is a comment");
        buf.append(b"G452");
        let max = buf.max_append_len();
        buf.append(b"    ");
        assert_eq!(max, buf.max_append_len());

        let first = buf.next()[2..7].to_vec();
        let second = buf.next()[2..7].to_vec();
        assert_eq!(first, second);
        assert_eq!(buf.next(), b"N2G452*8\n");
    }

    #[test]
    fn byte_accounting_is_exact() {
        let mut buf = MarlinBuf::new();
        buf.set_buf_size(1000);
        let before = buf.max_append_len();
        buf.append(b"G28");
        // The frame is N0G28*51\n: 3 payload bytes, 2 prefix bytes and
        // the 4-byte *51\n suffix.
        assert_eq!(before - buf.max_append_len(), 9);

        // Whatever maxAppendLen promises must actually fit.
        let fit = buf.max_append_len() as usize;
        buf.append(&vec![b'X'; fit]);
        assert!(buf.sz <= buf.buf_size);
    }

    #[test]
    fn shrinking_buf_size_can_go_negative() {
        let mut buf = MarlinBuf::new();
        buf.append(b"G28");
        buf.set_buf_size(4);
        assert!(buf.max_append_len() < 0);
    }

    #[test]
    fn wire_checksum_is_xor_of_prefix() {
        let mut buf = MarlinBuf::new();
        buf.append(b"M115");
        let framed = buf.next().to_vec();
        let star = framed.iter().position(|&b| b == b'*').unwrap();
        let expected: u8 = framed[..star].iter().fold(0, |chk, &b| chk ^ b);
        let digits = std::str::from_utf8(&framed[star + 1..framed.len() - 1]).unwrap();
        assert_eq!(digits.parse::<u8>().unwrap(), expected);
        assert!(framed.ends_with(b"\n"));
    }

    #[test]
    fn wrap_around_checksum_is_97() {
        let chk: u8 = b"N99M110N-1".iter().fold(0, |chk, &b| chk ^ b);
        assert_eq!(chk, 97);
        assert_eq!(WRAP_AROUND_STRING.len(), WRAP_AROUND_STRING_LENGTH);
    }
}
