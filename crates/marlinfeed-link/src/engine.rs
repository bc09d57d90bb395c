//! The printer-coupling engine.
//!
//! Runs one print job: attaches to the printer (reconnecting and
//! handshaking if necessary), then multiplexes the printer link, the
//! G-Code source, the injection channel, the echo stream and the API
//! listener under a single poll loop until the source is drained or an
//! error class decides otherwise.
//!
//! The inner loop drives the printer side to quiescence before anything
//! else is serviced: replies must be drained before new commands are
//! pushed so the send window can free slots. This ordering is a hard
//! requirement of the flow control scheme.

use std::os::fd::OwnedFd;
use std::time::Duration;

use marlinfeed_core::{
    millis, Error, ErrorClass, Fifo, JobError, ProtocolError, SharedPrinterState, Status,
};

use crate::channel::{poll_entry, poll_fds, Channel};
use crate::control;
use crate::gcode::{GcodeReader, Line};
use crate::window::{MarlinBuf, WRAP_AROUND_STRING};

/// Maximum milliseconds without a non-error reply before the job is
/// aborted because the printer answers everything with an error.
pub const MAX_TIME_WITH_ERROR: i64 = 5000;

/// Maximum milliseconds of printer silence while at least one command
/// is unacknowledged. Needs to be longer than the longest blocking
/// command that is silent (e.g. G28).
pub const MAX_TIME_SILENCE: i64 = 120_000;

/// Milliseconds a command may sit ready-but-unsendable before the
/// printer state changes to Stalled. Indicates a long running command
/// like G28.
pub const STALL_TIME: i64 = 2000;

/// Sent before the handshake on a hard reconnect to stop any SD card
/// print the firmware may still be running.
pub const STOP_SD_PRINT_GCODE: &[u8] = b"M524\n";

/// Dummy source used to run the loop purely for injected commands.
/// Reading from it yields EOF immediately.
pub const DEV_NULL: &str = "/dev/null";

const MAX_ATTEMPTS: u32 = 4;

/// How a job ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEnd {
    /// The source reached EOF and everything was acknowledged.
    SourceDrained,
    /// The user cancelled; the printer link is still in sync.
    Cancelled,
}

/// Engine tunables owned by the driver.
pub struct EngineConfig {
    /// Verbosity ladder 0..=4 as set by `-v`.
    pub verbosity: u8,
}

/// Everything a job borrows from the driver for its duration.
pub struct JobContext<'a> {
    /// Echo stream (stdout). Errors on it are tolerated.
    pub out: &'a mut Channel,
    /// The printer link.
    pub serial: &'a mut Channel,
    /// API listener, when one is configured.
    pub listener: Option<&'a mut Channel>,
    /// Reader over the engine end of the injection channel.
    pub inject_reader: &'a mut GcodeReader,
    /// Engine end of the injection channel.
    pub inject: &'a mut Channel,
    /// Printer state; the engine is the only writer.
    pub state: &'a SharedPrinterState,
    /// Invoked with each accepted listener connection.
    pub on_connect: &'a mut dyn FnMut(OwnedFd),
    pub config: &'a EngineConfig,
}

/// Per-job throughput counters reported at completion.
#[derive(Debug, Default)]
struct JobStats {
    start_time: i64,
    g28_time: i64,
    errors: u32,
    resends: u32,
    gcodes: u64,
    bytes: u64,
}

fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// Turns a channel's sticky error into a classed job error.
fn ch_err(ch: &Channel, class: ErrorClass) -> JobError {
    let source = match ch.sticky_error() {
        Some(e) => Error::Channel(e),
        None => Error::other(format!("unknown failure on {}", ch.path())),
    };
    JobError::new(class, source)
}

/// (Re-)establishes the printer link and agrees on a line-number origin.
///
/// A hard reconnect closes and reopens the device (connecting if the
/// path is a socket, serial bring-up otherwise) and drains the firmware
/// boot banner. The handshake then writes the wrap-around command until
/// the freshest reply line is an `ok`. Failures on the soft path demote
/// to a hard reconnect; failures on the hard path are final.
fn connect_and_handshake(
    serial: &mut Channel,
    out: &mut Channel,
    config: &EngineConfig,
) -> Result<(), JobError> {
    let mut hard = serial.is_closed() || serial.eof() || serial.has_error();

    loop {
        if hard {
            serial.close();
            serial.clear_error();
            serial.set_action("opening printer device");
            let Some(info) = serial.stat() else {
                return Err(ch_err(serial, ErrorClass::PrinterHard));
            };
            if info.is_socket() {
                serial.connect();
            } else {
                serial.open_tty();
            }
            if serial.has_error() {
                return Err(ch_err(serial, ErrorClass::PrinterHard));
            }
        }

        serial.set_action("connecting to printer");
        serial.set_nonblock(true);

        // Marlin spams a boot banner over a fresh connection; wait for
        // it so the tail read below sees the end of it.
        if hard {
            serial.poll(libc::POLLIN, 3000);
        }

        let mut handshook = false;
        let mut restart_hard = false;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut buffy = [0u8; 2048];
            let got = serial.tail(&mut buffy[..2047], 500, -1);
            if got < 0 {
                if hard {
                    return Err(ch_err(serial, ErrorClass::PrinterHard));
                }
                restart_hard = true;
                break;
            }

            let mut n = got as usize;
            let mut idx = n;
            if n > 0 && buffy[n - 1] == b'\n' {
                idx = n - 1;
            } else {
                buffy[n] = b'\n';
                n += 1;
            }
            // Put idx at the start of the last line.
            while idx > 0 && buffy[idx - 1] != b'\n' {
                idx -= 1;
            }

            if config.verbosity > 1 {
                out.write_all(&buffy[..n]);
            }

            // On the first attempt nothing has been sent yet, so any ok
            // in the backlog is unrelated.
            if attempt > 1
                && buffy[idx] == b'o'
                && buffy.get(idx + 1) == Some(&b'k')
                && buffy.get(idx + 2).is_some_and(|&b| b <= b' ')
            {
                handshook = true;
                break;
            }

            if config.verbosity > 1 {
                if hard {
                    out.write_all(STOP_SD_PRINT_GCODE);
                }
                out.write_all(WRAP_AROUND_STRING);
            }

            if hard {
                serial.write_all(STOP_SD_PRINT_GCODE);
            }
            if serial.write_all(WRAP_AROUND_STRING) != 0 {
                if hard {
                    return Err(ch_err(serial, ErrorClass::PrinterHard));
                }
                restart_hard = true;
                break;
            }

            // Let the firmware settle before looking for its reply.
            sleep_ms(if hard { 1500 } else { 100 });
        }

        if out.is_would_block() {
            // We don't care if we could not echo all of the backlog.
            out.clear_error();
        }
        serial.set_action("");

        if restart_hard {
            hard = true;
            continue;
        }
        if !handshook {
            if hard {
                return Err(JobError::new(
                    ErrorClass::PrinterHard,
                    Error::Protocol(ProtocolError::HandshakeFailed),
                ));
            }
            hard = true;
            continue;
        }

        if hard {
            tracing::info!("Successfully established printer connection");
        }
        return Ok(());
    }
}

/// Streams one source to the printer.
///
/// `infile` is a path, `-` for stdin, or [`DEV_NULL`] to run the loop
/// for injected commands only. Returns how the job ended, or a
/// [`JobError`] whose class tells the driver how to recover.
pub fn run_job(ctx: &mut JobContext, infile: &str) -> Result<JobEnd, JobError> {
    control::reset();

    let dummy = infile == DEV_NULL;
    if !dummy {
        tracing::info!("Started print '{}'", infile);
    }

    connect_and_handshake(ctx.serial, ctx.out, ctx.config)?;
    ctx.state.write().set_status(Status::Idle);

    let mut gcode_serial = GcodeReader::new();
    gcode_serial.set_whitespace_compression(1);

    let mut input_ch = if infile == "-" {
        Channel::from_raw_fd("stdin", 0)
    } else {
        ctx.state.write().set_print_name(infile);
        let mut ch = Channel::new(infile);
        ch.open_read();
        ch
    };

    input_ch.set_nonblock(true);
    if let Some(info) = input_ch.stat() {
        ctx.state.write().set_print_size(info.size);
    }
    if input_ch.has_error() {
        return Err(ch_err(&input_ch, ErrorClass::Source));
    }

    input_ch.set_action("reading source gcode");
    let mut gcode_in = GcodeReader::new();
    // Level 1, not 3: stock CR-10 Marlin requires a space between the
    // command and its parameters.
    gcode_in.set_whitespace_compression(1);
    let mut next_gcode: Option<Line> = None;

    // Echo lines queue here and drain to stdout as it accepts them.
    // The queue has no size limit and just grows if stdout blocks.
    let mut stdoutbuf: Fifo<Line> = Fifo::new();

    let mut marlinbuf = MarlinBuf::new();

    ctx.state.write().set_status(Status::Printing);
    let mut last_ok_time: i64 = 0;
    let mut have_time = false;
    let mut resend_count = 0u32;
    let mut last_error: i64 = 0;
    // 0 means we are not waiting for a lifesign.
    let mut last_lifesign: i64 = 0;
    // Skip exactly one ok, the one accompanying a Resend.
    let mut ignore_ok = false;

    let mut stats = JobStats {
        start_time: millis(),
        ..JobStats::default()
    };

    loop {
        if control::cancel_requested() {
            tracing::info!("Print cancelled");
            return Ok(JobEnd::Cancelled);
        }

        // Block until any descriptor is actionable.
        {
            let mut fds = Vec::with_capacity(5);
            let mut serial_events = libc::POLLIN;
            if marlinbuf.has_next() {
                serial_events |= libc::POLLOUT;
            }
            fds.push(poll_entry(ctx.serial.raw_fd(), serial_events));
            fds.push(poll_entry(ctx.inject.raw_fd(), libc::POLLIN));
            if !ctx.out.has_error() && !stdoutbuf.is_empty() {
                fds.push(poll_entry(ctx.out.raw_fd(), libc::POLLOUT));
            }
            if next_gcode.is_none() && !control::is_paused() {
                fds.push(poll_entry(input_ch.raw_fd(), libc::POLLIN));
            }
            if let Some(listener) = ctx.listener.as_deref() {
                fds.push(poll_entry(listener.raw_fd(), libc::POLLIN));
            }
            poll_fds(&mut fds, -1);
        }

        if control::cancel_requested() {
            tracing::info!("Print cancelled");
            return Ok(JobEnd::Cancelled);
        }

        // Handle all action on the printer link before anything else;
        // communication with the printer is time-sensitive.
        let mut action_on_printer = true;
        while action_on_printer && !control::cancel_requested() {
            action_on_printer = false;

            ctx.serial.set_action("reading printer response");
            ctx.serial.set_nonblock(true);
            while let Some(mut input) = gcode_serial.next(ctx.serial) {
                last_lifesign = millis();
                action_on_printer = true;

                // Reparses after an ok in case something follows it,
                // such as an M105 temperature report.
                loop {
                    let idx = input.starts_with(b"ok\x08");
                    if idx != 0 {
                        if ctx.config.verbosity > 2 {
                            stdoutbuf.put(Line::from_str("ok\n"));
                        }
                        last_ok_time = millis();
                        if ignore_ok {
                            ignore_ok = false;
                        } else {
                            resend_count = 0;
                            last_error = 0;
                            if !marlinbuf.ack() {
                                // Not fatal. The user may be driving the
                                // printer out-of-band and knows best.
                                stdoutbuf.put(Line::from_str(
                                    "WARNING! Spurious 'ok'! Is a user manually controlling the printer?\n",
                                ));
                            }
                        }
                        input.slice_from(idx as i64);
                        if !input.is_empty() {
                            continue;
                        }
                        break;
                    }

                    if input.starts_with(b"T:") != 0 {
                        ctx.state.write().parse_temperature_report(input.data());
                        if ctx.config.verbosity > 1 {
                            stdoutbuf.put(input);
                        }
                        break;
                    }

                    if input.starts_with(b"Error:") != 0 {
                        stats.errors += 1;
                        if last_error == 0 {
                            last_error = millis();
                        }
                        stdoutbuf.put(input);
                        // Give the printer a moment to send follow-on
                        // errors so we don't leave this loop, resume
                        // sending and trigger more of them.
                        sleep_ms(100);
                        break;
                    }

                    let idx = input.starts_with(b"Resend:\x08");
                    if idx != 0 {
                        if last_error == 0 {
                            last_error = millis();
                        }
                        resend_count += 1;
                        stats.resends += 1;
                        input.slice_from(idx as i64);
                        let (line, _) = input.number(10);
                        let target = if !(0..=i32::MAX as i64).contains(&line) {
                            -1
                        } else {
                            line
                        };
                        // Echo the sliced-away prefix, then the rest.
                        stdoutbuf.put(Line::from_str("Resend: "));
                        stdoutbuf.put(input);

                        if !marlinbuf.seek(target) {
                            return Err(JobError::protocol(ProtocolError::IllegalResend));
                        }
                        // The Resend is accompanied by an ok that must
                        // not ack the window.
                        ignore_ok = true;
                        sleep_ms(100);
                        break;
                    }

                    last_error = 0;
                    stdoutbuf.put(input);
                    break;
                }

                if last_error > 0 && millis() - last_error > MAX_TIME_WITH_ERROR {
                    return Err(JobError::protocol(ProtocolError::PersistentErrorState));
                }
            }

            // Refill the pre-fetched line and push whatever fits into
            // the send window. Injected commands always come first.
            loop {
                if next_gcode.is_none() {
                    next_gcode = ctx.inject_reader.next(ctx.inject);
                }
                if next_gcode.is_none() && !control::is_paused() {
                    next_gcode = gcode_in.next(&mut input_ch);
                }

                if !have_time {
                    if gcode_in.estimated_print_time() > 0 {
                        have_time = true;
                        ctx.state
                            .write()
                            .set_estimated_print_time(gcode_in.estimated_print_time());
                    } else {
                        ctx.state
                            .write()
                            .set_printed_bytes(gcode_in.total_bytes_read());
                    }
                }

                let Some(gcode) = next_gcode.as_ref() else {
                    break;
                };
                if (gcode.len() as isize) > marlinbuf.max_append_len() {
                    break;
                }
                if gcode.starts_with(b"G28\x08") != 0 {
                    // Count only what comes after homing so the
                    // throughput figures exclude the wait.
                    stats.g28_time = millis();
                    stats.gcodes = 0;
                    stats.bytes = 0;
                }
                action_on_printer = true;
                marlinbuf.append(gcode.data());
                next_gcode = None;
            }

            // Flush the window to the wire. Blocking mode on purpose:
            // the printer's serial buffer is the flow-control signal.
            ctx.serial.set_action("sending gcode to printer");
            ctx.serial.set_nonblock(false);
            while marlinbuf.has_next() && !ctx.serial.has_error() {
                action_on_printer = true;
                let gcode_to_send = marlinbuf.next().to_vec();
                ctx.serial.write_all(&gcode_to_send);

                stats.gcodes += 1;
                stats.bytes += gcode_to_send.len() as u64;

                if ctx.config.verbosity > 2 {
                    stdoutbuf.put(Line::from_bytes(gcode_to_send));
                }
            }

            let mut state = ctx.state.write();
            if control::is_paused() {
                state.set_status(Status::Paused);
            } else if next_gcode.is_some() && millis() - last_ok_time > STALL_TIME {
                state.set_status(Status::Stalled);
            } else {
                state.set_status(Status::Printing);
            }
        }

        // Hand a pending API connection to a worker.
        if let Some(listener) = ctx.listener.as_deref_mut() {
            if let Some(fd) = listener.accept() {
                (ctx.on_connect)(fd);
            } else if listener.is_would_block() {
                listener.clear_error();
            }
        }

        // Drain the echo queue; a short write re-slices the head line.
        loop {
            if ctx.out.has_error() {
                break;
            }
            let Some(outline) = stdoutbuf.peek_mut() else {
                break;
            };
            let nrest = ctx.out.write_all(outline.data());
            if nrest == 0 {
                stdoutbuf.get();
            } else {
                outline.slice_from(-(nrest as i64));
            }
        }
        if ctx.out.is_would_block() {
            // Try again later; stdout is only for echoing.
            ctx.out.clear_error();
        }

        if resend_count > 3 {
            return Err(JobError::protocol(ProtocolError::TooManyResends));
        }

        if input_ch.has_error() {
            return Err(ch_err(&input_ch, ErrorClass::Source));
        }

        if marlinbuf.needs_ack() {
            if last_lifesign == 0 {
                last_lifesign = millis();
            }
            if millis() - last_lifesign > MAX_TIME_SILENCE {
                return Err(JobError::protocol(ProtocolError::AckTimeout));
            }
        } else {
            last_lifesign = 0;
            if input_ch.eof() && next_gcode.is_none() {
                if !dummy {
                    report_stats(infile, &stats);
                }
                return Ok(JobEnd::SourceDrained);
            }
        }

        if ctx.serial.has_error() {
            return Err(ch_err(ctx.serial, ErrorClass::PrinterSoft));
        }
        if ctx.serial.eof() {
            return Err(JobError::protocol(ProtocolError::ReplyStreamEnded));
        }
    }
}

fn report_stats(infile: &str, stats: &JobStats) {
    let now = millis();
    let mut dt = now;
    let g28 = if stats.g28_time == 0 {
        dt -= stats.start_time;
        now
    } else {
        dt -= stats.g28_time;
        stats.g28_time
    };
    let dt = ((dt + 500) / 1000).max(1);
    tracing::info!(
        "Print:{} Err:{} Resend:{} Time:{}s Post-G28:{}s GCODE/s:{:.1} Transfer:{}bps",
        infile,
        stats.errors,
        stats.resends,
        (now - stats.start_time + 500) / 1000,
        (now - g28 + 500) / 1000,
        stats.gcodes as f64 / dt as f64,
        stats.bytes * 8 / dt as u64,
    );
}
