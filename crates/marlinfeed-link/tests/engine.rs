//! End-to-end engine runs against a scripted Marlin firmware on the far
//! end of a socketpair: checksummed frames, flow control, resend
//! recovery, line-number wraparound and error aborts.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use marlinfeed_core::{shared_state, Error, ErrorClass, JobError, ProtocolError};
use marlinfeed_link::channel::Channel;
use marlinfeed_link::engine::{run_job, EngineConfig, JobContext, JobEnd};
use marlinfeed_link::gcode::GcodeReader;
use marlinfeed_link::window::WRAP_AROUND_STRING;

#[derive(Default)]
struct MockOptions {
    /// Swallow the ok for this line number, once.
    silent_for: Option<i64>,
    /// When receiving this line number the first time, request a resend
    /// of (.1) instead of acknowledging.
    resend_once: Option<(i64, i64)>,
    /// Reply to every frame with an error and keep erroring every
    /// 200 ms afterwards.
    persistent_error: bool,
    /// Acknowledge every frame twice.
    double_ok: bool,
}

/// Received command frames, verified and decoded.
struct MockResult {
    /// Line numbers in receive order, -1 for the wrap-around command.
    numbers: Vec<i64>,
    /// Payloads in receive order (wrap-around excluded).
    payloads: Vec<String>,
}

/// Pretends to be a Marlin firmware: verifies each frame's checksum and
/// line number, acknowledges per the options, and records everything.
fn mock_firmware(stream: UnixStream, opts: MockOptions) -> MockResult {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut peer = stream;
    let mut numbers = Vec::new();
    let mut payloads = Vec::new();
    let mut expected: i64 = 0;
    let mut resend_armed = opts.resend_once.is_some();
    let mut silence_armed = opts.silent_for.is_some();

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let frame = line.trim_end_matches('\n');

        if frame.as_bytes() == &WRAP_AROUND_STRING[..WRAP_AROUND_STRING.len() - 1] {
            // Wrap-around command: during handshake and after N98.
            if !numbers.is_empty() {
                numbers.push(-1);
            }
            expected = 0;
            peer.write_all(b"ok\n").unwrap();
            continue;
        }

        let star = frame.rfind('*').expect("frame without checksum");
        let check: u8 = frame[..star].bytes().fold(0, |chk, b| chk ^ b);
        let sent: u8 = frame[star + 1..].parse().expect("bad checksum digits");
        assert_eq!(check, sent, "checksum mismatch in {:?}", frame);

        assert!(frame.starts_with('N'), "frame without line number: {:?}", frame);
        let digits: String = frame[1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let number: i64 = digits.parse().unwrap();
        let payload = &frame[1 + digits.len()..star];

        if opts.persistent_error {
            numbers.push(number);
            payloads.push(payload.to_string());
            // Keep erroring so the engine notices the budget expiring.
            loop {
                if peer.write_all(b"Error: checksum mismatch\n").is_err() {
                    return MockResult { numbers, payloads };
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }

        if resend_armed {
            let (when, what) = opts.resend_once.unwrap();
            if number == when {
                resend_armed = false;
                numbers.push(number);
                payloads.push(payload.to_string());
                peer.write_all(format!("Resend: {}\nok\n", what).as_bytes())
                    .unwrap();
                expected = what;
                continue;
            }
        }

        assert_eq!(number, expected, "out of order frame {:?}", frame);
        expected = (expected + 1) % 99;
        numbers.push(number);
        payloads.push(payload.to_string());

        if silence_armed && opts.silent_for == Some(number) {
            silence_armed = false;
            continue;
        }

        if opts.double_ok {
            // One write so both lines arrive in the same read on the
            // engine side.
            peer.write_all(b"ok\nok\n").unwrap();
        } else {
            peer.write_all(b"ok\n").unwrap();
        }
    }

    MockResult { numbers, payloads }
}

struct EchoSink {
    collector: std::thread::JoinHandle<Vec<u8>>,
}

/// Runs one job over a socketpair printer with the given source bytes.
/// Returns the job result, what the mock firmware saw, and the echo
/// stream the engine produced.
fn run_scenario(
    source: &[u8],
    opts: MockOptions,
) -> (Result<JobEnd, JobError>, MockResult, Vec<u8>) {
    // The mock may write into a closed socket when a scenario aborts;
    // that must surface as EPIPE, not kill the test process.
    marlinfeed_link::control::install_signal_handlers();

    let mut source_file = tempfile::NamedTempFile::new().unwrap();
    source_file.write_all(source).unwrap();
    let source_path = source_file.into_temp_path();

    let (engine_side, mock_side) = UnixStream::pair().unwrap();
    let mock = std::thread::spawn(move || mock_firmware(mock_side, opts));

    let (echo_side, echo_read) = UnixStream::pair().unwrap();
    let echo = EchoSink {
        collector: std::thread::spawn(move || {
            let mut collected = Vec::new();
            let mut reader = BufReader::new(echo_read);
            let mut buf = [0u8; 4096];
            loop {
                use std::io::Read;
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => collected.extend_from_slice(&buf[..n]),
                }
            }
            collected
        }),
    };

    let mut serial = Channel::from_owned_fd("printer", engine_side.into());
    let mut out = Channel::from_owned_fd("stdout", echo_side.into());
    out.set_nonblock(true);

    let (inject_tx, inject_rx) = UnixStream::pair().unwrap();
    let mut inject_ch = Channel::from_owned_fd("Command Injector", inject_rx.into());
    inject_ch.set_nonblock(true);
    let mut inject_reader = GcodeReader::new();
    inject_reader.set_whitespace_compression(1);

    let state = shared_state();
    let config = EngineConfig { verbosity: 0 };
    let mut on_connect = |_fd: OwnedFd| {};

    let result = {
        let mut ctx = JobContext {
            out: &mut out,
            serial: &mut serial,
            listener: None,
            inject_reader: &mut inject_reader,
            inject: &mut inject_ch,
            state: &state,
            on_connect: &mut on_connect,
            config: &config,
        };
        run_job(&mut ctx, &source_path.to_string_lossy())
    };

    drop(serial); // EOF for the mock
    drop(out); // EOF for the echo collector
    drop(inject_tx);
    let mock_result = mock.join().unwrap();
    let echoed = echo.collector.join().unwrap();
    (result, mock_result, echoed)
}

#[test]
fn simple_stream_is_numbered_and_checksummed() {
    let (result, mock, _echo) = run_scenario(b"G28\nG1 X2 Y3\nM115\n", MockOptions::default());
    assert_eq!(result.unwrap(), JobEnd::SourceDrained);
    assert_eq!(mock.numbers, vec![0, 1, 2]);
    assert_eq!(mock.payloads, vec!["G28", "G1 X2 Y3", "M115"]);
}

#[test]
fn resend_rewinds_the_window() {
    let opts = MockOptions {
        silent_for: Some(1),
        resend_once: Some((2, 1)),
        ..MockOptions::default()
    };
    let (result, mock, echo) = run_scenario(b"G28\nG1 X2 Y3\nM115\n", opts);
    assert_eq!(result.unwrap(), JobEnd::SourceDrained);
    // N1 went unacknowledged, the resend at N2 rewound to it, and both
    // were retransmitted. Nothing was lost or reordered.
    assert_eq!(mock.numbers, vec![0, 1, 2, 1, 2]);
    assert_eq!(mock.payloads[1], mock.payloads[3]);
    assert_eq!(mock.payloads[2], mock.payloads[4]);
    let echoed = String::from_utf8_lossy(&echo);
    assert!(echoed.contains("Resend: "));
}

#[test]
fn line_numbers_wrap_after_98() {
    let mut source = Vec::new();
    for i in 0..120 {
        source.extend_from_slice(format!("G{}\n", i).as_bytes());
    }
    let (result, mock, _echo) = run_scenario(&source, MockOptions::default());
    assert_eq!(result.unwrap(), JobEnd::SourceDrained);

    // 120 commands plus the wrap-around after N98.
    assert_eq!(mock.numbers.len(), 121);
    assert_eq!(mock.numbers[98], 98);
    assert_eq!(mock.numbers[99], -1);
    assert_eq!(mock.numbers[100], 0);
    assert_eq!(mock.payloads.len(), 120);
    assert_eq!(mock.payloads[99], "G99");
    assert_eq!(mock.payloads[119], "G119");
}

#[test]
fn spurious_ok_warns_but_continues() {
    let opts = MockOptions {
        double_ok: true,
        ..MockOptions::default()
    };
    let (result, mock, echo) = run_scenario(b"G28\n", opts);
    assert_eq!(result.unwrap(), JobEnd::SourceDrained);
    assert_eq!(mock.payloads, vec!["G28"]);
    let echoed = String::from_utf8_lossy(&echo);
    assert!(echoed.contains("Spurious 'ok'"));
}

#[test]
fn persistent_errors_abort_the_job() {
    let opts = MockOptions {
        persistent_error: true,
        ..MockOptions::default()
    };
    let (result, _mock, echo) = run_scenario(b"G28\nG1 X2 Y3\n", opts);
    let err = result.unwrap_err();
    assert_eq!(err.class, ErrorClass::PrinterSoft);
    assert!(err.to_string().contains("Persistent error state"));
    assert!(matches!(
        err.source,
        Error::Protocol(ProtocolError::PersistentErrorState)
    ));
    let echoed = String::from_utf8_lossy(&echo);
    assert!(echoed.contains("Error: checksum mismatch"));
}
