//! Byte channel semantics: sticky errors, timed reads, tail reads,
//! partial writes and the template-based file creation.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use marlinfeed_link::channel::{create_dir, create_file, Channel};

fn pair() -> (Channel, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    (Channel::from_owned_fd("pair", ours.into()), theirs)
}

#[test]
fn errors_stick_until_cleared() {
    let mut ch = Channel::new("/nonexistent/definitely/not/here");
    ch.set_action("opening");
    assert!(!ch.has_error());
    assert_eq!(ch.error_message(), "");

    assert!(!ch.open_read());
    assert!(ch.has_error());
    assert!(ch
        .error_message()
        .starts_with("Error opening /nonexistent/definitely/not/here: "));

    // Further operations are no-ops while the error is pending.
    assert_eq!(ch.write_all(b"xyz"), 3);
    let mut buf = [0u8; 4];
    assert_eq!(ch.read(&mut buf, 0, 0), -1);

    ch.clear_error();
    assert!(!ch.has_error());
    assert_eq!(ch.error_message(), "");
    assert!(!ch.eof());
}

#[test]
fn nonblocking_short_write_reports_rest() {
    let (mut ch, theirs) = pair();
    assert!(ch.set_nonblock(true));

    // Far more than any socket buffer will take.
    let block = vec![0x55u8; 8 * 1024 * 1024];
    let rest = ch.write_all(&block);
    assert!(rest > 0);
    assert!(rest < block.len());
    assert!(ch.has_error());
    assert!(ch.is_would_block());
    ch.clear_error();
    drop(theirs);
}

#[test]
fn read_budgets_and_eof() {
    let (mut ch, theirs) = pair();
    let mut buf = [0u8; 64];

    // Nothing there: a bounded read reports would-block...
    assert_eq!(ch.read(&mut buf, 0, 200), -1);
    assert!(ch.is_would_block());
    ch.clear_error();

    // ...and a tail read reports emptiness without an error.
    assert_eq!(ch.tail(&mut buf, 0, 200), 0);
    assert!(!ch.has_error());

    // max_time 0 polls regardless of the blocking mode.
    assert_eq!(ch.read(&mut buf, 0, 0), -1);
    assert!(ch.is_would_block());
    ch.clear_error();

    (&theirs).write_all(b"abc").unwrap();
    assert_eq!(ch.read(&mut buf, 0, 1000), 3);
    assert_eq!(&buf[..3], b"abc");

    drop(theirs);
    assert_eq!(ch.read(&mut buf, 0, 1000), 0);
    assert!(ch.eof());
    assert!(!ch.has_error());
}

#[test]
fn tail_keeps_the_freshest_bytes() {
    let (mut ch, theirs) = pair();

    let writer = std::thread::spawn(move || {
        let chunks: [&[u8]; 3] = [b"abcdef", b"ghijkl", b"mnopqr"];
        for chunk in chunks {
            (&theirs).write_all(chunk).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }
        theirs
    });

    let mut buf = [0u8; 4];
    // Idle budget far beyond the write cadence: collects everything,
    // keeps only the last four bytes.
    let n = ch.tail(&mut buf, 500, 2000);
    assert_eq!(n, 4);
    assert_eq!(&buf, b"opqr");

    drop(writer.join().unwrap());
}

#[test]
fn write_resumes_after_reader_catches_up() {
    let (mut ch, mut theirs) = pair();
    ch.set_nonblock(true);
    let block = vec![1u8; 4 * 1024 * 1024];
    let rest = ch.write_all(&block);
    assert!(rest > 0);
    ch.clear_error();

    // Drain everything on the peer side in parallel, then finish the
    // write in blocking mode.
    let drainer = std::thread::spawn(move || {
        let mut sink = vec![0u8; 4 * 1024 * 1024];
        let mut total = 0;
        while total < block.len() {
            match theirs.read(&mut sink) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        total
    });

    ch.set_nonblock(false);
    let unwritten = ch.write_all(&vec![1u8; rest]);
    assert_eq!(unwritten, 0);
    assert!(!ch.has_error());
    ch.close();
    assert_eq!(drainer.join().unwrap(), 4 * 1024 * 1024);
}

#[test]
fn stat_classifies_targets() {
    let dir = tempfile::tempdir().unwrap();
    let fpath = dir.path().join("f");
    std::fs::write(&fpath, b"12345").unwrap();

    let mut ch = Channel::new(fpath.to_string_lossy().into_owned());
    let info = ch.stat().unwrap();
    assert!(info.is_regular());
    assert!(!info.is_socket());
    assert_eq!(info.size, 5);

    let mut missing = Channel::new(dir.path().join("gone").to_string_lossy().into_owned());
    assert!(missing.stat().is_none());
    assert!(missing.has_error());

    let sock_path = dir.path().join("sock");
    let _listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();
    let mut sock = Channel::new(sock_path.to_string_lossy().into_owned());
    assert!(sock.stat().unwrap().is_socket());
}

#[test]
fn unix_listener_accepts_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("api.sock");
    let mut listener = Channel::new(path.to_string_lossy().into_owned());
    assert!(listener.listen());
    listener.set_nonblock(true);

    // Nothing pending: would-block, cleared like the engine does.
    assert!(listener.accept().is_none());
    assert!(listener.is_would_block());
    listener.clear_error();

    let client = UnixStream::connect(&path).unwrap();
    let accepted = listener.accept();
    assert!(accepted.is_some());
    drop(client);
}

#[test]
fn template_counters_pick_free_names() {
    let dir = tempfile::tempdir().unwrap();
    let template = format!("{}/upload-??", dir.path().display());

    let first = create_file(&template, 0o644).unwrap();
    assert!(first.ends_with("upload-00"));
    let second = create_file(&template, 0o644).unwrap();
    assert!(second.ends_with("upload-01"));

    let dtemplate = format!("{}/work-?", dir.path().display());
    let created = create_dir(&dtemplate, 0o700).unwrap();
    assert!(created.ends_with("work-0"));
    assert!(std::fs::metadata(&created).unwrap().is_dir());

    // Without wildcards there is exactly one candidate name.
    let fixed = format!("{}/fixed", dir.path().display());
    assert!(create_file(&fixed, 0o644).is_some());
    assert!(create_file(&fixed, 0o644).is_none());
}

#[test]
fn template_exhaustion_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let template = format!("{}/x-?", dir.path().display());
    for i in 0..10 {
        std::fs::write(dir.path().join(format!("x-{}", i)), b"").unwrap();
    }
    assert!(create_file(&template, 0o644).is_none());
}
