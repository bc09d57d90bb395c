//! Behavior of the normalizing G-Code reader against real files and
//! sockets.

use std::io::Write;
use std::os::unix::net::UnixStream;

use marlinfeed_link::channel::Channel;
use marlinfeed_link::gcode::GcodeReader;

fn file_channel(content: &[u8]) -> (tempfile::TempPath, Channel) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    let path = file.into_temp_path();
    let mut ch = Channel::new(path.to_string_lossy().into_owned());
    assert!(ch.open_read());
    (path, ch)
}

#[test]
fn compression_levels_and_preserved_comments() {
    let content = b" G 2 8 ; This is a comment\nG1  X2   Y3\n   \n;  keep   me\nTAIL";
    let (_path, mut ch) = file_channel(content);

    let mut reader = GcodeReader::new();
    reader.set_comment_char(b'\n'); // preserve comments

    // Level 3 (default): all whitespace goes, the comment stays.
    assert!(reader.has_next(&mut ch));
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"G28;Thisisacomment");

    reader.set_whitespace_compression(2);
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"G1X2Y3\n");
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"\n");

    reader.set_whitespace_compression(1);
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"; keep me\n");

    // The final line has no terminator and is delivered as-is at EOF.
    reader.set_whitespace_compression(0);
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"TAIL");
    assert!(reader.next(&mut ch).is_none());
    assert!(!reader.has_next(&mut ch));
}

#[test]
fn comment_stripping_and_time_estimate() {
    let content = b"G28 ; home first\n;TIME:3600\nG1 X2 Y3\n  \nM115\n";
    let (_path, mut ch) = file_channel(content);

    let mut reader = GcodeReader::new(); // level 3, ';' comments
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"G28");
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"G1X2Y3");
    assert_eq!(reader.estimated_print_time(), 3600);
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"M115");
    assert!(reader.next(&mut ch).is_none());
    assert_eq!(reader.total_bytes_read(), content.len() as i64);
}

#[test]
fn unbelievable_time_estimates_are_ignored() {
    let content = b";TIME:0\n;TIME:9999999\nG28\n";
    let (_path, mut ch) = file_channel(content);
    let mut reader = GcodeReader::new();
    assert_eq!(reader.next(&mut ch).unwrap().data(), b"G28");
    assert_eq!(reader.estimated_print_time(), 0);
}

#[test]
fn overlong_line_is_split_without_terminator() {
    let mut content = vec![b'X'; 2000];
    content.push(b'\n');
    content.extend_from_slice(b"G28\n");
    let (_path, mut ch) = file_channel(&content);

    let mut reader = GcodeReader::new();
    reader.set_whitespace_compression(0);
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.len(), 1024);
    assert!(!line.data().ends_with(b"\n"));
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.len(), 977); // remaining 976 X plus newline
    assert!(line.data().ends_with(b"\n"));
    let line = reader.next(&mut ch).unwrap();
    assert_eq!(line.data(), b"G28\n");
}

#[test]
fn level3_output_is_idempotent() {
    let content = b"  G28 ; home\n\tG1 X2\t Y3 ;; move\n\n   M115\n";
    let (_path, mut ch) = file_channel(content);
    let mut reader = GcodeReader::new();

    let mut first_pass = Vec::new();
    while let Some(line) = reader.next(&mut ch) {
        first_pass.push(line.data().to_vec());
    }

    let mut rejoined = Vec::new();
    for line in &first_pass {
        rejoined.extend_from_slice(line);
        rejoined.push(b'\n');
    }
    let (_path2, mut ch2) = file_channel(&rejoined);
    let mut reader2 = GcodeReader::new();
    let mut second_pass = Vec::new();
    while let Some(line) = reader2.next(&mut ch2) {
        second_pass.push(line.data().to_vec());
    }

    assert_eq!(first_pass, second_pass);
}

#[test]
fn would_block_is_cleared_transparently() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mut ch = Channel::from_owned_fd("pair", ours.into());
    ch.set_nonblock(true);

    let mut reader = GcodeReader::new();
    assert!(!reader.has_next(&mut ch));
    assert!(!ch.has_error());

    (&theirs).write_all(b"G28\n").unwrap();
    assert!(reader.has_next(&mut ch));
    assert_eq!(reader.next(&mut ch).unwrap().data(), b"G28");
}

#[test]
fn discard_and_raw_drain_the_buffer() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mut ch = Channel::from_owned_fd("pair", ours.into());
    ch.set_nonblock(true);
    let mut reader = GcodeReader::new();
    reader.set_whitespace_compression(0);

    (&theirs).write_all(b"HEAD\r\n\r\nBODY").unwrap();
    assert_eq!(reader.next(&mut ch).unwrap().data(), b"HEAD\r\n");
    assert_eq!(reader.next(&mut ch).unwrap().data(), b"\r\n");

    // What is left in the buffer comes out verbatim through raw().
    let mut buf = [0u8; 16];
    let n = reader.raw(&mut buf);
    assert_eq!(&buf[..n], b"BODY");
    assert_eq!(reader.raw(&mut buf), 0);

    (&theirs).write_all(b"junk...").unwrap();
    assert!(!reader.has_next(&mut ch));
    assert!(reader.discard() > 0);
    assert!(!reader.has_next(&mut ch));
}
