//! Octoprint-compatible API worker.
//!
//! Each accepted connection is served by a short-lived worker that
//! parses exactly one HTTP request and replies. Workers see a read-only
//! snapshot of the printer state and talk back to the engine only
//! through the injection channel and the pause/cancel flags, so a
//! malformed request can never corrupt the printer link.
//!
//! Only the routes enumerated here exist; everything else is 404.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use marlinfeed_core::SharedPrinterState;
use marlinfeed_link::channel::{create_file, Channel};
use marlinfeed_link::control;
use marlinfeed_link::gcode::{GcodeReader, Line};

/// Bodies at or above this size are not interpreted, only drained.
const MAX_BODY: i64 = 65536;

const VERSION_JSON: &str = "{\r\n  \"api\": \"0.1\",\r\n  \"server\": \"1.0.0\",\r\n  \"text\": \"Marlinfeed 1.0.0\"\r\n}\r\n";

const SETTINGS_JSON: &str = "{\r\n  \"feature\":\r\n  {\r\n    \"sdSupport\": false\r\n  },\r\n  \"webcam\":\r\n  {\r\n    \"webcamEnabled\": false,\r\n    \"streamUrl\": \"\"\r\n  }\r\n}\r\n";

const LOGIN_JSON: &str = "{\r\n  \"_is_external_client\": false,\r\n  \"active\": true,\r\n  \"admin\": true,\r\n  \"apikey\": null,\r\n  \"groups\": [\"admins\",\"users\"],\r\n  \"name\": \"_api\"\r\n}\r\n";

const CREATED_JSON: &str = "{\r\n  \"done\": true,\r\n  \"files\": {\r\n    \"local\": {\r\n      \"origin\": \"local\",\r\n      \"refs\": {\r\n      }\r\n    }\r\n  }\r\n}\r\n";

#[derive(Clone, Copy)]
enum HttpCode {
    Ok,
    NotFound,
    Created,
    NoContent,
}

impl HttpCode {
    fn num(self) -> u16 {
        match self {
            HttpCode::Ok => 200,
            HttpCode::NotFound => 404,
            HttpCode::Created => 201,
            HttpCode::NoContent => 204,
        }
    }

    fn desc(self) -> &'static str {
        match self {
            HttpCode::Ok => "OK",
            HttpCode::NotFound => "Not Found",
            HttpCode::Created => "Created",
            HttpCode::NoContent => "No Content",
        }
    }
}

/// Everything a worker needs, shared across all workers.
pub struct ApiContext {
    /// Where uploads land; the directory the scanner watches.
    pub upload_dir: PathBuf,
    /// The base URL clients use, for the Location header.
    pub base_url: String,
    /// Read-only view of the printer state.
    pub state: SharedPrinterState,
    /// Write end of the injection channel.
    pub inject: Mutex<UnixStream>,
    pub verbosity: u8,
}

fn respond(
    client: &mut Channel,
    code: HttpCode,
    extra_headers: &str,
    content_type: &str,
    body: &[u8],
) {
    let head = format!(
        "HTTP/1.1 {} {}\r\n{}Cache-Control: no-store\r\nContent-Length: {}\r\nContent-Type: {}\r\n\r\n",
        code.num(),
        code.desc(),
        extra_headers,
        body.len(),
        content_type,
    );
    client.write_all(head.as_bytes());
    client.write_all(body);
}

/// Consumes header lines up to the blank line ending them, returning the
/// announced Content-Length (0 if none).
fn wait_empty_line(reader: &mut GcodeReader, client: &mut Channel) -> i64 {
    let mut contentlength = 0;
    loop {
        let Some(line) = reader.next(client) else {
            break;
        };
        if line.is_empty() {
            break;
        }
        trace!("{}", line.text().trim_end());
        let first = line.data()[0];
        if first == b'\n' || (first == b'\r' && line.data().get(1) == Some(&b'\n')) {
            break;
        }
        let idx = line.starts_with(b"Content-Length:\x08");
        if idx > 0 {
            let mut value = line;
            value.slice_from(idx as i64);
            contentlength = value.number(10).0;
        }
    }
    contentlength
}

/// Reads the request body into a buffer, combining what the reader has
/// already buffered with a timed read from the client. Returns `None`
/// for absent or oversize bodies (the oversize case is left unread; the
/// connection is closed right after anyway).
fn read_body(reader: &mut GcodeReader, client: &mut Channel, contentlength: i64) -> Option<Vec<u8>> {
    if contentlength <= 0 || contentlength >= MAX_BODY {
        return None;
    }
    let mut buf = vec![0u8; contentlength as usize];
    let buffered = reader.raw(&mut buf);
    let got = client.read(&mut buf[buffered..], 200, 2000);
    if got < 0 {
        return None;
    }
    buf.truncate(buffered + got as usize);
    Some(buf)
}

fn http_json(client: &mut Channel, reader: &mut GcodeReader, code: HttpCode, json: &str) {
    let mut len = wait_empty_line(reader, client);
    len -= reader.discard() as i64;
    if len > 0 && len < MAX_BODY {
        let mut buf = vec![0u8; len as usize];
        client.read(&mut buf, 1000, -1);
    }
    respond(client, code, "", "application/json", json.as_bytes());
    debug!("Replied {} {}", code.num(), code.desc());
}

fn http_error(
    message: &str,
    ctx: &ApiContext,
    client: &mut Channel,
    reader: &mut GcodeReader,
    code: HttpCode,
) {
    let len = wait_empty_line(reader, client);
    if len < MAX_BODY {
        if let Some(body) = read_body(reader, client, len) {
            if ctx.verbosity > 3 {
                if let Some(fname) = create_file("/tmp/raw-request-????", 0o600) {
                    let mut dump = Channel::new(fname.clone());
                    dump.open_write();
                    dump.write_all(&body);
                    dump.close();
                    warn!("Dumped erroneous request body to {}", fname);
                }
            }
        }
    }

    let content = format!(
        "<!DOCTYPE html><html><head><title>Error</title></head><body><h1>Unsupported Request: {}</h1></body></html>",
        message
    );
    respond(client, code, "", "text/html", content.as_bytes());
    warn!("Unsupported request: {}", message);
}

/// Translates evil filename characters to `_`. Bytes above 127 are kept
/// so UTF-8 names survive.
fn sanitize(name: &str) -> String {
    let bytes: Vec<u8> = name
        .bytes()
        .map(|b| {
            if b > 127 || b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'+' | b'.' | b',') {
                b
            } else {
                b'_'
            }
        })
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// `POST /api/files/local`: stores a multipart upload in the watch
/// directory under a unique temporary name, then renames it to the
/// sanitized upload filename.
fn upload(ctx: &ApiContext, client: &mut Channel, reader: &mut GcodeReader) {
    // The payload must pass through byte-exact.
    reader.set_whitespace_compression(0);
    reader.set_comment_char(b'\n');
    let contentlength = wait_empty_line(reader, client);
    let mut contentread: i64 = 0;

    let mut boundary: Option<Line> = None;
    let mut fname: Option<String> = None;
    let mut file_line: Option<Vec<u8>> = None;
    let mut finished_fname: Option<String> = None;
    let mut wait_for_file_start = false;

    let template = format!("{}/upload-????", ctx.upload_dir.display());
    let Some(tempname) = create_file(&template, 0o644) else {
        error!("Cannot create upload temporary below {}", ctx.upload_dir.display());
        respond(client, HttpCode::NotFound, "", "text/html", b"upload failed");
        return;
    };
    let mut tmp = Channel::new(tempname.clone());

    while reader.has_next(client) {
        let Some(line) = reader.next(client) else {
            break;
        };
        contentread += line.len() as i64;

        let boundary_len = boundary
            .as_ref()
            .map(|b| line.starts_with(b.data()))
            .unwrap_or(0);

        if boundary.is_none() && line.starts_with(b"--") != 0 {
            trace!("{}", line.text().trim_end());
            boundary = Some(line);
        } else if boundary_len != 0 && line.len() == boundary_len {
            trace!("{}", line.text().trim_end());
            if let Some(last) = file_line.take() {
                // The newline terminating the last payload line belongs
                // to the boundary delimiter, not to the file.
                let keep = last
                    .strip_suffix(b"\r\n")
                    .or_else(|| last.strip_suffix(b"\n"))
                    .unwrap_or(&last);
                if !keep.is_empty() {
                    tmp.write_all(keep);
                }

                let finished = sanitize(fname.as_deref().unwrap_or("upload"));
                let newpath = ctx.upload_dir.join(&finished);
                debug!("Renaming temporary file '{}' => '{}'", tempname, newpath.display());
                tmp.close();
                if let Err(e) = std::fs::rename(&tempname, &newpath) {
                    error!("Error renaming {}: {}", tempname, e);
                }
                fname = None;
                finished_fname = Some(finished);
                break;
            }
        } else if fname.is_some() {
            if wait_for_file_start {
                trace!("{}", line.text().trim_end());
                wait_for_file_start =
                    !(line.data().first() == Some(&b'\r') && line.data().get(1) == Some(&b'\n'));
            } else {
                if let Some(prev) = &file_line {
                    tmp.write_all(prev);
                } else {
                    debug!("Storing upload data in temporary file '{}'", tempname);
                    tmp.open_write();
                }
                file_line = Some(line.data().to_vec());
            }
        } else if finished_fname.is_none()
            && line.starts_with(b"Content-Disposition:\x08form-data\x08") != 0
        {
            trace!("{}", line.text().trim_end());
            fname = line.get_string("filename", None);
            wait_for_file_start = fname.is_some();
        } else {
            trace!("{}", line.text().trim_end());
        }
    }

    if !tmp.is_closed() {
        error!("Premature end of upload data");
    }

    let Some(finished) = finished_fname else {
        respond(client, HttpCode::NotFound, "", "text/html", b"incomplete upload");
        return;
    };

    // Drain the remainder of the multipart data.
    contentread += reader.discard() as i64;
    let remainder = contentlength - contentread;
    if remainder > 0 && remainder < MAX_BODY {
        let mut buf = vec![0u8; remainder as usize];
        client.read_with_budgets(&mut buf, 200, 2000, 200);
    }

    let location = format!("Location: {}/api/files/local/{}\r\n", ctx.base_url, finished);
    respond(
        client,
        HttpCode::Created,
        &location,
        "application/json",
        CREATED_JSON.as_bytes(),
    );
    info!("Upload complete: {}", finished);
}

/// `POST /api/files/local/<name>` with a body selecting `"print"`:
/// refreshes the file's mtime so the directory scanner picks it up.
fn touch_file(ctx: &ApiContext, request: &mut Line, client: &mut Channel, reader: &mut GcodeReader) {
    let contentlength = wait_empty_line(reader, client);
    if let Some(body) = read_body(reader, client, contentlength) {
        request.slice_from("files/local/".len() as i64);
        if let Some(space) = request.data().iter().position(|&b| b == b' ') {
            request.slice(0, space as i64);

            if contains(&body, b"\"print\"") {
                let finished = sanitize(&request.text());
                let fpath = ctx.upload_dir.join(&finished);
                let is_file = std::fs::metadata(&fpath).map(|m| m.is_file()).unwrap_or(false);
                if is_file {
                    touch(&fpath);
                    info!("Print requested for {}", fpath.display());
                    respond(client, HttpCode::NoContent, "", "text/html", b"");
                    return;
                }
            }
        }
    }

    let content =
        "<!DOCTYPE html><html><head><title>Error</title></head><body><h1>Touch Error</h1></body></html>";
    respond(client, HttpCode::NotFound, "", "text/html", content.as_bytes());
}

fn touch(path: &std::path::Path) {
    use std::os::unix::ffi::OsStrExt;
    if let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) {
        unsafe { libc::utime(cpath.as_ptr(), std::ptr::null()) };
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && (0..=haystack.len() - needle.len()).any(|i| &haystack[i..i + needle.len()] == needle)
}

/// `POST /api/printer/command`: extracts the `"commands"` array from the
/// body and writes the commands, newline separated, to the injection
/// channel.
fn inject(ctx: &ApiContext, client: &mut Channel, reader: &mut GcodeReader) {
    let contentlength = wait_empty_line(reader, client);
    if let Some(body) = read_body(reader, client, contentlength) {
        let commands = find(&body, b"\"commands\"")
            .and_then(|i| find(&body[i..], b"[").map(|j| i + j + 1));
        if let Some(start) = commands {
            let mut block = Vec::new();
            let mut complete = false;
            let mut in_string = false;
            for &b in &body[start..] {
                match b {
                    b']' if !in_string => {
                        complete = true;
                        break;
                    }
                    b'"' => {
                        in_string = !in_string;
                        block.push(b'\n');
                    }
                    b',' if !in_string => block.push(b' '),
                    _ => block.push(b),
                }
            }

            if complete {
                block.push(b'\n');
                debug!("Injecting \"{}\"", String::from_utf8_lossy(&block).trim());
                use std::io::Write;
                if let Err(e) = ctx.inject.lock().write_all(&block) {
                    error!("Error writing to injection channel: {}", e);
                }
                respond(client, HttpCode::NoContent, "", "text/html", b"");
                return;
            }
        }
    }

    let content =
        "<!DOCTYPE html><html><head><title>Error</title></head><body><h1>Inject Error</h1></body></html>";
    respond(client, HttpCode::NotFound, "", "text/html", content.as_bytes());
}

/// `POST /api/job`: pause/resume/cancel the running job.
fn job_command(ctx: &ApiContext, client: &mut Channel, reader: &mut GcodeReader) {
    reader.set_whitespace_compression(0);
    reader.set_comment_char(b'\n');
    let contentlength = wait_empty_line(reader, client);

    let mut known = false;
    if let Some(body) = read_body(reader, client, contentlength) {
        let line = Line::from_bytes(body);
        match line.get_string("\"command\"", None).as_deref() {
            Some("pause") => {
                known = true;
                match line.get_string("\"action\"", None).as_deref() {
                    Some("pause") => control::set_paused(true),
                    Some("resume") => control::set_paused(false),
                    _ => control::toggle_pause(),
                }
                info!("Pause toggled via API");
            }
            Some("cancel") => {
                known = true;
                control::request_cancel();
                info!("Cancel requested via API");
            }
            _ => {}
        }
    }

    if known {
        // The engine reads the flags at its next iteration; an empty
        // injection line wakes its poll so that happens now, not at the
        // next printer event.
        use std::io::Write;
        let _ = ctx.inject.lock().write_all(b"\n");
        respond(client, HttpCode::NoContent, "", "text/html", b"");
        return;
    }

    let content =
        "<!DOCTYPE html><html><head><title>Error</title></head><body><h1>Unsupported Job Action</h1></body></html>";
    respond(client, HttpCode::NotFound, "", "text/html", content.as_bytes());
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Serves exactly one request on the accepted connection, then returns.
pub fn handle_connection(fd: OwnedFd, ctx: Arc<ApiContext>) {
    let mut client = Channel::from_owned_fd("API request", fd);
    let mut reader = GcodeReader::new();
    reader.set_whitespace_compression(1);

    let Some(mut request) = reader.next(&mut client) else {
        return;
    };
    debug!("{}", request.text().trim_end());

    let idx = request.starts_with(b"get\x08") + request.starts_with(b"GET\x08");
    if idx > 0 {
        request.slice_from(idx as i64);
        if request.starts_with(b"/plugin/appkeys/probe\x08") != 0 {
            return http_error(
                "/plugin/appkeys/probe",
                &ctx,
                &mut client,
                &mut reader,
                HttpCode::NotFound,
            );
        }
        if request.starts_with(b"/api/") != 0 {
            request.slice_from(5);
            if request.starts_with(b"version\x08") != 0 {
                return http_json(&mut client, &mut reader, HttpCode::Ok, VERSION_JSON);
            } else if request.starts_with(b"settings\x08") != 0 {
                return http_json(&mut client, &mut reader, HttpCode::Ok, SETTINGS_JSON);
            } else if request.starts_with(b"printer\x08") != 0 {
                let json = ctx.state.read().to_json();
                return http_json(&mut client, &mut reader, HttpCode::Ok, &json);
            } else if request.starts_with(b"job\x08") != 0 {
                let json = ctx.state.read().job_json();
                return http_json(&mut client, &mut reader, HttpCode::Ok, &json);
            } else if request.starts_with(b"printerprofiles\x08") != 0 {
                return http_error(
                    "/api/printerprofiles",
                    &ctx,
                    &mut client,
                    &mut reader,
                    HttpCode::NotFound,
                );
            }
        }
    } else {
        let idx = request.starts_with(b"post\x08") + request.starts_with(b"POST\x08");
        if idx > 0 {
            request.slice_from(idx as i64);
            if request.starts_with(b"/api/") != 0 {
                request.slice_from(5);
                if request.starts_with(b"login\x08") != 0 {
                    return http_json(&mut client, &mut reader, HttpCode::Ok, LOGIN_JSON);
                } else if request.starts_with(b"job\x08") != 0 {
                    return job_command(&ctx, &mut client, &mut reader);
                } else if request.starts_with(b"files/local/") != 0 {
                    return touch_file(&ctx, &mut request, &mut client, &mut reader);
                } else if request.starts_with(b"files/local\x08") != 0 {
                    return upload(&ctx, &mut client, &mut reader);
                } else if request.starts_with(b"printer/command\x08") != 0 {
                    return inject(&ctx, &mut client, &mut reader);
                }
            }
        }
    }

    let message = request.text().into_owned();
    http_error(&message, &ctx, &mut client, &mut reader, HttpCode::NotFound);
}
