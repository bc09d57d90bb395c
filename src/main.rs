use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use marlinfeed::api::{self, ApiContext};
use marlinfeed::{init_logging, EngineConfig, ErrorClass, Fifo, JobContext};
use marlinfeed_core::{shared_state, Status};
use marlinfeed_link::channel::{create_dir, Channel};
use marlinfeed_link::engine::{run_job, DEV_NULL};
use marlinfeed_link::gcode::GcodeReader;
use marlinfeed_link::{control, DirScanner};

/// Reads all infiles in order and sends the contained G-Code to the
/// printer device, which must speak Marlin's serial port protocol.
///
/// The printer device can be either a TTY or a Unix domain socket. Pass
/// `-` as an infile to read from stdin. A directory infile is watched
/// for new or modified G-Code files, which are printed automatically;
/// files older than the time Marlinfeed started are never printed. With
/// no `--api` and no infile, `-` is assumed. Communication is echoed to
/// stdout.
///
/// Marlinfeed offers no access control beyond `--localhost`; to expose
/// it on a network, front it with a reverse proxy that handles TLS and
/// authentication.
#[derive(Parser, Debug)]
#[command(name = "marlinfeed", version, about, verbatim_doc_comment)]
struct Args {
    /// Increase verbosity. Can be used multiple times. At level 4+
    /// erroneous API requests are written to /tmp.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Listen for incoming connections with an Octoprint compatible API
    /// that clients will access as <BASE_URL>/api. If --port is not
    /// given and <BASE_URL> contains a port, that port is used.
    #[arg(long = "api", value_name = "BASE_URL")]
    api: Option<String>,

    /// Port to listen on for API connections. Defaults to 8080 unless
    /// derived from <BASE_URL>.
    #[arg(short = 'p', long = "port", value_name = "NUM")]
    port: Option<i64>,

    /// Limit API connections to the machine Marlinfeed runs on. Most
    /// useful combined with a reverse proxy that implements access
    /// control.
    #[arg(long = "localhost")]
    localhost: bool,

    /// How to handle an error on an infile or the printer device:
    /// 'next' reinitializes the printer connection and prints the next
    /// infile, 'quit' terminates. Defaults to 'quit' without --api and
    /// 'next' with it.
    #[arg(short = 'e', long = "ioerror", value_name = "next|quit")]
    ioerror: Option<IoErrorPolicy>,

    /// G-Code files, `-` for stdin, or directories to watch; the last
    /// argument is the printer device.
    #[arg(value_name = "PATH", required = true)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum IoErrorPolicy {
    Next,
    Quit,
}

fn fatal(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

/// Port embedded in a base URL like `https://my-printer:443/`, if any.
fn port_from_url(url: &str) -> Option<i64> {
    let after_scheme = url.find(":/").map(|i| i + 2).unwrap_or(0);
    let rest = &url[after_scheme..];
    let colon = rest.find(':')?;
    let digits: String = rest[colon + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;
    control::install_signal_handlers();

    let mut port: i64 = 8080;
    if let Some(base_url) = &args.api {
        if let Some(embedded) = port_from_url(base_url) {
            port = embedded;
        }
        if let Some(explicit) = args.port {
            port = explicit;
        }
        if !(10..=65535).contains(&port) {
            fatal(format!("Illegal port specified: {}", port));
        }
    } else if args.localhost || args.port.is_some() {
        fatal("--localhost and --port don't work without --api!");
    }

    let Some((printdev, infiles)) = args.paths.split_last() else {
        fatal("You must provide a path to your printer device!");
    };

    let mut infile_queue: Fifo<PathBuf> = Fifo::new();
    let mut dir_scanner = DirScanner::new();
    // Baseline scan so only files newer than startup get printed.
    dir_scanner.refill(&mut infile_queue);

    let mut upload_dir: Option<PathBuf> = None;
    for infile in infiles {
        if infile == "-" {
            infile_queue.put(PathBuf::from(infile));
            continue;
        }
        match std::fs::metadata(infile) {
            Ok(meta) if meta.is_dir() => {
                dir_scanner.add_dir(infile, false);
                if upload_dir.is_none() {
                    upload_dir = Some(PathBuf::from(infile));
                }
            }
            Ok(_) => infile_queue.put(PathBuf::from(infile)),
            Err(_) => fatal(format!("Don't understand this argument: {}", infile)),
        }
    }

    let mut listener: Option<Channel> = None;
    if let Some(base_url) = &args.api {
        let host = if args.localhost { "localhost" } else { "" };
        let mut sock = Channel::new(format!("{}:{}", host, port));
        sock.set_action("listening on");
        sock.listen();
        sock.set_nonblock(true);
        if sock.has_error() {
            fatal(sock.error_message());
        }
        sock.set_action("accepting connections on");

        if upload_dir.is_none() {
            match create_dir("/tmp/marlinfeed-????", 0o700) {
                Some(dir) => {
                    dir_scanner.add_dir(&dir, false);
                    upload_dir = Some(PathBuf::from(dir));
                }
                None => fatal("Cannot create temporary upload directory under /tmp"),
            }
        }

        if let Some(upload) = &upload_dir {
            println!(
                "Listening on port {}. Uploading to {}. API base: {}",
                port,
                upload.display(),
                base_url
            );
        }
        listener = Some(sock);
    } else if infiles.is_empty() {
        // No API and nothing to print: read stdin.
        infile_queue.put(PathBuf::from("-"));
    }

    let ioerror_next = match args.ioerror {
        Some(IoErrorPolicy::Next) => true,
        Some(IoErrorPolicy::Quit) => false,
        None => listener.is_some(),
    };

    // The injection channel: API workers write G-Code to one end, the
    // engine reads lines from the other. The local write end stays open
    // for the process lifetime so the engine side never sees EOF.
    let (inject_tx, engine_end) = UnixStream::pair()?;
    let mut inject_ch = Channel::from_owned_fd("Command Injector", engine_end.into());
    inject_ch.set_nonblock(true);
    let mut inject_reader = GcodeReader::new();
    inject_reader.set_whitespace_compression(1);

    let state = shared_state();

    let api_ctx = match (&args.api, &upload_dir) {
        (Some(base_url), Some(upload)) => Some(Arc::new(ApiContext {
            upload_dir: upload.clone(),
            base_url: base_url.clone(),
            state: Arc::clone(&state),
            inject: Mutex::new(inject_tx.try_clone()?),
            verbosity: args.verbose,
        })),
        _ => None,
    };

    let mut on_connect = {
        let api_ctx = api_ctx.clone();
        move |fd: OwnedFd| {
            let Some(ctx) = api_ctx.clone() else {
                return;
            };
            debug!("New socket connection => handled by worker thread");
            std::thread::spawn(move || api::handle_connection(fd, ctx));
        }
    };

    let mut out = Channel::from_raw_fd("stdout", 1);
    out.set_nonblock(true);
    // Errors on stdout never end the program; it only carries echo.

    let mut serial = Channel::new(printdev.clone());
    let config = EngineConfig {
        verbosity: args.verbose,
    };

    let mut hard_error_count: u32 = 0;

    loop {
        // Done with all infiles and no chance of more coming in?
        let listening = listener.as_ref().map(|l| !l.has_error()).unwrap_or(false);
        if infile_queue.is_empty() && !listening && dir_scanner.is_empty() {
            break;
        }

        if infile_queue.is_empty() {
            if let Some(sock) = listener.as_mut() {
                sock.poll(libc::POLLIN, 250);
                if let Some(fd) = sock.accept() {
                    on_connect(fd);
                } else if sock.is_would_block() {
                    sock.clear_error();
                }
            }

            dir_scanner.refill(&mut infile_queue);
            // Only files with a known G-Code extension get printed.
            infile_queue.retain(|p| p.extension().map(|e| e == "gcode").unwrap_or(false));

            if infile_queue.is_empty() && !inject_reader.has_next(&mut inject_ch) {
                std::thread::sleep(Duration::from_millis(250));
                continue;
            }
        }

        // An empty queue here means injected commands are waiting; run
        // the loop against a source that is pure EOF.
        let infile = infile_queue
            .get()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEV_NULL.to_string());

        let result = {
            let mut ctx = JobContext {
                out: &mut out,
                serial: &mut serial,
                listener: listener.as_mut(),
                inject_reader: &mut inject_reader,
                inject: &mut inject_ch,
                state: &state,
                on_connect: &mut on_connect,
                config: &config,
            };
            run_job(&mut ctx, &infile)
        };

        match result {
            Ok(end) => {
                hard_error_count = 0;
                debug!("Job '{}' ended: {:?}", infile, end);
                state.write().set_status(Status::Idle);
            }
            Err(job_err) => {
                error!("{}", job_err);
                if !ioerror_next {
                    std::process::exit(1);
                }
                match job_err.class {
                    ErrorClass::PrinterHard | ErrorClass::PrinterSoft => {
                        serial.close();
                        state.write().set_status(Status::Disconnected);
                        if job_err.class == ErrorClass::PrinterHard {
                            // E.g. USB unplugged; give re-enumeration a
                            // chance before trying again.
                            hard_error_count = (hard_error_count + 1).min(4);
                            warn!(
                                "Suspending operation for {}s in hopes hard error will disappear",
                                5 * hard_error_count
                            );
                            std::thread::sleep(Duration::from_secs(5 * hard_error_count as u64));
                        }
                    }
                    _ => {
                        state.write().set_status(Status::Idle);
                    }
                }
            }
        }
    }

    info!("All sources drained");
    Ok(())
}
