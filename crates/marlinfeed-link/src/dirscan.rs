//! Watches directories for freshly written G-Code files.
//!
//! Each scan picks up regular files whose modification time falls into
//! the just-elapsed interval. A file is only reported once it has not
//! been modified for [`MIN_AGE_MS`], so a file a slicer is still
//! uploading is not printed half-written.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use marlinfeed_core::Fifo;

/// Minimum milliseconds since the last modification before a file is
/// considered ripe for printing.
pub const MIN_AGE_MS: i64 = 2000;

struct WatchDir {
    path: PathBuf,
    /// One-shot directories are scanned once and then dropped.
    once: bool,
}

/// Periodically scans watched directories and reports ripe files.
pub struct DirScanner {
    dirs: Fifo<WatchDir>,
    /// Files found during a scan that have not aged past [`MIN_AGE_MS`]
    /// yet.
    candidates: Fifo<PathBuf>,
    last_scan: i64,
}

/// Modification time in nanoseconds since the epoch, truncated to whole
/// seconds. The nanosecond part is deliberately discarded: filesystems
/// have been observed to stamp mtimes that lag the realtime clock, which
/// made files written in the same second as a scan fall before it and
/// get lost.
fn mtime_nanos(meta: &fs::Metadata) -> i64 {
    let secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs as i64 * 1_000_000_000
}

fn now_nanos() -> i64 {
    let secs = std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs as i64 * 1_000_000_000
}

impl DirScanner {
    pub fn new() -> Self {
        DirScanner {
            dirs: Fifo::new(),
            candidates: Fifo::new(),
            last_scan: 0,
        }
    }

    /// Adds `path` to the list of directories to scan. A one-shot
    /// directory is scanned on the next refill only; otherwise it is
    /// watched until the scanner is dropped. Empty paths are ignored.
    pub fn add_dir(&mut self, path: impl AsRef<Path>, once: bool) {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return;
        }
        self.dirs.put(WatchDir {
            path: path.to_path_buf(),
            once,
        });
    }

    /// True if there is no chance of [`DirScanner::refill`] ever
    /// producing more entries. False does not guarantee it will.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.dirs.is_empty()
    }

    /// True iff `path` can be statted and was last modified at least
    /// [`MIN_AGE_MS`] before now.
    fn ripe(path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) => mtime_nanos(&meta) + 1_000_000 * MIN_AGE_MS <= now_nanos(),
            Err(_) => false,
        }
    }

    /// Scans all directories for files modified since the last scan and
    /// adds them to the candidate list.
    fn scan(&mut self) {
        let last = self.last_scan;
        self.last_scan = now_nanos();
        // Scans within the same second would rediscover the same files.
        if last == self.last_scan {
            return;
        }
        let cur = self.last_scan;

        for _ in 0..self.dirs.len() {
            let Some(dir) = self.dirs.get() else { break };

            match fs::read_dir(&dir.path) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        // Follows symlinks; a linked file counts.
                        let Ok(meta) = fs::metadata(entry.path()) else {
                            continue;
                        };
                        if !meta.is_file() {
                            continue;
                        }
                        let ftim = mtime_nanos(&meta);
                        if ftim < last || ftim >= cur {
                            continue;
                        }
                        let fpath = entry.path();
                        if !self.candidates.iter().any(|c| *c == fpath) {
                            self.candidates.put(fpath);
                        }
                    }
                    if !dir.once {
                        self.dirs.put(dir);
                    }
                }
                Err(e) => {
                    tracing::warn!("{}: {}", dir.path.display(), e);
                    // An unreadable directory is dropped like a one-shot.
                }
            }
        }
    }

    /// Moves ripe files from the watched directories into `files`.
    pub fn refill(&mut self, files: &mut Fifo<PathBuf>) {
        self.scan();

        for _ in 0..self.candidates.len() {
            let Some(candidate) = self.candidates.get() else {
                break;
            };
            if Self::ripe(&candidate) {
                files.put(candidate);
            } else {
                self.candidates.put(candidate);
            }
        }
    }

    #[cfg(test)]
    fn force_last_scan(&mut self, nanos: i64) {
        self.last_scan = nanos;
    }
}

impl Default for DirScanner {
    fn default() -> Self {
        DirScanner::new()
    }
}
