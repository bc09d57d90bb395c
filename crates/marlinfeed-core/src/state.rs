//! Derived printer status shared between the engine and API workers.
//!
//! The engine is the only writer. API workers take the read side of the
//! lock and serialize a consistent snapshot into the Octoprint JSON
//! shapes.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;

use crate::clock::millis;
use crate::scan::{is_space, parse_f64};

/// Printer status as derived by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Marlinfeed is not currently sync'ed with the printer.
    #[default]
    Disconnected,
    /// Commands are flowing from a source to the printer.
    Printing,
    /// Sync'ed with the printer but no active source.
    Idle,
    /// A command is waiting because the printer buffer has been full
    /// for a while.
    Stalled,
    /// Paused by the user.
    Paused,
}

/// One temperature channel as reported in the Octoprint status JSON.
#[derive(Debug, Clone, Copy, Serialize)]
struct TempPoint {
    actual: f64,
    target: f64,
    offset: i32,
}

/// Snapshot of everything Marlinfeed knows about the printer and the
/// current job.
#[derive(Debug)]
pub struct PrinterState {
    status: Status,
    /// tool[t][0] is the actual temperature of hotend t, tool[t][1] the target.
    tool: [[f64; 2]; 2],
    /// bed[0] actual, bed[1] target.
    bed: [f64; 2],
    start_time: i64,
    end_time: i64,
    pause_start: i64,
    paused_accum: i64,
    print_name: String,
    print_size: i64,
    printed_bytes: i64,
}

impl Default for PrinterState {
    fn default() -> Self {
        let mut state = PrinterState {
            status: Status::Disconnected,
            tool: [[0.0; 2]; 2],
            bed: [0.0; 2],
            start_time: 0,
            end_time: 0,
            pause_start: 0,
            paused_accum: 0,
            print_name: String::new(),
            print_size: 0,
            printed_bytes: 0,
        };
        state.clear_job();
        state
    }
}

impl PrinterState {
    /// Forgets everything about the current job. Temperatures are kept.
    pub fn clear_job(&mut self) {
        self.start_time = 0;
        self.end_time = 0;
        self.pause_start = 0;
        self.paused_accum = 0;
        self.print_name = "None".to_string();
        self.print_size = 0;
        self.printed_bytes = 0;
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Changes the status, maintaining job and pause accounting.
    ///
    /// Leaving the active statuses (Printing/Stalled/Paused) clears the
    /// job. Entering Printing from a non-active status starts the job
    /// clock. Entering and leaving Paused maintains the accumulated
    /// pause time.
    pub fn set_status(&mut self, status: Status) {
        let was_active = matches!(
            self.status,
            Status::Printing | Status::Stalled | Status::Paused
        );
        if !matches!(status, Status::Printing | Status::Stalled | Status::Paused) {
            self.clear_job();
        }
        if status == Status::Printing && !was_active {
            self.start_time = millis();
        }
        if status == Status::Paused && self.status != Status::Paused {
            self.pause_start = millis();
        }
        if self.status == Status::Paused && status != Status::Paused {
            self.paused_accum += millis() - self.pause_start;
            self.pause_start = 0;
        }
        self.status = status;
    }

    pub fn set_print_name(&mut self, name: &str) {
        self.print_name = name.to_string();
    }

    pub fn set_print_size(&mut self, bytes: i64) {
        self.print_size = bytes;
    }

    pub fn set_printed_bytes(&mut self, bytes: i64) {
        self.printed_bytes = bytes;
    }

    /// Fixes the expected end of the job from a slicer estimate.
    pub fn set_estimated_print_time(&mut self, seconds: i64) {
        if seconds > 0 {
            self.end_time = self.start_time + seconds * 1000;
        }
    }

    /// Elapsed print time in milliseconds, frozen while paused and with
    /// accumulated pauses subtracted.
    fn elapsed(&self) -> i64 {
        if self.start_time == 0 {
            return 0;
        }
        let delta = if self.pause_start > 0 {
            self.pause_start - self.start_time
        } else {
            millis() - self.start_time
        };
        delta - self.paused_accum
    }

    /// Job completion in percent.
    ///
    /// Prefers the slicer time estimate when one was seen, falls back to
    /// the bytes-consumed ratio, else 0.
    fn completion(&self) -> f64 {
        if self.start_time > 0 && self.end_time > self.start_time {
            100.0 * self.elapsed() as f64 / (self.end_time - self.start_time) as f64
        } else if self.print_size > 0 {
            100.0 * self.printed_bytes as f64 / self.print_size as f64
        } else {
            0.0
        }
    }

    /// Updates temperatures from a Marlin temperature report.
    ///
    /// Recognizes `T:`, `T0:`, `T1:` and `B:` followed by a number and an
    /// optional `/target`. Unknown keys (`@:`, `W:`, ...) are skipped by
    /// advancing past their `:`.
    pub fn parse_temperature_report(&mut self, report: &[u8]) {
        #[derive(Clone, Copy)]
        enum Target {
            Tool(usize),
            Bed,
        }

        let b = report;
        let mut p = 0;
        let mut target: Option<Target> = None;
        let mut idx = 0;
        while p < b.len() {
            if b[p] == b'T' && b.get(p + 1) == Some(&b':') {
                p += 2;
                target = Some(Target::Tool(0));
                idx = 0;
            } else if b[p] == b'T' && b.get(p + 1) == Some(&b'0') && b.get(p + 2) == Some(&b':') {
                p += 3;
                target = Some(Target::Tool(0));
                idx = 0;
            } else if b[p] == b'T' && b.get(p + 1) == Some(&b'1') && b.get(p + 2) == Some(&b':') {
                p += 3;
                target = Some(Target::Tool(1));
                idx = 0;
            } else if b[p] == b'B' && b.get(p + 1) == Some(&b':') {
                p += 2;
                target = Some(Target::Bed);
                idx = 0;
            } else if b[p] == b'/' {
                idx = 1;
                p += 1;
            } else {
                while p < b.len() && b[p] != b':' {
                    p += 1;
                }
                if p < b.len() {
                    p += 1;
                }
                target = None;
            }

            let (value, consumed) = parse_f64(&b[p..]);
            p += consumed;
            while p < b.len() && is_space(b[p]) {
                p += 1;
            }

            match target {
                Some(Target::Tool(t)) => self.tool[t][idx] = value,
                Some(Target::Bed) => self.bed[idx] = value,
                None => {}
            }
        }
    }

    /// Octoprint `/api/job` response body.
    pub fn job_json(&self) -> String {
        let text = match self.status {
            Status::Printing | Status::Stalled => "Printing",
            Status::Paused => "Paused",
            _ => "Operational",
        };
        let name_only = match self.print_name.rfind('/') {
            Some(i) => &self.print_name[i + 1..],
            None => &self.print_name,
        };
        let value = json!({
            "state": text,
            "job": {
                "file": {
                    "name": name_only
                }
            },
            "progress": {
                "printTime": self.elapsed() as f64 / 1000.0,
                "printTimeLeft": null,
                "completion": self.completion()
            }
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }

    /// Octoprint `/api/printer` response body.
    pub fn to_json(&self) -> String {
        let text = match self.status {
            Status::Printing => "Printing",
            Status::Stalled => "Stalled",
            Status::Paused => "Paused",
            _ => "Operational",
        };
        let tool0 = TempPoint {
            actual: self.tool[0][0],
            target: self.tool[0][1],
            offset: 0,
        };
        let tool1 = TempPoint {
            actual: self.tool[1][0],
            target: self.tool[1][1],
            offset: 0,
        };
        let bed = TempPoint {
            actual: self.bed[0],
            target: self.bed[1],
            offset: 0,
        };
        let value = json!({
            "sd": {
                "ready": false
            },
            "state": {
                "text": text,
                "flags": {
                    "operational": true,
                    "paused": self.status == Status::Paused,
                    "printing": matches!(self.status, Status::Printing | Status::Stalled),
                    "cancelling": false,
                    "pausing": false,
                    "sdReady": false,
                    "error": false,
                    "ready": true,
                    "closedOrError": false
                }
            },
            "temperature": {
                "tool0": tool0,
                "tool1": tool1,
                "bed": bed
            }
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Handle shared between the engine (writer) and API workers (readers).
pub type SharedPrinterState = Arc<RwLock<PrinterState>>;

/// Creates a fresh shared state in the Disconnected status.
pub fn shared_state() -> SharedPrinterState {
    Arc::new(RwLock::new(PrinterState::default()))
}
