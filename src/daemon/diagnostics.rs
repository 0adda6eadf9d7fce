//! Human-readable report about a daemon on the failure path.
//!
//! Rendering must never fail: every piece that cannot be gathered is
//! replaced with a placeholder so the report always says something.

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::daemon::info::DaemonInfo;
use crate::daemon::parameters::DaemonParameters;

/// How many trailing log lines the report includes.
const LOG_TAIL_LINES: usize = 50;

pub struct DaemonDiagnostics<'a> {
    daemon: &'a DaemonInfo,
    parameters: &'a DaemonParameters,
}

impl<'a> DaemonDiagnostics<'a> {
    pub fn new(daemon: &'a DaemonInfo, parameters: &'a DaemonParameters) -> Self {
        Self { daemon, parameters }
    }

    pub fn describe(&self) -> String {
        let mut report = String::new();
        report.push_str("--- daemon diagnostics ---\n");
        report.push_str(&format!(
            "daemon: {} (pid {}, {})\n",
            self.daemon.id,
            self.daemon.pid,
            process_status(self.daemon.pid)
        ));
        report.push_str(&format!(
            "endpoint: {} (registered {}, {})\n",
            self.daemon.socket_path.display(),
            self.daemon.registered_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.daemon.state.label()
        ));

        let log_path = self.parameters.daemon_log_path(&self.daemon.id);
        report.push_str(&format!(
            "last {} lines of {}:\n",
            LOG_TAIL_LINES,
            log_path.display()
        ));
        match read_log_tail(&log_path, LOG_TAIL_LINES) {
            Ok(lines) if lines.is_empty() => report.push_str("  <daemon log is empty>\n"),
            Ok(lines) => {
                for line in lines {
                    report.push_str("  ");
                    report.push_str(&line);
                    report.push('\n');
                }
            }
            Err(e) => report.push_str(&format!("  <could not read daemon log: {}>\n", e)),
        }
        report
    }
}

/// Whether the pid looks alive, where the platform lets us peek.
pub fn process_alive(pid: u32) -> Option<bool> {
    #[cfg(target_os = "linux")]
    {
        Some(Path::new(&format!("/proc/{}", pid)).exists())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

fn process_status(pid: u32) -> &'static str {
    match process_alive(pid) {
        Some(true) => "alive",
        Some(false) => "dead",
        None => "status unknown",
    }
}

/// Read the last `lines` lines of a log file.
fn read_log_tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let all_lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;

    let start = all_lines.len().saturating_sub(lines);
    Ok(all_lines[start..].to_vec())
}
