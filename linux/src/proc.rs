// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

//! Host process introspection: signal disposition from `/proc/<pid>/status`, process tree
//! enumeration and listening socket ownership.

use nix::sys::signal::Signal;
use serde::Serialize;
use std::process::{Command, Stdio};
use thiserror::Error;

pub const PGREP_CMD: &str = crate::env_or_default!("PSDOCK_PGREP_CMD", "pgrep");
pub const LSOF_CMD: &str = crate::env_or_default!("PSDOCK_LSOF_CMD", "lsof");

#[derive(Error, Debug)]
pub enum ProcError {
    /// The process exited between lookup and read, this is an expected race
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("malformed process status: {0}")]
    Parse(String),
    #[error("{0} exited with status {1}")]
    Command(&'static str, i32),
    #[error("{0}")]
    Io(std::io::Error),
}

impl ProcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcError::NotFound(_))
    }
}

/// Snapshot of the signal disposition of a process. Never cache it across signals, handlers can
/// be installed or removed at any time.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcStatus {
    pub pid: u32,
    pub name: Option<String>,
    /// Signal numbers with an installed handler, in ascending order
    pub caught: Vec<i32>,
}

impl ProcStatus {
    pub fn from_pid(pid: u32) -> Result<ProcStatus, ProcError> {
        let path = format!("/proc/{pid}/status");
        let content = std::fs::read_to_string(&path).map_err(|err| {
            // ESRCH shows up when the process turns into a zombie while reading
            if err.kind() == std::io::ErrorKind::NotFound
                || err.raw_os_error() == Some(nix::libc::ESRCH)
            {
                ProcError::NotFound(pid)
            } else {
                ProcError::Io(crate::tag_io_err(path, err))
            }
        })?;
        ProcStatus::parse(pid, &content)
    }

    pub fn parse(pid: u32, content: &str) -> Result<ProcStatus, ProcError> {
        let mut name = None;
        let mut caught = None;
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "Name" => name = Some(value.trim().to_string()),
                    "SigCgt" => caught = Some(decode_signal_mask(value.trim())?),
                    _ => continue,
                }
            }
        }
        let caught = caught.ok_or_else(|| ProcError::Parse("missing SigCgt field".to_string()))?;
        Ok(ProcStatus { pid, name, caught })
    }

    pub fn signal_caught(&self, signal: Signal) -> bool {
        self.caught.contains(&(signal as i32))
    }
}

/// Last standard (non real-time) signal number
const LAST_STANDARD_SIGNAL: i32 = 31;

/// Decode a hexadecimal signal mask (most significant nibble first). Bit `p` set means signal
/// `p + 1` is in the set. Only the standard signals 1 to 31 are reported, real-time signal bits
/// are ignored.
pub fn decode_signal_mask(mask: &str) -> Result<Vec<i32>, ProcError> {
    let bits = u64::from_str_radix(mask, 16)
        .map_err(|err| ProcError::Parse(format!("invalid signal mask {mask:?}: {err}")))?;
    Ok((0..LAST_STANDARD_SIGNAL)
        .filter(|position| bits & (1u64 << position) != 0)
        .map(|position| position + 1)
        .collect())
}

fn run_listing(command: &'static str, args: &[&str]) -> Result<Vec<u32>, ProcError> {
    let output = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|err| ProcError::Io(crate::tag_io_err(command, err)))?;

    match output.status.code() {
        Some(0) => {}
        // both pgrep and lsof use 1 for "nothing matched"
        Some(1) => return Ok(Vec::new()),
        code => return Err(ProcError::Command(command, code.unwrap_or(-1))),
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u32>()
                .map_err(|_| ProcError::Parse(format!("unexpected pid {line:?} from {command}")))
        })
        .collect()
}

/// Direct children of `pid`. An empty list is the normal leaf case.
pub fn children(pid: u32) -> Result<Vec<u32>, ProcError> {
    run_listing(PGREP_CMD, &["-P", &pid.to_string()])
}

/// Pids owning a listening socket on `port`. An empty list means the port is not bound yet.
pub fn port_owners(port: u16) -> Result<Vec<u32>, ProcError> {
    let port = format!(":{port}");
    let mut pids = run_listing(LSOF_CMD, &["-t", "-i", &port, "-sTCP:LISTEN"])?;
    pids.dedup();
    Ok(pids)
}

/// Command line of a process, arguments separated by spaces
pub fn cmdline(pid: u32) -> Result<String, ProcError> {
    let bytes = std::fs::read(format!("/proc/{pid}/cmdline")).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ProcError::NotFound(pid)
        } else {
            ProcError::Io(err)
        }
    })?;
    Ok(bytes
        .split(|byte| *byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mask() {
        let signals = decode_signal_mask("fffffffe7ffbfeff").unwrap();
        let mut expected: Vec<i32> = (1..=8).collect();
        expected.extend(10..=18);
        expected.extend(20..=31);
        assert_eq!(signals.len(), 29);
        assert_eq!(signals, expected);

        assert_eq!(
            decode_signal_mask("00000000280b2603").unwrap(),
            vec![1, 2, 10, 11, 14, 17, 18, 20, 28, 30]
        );
        assert!(decode_signal_mask("0000000000000000").unwrap().is_empty());
    }

    #[test]
    fn test_decode_mask_ignores_realtime_signals() {
        assert!(decode_signal_mask("ffffffff80000000").unwrap().is_empty());
        assert_eq!(decode_signal_mask("0000000180000004").unwrap(), vec![3]);
    }

    #[test]
    fn test_decode_mask_rejects_garbage() {
        assert!(matches!(
            decode_signal_mask("not-hex"),
            Err(ProcError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_status() {
        let content = "Name:\tnc\nUmask:\t0022\nState:\tS (sleeping)\nPid:\t42\n\
                       SigQ:\t0/63448\nSigPnd:\t0000000000000000\nShdPnd:\t0000000000000000\n\
                       SigBlk:\t0000000000000000\nSigIgn:\t0000000000001000\n\
                       SigCgt:\t0000000000004002\n";
        let status = ProcStatus::parse(42, content).unwrap();
        assert_eq!(status.pid, 42);
        assert_eq!(status.name.as_deref(), Some("nc"));
        assert_eq!(status.caught, vec![2, 15]);
        assert!(status.signal_caught(Signal::SIGINT));
        assert!(status.signal_caught(Signal::SIGTERM));
        assert!(!status.signal_caught(Signal::SIGKILL));
    }

    #[test]
    fn test_parse_status_without_mask() {
        assert!(matches!(
            ProcStatus::parse(1, "Name:\tinit\n"),
            Err(ProcError::Parse(_))
        ));
    }

    #[test]
    fn test_status_of_live_process() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut status = ProcStatus::from_pid(child.id()).unwrap();
        for _ in 0..100 {
            if status.name.as_deref() == Some("sleep") {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            status = ProcStatus::from_pid(child.id()).unwrap();
        }
        _ = child.kill();
        _ = child.wait();
        assert_eq!(status.pid, child.id());
        assert_eq!(status.name.as_deref(), Some("sleep"));
    }

    #[test]
    fn test_status_of_missing_process() {
        let err = ProcStatus::from_pid(u32::MAX - 1).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_leaf_process_has_no_children() {
        if !crate::exists_command(PGREP_CMD) {
            return;
        }
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let children = children(child.id());
        _ = child.kill();
        _ = child.wait();
        assert!(children.unwrap().is_empty());
    }

    #[test]
    fn test_cmdline() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        // the child may not have exec'd yet
        let mut line = String::new();
        for _ in 0..100 {
            line = cmdline(child.id()).unwrap();
            if line == "sleep 5" {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        _ = child.kill();
        _ = child.wait();
        assert_eq!(line, "sleep 5");
    }
}
