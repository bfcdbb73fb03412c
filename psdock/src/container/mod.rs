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

//! The contract of the runtime creating the isolated environment and launching the process in
//! it. [`HostRuntime`] is the implementation used by the `psdock` binary.

mod error;
mod host;

pub use error::ContainerError;
pub use host::{HostContainer, HostRuntime};

use crate::config::BindMount;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use pty_process::Console;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::debug;

pub const ID_PREFIX: &str = "psdock_";
pub const PID_POLL_DELAY: Duration = Duration::from_millis(100);
pub const PID_POLL_ATTEMPTS: usize = 50;

/// `psdock_` followed by 7 random alphanumeric characters
pub fn generate_id() -> String {
    let suffix = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect::<String>();
    format!("{ID_PREFIX}{suffix}")
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub rootfs: PathBuf,
    pub hostname: String,
    pub bind_mounts: Vec<BindMount>,
    pub state_root: PathBuf,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub user: String,
    pub cwd: Option<String>,
    /// Allocate a pseudo-terminal as the controlling terminal of the process
    pub console: bool,
}

pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

pub enum ProcessIo {
    Console(Console),
    Pipes {
        stdout: ProcessOutput,
        stderr: ProcessOutput,
    },
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessIo::Console(console) => f.debug_tuple("Console").field(console).finish(),
            ProcessIo::Pipes { .. } => f.write_str("Pipes"),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    /// Shell convention, a process killed by signal `n` reports `128 + n`
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + signal,
        }
    }

    pub fn killed_by(&self, signal: Signal) -> bool {
        *self == ExitStatus::Signaled(signal as i32)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => ExitStatus::Signaled(signal),
            None => ExitStatus::Exited(status.code().unwrap_or(-1)),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    /// Host pid of the supervised process, not available before start or after exit
    pub init_pid: Option<u32>,
}

#[async_trait]
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&self, spec: &ProcessSpec) -> Result<ProcessIo, ContainerError>;

    async fn signal(&self, signal: Signal) -> Result<(), ContainerError>;

    /// Wait for the process to exit, can only be called once
    async fn wait(&self) -> Result<ExitStatus, ContainerError>;

    async fn state(&self) -> Result<ContainerState, ContainerError>;

    async fn destroy(&self) -> Result<(), ContainerError>;
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<Arc<dyn Container>, ContainerError>;
}

/// Host pid of the supervised process, polling while the runtime does not know it yet. `None`
/// after `attempts` polls, the process most likely exited.
pub async fn poll_init_pid(
    container: &dyn Container,
    delay: Duration,
    attempts: usize,
) -> Option<u32> {
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
        }
        match container.state().await {
            Ok(ContainerState {
                init_pid: Some(pid),
                ..
            }) => return Some(pid),
            Ok(_) => continue,
            Err(err) => debug!("cannot get state of {}: {err}", container.id()),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert!(id.starts_with(ID_PREFIX));
        assert_eq!(id.len(), ID_PREFIX.len() + 7);
        assert!(id[ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(ExitStatus::Exited(3).code(), 3);
        assert_eq!(ExitStatus::Signaled(9).code(), 137);
        assert!(ExitStatus::Signaled(9).killed_by(Signal::SIGKILL));
        assert!(!ExitStatus::Exited(137).killed_by(Signal::SIGKILL));
    }

    #[test]
    fn test_exit_status_conversion() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 4"])
            .status()
            .unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Exited(4));

        let status = std::process::Command::new("sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Signaled(9));
    }
}
