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
pub mod console;
pub mod term;

pub use console::Console;

use nix::fcntl::{open, OFlag};
use nix::libc::{ioctl, TIOCNOTTY, TIOCSCTTY};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, setsid};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use tokio::process::Command as TokioCommand;

/// Both ends of a freshly allocated pseudo-terminal
#[derive(Debug)]
pub struct Pty {
    pub primary: OwnedFd,
    pub replica: OwnedFd,
    pub replica_path: String,
}

/// Allocate a new pseudo-terminal pair. Both descriptors are close-on-exec, the replica is
/// installed as stdio of the child by [`TokioPtyCommandExt::pty`].
pub fn open_pty() -> nix::Result<Pty> {
    let primary = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)?;
    grantpt(&primary)?;
    unlockpt(&primary)?;
    let replica_path = ptsname_r(&primary)?;
    let replica = open(
        replica_path.as_str(),
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    Ok(Pty {
        primary: unsafe { OwnedFd::from_raw_fd(primary.into_raw_fd()) },
        replica: unsafe { OwnedFd::from_raw_fd(replica) },
        replica_path,
    })
}

pub trait TokioPtyCommandExt {
    /// Detach the child process from controlling terminal, attach to the replica side of the pty
    /// and use it as controlling terminal
    fn pty(&mut self, pty: &Pty) -> &mut TokioCommand;
}

impl TokioPtyCommandExt for TokioCommand {
    fn pty(&mut self, pty: &Pty) -> &mut TokioCommand {
        let primary = pty.primary.as_raw_fd();
        let replica = pty.replica.as_raw_fd();
        unsafe {
            self.pre_exec(move || {
                if let Ok(fd) = open("/dev/tty", OFlag::O_RDWR, Mode::empty()) {
                    ioctl(fd, TIOCNOTTY);
                    _ = close(fd);
                }
                setsid()?;
                if ioctl(replica, TIOCSCTTY, 0) == -1 {
                    Err(std::io::Error::last_os_error())?;
                }
                close(primary)?;
                dup2(replica, 0)?;
                dup2(replica, 1)?;
                dup2(replica, 2)?;
                close(replica)?;
                Ok(())
            });
        }
        self
    }
}
