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

pub mod fs;
pub mod proc;

pub use nix;
pub use nix::libc;

use nix::sys::signal::Signal;
use nix::unistd::{chdir, chroot, setgid, setgroups, setuid, Gid, Uid};
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

#[macro_export]
macro_rules! env_or_default {
    ($env:expr, $default:expr) => {
        match option_env!($env) {
            Some(value) => value,
            None => $default,
        }
    };
}

pub fn tag_io_err<S: AsRef<str>>(tag: S, err: std::io::Error) -> std::io::Error {
    std::io::Error::new(err.kind(), format!("{}: {err:?}", tag.as_ref()))
}

/// Check if an executable named `name` can be found in the host's `PATH`
pub fn exists_command(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

pub trait LinuxCommandExt {
    /// Change the root directory of the child to `root` before exec. The working directory of the
    /// child is reset to the new root.
    fn chroot(&mut self, root: impl AsRef<Path>) -> &mut Self;

    /// Set the uid from the process before exec, after clone. Unlike the uid() implementation in
    /// std::process::Command, this runs after `chroot` and therefore works for a container root.
    fn cuid(&mut self, uid: u32) -> &mut Self;

    /// Set the gid, and drop all supplementary groups
    fn cgid(&mut self, gid: u32) -> &mut Self;

    fn cwork_dir(&mut self, wd: impl AsRef<Path>) -> &mut Self;

    /// Signal delivered to the child when the launching thread dies
    fn parent_death_signal(&mut self, signal: Signal) -> &mut Self;
}

// pre_exec hooks run in registration order, callers are expected to chroot first, then switch
// working directory, group, and finally user.
macro_rules! command_ext_impl {
    ($tpe:ty) => {
        impl LinuxCommandExt for $tpe {
            fn chroot(&mut self, root: impl AsRef<Path>) -> &mut Self {
                let root: OsString = root.as_ref().as_os_str().to_os_string();
                unsafe {
                    self.pre_exec(move || {
                        chroot(root.as_os_str())?;
                        chdir("/")?;
                        Ok(())
                    });
                }
                self
            }

            fn cuid(&mut self, uid: u32) -> &mut Self {
                unsafe {
                    self.pre_exec(move || {
                        setuid(Uid::from_raw(uid))?;
                        Ok(())
                    });
                }
                self
            }

            fn cgid(&mut self, gid: u32) -> &mut Self {
                unsafe {
                    self.pre_exec(move || {
                        let gid = Gid::from_raw(gid);
                        setgroups(&[gid])?;
                        setgid(gid)?;
                        Ok(())
                    });
                }
                self
            }

            fn cwork_dir(&mut self, wd: impl AsRef<Path>) -> &mut Self {
                let os_str: OsString = wd.as_ref().as_os_str().to_os_string();
                unsafe {
                    self.pre_exec(move || {
                        chdir(os_str.as_os_str())?;
                        Ok(())
                    });
                }
                self
            }

            fn parent_death_signal(&mut self, signal: Signal) -> &mut Self {
                let signo = signal as nix::libc::c_ulong;
                unsafe {
                    self.pre_exec(move || {
                        if nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, signo, 0, 0, 0) == -1 {
                            Err(std::io::Error::last_os_error())?;
                        }
                        Ok(())
                    });
                }
                self
            }
        }
    };
}

command_ext_impl!(Command);

#[cfg(feature = "tokio")]
command_ext_impl!(tokio::process::Command);
