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

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

pub const MODPROBE_CMD: &str = crate::env_or_default!("PSDOCK_MODPROBE_CMD", "modprobe");
pub const FILESYSTEMS_PATH: &str = "/proc/filesystems";

#[derive(Error, Debug)]
pub enum MountError {
    #[error("Mount point does not exist: {0}")]
    MountPointNotFound(String),
    #[error("Mount point is not a directory (or file in the case of bind mount)")]
    InvalidMountPointType,
    #[error("Mount point and source are not the same type")]
    MountPointTypeMismatch,
    #[error("{0} is not a mount point")]
    NotMounted(String),
    #[error("{0}")]
    Sys(Errno),
}

/// Mount a filesystem of type `tpe` from `source` to a given `mount_point`
///
/// # Parameters
/// * tpe: Type of the filesystem
/// * source: Source of the filesystem
/// * mount_point: Targetted mountpoint of this mount operation
/// * options: filesystem specific data, joined with ","
pub fn mount<S: AsRef<str>>(
    tpe: impl AsRef<str>,
    source: impl AsRef<str>,
    mount_point: impl AsRef<Path>,
    options: impl AsRef<[S]>,
) -> Result<(), MountError> {
    let mount_point = mount_point.as_ref();
    if !mount_point.exists() {
        return Err(MountError::MountPointNotFound(
            mount_point.to_string_lossy().to_string(),
        ));
    }
    if !mount_point.is_dir() {
        return Err(MountError::InvalidMountPointType);
    }

    let options = options
        .as_ref()
        .iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",");

    debug!(
        "mount -t {} -o {options} {} {mount_point:?}",
        tpe.as_ref(),
        source.as_ref()
    );
    nix::mount::mount(
        Some(source.as_ref()),
        mount_point,
        Some(tpe.as_ref()),
        MsFlags::empty(),
        if options.is_empty() {
            None
        } else {
            Some(options.as_str())
        },
    )
    .map_err(MountError::Sys)
}

/// Bind mount `source` onto `mount_point`, recursively. Read only bind mounts need a second
/// remount pass, the kernel ignores MS_RDONLY on the initial bind.
pub fn bind_mount(
    source: impl AsRef<Path>,
    mount_point: impl AsRef<Path>,
    read_only: bool,
) -> Result<(), MountError> {
    let source = source.as_ref();
    let mount_point = mount_point.as_ref();

    let source_type = std::fs::metadata(source)
        .map_err(|_| MountError::MountPointNotFound(source.to_string_lossy().to_string()))?
        .file_type();
    let mount_type = std::fs::metadata(mount_point)
        .map_err(|_| MountError::MountPointNotFound(mount_point.to_string_lossy().to_string()))?
        .file_type();

    if source_type.is_dir() != mount_type.is_dir() {
        return Err(MountError::MountPointTypeMismatch);
    } else if !mount_type.is_dir() && !mount_type.is_file() {
        return Err(MountError::InvalidMountPointType);
    }

    debug!("bind mount {source:?} -> {mount_point:?} (ro: {read_only})");
    nix::mount::mount(
        Some(source),
        mount_point,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(MountError::Sys)?;

    if read_only {
        nix::mount::mount(
            None::<&str>,
            mount_point,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(MountError::Sys)?;
    }
    Ok(())
}

/// Unmount filesystem at a given mountpoint
pub fn umount(mountpoint: impl AsRef<Path>) -> Result<(), MountError> {
    let mp = mountpoint.as_ref();
    match nix::mount::umount2(mp, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(Errno::ENOENT) => Err(MountError::MountPointNotFound(
            mp.to_string_lossy().to_string(),
        )),
        Err(Errno::EINVAL) => Err(MountError::NotMounted(mp.to_string_lossy().to_string())),
        Err(errno) => Err(MountError::Sys(errno)),
    }
}

fn unescape_mountinfo(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Check if `path` is currently a mount point in the mount namespace of this process
pub fn is_mount_point(path: impl AsRef<Path>) -> Result<bool, std::io::Error> {
    let Ok(path) = path.as_ref().canonicalize() else {
        return Ok(false);
    };
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(|err| crate::tag_io_err("/proc/self/mountinfo", err))?;
    Ok(mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mount_point| Path::new(&unescape_mountinfo(mount_point)) == path))
}

/// Best effort attempt to load a kernel module, failures are ignored since the module may be
/// built into the kernel or the tool may be missing.
pub fn load_kernel_module(name: &str) {
    let status = Command::new(MODPROBE_CMD)
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    debug!("{MODPROBE_CMD} {name}: {status:?}");
}

/// Check if the running kernel lists `fs_type` as a registered `nodev` filesystem
pub fn supports_filesystem(fs_type: &str) -> Result<bool, std::io::Error> {
    let content = std::fs::read_to_string(FILESYSTEMS_PATH)
        .map_err(|err| crate::tag_io_err(FILESYSTEMS_PATH, err))?;
    Ok(lists_nodev_filesystem(&content, fs_type))
}

/// Given the content of `/proc/filesystems`, check if `fs_type` appears as a `nodev` entry
pub fn lists_nodev_filesystem(filesystems: &str, fs_type: &str) -> bool {
    filesystems.lines().any(|line| {
        let mut columns = line.split('\t');
        columns.next() == Some("nodev") && columns.next().map(str::trim) == Some(fs_type)
    })
}
