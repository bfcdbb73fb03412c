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

//! Assemble a writable rootfs out of an immutable image with a union mount.
//!
//! The driver is picked from a fixed priority list, the first one whose kernel support probe
//! succeeds wins.

mod aufs;
mod overlay;

pub use aufs::Aufs;
pub use overlay::Overlay;

use linux::fs::MountError;
use serde::Serialize;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RootfsError {
    #[error("no rootfs driver supported, tried {0:?}")]
    NoDriverSupported(Vec<DriverKind>),
    #[error("cannot mount {0}: {1}")]
    Mount(&'static str, MountError),
    #[error("cannot unmount {0:?}: {1}")]
    Unmount(PathBuf, MountError),
    #[error("{0:?}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Overlay,
    Aufs,
}

impl DriverKind {
    /// Drivers in the order they are tried
    pub const PRIORITY: [DriverKind; 2] = [DriverKind::Overlay, DriverKind::Aufs];

    pub fn fs_type(&self) -> &'static str {
        match self {
            DriverKind::Overlay => "overlay",
            DriverKind::Aufs => "aufs",
        }
    }
}

pub trait FilesystemProbe {
    fn supports(&self, kind: DriverKind) -> bool;
}

/// Load the kernel module of the filesystem (best effort) then look it up in `/proc/filesystems`
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelProbe;

impl FilesystemProbe for KernelProbe {
    fn supports(&self, kind: DriverKind) -> bool {
        linux::fs::load_kernel_module(kind.fs_type());
        match linux::fs::supports_filesystem(kind.fs_type()) {
            Ok(supported) => supported,
            Err(error) => {
                warn!("cannot probe {} support: {error}", kind.fs_type());
                false
            }
        }
    }
}

pub fn select_driver(probe: &impl FilesystemProbe) -> Result<DriverKind, RootfsError> {
    DriverKind::PRIORITY
        .into_iter()
        .find(|kind| {
            let supported = probe.supports(*kind);
            debug!("{} supported: {supported}", kind.fs_type());
            supported
        })
        .ok_or_else(|| RootfsError::NoDriverSupported(DriverKind::PRIORITY.to_vec()))
}

#[derive(Debug, Clone)]
pub enum RootfsDriver {
    Overlay(Overlay),
    Aufs(Aufs),
}

impl RootfsDriver {
    pub fn new(image: impl AsRef<Path>, rootfs: impl AsRef<Path>) -> Result<Self, RootfsError> {
        Self::with_probe(image, rootfs, &KernelProbe)
    }

    pub fn with_probe(
        image: impl AsRef<Path>,
        rootfs: impl AsRef<Path>,
        probe: &impl FilesystemProbe,
    ) -> Result<Self, RootfsError> {
        let kind = select_driver(probe)?;
        info!("using {} rootfs driver", kind.fs_type());
        Ok(Self::from_kind(kind, image, rootfs))
    }

    pub fn from_kind(kind: DriverKind, image: impl AsRef<Path>, rootfs: impl AsRef<Path>) -> Self {
        let image = image.as_ref().to_path_buf();
        let rootfs = rootfs.as_ref().to_path_buf();
        match kind {
            DriverKind::Overlay => RootfsDriver::Overlay(Overlay::new(image, rootfs)),
            DriverKind::Aufs => RootfsDriver::Aufs(Aufs::new(image, rootfs)),
        }
    }

    pub fn kind(&self) -> DriverKind {
        match self {
            RootfsDriver::Overlay(_) => DriverKind::Overlay,
            RootfsDriver::Aufs(_) => DriverKind::Aufs,
        }
    }

    /// The directory the merged tree is mounted on
    pub fn rootfs(&self) -> &Path {
        match self {
            RootfsDriver::Overlay(overlay) => &overlay.upper_dir,
            RootfsDriver::Aufs(aufs) => &aufs.upper_dir,
        }
    }

    pub fn setup_rootfs(&self) -> Result<(), RootfsError> {
        match self {
            RootfsDriver::Overlay(overlay) => overlay.setup_rootfs(),
            RootfsDriver::Aufs(aufs) => aufs.setup_rootfs(),
        }
    }

    /// Unmount and delete the rootfs. Safe to call after a partial setup, a directory that is not
    /// mounted is just deleted; a failed unmount aborts before anything is deleted.
    pub fn cleanup_rootfs(&self) -> Result<(), RootfsError> {
        match self {
            RootfsDriver::Overlay(overlay) => overlay.cleanup_rootfs(),
            RootfsDriver::Aufs(aufs) => aufs.cleanup_rootfs(),
        }
    }
}

// the execute bit is required for user switching inside the container to succeed
fn create_dir(path: &Path) -> Result<(), RootfsError> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|err| RootfsError::Io(path.to_path_buf(), err))
}

fn remove_dir(path: &Path) -> Result<(), RootfsError> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            Err(RootfsError::Io(path.to_path_buf(), err))
        }
        _ => Ok(()),
    }
}

fn unmount_and_remove(mount_point: &Path, scratch: &[&Path]) -> Result<(), RootfsError> {
    let mounted = linux::fs::is_mount_point(mount_point)
        .map_err(|err| RootfsError::Io(mount_point.to_path_buf(), err))?;
    if mounted {
        linux::fs::umount(mount_point)
            .map_err(|err| RootfsError::Unmount(mount_point.to_path_buf(), err))?;
    } else {
        debug!("{mount_point:?} is not mounted, skipping unmount");
    }
    remove_dir(mount_point)?;
    for dir in scratch {
        remove_dir(dir)?;
    }
    Ok(())
}
