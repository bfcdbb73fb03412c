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

use super::{create_dir, unmount_and_remove, DriverKind, RootfsError};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aufs {
    pub image: PathBuf,
    pub upper_dir: PathBuf,
}

impl Aufs {
    pub fn new(image: PathBuf, rootfs: PathBuf) -> Aufs {
        Aufs {
            image,
            upper_dir: rootfs,
        }
    }

    /// The writable branch is stacked on top of the image
    pub(super) fn branches(&self) -> String {
        format!(
            "br={}=rw:{}=ro",
            self.upper_dir.to_string_lossy(),
            self.image.to_string_lossy()
        )
    }

    pub fn setup_rootfs(&self) -> Result<(), RootfsError> {
        create_dir(&self.upper_dir)?;
        let fs_type = DriverKind::Aufs.fs_type();
        linux::fs::mount(fs_type, "none", &self.upper_dir, [self.branches()])
            .map_err(|err| RootfsError::Mount(fs_type, err))
    }

    pub fn cleanup_rootfs(&self) -> Result<(), RootfsError> {
        unmount_and_remove(&self.upper_dir, &[])
    }
}
