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
pub struct Overlay {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl Overlay {
    pub fn new(image: PathBuf, rootfs: PathBuf) -> Overlay {
        let mut work_dir = rootfs.clone().into_os_string();
        work_dir.push("_work");
        Overlay {
            lower_dir: image,
            upper_dir: rootfs,
            work_dir: PathBuf::from(work_dir),
        }
    }

    pub(super) fn options(&self) -> Vec<String> {
        vec![
            format!("lowerdir={}", self.lower_dir.to_string_lossy()),
            format!("upperdir={}", self.upper_dir.to_string_lossy()),
            format!("workdir={}", self.work_dir.to_string_lossy()),
        ]
    }

    pub fn setup_rootfs(&self) -> Result<(), RootfsError> {
        create_dir(&self.upper_dir)?;
        create_dir(&self.work_dir)?;
        let fs_type = DriverKind::Overlay.fs_type();
        linux::fs::mount(fs_type, fs_type, &self.upper_dir, self.options())
            .map_err(|err| RootfsError::Mount(fs_type, err))
    }

    pub fn cleanup_rootfs(&self) -> Result<(), RootfsError> {
        unmount_and_remove(&self.upper_dir, &[&self.work_dir])
    }
}
