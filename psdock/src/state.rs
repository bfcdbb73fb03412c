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

//! Per container state persisted under `<state_root>/<id>/state.json`, consumed by `psdock-ls`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const STATE_FILE: &str = "state.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerStateFile {
    pub id: String,
    pub rootfs: PathBuf,
    pub command: Vec<String>,
    /// Pid of the supervisor
    pub launcher_pid: u32,
    #[serde(default)]
    pub init_pid: Option<u32>,
    pub created: String,
}

impl ContainerStateFile {
    pub fn new(id: &str, rootfs: impl AsRef<Path>, command: Vec<String>) -> ContainerStateFile {
        ContainerStateFile {
            id: id.to_string(),
            rootfs: rootfs.as_ref().to_path_buf(),
            command,
            launcher_pid: std::process::id(),
            init_pid: None,
            created: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn dir(state_root: impl AsRef<Path>, id: &str) -> PathBuf {
        state_root.as_ref().join(id)
    }

    pub fn write(&self, state_root: impl AsRef<Path>) -> std::io::Result<()> {
        let dir = Self::dir(state_root, &self.id);
        std::fs::create_dir_all(&dir).map_err(|err| linux::tag_io_err(dir.to_string_lossy(), err))?;
        let content = serde_json::to_vec_pretty(self)?;
        let path = dir.join(STATE_FILE);
        std::fs::write(&path, content).map_err(|err| linux::tag_io_err(path.to_string_lossy(), err))
    }

    pub fn remove(state_root: impl AsRef<Path>, id: &str) -> std::io::Result<()> {
        match std::fs::remove_dir_all(Self::dir(state_root, id)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Every readable state under `state_root`, sorted by id. A missing root means no container.
    pub fn list(state_root: impl AsRef<Path>) -> std::io::Result<Vec<ContainerStateFile>> {
        let entries = match std::fs::read_dir(state_root.as_ref()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut states = Vec::new();
        for entry in entries {
            let path = entry?.path().join(STATE_FILE);
            let Ok(content) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<ContainerStateFile>(&content) {
                Ok(state) => states.push(state),
                Err(err) => warn!("ignoring malformed state {path:?}: {err}"),
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }
}
