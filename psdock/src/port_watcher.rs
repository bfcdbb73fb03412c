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

use async_trait::async_trait;
use linux::proc::ProcError;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("cannot enumerate children of {0}: {1}")]
    ProcessTree(u32, ProcError),
    #[error("cannot resolve owner of port {0}: {1}")]
    SocketOwner(u16, ProcError),
}

#[async_trait]
pub trait ProcessTree: Send + Sync {
    /// Direct children of `pid`, empty for a leaf
    async fn children(&self, pid: u32) -> Result<Vec<u32>, ProcError>;
}

#[async_trait]
pub trait SocketOwner: Send + Sync {
    /// Pids listening on `port`, empty if the port is not bound
    async fn owners(&self, port: u16) -> Result<Vec<u32>, ProcError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Pgrep;

#[async_trait]
impl ProcessTree for Pgrep {
    async fn children(&self, pid: u32) -> Result<Vec<u32>, ProcError> {
        tokio::task::spawn_blocking(move || linux::proc::children(pid))
            .await
            .map_err(|err| ProcError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lsof;

#[async_trait]
impl SocketOwner for Lsof {
    async fn owners(&self, port: u16) -> Result<Vec<u32>, ProcError> {
        tokio::task::spawn_blocking(move || linux::proc::port_owners(port))
            .await
            .map_err(|err| ProcError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
    }
}

/// Waits until a port is bound by a given process or one of its descendants
#[derive(Clone)]
pub struct PortBindWatcher {
    tree: Arc<dyn ProcessTree>,
    sockets: Arc<dyn SocketOwner>,
    retry_delay: Duration,
}

impl Default for PortBindWatcher {
    fn default() -> Self {
        PortBindWatcher::new(Arc::new(Pgrep), Arc::new(Lsof))
    }
}

impl PortBindWatcher {
    pub fn new(tree: Arc<dyn ProcessTree>, sockets: Arc<dyn SocketOwner>) -> PortBindWatcher {
        PortBindWatcher {
            tree,
            sockets,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// `pid` and all its transitive children
    pub async fn descendants(&self, pid: u32) -> Result<HashSet<u32>, WatchError> {
        let mut found = HashSet::from([pid]);
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            let children = self
                .tree
                .children(parent)
                .await
                .map_err(|err| WatchError::ProcessTree(parent, err))?;
            for child in children {
                if found.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        Ok(found)
    }

    /// Retry until `port` is owned by `pid` or a descendant, returns the owner. A port bound by
    /// an unrelated process does not count, the expected binder may not have acted yet.
    pub async fn watch(&self, pid: u32, port: u16) -> Result<u32, WatchError> {
        loop {
            let owners = self
                .sockets
                .owners(port)
                .await
                .map_err(|err| WatchError::SocketOwner(port, err))?;
            if !owners.is_empty() {
                let family = self.descendants(pid).await?;
                if let Some(owner) = owners.iter().find(|owner| family.contains(owner)) {
                    info!("port {port} bound by {owner}");
                    return Ok(*owner);
                }
                debug!("port {port} bound by unrelated process {owners:?}");
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
