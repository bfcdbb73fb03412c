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

use super::{
    Container, ContainerConfig, ContainerError, ContainerState, ExitStatus, ProcessIo,
    ProcessSpec, Runtime,
};
use crate::state::ContainerStateFile;
use async_trait::async_trait;
use linux::LinuxCommandExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getegid, geteuid, Pid};
use pty_process::{Console, Pty, TokioPtyCommandExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Runs the process directly on the host, chrooted into the rootfs
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRuntime;

#[async_trait]
impl Runtime for HostRuntime {
    async fn create(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<Arc<dyn Container>, ContainerError> {
        let container = HostContainer::create(id, config)?;
        Ok(Arc::new(container))
    }
}

#[derive(Debug)]
pub struct HostContainer {
    id: String,
    config: ContainerConfig,
    /// Bind mount points inside the rootfs, in mount order
    mounted: std::sync::Mutex<Vec<PathBuf>>,
    started: AtomicBool,
    pid: AtomicU32,
    child: Mutex<Option<Child>>,
    state: std::sync::Mutex<ContainerStateFile>,
}

/// Resolve `user` as `uid[:gid]` or a name from the `/etc/passwd` of the rootfs
pub(crate) fn resolve_user(rootfs: &Path, user: &str) -> Result<(u32, u32), ContainerError> {
    let mut numeric = user.splitn(2, ':').map(str::parse::<u32>);
    match (numeric.next(), numeric.next()) {
        (Some(Ok(uid)), None) => return Ok((uid, uid)),
        (Some(Ok(uid)), Some(Ok(gid))) => return Ok((uid, gid)),
        _ => {}
    }

    let passwd = match std::fs::read_to_string(rootfs.join("etc/passwd")) {
        Ok(passwd) => passwd,
        Err(_) if user == "root" => return Ok((0, 0)),
        Err(err) => {
            debug!("cannot read passwd of {rootfs:?}: {err}");
            return Err(ContainerError::User(user.to_string()));
        }
    };
    passwd
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() >= 4 && fields[0] == user)
        .and_then(|fields| {
            let uid = fields[2].parse::<u32>().ok()?;
            Some((uid, fields[3].parse::<u32>().ok()?))
        })
        .or_else(|| (user == "root").then_some((0, 0)))
        .ok_or_else(|| ContainerError::User(user.to_string()))
}

fn mount_target(rootfs: &Path, destination: &Path) -> PathBuf {
    rootfs.join(destination.strip_prefix("/").unwrap_or(destination))
}

impl HostContainer {
    pub fn create(id: &str, config: &ContainerConfig) -> Result<HostContainer, ContainerError> {
        if !config.rootfs.is_dir() {
            return Err(ContainerError::NotExists(id.to_string()));
        }
        let state = ContainerStateFile::new(id, &config.rootfs, Vec::new());
        let container = HostContainer {
            id: id.to_string(),
            config: config.clone(),
            mounted: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            child: Mutex::new(None),
            state: std::sync::Mutex::new(state),
        };
        if let Err(err) = container.mount_binds() {
            _ = container.unmount_binds();
            return Err(err);
        }
        container.persist_state();
        info!(id, rootfs = ?config.rootfs, "container created");
        Ok(container)
    }

    fn mount_binds(&self) -> Result<(), ContainerError> {
        for bind in &self.config.bind_mounts {
            let target = mount_target(&self.config.rootfs, &bind.destination);
            let io_err =
                |err: std::io::Error| ContainerError::Io(target.to_string_lossy().to_string(), err);
            if bind.source.is_dir() {
                std::fs::create_dir_all(&target).map_err(io_err)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .map_err(io_err)?;
            }
            linux::fs::bind_mount(&bind.source, &target, bind.read_only)
                .map_err(|err| ContainerError::Mount(target.clone(), err))?;
            self.mounted
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(target);
        }
        Ok(())
    }

    /// Unmount in reverse order, keep going on failure and report the first error
    fn unmount_binds(&self) -> Result<(), ContainerError> {
        let mounted = std::mem::take(&mut *self.mounted.lock().unwrap_or_else(|e| e.into_inner()));
        let mut result = Ok(());
        for target in mounted.into_iter().rev() {
            if let Err(err) = linux::fs::umount(&target) {
                error!("cannot unmount {target:?}: {err}");
                if result.is_ok() {
                    result = Err(ContainerError::Mount(target, err));
                }
            }
        }
        result
    }

    fn persist_state(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = state.write(&self.config.state_root) {
            warn!("cannot persist state of {}: {err}", self.id);
        }
    }

    /// The pty hook has to be registered before the chroot, hooks run in registration order
    fn command(&self, spec: &ProcessSpec, pty: Option<&Pty>) -> Result<Command, ContainerError> {
        let (program, args) = spec
            .args
            .split_first()
            .ok_or_else(|| ContainerError::Spawn(std::io::ErrorKind::InvalidInput.into()))?;
        let (uid, gid) = resolve_user(&self.config.rootfs, &spec.user)?;

        let mut envs = spec
            .env
            .iter()
            .filter_map(|pair| match pair.split_once('=') {
                Some(pair) => Some(pair),
                None => {
                    warn!("ignoring malformed environment variable {pair:?}");
                    None
                }
            })
            .collect::<Vec<_>>();
        if !envs.iter().any(|(key, _)| *key == "HOSTNAME") {
            envs.push(("HOSTNAME", self.config.hostname.as_str()));
        }

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear().envs(envs);
        match pty {
            Some(pty) => {
                cmd.pty(pty);
            }
            None => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }
        cmd.chroot(&self.config.rootfs);
        if let Some(cwd) = spec.cwd.as_ref().filter(|cwd| !cwd.is_empty()) {
            cmd.cwork_dir(cwd);
        }
        if uid != geteuid().as_raw() || gid != getegid().as_raw() {
            cmd.cgid(gid).cuid(uid);
        }
        // credential changes reset the parent death signal
        cmd.parent_death_signal(Signal::SIGKILL);
        Ok(cmd)
    }

    fn update_state(&self, spec: &ProcessSpec, pid: Option<u32>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.command = spec.args.clone();
            state.init_pid = pid;
        }
        self.persist_state();
    }
}

#[async_trait]
impl Container for HostContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, spec: &ProcessSpec) -> Result<ProcessIo, ContainerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ContainerError::AlreadyStarted(self.id.clone()));
        }
        debug!("start: {spec:#?}");

        let (child, io) = if spec.console {
            let pty = pty_process::open_pty()
                .map_err(|errno| ContainerError::Console(errno.into()))?;
            let child = self
                .command(spec, Some(&pty))?
                .spawn()
                .map_err(ContainerError::Spawn)?;
            let Pty {
                primary, replica, ..
            } = pty;
            drop(replica);
            let console = Console::from_primary(primary).map_err(ContainerError::Console)?;
            (child, ProcessIo::Console(console))
        } else {
            let mut child = self
                .command(spec, None)?
                .spawn()
                .map_err(ContainerError::Spawn)?;
            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                return Err(ContainerError::Spawn(std::io::ErrorKind::BrokenPipe.into()));
            };
            (
                child,
                ProcessIo::Pipes {
                    stdout: Box::new(stdout),
                    stderr: Box::new(stderr),
                },
            )
        };

        let pid = child.id();
        if let Some(pid) = pid {
            self.pid.store(pid, Ordering::Release);
        }
        info!(id = %self.id, ?pid, "process started");
        self.update_state(spec, pid);
        *self.child.lock().await = Some(child);
        Ok(io)
    }

    async fn signal(&self, signal: Signal) -> Result<(), ContainerError> {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return Err(ContainerError::NotRunning(self.id.clone()));
        }
        debug!("kill -{signal} {pid}");
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(ContainerError::NotRunning(self.id.clone())),
            Err(errno) => Err(ContainerError::Signal(errno)),
        }
    }

    async fn wait(&self) -> Result<ExitStatus, ContainerError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Err(ContainerError::NotRunning(self.id.clone()));
        };
        let status = child
            .wait()
            .await
            .map_err(|err| ContainerError::Io(format!("wait {}", self.id), err))?;
        self.pid.store(0, Ordering::Release);
        let status = ExitStatus::from(status);
        info!(id = %self.id, ?status, "process exited");
        Ok(status)
    }

    async fn state(&self) -> Result<ContainerState, ContainerError> {
        let pid = self.pid.load(Ordering::Acquire);
        Ok(ContainerState {
            id: self.id.clone(),
            init_pid: (pid != 0).then_some(pid),
        })
    }

    async fn destroy(&self) -> Result<(), ContainerError> {
        if let Some(mut child) = self.child.lock().await.take() {
            warn!(id = %self.id, pid = ?child.id(), "process still running on destroy, killing it");
            if let Err(err) = child.kill().await {
                error!("cannot kill process of {}: {err}", self.id);
            }
            self.pid.store(0, Ordering::Release);
        }
        let result = self.unmount_binds();
        if let Err(err) = ContainerStateFile::remove(&self.config.state_root, &self.id) {
            warn!("cannot remove state of {}: {err}", self.id);
        }
        result
    }
}
