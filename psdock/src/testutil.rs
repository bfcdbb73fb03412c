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

//! Fakes shared by the unit tests of the crate

use crate::container::{
    Container, ContainerConfig, ContainerError, ContainerState, ExitStatus, ProcessIo,
    ProcessSpec, Runtime,
};
use crate::signal::StatusInspector;
use async_trait::async_trait;
use linux::proc::{ProcError, ProcStatus};
use nix::sys::signal::Signal;
use pty_process::Console;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const FAKE_PID: u32 = 4242;

/// A process that only exits when told to, or when it receives a signal it handles (or SIGKILL)
pub struct FakeContainer {
    handled: Vec<Signal>,
    output: Vec<u8>,
    /// Hand out a console backed by a socket instead of pipes
    console: bool,
    started: AtomicBool,
    destroyed: AtomicBool,
    signals: Mutex<Vec<Signal>>,
    exit: watch::Sender<Option<ExitStatus>>,
}

impl FakeContainer {
    pub fn new(handled: &[Signal]) -> Arc<FakeContainer> {
        Self::with_output(handled, b"")
    }

    pub fn with_output(handled: &[Signal], output: &[u8]) -> Arc<FakeContainer> {
        Self::build(handled, output, false)
    }

    /// The console is not a terminal, so configuring its line discipline fails
    pub fn with_console(handled: &[Signal]) -> Arc<FakeContainer> {
        Self::build(handled, b"", true)
    }

    fn build(handled: &[Signal], output: &[u8], console: bool) -> Arc<FakeContainer> {
        let (exit, _) = watch::channel(None);
        Arc::new(FakeContainer {
            handled: handled.to_vec(),
            output: output.to_vec(),
            console,
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            signals: Mutex::new(Vec::new()),
            exit,
        })
    }

    pub fn exit(&self, status: ExitStatus) {
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                true
            } else {
                false
            }
        });
    }

    pub fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        "psdock_fake000"
    }

    async fn start(&self, _spec: &ProcessSpec) -> Result<ProcessIo, ContainerError> {
        self.started.store(true, Ordering::SeqCst);
        if self.console {
            let (primary, _) = std::os::unix::net::UnixStream::pair()
                .map_err(|err| ContainerError::Io("socketpair".to_string(), err))?;
            let console = Console::from_primary(OwnedFd::from(primary))
                .map_err(|err| ContainerError::Io("console".to_string(), err))?;
            return Ok(ProcessIo::Console(console));
        }
        Ok(ProcessIo::Pipes {
            stdout: Box::new(std::io::Cursor::new(self.output.clone())),
            stderr: Box::new(tokio::io::empty()),
        })
    }

    async fn signal(&self, signal: Signal) -> Result<(), ContainerError> {
        self.signals.lock().unwrap().push(signal);
        if !self.started() || self.exited() {
            return Err(ContainerError::NotRunning(self.id().to_string()));
        }
        if signal == Signal::SIGKILL {
            self.exit(ExitStatus::Signaled(Signal::SIGKILL as i32));
        } else if self.handled.contains(&signal) {
            self.exit(ExitStatus::Exited(0));
        }
        Ok(())
    }

    async fn wait(&self) -> Result<ExitStatus, ContainerError> {
        let mut receiver = self.exit.subscribe();
        loop {
            let status = *receiver.borrow_and_update();
            if let Some(status) = status {
                return Ok(status);
            }
            if receiver.changed().await.is_err() {
                return Err(ContainerError::NotRunning(self.id().to_string()));
            }
        }
    }

    async fn state(&self) -> Result<ContainerState, ContainerError> {
        Ok(ContainerState {
            id: self.id().to_string(),
            init_pid: (self.started() && !self.exited()).then_some(FAKE_PID),
        })
    }

    async fn destroy(&self) -> Result<(), ContainerError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeRuntime(pub Arc<FakeContainer>);

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(
        &self,
        _id: &str,
        _config: &ContainerConfig,
    ) -> Result<Arc<dyn Container>, ContainerError> {
        Ok(self.0.clone())
    }
}

/// Reports `caught` as the handled signals of any pid, or the process as gone
pub struct FakeInspector {
    pub caught: Option<Vec<i32>>,
}

#[async_trait]
impl StatusInspector for FakeInspector {
    async fn inspect(&self, pid: u32) -> Result<ProcStatus, ProcError> {
        match &self.caught {
            Some(caught) => Ok(ProcStatus {
                pid,
                name: None,
                caught: caught.clone(),
            }),
            None => Err(ProcError::NotFound(pid)),
        }
    }
}

/// Minimal HTTP endpoint recording `(method, body)` of every request
pub struct HookServer {
    pub url: String,
    requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl HookServer {
    pub async fn start(status: u16) -> HookServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/ps/1", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let (head, body_start) = loop {
                    let len = socket.read(&mut chunk).await.unwrap();
                    if len == 0 {
                        break (String::new(), buf.len());
                    }
                    buf.extend_from_slice(&chunk[..len]);
                    if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break (String::from_utf8_lossy(&buf[..end]).to_string(), end + 4);
                    }
                };
                let content_length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < body_start + content_length {
                    let len = socket.read(&mut chunk).await.unwrap();
                    if len == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..len]);
                }
                let method = head.split(' ').next().unwrap_or_default().to_string();
                let body = String::from_utf8_lossy(&buf[body_start..]).to_string();
                recorded.lock().unwrap().push((method, body));
                let response =
                    format!("HTTP/1.1 {status} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                _ = socket.write_all(response.as_bytes()).await;
                _ = socket.shutdown().await;
            }
        });
        HookServer { url, requests }
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }

    /// Statuses carried by the recorded payloads
    pub fn statuses(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|(_, body)| {
                let value: serde_json::Value = serde_json::from_str(&body).unwrap();
                value["ps"]["status"].as_str().unwrap().to_string()
            })
            .collect()
    }

    pub async fn wait_for(&self, count: usize) {
        for _ in 0..500 {
            if self.requests.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} requests, got {:?}", self.requests());
    }
}
