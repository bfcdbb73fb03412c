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

//! Supervision of one container run: rootfs, stdio, process start, signals, readiness and
//! lifecycle notifications, then teardown in reverse order.

use crate::config::{ConfigError, SupervisorConfig};
use crate::console::ConsoleAttachment;
use crate::container::{
    generate_id, poll_init_pid, Container, ContainerConfig, ContainerError, HostRuntime,
    ProcessIo, ProcessSpec, Runtime, PID_POLL_ATTEMPTS, PID_POLL_DELAY,
};
use crate::log_rotate::LogRotator;
use crate::notifier::{PsStatus, StatusNotifier};
use crate::port_watcher::PortBindWatcher;
use crate::rootfs::{RootfsDriver, RootfsError};
use crate::signal::{os_signals, ProcInspector, SignalForwarder, StatusInspector};
use crate::stream::{StdioStream, StreamError, StreamKind};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bound on the wait for the output of the process to be flushed once it exited
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on the wait for a process killed after a failed run to be reaped
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("rootfs error: {0}")]
    Rootfs(#[from] RootfsError),
    #[error("cannot open stdio: {0}")]
    Stream(#[from] StreamError),
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
    #[error("cannot attach console: {0}")]
    Attach(std::io::Error),
    #[error("cannot listen to signals: {0}")]
    Signals(std::io::Error),
}

/// Resources tied to a running process, released on teardown
#[derive(Default)]
struct Session {
    tasks: Vec<JoinHandle<()>>,
    output: Vec<JoinHandle<()>>,
    attachment: Option<Arc<ConsoleAttachment>>,
    rotator: Option<Arc<LogRotator>>,
}

impl Session {
    async fn drain_output(&mut self) {
        for handle in self.output.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await.is_err() {
                debug!("process output still open after exit, abandoning it");
            }
        }
    }

    fn teardown(&mut self) {
        for task in self.tasks.drain(..).chain(self.output.drain(..)) {
            task.abort();
        }
        if let Some(attachment) = self.attachment.take() {
            attachment.close();
        }
        if let Some(rotator) = self.rotator.take() {
            rotator.stop_watching();
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    runtime: Arc<dyn Runtime>,
    watcher: PortBindWatcher,
    inspector: Arc<dyn StatusInspector>,
    signals: Option<mpsc::UnboundedReceiver<Signal>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Supervisor {
        Supervisor {
            config,
            runtime: Arc::new(HostRuntime),
            watcher: PortBindWatcher::default(),
            inspector: Arc::new(ProcInspector),
            signals: None,
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_port_watcher(mut self, watcher: PortBindWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn StatusInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Use `signals` instead of the signals delivered to this process
    pub fn with_signals(mut self, signals: mpsc::UnboundedReceiver<Signal>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Assemble the rootfs, supervise the process and clean up. Returns the exit code to report.
    pub async fn run(self) -> Result<i32, SupervisorError> {
        self.config.validate()?;
        let driver = RootfsDriver::new(&self.config.image, &self.config.rootfs)?;
        if let Err(err) = driver.setup_rootfs() {
            if let Err(cleanup) = driver.cleanup_rootfs() {
                error!("cannot clean up rootfs after failed setup: {cleanup}");
            }
            return Err(err.into());
        }
        info!(rootfs = ?driver.rootfs(), "rootfs ready");

        let result = self.supervise().await;

        if let Err(err) = driver.cleanup_rootfs() {
            error!("cannot clean up rootfs: {err}");
        }
        result
    }

    /// Run the process on an already assembled rootfs
    pub async fn supervise(mut self) -> Result<i32, SupervisorError> {
        let signals = match self.signals.take() {
            Some(signals) => signals,
            None => os_signals().map_err(SupervisorError::Signals)?,
        };
        let notifier = Arc::new(StatusNotifier::new(self.config.web_hook()));

        let id = generate_id();
        let container_config = ContainerConfig {
            rootfs: self.config.rootfs.clone(),
            hostname: self.config.hostname.clone(),
            bind_mounts: self.config.bind_mounts.clone(),
            state_root: self.config.state_root.clone(),
        };
        let container = self.runtime.create(&id, &container_config).await?;

        let stream =
            match StdioStream::open(&self.config.stdio, self.config.stdout_prefix.as_ref()).await {
                Ok(stream) => Arc::new(stream),
                Err(err) => {
                    destroy(container.as_ref()).await;
                    return Err(err.into());
                }
            };

        let mut session = Session::default();
        notifier.notify(PsStatus::Starting).await;
        let result = self
            .run_process(&container, &stream, &notifier, signals, &mut session)
            .await;
        notifier.notify(PsStatus::Crashed).await;

        if let Err(err) = &result {
            warn!("run failed: {err}");
            stop_process(container.as_ref()).await;
        }
        session.teardown();
        stream.close().await;
        destroy(container.as_ref()).await;
        result
    }

    async fn run_process(
        &self,
        container: &Arc<dyn Container>,
        stream: &Arc<StdioStream>,
        notifier: &Arc<StatusNotifier>,
        signals: mpsc::UnboundedReceiver<Signal>,
        session: &mut Session,
    ) -> Result<i32, SupervisorError> {
        let spec = ProcessSpec {
            args: self.config.command.clone(),
            env: self.config.env.clone(),
            user: self.config.user.clone(),
            cwd: self.config.cwd.clone(),
            console: stream.interactive(),
        };
        let io = container.start(&spec).await?;

        match io {
            ProcessIo::Console(console) => {
                let attachment = Arc::new(ConsoleAttachment::new(console));
                session.attachment = Some(attachment.clone());
                let output = attachment
                    .attach(stream.clone())
                    .map_err(SupervisorError::Attach)?;
                session.output.push(output);
            }
            ProcessIo::Pipes { stdout, stderr } => {
                for output in [stdout, stderr] {
                    let stream = stream.clone();
                    session.output.push(tokio::spawn(async move {
                        if let Err(err) = stream.copy_from(output).await {
                            debug!("process output copy ended: {err}");
                        }
                    }));
                }
                // the process has no input, still consume it to notice the remote end leaving
                if let Some(mut reader) = stream.take_reader() {
                    session.tasks.push(tokio::spawn(async move {
                        _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    }));
                }
            }
        }

        if let (StreamKind::File, Some(path)) = (stream.kind(), stream.path()) {
            if self.config.log_rotate > 0 {
                let delay = Duration::from_secs(self.config.log_rotate * 60 * 60);
                let rotator = Arc::new(LogRotator::new(path).with_rotation_delay(delay));
                session.rotator = Some(rotator.clone());
                session.tasks.push(tokio::spawn(async move {
                    rotator.start_watching().await;
                }));
            }
        }

        let kill_timeout = u64::try_from(self.config.kill_timeout)
            .ok()
            .map(Duration::from_secs);
        let forwarder = Arc::new(
            SignalForwarder::new(container.clone())
                .with_console(session.attachment.clone())
                .with_inspector(self.inspector.clone())
                .with_kill_timeout(kill_timeout),
        );
        session.tasks.push(tokio::spawn({
            let forwarder = forwarder.clone();
            async move { forwarder.run(signals).await }
        }));

        if stream.kind().is_remote() {
            let forwarder = forwarder.clone();
            let stream = stream.clone();
            session.tasks.push(tokio::spawn(async move {
                stream.remote_closed().await;
                info!("stdio closed by the remote end, stopping the process");
                forwarder.interrupt(Signal::SIGTERM).await;
            }));
        }

        match self.config.bind_port {
            None => {
                notifier.notify(PsStatus::Running).await;
            }
            Some(port) => {
                session.tasks.push(tokio::spawn(watch_port(
                    container.clone(),
                    self.watcher.clone(),
                    port,
                    notifier.clone(),
                )));
            }
        }

        let status = container.wait().await?;
        session.drain_output().await;

        if forwarder.force_killed() && status.killed_by(Signal::SIGKILL) {
            info!("process stopped by SIGKILL after an interrupt, reporting success");
            Ok(0)
        } else {
            Ok(status.code())
        }
    }
}

async fn watch_port(
    container: Arc<dyn Container>,
    watcher: PortBindWatcher,
    port: u16,
    notifier: Arc<StatusNotifier>,
) {
    let Some(pid) = poll_init_pid(container.as_ref(), PID_POLL_DELAY, PID_POLL_ATTEMPTS).await
    else {
        warn!("no pid for the process, cannot watch port {port}");
        return;
    };
    match watcher.watch(pid, port).await {
        Ok(_) => {
            notifier.notify(PsStatus::Running).await;
        }
        Err(err) => error!("failed to check if port {port} is bound: {err}"),
    }
}

/// Kill whatever the failed run left behind and reap it
async fn stop_process(container: &dyn Container) {
    match container.signal(Signal::SIGKILL).await {
        Ok(()) => {}
        Err(ContainerError::NotRunning(_)) => return,
        Err(err) => {
            error!("cannot kill process of {}: {err}", container.id());
            return;
        }
    }
    match tokio::time::timeout(KILL_WAIT_TIMEOUT, container.wait()).await {
        Ok(Ok(status)) => debug!(?status, "process killed"),
        Ok(Err(err)) => debug!("cannot wait for killed process: {err}"),
        Err(_) => warn!("process of {} still running after SIGKILL", container.id()),
    }
}

async fn destroy(container: &dyn Container) {
    if let Err(err) = container.destroy().await {
        error!("cannot destroy container {}: {err}", container.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ExitStatus;
    use crate::port_watcher::{ProcessTree, SocketOwner};
    use crate::testutil::{FakeContainer, FakeInspector, FakeRuntime, HookServer, FAKE_PID};
    use async_trait::async_trait;
    use linux::proc::ProcError;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoChildren;

    #[async_trait]
    impl ProcessTree for NoChildren {
        async fn children(&self, _pid: u32) -> Result<Vec<u32>, ProcError> {
            Ok(Vec::new())
        }
    }

    /// The port is bound by the fake process once `bound` is set
    #[derive(Default)]
    struct GatedPort {
        bound: AtomicBool,
    }

    #[async_trait]
    impl SocketOwner for GatedPort {
        async fn owners(&self, _port: u16) -> Result<Vec<u32>, ProcError> {
            Ok(if self.bound.load(Ordering::SeqCst) {
                vec![FAKE_PID]
            } else {
                Vec::new()
            })
        }
    }

    fn test_config(dir: &Path, web_hook: Option<&str>) -> SupervisorConfig {
        let mut config =
            SupervisorConfig::new("/", dir.join("rootfs"), vec!["app".to_string()]);
        config.stdio = format!("file://{}", dir.join("out.log").to_string_lossy());
        config.web_hook = web_hook.map(str::to_string);
        config.state_root = dir.join("state");
        config
    }

    fn build(
        config: SupervisorConfig,
        container: &Arc<FakeContainer>,
        caught: Vec<i32>,
    ) -> (Supervisor, mpsc::UnboundedSender<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(config)
            .with_runtime(Arc::new(FakeRuntime(container.clone())))
            .with_inspector(Arc::new(FakeInspector {
                caught: Some(caught),
            }))
            .with_signals(rx);
        (supervisor, tx)
    }

    #[tokio::test]
    async fn test_lifecycle_without_port() {
        let dir = tempfile::tempdir().unwrap();
        let server = HookServer::start(200).await;
        let container = FakeContainer::with_output(&[], b"hello\n");
        let mut config = test_config(dir.path(), Some(&server.url));
        config.stdout_prefix = Some("app".parse().unwrap());
        let (supervisor, _signals) = build(config, &container, Vec::new());

        let (code, ()) = tokio::join!(supervisor.supervise(), async {
            server.wait_for(2).await;
            assert_eq!(server.statuses(), vec!["starting", "running"]);
            assert!(!container.exited());
            container.exit(ExitStatus::Exited(0));
        });

        assert_eq!(code.unwrap(), 0);
        server.wait_for(3).await;
        assert_eq!(server.statuses(), vec!["starting", "running", "crashed"]);
        assert!(container.destroyed());
        let output = std::fs::read_to_string(dir.path().join("out.log")).unwrap();
        assert_eq!(output, "app: hello\n");
    }

    #[tokio::test]
    async fn test_lifecycle_with_bind_port() {
        let dir = tempfile::tempdir().unwrap();
        let server = HookServer::start(200).await;
        let container = FakeContainer::new(&[Signal::SIGTERM]);
        let mut config = test_config(dir.path(), Some(&server.url));
        config.bind_port = Some(8080);
        let port = Arc::new(GatedPort::default());
        let (supervisor, signals) = build(config, &container, vec![15]);
        let supervisor = supervisor.with_port_watcher(
            PortBindWatcher::new(Arc::new(NoChildren), port.clone())
                .with_retry_delay(Duration::from_millis(10)),
        );

        let (code, ()) = tokio::join!(supervisor.supervise(), async {
            server.wait_for(1).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            // started but not bound yet
            assert_eq!(server.statuses(), vec!["starting"]);

            port.bound.store(true, Ordering::SeqCst);
            server.wait_for(2).await;
            assert_eq!(server.statuses(), vec!["starting", "running"]);
            assert!(!container.exited());

            signals.send(Signal::SIGTERM).unwrap();
        });

        assert_eq!(code.unwrap(), 0);
        server.wait_for(3).await;
        assert_eq!(server.statuses(), vec!["starting", "running", "crashed"]);
        assert_eq!(container.signals(), vec![Signal::SIGTERM]);
    }

    #[tokio::test]
    async fn test_forced_kill_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let container = FakeContainer::new(&[]);
        let (supervisor, signals) = build(test_config(dir.path(), None), &container, Vec::new());

        let (code, ()) = tokio::join!(supervisor.supervise(), async {
            while !container.started() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            signals.send(Signal::SIGINT).unwrap();
        });

        assert_eq!(code.unwrap(), 0);
        assert_eq!(container.signals(), vec![Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_exit_status_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let container = FakeContainer::new(&[]);
        container.exit(ExitStatus::Signaled(Signal::SIGKILL as i32));
        let (supervisor, _signals) = build(test_config(dir.path(), None), &container, Vec::new());
        // not killed by us, this is a crash
        assert_eq!(supervisor.supervise().await.unwrap(), 137);

        let container = FakeContainer::new(&[]);
        container.exit(ExitStatus::Exited(3));
        let (supervisor, _signals) = build(test_config(dir.path(), None), &container, Vec::new());
        assert_eq!(supervisor.supervise().await.unwrap(), 3);
        assert!(container.destroyed());
    }

    #[tokio::test]
    async fn test_stream_failure_aborts_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let server = HookServer::start(200).await;
        let container = FakeContainer::new(&[]);
        let mut config = test_config(dir.path(), Some(&server.url));
        config.stdio = "carrier-pigeon://home".to_string();
        let (supervisor, _signals) = build(config, &container, Vec::new());

        let err = supervisor.supervise().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Stream(_)));
        assert!(!container.started());
        assert!(container.destroyed());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_remote_close_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(dir.path(), None);
        config.stdio = format!("tcp://{}", listener.local_addr().unwrap());
        let container = FakeContainer::new(&[Signal::SIGTERM]);
        let (supervisor, _signals) = build(config, &container, vec![15]);

        let (code, ()) = tokio::join!(supervisor.supervise(), async {
            let (socket, _) = listener.accept().await.unwrap();
            while !container.started() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            drop(socket);
        });

        assert_eq!(code.unwrap(), 0);
        assert_eq!(container.signals(), vec![Signal::SIGTERM]);
    }

    #[tokio::test]
    async fn test_attach_failure_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let server = HookServer::start(200).await;
        // the connection is queued by the kernel, no accept needed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(dir.path(), Some(&server.url));
        config.stdio = format!("tcp://{}", listener.local_addr().unwrap());
        let container = FakeContainer::with_console(&[]);
        let (supervisor, _signals) = build(config, &container, Vec::new());

        let err = supervisor.supervise().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Attach(_)));
        assert!(container.started());
        assert_eq!(container.signals(), vec![Signal::SIGKILL]);
        assert!(container.exited());
        assert!(container.destroyed());
        server.wait_for(2).await;
        assert_eq!(server.statuses(), vec!["starting", "crashed"]);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), None);
        config.command.clear();
        let err = Supervisor::new(config).run().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Config(ConfigError::MissingCommand)
        ));
        assert!(!dir.path().join("rootfs").exists());
    }
}
