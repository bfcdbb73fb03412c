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

//! Relay of host signals to the supervised process.
//!
//! SIGINT and SIGTERM are special: the supervised process often runs as pid 1 of its own
//! namespace, where signals without an installed handler are silently dropped. Unless the process
//! is known to catch the signal, it is replaced by SIGKILL.

use crate::console::ConsoleAttachment;
use crate::container::{poll_init_pid, Container, PID_POLL_ATTEMPTS, PID_POLL_DELAY};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use linux::proc::{ProcError, ProcStatus};
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Signals received by the supervisor and handed to the forwarder. SIGKILL and SIGSTOP cannot be
/// caught, SIGCHLD, SIGPIPE and the fault signals are about the supervisor itself.
pub const HANDLED_SIGNALS: [Signal; 18] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
    Signal::SIGALRM,
    Signal::SIGPWR,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGURG,
    Signal::SIGTSTP,
    Signal::SIGCONT,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

#[async_trait]
pub trait StatusInspector: Send + Sync {
    async fn inspect(&self, pid: u32) -> Result<ProcStatus, ProcError>;
}

/// Reads `/proc/<pid>/status`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcInspector;

#[async_trait]
impl StatusInspector for ProcInspector {
    async fn inspect(&self, pid: u32) -> Result<ProcStatus, ProcError> {
        tokio::task::spawn_blocking(move || ProcStatus::from_pid(pid))
            .await
            .map_err(|err| ProcError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
    }
}

/// Install handlers for [`HANDLED_SIGNALS`] and merge them into a single queue
pub fn os_signals() -> std::io::Result<mpsc::UnboundedReceiver<Signal>> {
    let mut sources = Vec::with_capacity(HANDLED_SIGNALS.len());
    for sig in HANDLED_SIGNALS {
        let listener = signal(SignalKind::from_raw(sig as i32))?;
        sources.push(
            stream::unfold(listener, move |mut listener| async move {
                listener.recv().await.map(|()| (sig, listener))
            })
            .boxed(),
        );
    }
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut merged = stream::select_all(sources);
        while let Some(sig) = merged.next().await {
            if tx.send(sig).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward(Signal),
    Kill,
}

pub struct SignalForwarder {
    container: Arc<dyn Container>,
    console: Option<Arc<ConsoleAttachment>>,
    inspector: Arc<dyn StatusInspector>,
    force_killed: Arc<AtomicBool>,
    kill_timeout: Option<Duration>,
    pid_poll_delay: Duration,
    pid_poll_attempts: usize,
}

impl SignalForwarder {
    pub fn new(container: Arc<dyn Container>) -> SignalForwarder {
        SignalForwarder {
            container,
            console: None,
            inspector: Arc::new(ProcInspector),
            force_killed: Arc::new(AtomicBool::new(false)),
            kill_timeout: None,
            pid_poll_delay: PID_POLL_DELAY,
            pid_poll_attempts: PID_POLL_ATTEMPTS,
        }
    }

    pub fn with_console(mut self, console: Option<Arc<ConsoleAttachment>>) -> Self {
        self.console = console;
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn StatusInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// SIGKILL the process if it is still around `timeout` after an interrupt got forwarded
    pub fn with_kill_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_pid_polling(mut self, delay: Duration, attempts: usize) -> Self {
        self.pid_poll_delay = delay;
        self.pid_poll_attempts = attempts;
        self
    }

    /// True once an interrupt has been escalated to SIGKILL
    pub fn force_killed(&self) -> bool {
        self.force_killed.load(Ordering::Acquire)
    }

    /// Handle signals one at a time until the source is exhausted
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        while let Some(sig) = signals.recv().await {
            self.handle(sig).await;
        }
    }

    pub async fn handle(&self, sig: Signal) {
        debug!("received {sig}");
        match sig {
            Signal::SIGWINCH => {
                if let Some(console) = &self.console {
                    if let Err(err) = console.resize() {
                        warn!("cannot resize console: {err}");
                    }
                }
            }
            Signal::SIGINT | Signal::SIGTERM => {
                self.interrupt(sig).await;
            }
            sig => self.forward(sig).await,
        }
    }

    pub async fn decide(&self, sig: Signal) -> Decision {
        let pid = poll_init_pid(
            self.container.as_ref(),
            self.pid_poll_delay,
            self.pid_poll_attempts,
        )
        .await;
        let Some(pid) = pid else {
            debug!("no pid for the process, it probably exited already");
            return Decision::Forward(sig);
        };
        match self.inspector.inspect(pid).await {
            Ok(status) if status.signal_caught(sig) => {
                info!("{sig} is caught by {pid}, forwarding");
                Decision::Forward(sig)
            }
            Ok(_) => {
                info!("{sig} is not caught by {pid}, killing");
                Decision::Kill
            }
            Err(err) if err.is_not_found() => Decision::Forward(sig),
            Err(err) => {
                error!("cannot inspect signal disposition of {pid}: {err}");
                Decision::Forward(sig)
            }
        }
    }

    pub async fn interrupt(&self, sig: Signal) {
        match self.decide(sig).await {
            Decision::Kill => {
                self.force_killed.store(true, Ordering::Release);
                self.forward(Signal::SIGKILL).await;
            }
            Decision::Forward(sig) => {
                self.forward(sig).await;
                if let Some(timeout) = self.kill_timeout {
                    self.schedule_kill(timeout);
                }
            }
        }
    }

    fn schedule_kill(&self, timeout: Duration) {
        let container = self.container.clone();
        let force_killed = self.force_killed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Ok(state) = container.state().await else {
                return;
            };
            if state.init_pid.is_none() {
                return;
            }
            warn!("process still running {timeout:?} after interrupt, killing");
            force_killed.store(true, Ordering::Release);
            if let Err(err) = container.signal(Signal::SIGKILL).await {
                debug!("cannot kill process: {err}");
            }
        });
    }

    async fn forward(&self, sig: Signal) {
        if let Err(err) = self.container.signal(sig).await {
            warn!("cannot forward {sig}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ExitStatus, ProcessSpec};
    use crate::testutil::{FakeContainer, FakeInspector};

    fn spec() -> ProcessSpec {
        ProcessSpec {
            args: vec!["app".to_string()],
            env: Vec::new(),
            user: "root".to_string(),
            cwd: None,
            console: false,
        }
    }

    async fn started(handled: &[Signal]) -> Arc<FakeContainer> {
        let container = FakeContainer::new(handled);
        container.start(&spec()).await.unwrap();
        container
    }

    fn forwarder(container: &Arc<FakeContainer>, caught: Option<Vec<i32>>) -> SignalForwarder {
        SignalForwarder::new(container.clone())
            .with_inspector(Arc::new(FakeInspector { caught }))
            .with_pid_polling(Duration::from_millis(1), 3)
    }

    #[tokio::test]
    async fn test_caught_interrupt_is_forwarded() {
        let container = started(&[Signal::SIGTERM]).await;
        let forwarder = forwarder(&container, Some(vec![2, 15]));
        forwarder.handle(Signal::SIGTERM).await;
        assert_eq!(container.signals(), vec![Signal::SIGTERM]);
        assert!(!forwarder.force_killed());
        assert_eq!(container.wait().await.unwrap(), ExitStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_uncaught_interrupt_is_escalated() {
        let container = started(&[]).await;
        let forwarder = forwarder(&container, Some(vec![1, 10]));
        forwarder.handle(Signal::SIGINT).await;
        assert_eq!(container.signals(), vec![Signal::SIGKILL]);
        assert!(forwarder.force_killed());
        assert_eq!(
            container.wait().await.unwrap(),
            ExitStatus::Signaled(Signal::SIGKILL as i32)
        );
    }

    #[tokio::test]
    async fn test_missing_pid_falls_back_to_forward() {
        let container = FakeContainer::new(&[]);
        let forwarder = forwarder(&container, Some(Vec::new()));
        forwarder.handle(Signal::SIGTERM).await;
        assert_eq!(container.signals(), vec![Signal::SIGTERM]);
        assert!(!forwarder.force_killed());
    }

    #[tokio::test]
    async fn test_vanished_process_falls_back_to_forward() {
        let container = started(&[]).await;
        let forwarder = forwarder(&container, None);
        assert_eq!(
            forwarder.decide(Signal::SIGINT).await,
            Decision::Forward(Signal::SIGINT)
        );
        forwarder.handle(Signal::SIGINT).await;
        assert_eq!(container.signals(), vec![Signal::SIGINT]);
        assert!(!forwarder.force_killed());
    }

    #[tokio::test]
    async fn test_other_signals() {
        let container = started(&[]).await;
        let forwarder = forwarder(&container, Some(Vec::new()));
        forwarder.handle(Signal::SIGWINCH).await;
        forwarder.handle(Signal::SIGUSR1).await;
        forwarder.handle(Signal::SIGHUP).await;
        assert_eq!(container.signals(), vec![Signal::SIGUSR1, Signal::SIGHUP]);
        assert!(!forwarder.force_killed());
    }

    #[tokio::test]
    async fn test_kill_timeout() {
        // the handler is installed but does not stop the process
        let container = started(&[]).await;
        let forwarder = forwarder(&container, Some(vec![15]))
            .with_kill_timeout(Some(Duration::from_millis(50)));
        forwarder.handle(Signal::SIGTERM).await;
        assert_eq!(container.signals(), vec![Signal::SIGTERM]);
        let status = tokio::time::timeout(Duration::from_secs(5), container.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ExitStatus::Signaled(Signal::SIGKILL as i32));
        assert_eq!(container.signals(), vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert!(forwarder.force_killed());
    }

    #[tokio::test]
    async fn test_run_consumes_queue_in_order() {
        let container = started(&[]).await;
        let forwarder = forwarder(&container, Some(vec![2]));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Signal::SIGUSR2).unwrap();
        tx.send(Signal::SIGINT).unwrap();
        tx.send(Signal::SIGQUIT).unwrap();
        drop(tx);
        forwarder.run(rx).await;
        assert_eq!(
            container.signals(),
            vec![Signal::SIGUSR2, Signal::SIGINT, Signal::SIGQUIT]
        );
    }

    #[tokio::test]
    async fn test_job_control_and_resource_signals_are_forwarded() {
        for sig in [
            Signal::SIGPWR,
            Signal::SIGXCPU,
            Signal::SIGVTALRM,
            Signal::SIGPROF,
            Signal::SIGURG,
            Signal::SIGTSTP,
        ] {
            assert!(HANDLED_SIGNALS.contains(&sig), "{sig} is not handled");
        }
        for sig in [Signal::SIGKILL, Signal::SIGSTOP, Signal::SIGCHLD, Signal::SIGPIPE] {
            assert!(!HANDLED_SIGNALS.contains(&sig), "{sig} must not be handled");
        }

        let container = started(&[]).await;
        let forwarder = forwarder(&container, Some(Vec::new()));
        forwarder.handle(Signal::SIGPWR).await;
        forwarder.handle(Signal::SIGXCPU).await;
        assert_eq!(container.signals(), vec![Signal::SIGPWR, Signal::SIGXCPU]);
    }

    #[test]
    fn test_proc_inspector_reads_own_status() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let status = runtime
            .block_on(ProcInspector.inspect(std::process::id()))
            .unwrap();
        assert_eq!(status.pid, std::process::id());
    }
}
