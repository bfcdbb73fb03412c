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

use crate::stream::{StdioStream, StreamKind};
use nix::sys::termios::Termios;
use pty_process::Console;
use std::io::IsTerminal;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bridges the pseudo-terminal of the container to a [`StdioStream`]
#[derive(Debug)]
pub struct ConsoleAttachment {
    console: Mutex<Option<Console>>,
    /// Host terminal state before switching to raw mode
    saved: Mutex<Option<Termios>>,
    closed: AtomicBool,
}

impl ConsoleAttachment {
    pub fn new(console: Console) -> ConsoleAttachment {
        let attachment = ConsoleAttachment {
            console: Mutex::new(Some(console)),
            saved: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if let Err(err) = attachment.resize() {
            debug!("cannot set initial console size: {err}");
        }
        attachment
    }

    /// Start copying console output into the stream and, if the stream has an input side, the
    /// stream input into the console. The copy tasks end with either side, the handle of the
    /// output copy is returned so that the caller can drain it.
    pub fn attach(&self, stream: Arc<StdioStream>) -> std::io::Result<JoinHandle<()>> {
        let Some(console) = locked(&self.console).clone() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };

        let output_stream = stream.clone();
        let output_console = console.clone();
        let output = tokio::spawn(async move {
            if let Err(err) = output_stream.copy_from(output_console).await {
                debug!("console output copy ended: {err}");
            }
            output_stream.close().await;
        });

        let Some(mut reader) = stream.take_reader() else {
            return Ok(output);
        };

        let kind = stream.kind();
        let mut input_console = console.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::io::copy(&mut reader, &mut input_console).await {
                debug!("console input copy ended: {err}");
            }
            // end of file on the host terminal must not cut the container output
            if kind.is_remote() {
                stream.close().await;
            }
        });

        match kind {
            StreamKind::Local => {
                let stdin = std::io::stdin();
                if stdin.is_terminal() {
                    let state = pty_process::term::enable_raw(stdin.as_fd())?;
                    *locked(&self.saved) = Some(state);
                }
            }
            kind if kind.is_remote() => console.disable_echo()?,
            _ => {}
        }
        Ok(output)
    }

    /// Propagate the window size of the host terminal to the console
    pub fn resize(&self) -> std::io::Result<()> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(());
        }
        let size = pty_process::term::get_winsize(stdin.as_fd())?;
        if let Some(console) = locked(&self.console).as_ref() {
            console.resize(&size)?;
        }
        Ok(())
    }

    /// Release the console and restore the host terminal, only the first call has any effect
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(locked(&self.console).take());
        if let Some(state) = locked(&self.saved).take() {
            if let Err(err) = pty_process::term::restore(std::io::stdin().as_fd(), &state) {
                warn!("cannot restore terminal state: {err}");
            }
        }
    }
}

impl Drop for ConsoleAttachment {
    fn drop(&mut self) {
        self.close();
    }
}
