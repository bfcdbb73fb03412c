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

//! Standard input/output transport of the supervised process.
//!
//! A stream is opened from a URI:
//! * empty: the host terminal (stdin/stdout)
//! * `file://<path>`: append only sink, never interactive
//! * `tls://<host:port>` or `ssl://<host:port>`: TLS over TCP, the peer certificate is not checked
//! * `tcp://`, `tcp4://`, `tcp6://`, `unix://`: raw stream socket

mod prefix;

pub use prefix::{Color, LineProbe};

use crate::config::Prefix;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use serde::Serialize;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{watch, Mutex};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;
pub type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("invalid stdio uri {0:?}")]
    InvalidUri(String),
    #[error("unsupported stdio scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("no address to connect for {0}")]
    NoAddress(String),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("{0}: {1}")]
    Io(String, std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("tls handshake with {0}: {1}")]
    Handshake(String, openssl::ssl::Error),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Local,
    File,
    Tcp,
    Tls,
    Unix,
}

impl StreamKind {
    /// Non interactive streams never attach to the input of the container
    pub fn interactive(&self) -> bool {
        *self != StreamKind::File
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StreamKind::Tcp | StreamKind::Tls | StreamKind::Unix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

/// Split `scheme://address`. A URI without scheme separator is only valid when empty.
fn split_uri(uri: &str) -> Result<(&str, &str), StreamError> {
    if uri.is_empty() {
        return Ok(("", ""));
    }
    match uri.split_once("://") {
        Some((scheme, address)) if !scheme.is_empty() => Ok((scheme, address)),
        _ => Err(StreamError::InvalidUri(uri.to_string())),
    }
}

async fn dial_tcp(address: &str, family: Family) -> Result<TcpStream, StreamError> {
    let connect = async {
        let candidates = tokio::net::lookup_host(address)
            .await
            .map_err(|err| StreamError::Io(address.to_string(), err))?
            .filter(|addr: &SocketAddr| match family {
                Family::Any => true,
                Family::V4 => addr.is_ipv4(),
                Family::V6 => addr.is_ipv6(),
            })
            .collect::<Vec<_>>();

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("cannot connect to {candidate}: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => StreamError::Io(address.to_string(), err),
            None => StreamError::NoAddress(address.to_string()),
        })
    };
    tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| StreamError::Timeout(address.to_string()))?
}

async fn dial_tls(address: &str) -> Result<SslStream<TcpStream>, StreamError> {
    let tcp = dial_tcp(address, Family::Any).await?;
    let host = address
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');

    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    let mut config = builder.build().configure()?;
    config.set_verify_hostname(false);
    let ssl = config.into_ssl(host)?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|err| StreamError::Handshake(address.to_string(), err))?;
    Ok(stream)
}

/// Reader that reports end of file (or a read error) to the owner of the stream
struct EofNotify<R> {
    inner: R,
    eof: watch::Sender<bool>,
}

impl<R: AsyncRead + Unpin> AsyncRead for EofNotify<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let filled = buf.filled().len();
        let had_room = buf.remaining() > 0;
        let result = ready!(Pin::new(&mut self.inner).poll_read(cx, buf));
        let eof = match &result {
            Ok(()) => had_room && buf.filled().len() == filled,
            Err(_) => true,
        };
        if eof {
            self.eof.send_replace(true);
        }
        Poll::Ready(result)
    }
}

struct Output {
    writer: StreamWriter,
    probe: Option<LineProbe>,
}

pub struct StdioStream {
    kind: StreamKind,
    path: Option<PathBuf>,
    reader: std::sync::Mutex<Option<StreamReader>>,
    output: Mutex<Output>,
    /// Undecorated state, cloned for every source copied into the stream
    line_probe: Option<LineProbe>,
    closed: AtomicBool,
    remote_closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for StdioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioStream")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish()
    }
}

impl StdioStream {
    pub async fn open(uri: &str, prefix: Option<&Prefix>) -> Result<StdioStream, StreamError> {
        let (scheme, address) = split_uri(uri)?;
        debug!("opening stdio stream, scheme: {scheme:?}, address: {address:?}");
        let stream = match scheme {
            "" => StdioStream::from_parts(
                StreamKind::Local,
                Some(Box::new(tokio::io::stdin())),
                Box::new(tokio::io::stdout()),
                prefix,
            ),
            "file" => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .mode(0o600)
                    .open(address)
                    .map_err(|err| StreamError::Io(address.to_string(), err))?;
                let mut stream = StdioStream::from_parts(
                    StreamKind::File,
                    None,
                    Box::new(tokio::fs::File::from_std(file)),
                    prefix,
                );
                stream.path = Some(PathBuf::from(address));
                stream
            }
            "tls" | "ssl" => {
                let (reader, writer) = tokio::io::split(dial_tls(address).await?);
                StdioStream::from_parts(
                    StreamKind::Tls,
                    Some(Box::new(reader)),
                    Box::new(writer),
                    prefix,
                )
            }
            "tcp" | "tcp4" | "tcp6" => {
                let family = match scheme {
                    "tcp4" => Family::V4,
                    "tcp6" => Family::V6,
                    _ => Family::Any,
                };
                let (reader, writer) = dial_tcp(address, family).await?.into_split();
                StdioStream::from_parts(
                    StreamKind::Tcp,
                    Some(Box::new(reader)),
                    Box::new(writer),
                    prefix,
                )
            }
            "unix" => {
                let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(address))
                    .await
                    .map_err(|_| StreamError::Timeout(address.to_string()))?
                    .map_err(|err| StreamError::Io(address.to_string(), err))?;
                let (reader, writer) = stream.into_split();
                StdioStream::from_parts(
                    StreamKind::Unix,
                    Some(Box::new(reader)),
                    Box::new(writer),
                    prefix,
                )
            }
            other => return Err(StreamError::UnsupportedScheme(other.to_string())),
        };
        Ok(stream)
    }

    /// Assemble a stream out of already connected halves. The reader of a remote stream reports
    /// the remote end closing through [`StdioStream::remote_closed`].
    pub fn from_parts(
        kind: StreamKind,
        reader: Option<StreamReader>,
        writer: StreamWriter,
        prefix: Option<&Prefix>,
    ) -> StdioStream {
        let (eof, remote_closed) = watch::channel(false);
        let reader = reader.map(|reader| -> StreamReader {
            if kind.is_remote() {
                Box::new(EofNotify { inner: reader, eof })
            } else {
                reader
            }
        });
        let probe = prefix
            .filter(|prefix| !prefix.prefix.is_empty())
            .map(|prefix| LineProbe::new(prefix.prefix.clone(), prefix.color));
        StdioStream {
            kind,
            path: None,
            reader: std::sync::Mutex::new(reader),
            output: Mutex::new(Output {
                writer,
                probe: probe.clone(),
            }),
            line_probe: probe,
            closed: AtomicBool::new(false),
            remote_closed,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn interactive(&self) -> bool {
        self.kind.interactive()
    }

    /// Path of the sink of a `file://` stream
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The input side, handed out once to whoever feeds the container
    pub fn take_reader(&self) -> Option<StreamReader> {
        self.reader
            .lock()
            .map(|mut reader| reader.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn write(&self, buf: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut output = self.output.lock().await;
        let Output { writer, probe } = &mut *output;
        match probe {
            Some(probe) => writer.write_all(&probe.decorate(buf)).await?,
            None => writer.write_all(buf).await?,
        }
        writer.flush().await
    }

    async fn write_decorated(&self, buf: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut output = self.output.lock().await;
        output.writer.write_all(buf).await?;
        output.writer.flush().await
    }

    /// Copy everything from `reader` into the output side until end of file. Every source keeps
    /// its own line state, a line of one source never swallows the prefix of another.
    pub async fn copy_from<R: AsyncRead + Unpin>(&self, mut reader: R) -> std::io::Result<u64> {
        let mut probe = self.line_probe.clone();
        let mut buf = [0u8; 8192];
        let mut copied = 0u64;
        loop {
            let len = reader.read(&mut buf).await?;
            if len == 0 {
                return Ok(copied);
            }
            match probe.as_mut() {
                Some(probe) => self.write_decorated(&probe.decorate(&buf[..len])).await?,
                None => self.write_decorated(&buf[..len]).await?,
            }
            copied += len as u64;
        }
    }

    /// Resolves once the remote end of a socket stream closed, never for local streams
    pub async fn remote_closed(&self) {
        let mut receiver = self.remote_closed.clone();
        loop {
            let closed = *receiver.borrow_and_update();
            if closed {
                return;
            }
            if receiver.changed().await.is_err() {
                // the reader is gone without reaching end of file
                std::future::pending::<()>().await
            }
        }
    }

    /// Release the underlying descriptors, only the first call has any effect
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing {:?} stream", self.kind);
        drop(self.take_reader());
        let mut output = self.output.lock().await;
        if let Err(err) = output.writer.shutdown().await {
            warn!("error closing {:?} stream: {err}", self.kind);
        }
    }
}
