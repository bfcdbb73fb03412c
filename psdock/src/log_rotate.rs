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

//! Periodic archival of a `file://` stdio sink. The live file is copied into
//! `<log>_<timestamp>.gz` then truncated, it is never removed since the stream keeps it open in
//! append mode.

use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const ROTATION_DELAY: Duration = Duration::from_secs(6 * 60 * 60);
pub const ARCHIVE_RETAIN_COUNT: usize = 5;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogArchive {
    pub log_file: PathBuf,
    pub retain: usize,
}

impl LogArchive {
    fn directory(&self) -> &Path {
        match self.log_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn archive_prefix(&self) -> String {
        let name = self
            .log_file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("{name}_")
    }

    /// Compress the current content of the log into a new archive, then empty the log
    pub fn rotate(&self, now: DateTime<Local>) -> std::io::Result<PathBuf> {
        let archive_path = self.directory().join(format!(
            "{}{}.gz",
            self.archive_prefix(),
            now.format(TIMESTAMP_FORMAT)
        ));
        let mut log = std::fs::File::open(&self.log_file)
            .map_err(|err| linux::tag_io_err(self.log_file.to_string_lossy(), err))?;
        let archive = std::fs::File::create(&archive_path)
            .map_err(|err| linux::tag_io_err(archive_path.to_string_lossy(), err))?;

        let mut encoder = GzEncoder::new(archive, Compression::default());
        std::io::copy(&mut log, &mut encoder)?;
        encoder.finish()?.sync_all()?;

        std::fs::OpenOptions::new()
            .write(true)
            .open(&self.log_file)?
            .set_len(0)?;
        Ok(archive_path)
    }

    /// Archives of this log, newest first
    pub fn archives(&self) -> std::io::Result<Vec<PathBuf>> {
        let prefix = self.archive_prefix();
        let mut archives = Vec::new();
        for entry in std::fs::read_dir(self.directory())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".gz") {
                archives.push(entry.path());
            }
        }
        archives.sort_by(|a, b| b.cmp(a));
        Ok(archives)
    }

    /// Delete the oldest archives beyond the retention count, returns what got deleted
    pub fn cleanup_old_archives(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut archives = self.archives()?;
        let stale = if archives.len() > self.retain {
            archives.split_off(self.retain)
        } else {
            Vec::new()
        };
        let mut deleted = Vec::with_capacity(stale.len());
        for archive in stale {
            match std::fs::remove_file(&archive) {
                Ok(()) => deleted.push(archive),
                Err(err) => error!("cannot delete log archive {archive:?}: {err}"),
            }
        }
        Ok(deleted)
    }

    fn tick(&self, now: DateTime<Local>) {
        info!("rotating {:?}", self.log_file);
        match self.rotate(now) {
            Ok(archive) => debug!("archived into {archive:?}"),
            Err(err) => error!("log rotation failed: {err}"),
        }
        if let Err(err) = self.cleanup_old_archives() {
            error!("log archive cleanup failed: {err}");
        }
    }
}

#[derive(Debug)]
pub struct LogRotator {
    archive: LogArchive,
    rotation_delay: Duration,
    stop: watch::Sender<bool>,
}

impl LogRotator {
    pub fn new(log_file: impl AsRef<Path>) -> LogRotator {
        let (stop, _) = watch::channel(false);
        LogRotator {
            archive: LogArchive {
                log_file: log_file.as_ref().to_path_buf(),
                retain: ARCHIVE_RETAIN_COUNT,
            },
            rotation_delay: ROTATION_DELAY,
            stop,
        }
    }

    pub fn with_rotation_delay(mut self, delay: Duration) -> Self {
        self.rotation_delay = delay;
        self
    }

    pub fn with_retain_count(mut self, retain: usize) -> Self {
        self.archive.retain = retain;
        self
    }

    pub fn archive(&self) -> &LogArchive {
        &self.archive
    }

    /// Rotate every `rotation_delay` until [`LogRotator::stop_watching`] is called
    pub async fn start_watching(&self) {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return;
        }
        let start = tokio::time::Instant::now() + self.rotation_delay;
        let mut interval = tokio::time::interval_at(start, self.rotation_delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let archive = self.archive.clone();
                    let result =
                        tokio::task::spawn_blocking(move || archive.tick(Local::now())).await;
                    if let Err(err) = result {
                        error!("log rotation task failed: {err}");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    pub fn stop_watching(&self) {
        self.stop.send_replace(true);
    }
}
