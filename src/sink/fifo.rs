// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named-pipe sinks for TS and status output. A FIFO with no reader is a
//! normal condition: opens are non-blocking, a failed open just marks the
//! sink not ready and is retried on demand, and a reader going away (EPIPE)
//! silently closes the file until the next retry. SIGPIPE is ignored
//! process-wide so the write error surfaces here instead of killing the
//! process.

use log::{debug, info};
use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

pub struct FifoWriter {
    path: String,
    file: Option<File>,
}

impl FifoWriter {
    /// Create the FIFO if needed and try a first open. Not having a reader
    /// yet is fine.
    pub fn new(path: &str) -> FifoWriter {
        if !Path::new(path).exists() {
            match nix::unistd::mkfifo(
                path,
                Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
            ) {
                Ok(()) => info!("created FIFO {}", path),
                Err(e) => debug!("mkfifo {} failed: {}", path, e),
            }
        }
        let mut writer = FifoWriter {
            path: path.to_string(),
            file: None,
        };
        writer.try_open();
        writer
    }

    /// Non-blocking open; ENXIO means nobody is reading yet.
    pub fn try_open(&mut self) -> bool {
        if self.file.is_some() {
            return true;
        }
        match OpenOptions::new()
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(&self.path)
        {
            Ok(file) => {
                info!("FIFO {} opened", self.path);
                self.file = Some(file);
                true
            }
            Err(e) => {
                debug!("FIFO {} not ready: {}", self.path, e);
                false
            }
        }
    }

    /// Write, dropping the file on error so a later write re-opens. Data
    /// lost while no reader is attached is intentional.
    pub fn write(&mut self, data: &[u8]) {
        if self.file.is_none() && !self.try_open() {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(data) {
                debug!("FIFO {} write failed ({}), closing", self.path, e);
                self.file = None;
            }
        }
    }

    pub fn write_line(&mut self, line: &str) {
        self.write(line.as_bytes());
    }
}
