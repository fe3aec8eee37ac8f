// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File-backed agent log sinks: one append-only `<agent>.log` per agent.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::domain::agent::AgentName;
use crate::domain::log_sink::{LogSink, LogSinkProvider};

pub struct FileLogSinkProvider {
    dir: PathBuf,
}

impl FileLogSinkProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, agent: &AgentName) -> PathBuf {
        let file_name: String = agent
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.log", file_name))
    }
}

impl LogSinkProvider for FileLogSinkProvider {
    fn open(&self, agent: &AgentName) -> io::Result<Box<dyn LogSink>> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(agent))?;
        Ok(Box::new(FileLogSink {
            writer: Some(BufWriter::new(file)),
        }))
    }
}

struct FileLogSink {
    writer: Option<BufWriter<File>>,
}

impl LogSink for FileLogSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "log sink is closed"))?;
        writeln!(writer, "{}", line)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileLogSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}
