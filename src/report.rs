//! Per-run log file.
//!
//! One `LogManager` per import run. Every line is timestamped and mirrored to
//! `tracing`. The file is always closed with a completion footer, either by
//! [`LogManager::close`] or on drop.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::ImportSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn label(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
pub struct LogManager {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LogManager {
    /// Create `import-YYYYMMDD-HHMMSS.log` under `dir`, creating `dir` if
    /// needed. A numeric suffix is added if a run in the same second already
    /// claimed the name.
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stem = format!("import-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("{stem}.log")
            } else {
                format!("{stem}-{suffix}.log")
            };
            let path = dir.join(name);
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    let mut log = Self {
                        path,
                        writer: Some(BufWriter::new(file)),
                    };
                    log.raw(&format!("{} Import log opened", stamp()));
                    return Ok(log);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref());
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(target: "pageview_import::run_log", "{message}"),
            LogLevel::Warn => warn!(target: "pageview_import::run_log", "{message}"),
            LogLevel::Error => error!(target: "pageview_import::run_log", "{message}"),
        }
        self.raw(&format!("{} [{}] {message}", stamp(), level.label()));
    }

    /// Append the final summary block.
    pub fn write_summary(&mut self, summary: &ImportSummary) {
        let ts = stamp();
        self.raw(&format!("{ts} ==================== IMPORT SUMMARY ===================="));
        for line in summary.to_string().lines() {
            self.raw(&format!("{ts} {line}"));
        }
        self.raw(&format!("{ts} ========================================================"));
    }

    /// Write the footer, flush and release the file. Safe to call twice.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writeln!(writer, "{} Import log closed", stamp())?;
        writer.flush()
    }

    fn raw(&mut self, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}") {
            error!(path = %self.path.display(), error = %e, "run log write failed");
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "closing run log failed");
        }
    }
}

fn stamp() -> String {
    format!("[{}]", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_timestamped_and_footer_written_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = LogManager::create(&dir.path().join("nested"))?;
        let path = log.path().to_path_buf();
        log.info("row 2 skipped");
        log.warn("batch 3 retried");
        log.close()?;
        log.close()?;
        log.error("after close is ignored");
        drop(log);

        let text = fs::read_to_string(&path)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.starts_with('[')));
        assert!(lines[1].contains("[INFO ] row 2 skipped"));
        assert!(lines[2].contains("[WARN ] batch 3 retried"));
        assert!(lines[3].ends_with("Import log closed"));
        Ok(())
    }

    #[test]
    fn drop_closes_with_footer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = {
            let mut log = LogManager::create(dir.path())?;
            log.error("fatal: missing file");
            log.path().to_path_buf()
        };
        let text = fs::read_to_string(path)?;
        assert!(text.trim_end().ends_with("Import log closed"));
        Ok(())
    }

    #[test]
    fn same_second_runs_get_distinct_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let a = LogManager::create(dir.path())?;
        let b = LogManager::create(dir.path())?;
        assert_ne!(a.path(), b.path());
        Ok(())
    }
}
