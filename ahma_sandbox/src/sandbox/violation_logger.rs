//! Durable, size-rotated violation log.
//!
//! One line per violation:
//!
//! ```text
//! 2025-01-15 10:30:45 VIOLATION process=cat operation=file-read target=/Users/me/.ssh/id_rsa
//! ```
//!
//! When the next line would push the active file past the size limit, the
//! file is shifted to `<name>.1`, older generations move up by one, and the
//! oldest beyond the retention count is deleted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::violations::Violation;

pub const MAX_LOG_BYTES: u64 = 512 * 1024;
pub const MAX_BACKUPS: usize = 3;

#[derive(Debug)]
pub struct ViolationLogger {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
    max_backups: usize,
}

impl ViolationLogger {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_limits(path, MAX_LOG_BYTES, MAX_BACKUPS)
    }

    pub fn with_limits(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        max_backups: usize,
    ) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            size,
            max_bytes,
            max_backups,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, violation: &Violation) -> io::Result<()> {
        let line = format_line(violation);
        if self.size > 0 && self.size + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.size += line.len() as u64;
        Ok(())
    }

    pub fn close(mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let oldest = backup_path(&self.path, self.max_backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for generation in (1..self.max_backups).rev() {
                let from = backup_path(&self.path, generation);
                if from.exists() {
                    fs::rename(&from, backup_path(&self.path, generation + 1))?;
                }
            }
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        }

        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `deny.log` → `deny.log.<generation>`
pub fn backup_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

pub fn format_line(violation: &Violation) -> String {
    format!(
        "{} VIOLATION process={} operation={} target={}\n",
        violation.timestamp.format("%Y-%m-%d %H:%M:%S"),
        violation.process,
        violation.operation,
        violation.target
    )
}
