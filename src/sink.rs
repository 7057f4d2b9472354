//! Persistence of identities and entries to per-day log files.
//!
//! Layout: `<directory>/<yyyy-mm-dd>/<hostName>.log`, one line per entry.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::Result;
use crate::protocol::{Identity, ReceivedEntity};
use crate::render::Renderer;

pub trait Persistence: Send + Sync {
    fn save_identity(&self, identity: &Identity) -> Result<()>;
    fn save_entity(&self, entry: &ReceivedEntity) -> Result<()>;
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

pub struct FileSink {
    directory: PathBuf,
    renderer: Renderer,
}

impl FileSink {
    pub fn new(directory: impl AsRef<Path>, renderer: Renderer) -> Self {
        Self {
            directory: expand_tilde(directory.as_ref()),
            renderer,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File holding `host_name`'s entries for the day of `at`.
    pub fn log_file(&self, host_name: &str, at: DateTime<Local>) -> PathBuf {
        self.directory
            .join(at.format("%Y-%m-%d").to_string())
            .join(format!("{}.log", file_stem(host_name)))
    }

    fn append(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

impl Persistence for FileSink {
    fn save_identity(&self, identity: &Identity) -> Result<()> {
        let now = Local::now();
        let banner = format!(
            "==== {} ({}) approved at {} ====",
            identity.host_name(),
            identity.device_id(),
            now.format("%Y-%m-%d %H:%M:%S")
        );
        self.append(&self.log_file(identity.host_name(), now), &banner)
    }

    fn save_entity(&self, entry: &ReceivedEntity) -> Result<()> {
        let path = self.log_file(entry.identity.host_name(), entry.entity.datetime());
        self.append(&path, &self.renderer.raw_line(&entry.entity))
    }
}

/// Host names become file names: path separators and line breaks dropped.
fn file_stem(host_name: &str) -> String {
    let stem: String = host_name
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '/' | '\\'))
        .collect();
    if stem.trim().is_empty() {
        "unknown".to_string()
    } else {
        stem
    }
}
