//! Append-only notification export (spec §4.4, §6.4).
//!
//! Each allow-listed topic gets its own `{topic}.jsonl` file under the
//! working directory; one JSON document per line, flushed after every
//! write. I/O failures are logged once per file and then silently ignored,
//! matching the original `notification_export_thread`'s "never let export
//! problems take down the control plane" stance.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::message::Notification;

struct ExportFile {
    file: File,
    failed: bool,
}

/// Writes allow-listed notifications to `{directory}/{topic}.jsonl`.
#[derive(Debug)]
pub struct NotificationExporter {
    directory: PathBuf,
    allowed: HashSet<String>,
    files: DashMap<String, Mutex<ExportFile>>,
}

impl std::fmt::Debug for ExportFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportFile").field("failed", &self.failed).finish()
    }
}

impl NotificationExporter {
    /// Creates an exporter writing under `directory` for the given set of
    /// topics. The directory is created if missing.
    pub fn new(directory: impl Into<PathBuf>, allowed: impl IntoIterator<Item = String>) -> std::io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            allowed: allowed.into_iter().collect(),
            files: DashMap::new(),
        })
    }

    /// Whether `topic` is configured for export.
    pub fn exports(&self, topic: &str) -> bool {
        self.allowed.contains(topic)
    }

    /// Appends `notification`, opening the topic's file on first use.
    /// Silently no-ops for topics not in the allow-list.
    pub fn append(&self, notification: &Notification) {
        if !self.exports(&notification.topic) {
            return;
        }
        let line = match serde_json::to_string(notification) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(topic = %notification.topic, error = %err, "failed to serialize notification for export");
                return;
            }
        };

        if !self.files.contains_key(&notification.topic) {
            match self.open(&notification.topic) {
                Ok(file) => {
                    self.files
                        .insert(notification.topic.clone(), Mutex::new(ExportFile { file, failed: false }));
                }
                Err(err) => {
                    tracing::warn!(topic = %notification.topic, error = %err, "failed to open notification export file");
                    return;
                }
            }
        }

        let entry = match self.files.get(&notification.topic) {
            Some(entry) => entry,
            None => return,
        };

        let mut guard = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = writeln!(guard.file, "{line}").and_then(|_| guard.file.flush()) {
            if !guard.failed {
                tracing::warn!(topic = %notification.topic, error = %err, "notification export write failed; further failures on this topic are suppressed");
                guard.failed = true;
            }
        }
    }

    fn open(&self, topic: &str) -> std::io::Result<File> {
        let path = self.path_for(topic);
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn path_for(&self, topic: &str) -> PathBuf {
        self.directory.join(format!("{topic}.jsonl"))
    }

    /// The directory notifications are written under.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
