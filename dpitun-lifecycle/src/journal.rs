//! Bounded list of human-readable lifecycle lines.
//!
//! Every entry is also emitted to `tracing` under the `dpitun::journal` target.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::Serialize;
use strum::Display;
use tracing::{error, info, warn};

use crate::classifier::strip_ansi;

pub const JOURNAL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JournalLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    pub at: DateTime<Local>,
    pub level: JournalLevel,
    pub message: String,
}

impl JournalEntry {
    /// `[HH:MM:SS] message`
    pub fn to_line(&self) -> String {
        format!("[{}] {}", self.at.format("%H:%M:%S"), self.message)
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
}

impl Default for Journal {
    fn default() -> Self {
        Self::with_capacity(JOURNAL_CAPACITY)
    }
}

impl Journal {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a line. Blank messages are ignored.
    pub fn push(&mut self, level: JournalLevel, message: impl AsRef<str>) {
        let message = strip_ansi(message.as_ref()).trim_end().to_string();
        if message.trim().is_empty() {
            return;
        }

        match level {
            JournalLevel::Info | JournalLevel::Success => info!(target: "dpitun::journal", "{}", message),
            JournalLevel::Warn => warn!(target: "dpitun::journal", "{}", message),
            JournalLevel::Error => error!(target: "dpitun::journal", "{}", message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(JournalEntry {
            at: Local::now(),
            level,
            message,
        });
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.push(JournalLevel::Info, message);
    }

    pub fn success(&mut self, message: impl AsRef<str>) {
        self.push(JournalLevel::Success, message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        self.push(JournalLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.push(JournalLevel::Error, message);
    }

    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// One line per entry, oldest first.
    pub fn export(&self) -> String {
        self.entries
            .iter()
            .map(JournalEntry::to_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
