//! Per-charge-point diagnostics log
//!
//! A bounded ring of log entries, filterable by level and kind. Every
//! recorded entry is also mirrored to `tracing` and published on the
//! event bus, so UIs and scenarios can follow `log.{kind}.{level}`
//! traffic live. `GetDiagnostics` snapshots this ring.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, SimEvent};
use crate::support::clock::SharedClock;

const DEFAULT_CAPACITY: usize = 1000;

/// Log severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which part of the simulator produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    System,
    Transport,
    Ocpp,
    Fsm,
    Scenario,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Transport => "transport",
            Self::Ocpp => "ocpp",
            Self::Fsm => "fsm",
            Self::Scenario => "scenario",
        }
    }
}

/// A recorded diagnostics entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub kind: LogKind,
    pub message: String,
}

/// Bounded diagnostics ring. One per charge point; never process-global.
pub struct DiagLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    /// Entries below this severity are dropped (not stored, not published).
    threshold: LogLevel,
    bus: EventBus,
    clock: SharedClock,
}

impl DiagLog {
    pub fn new(bus: EventBus, clock: SharedClock) -> Self {
        Self::with_capacity(bus, clock, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(bus: EventBus, clock: SharedClock, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            threshold: LogLevel::Debug,
            bus,
            clock,
        }
    }

    /// Drop entries less severe than `level`.
    pub fn with_threshold(mut self, level: LogLevel) -> Self {
        self.threshold = level;
        self
    }

    /// Record an entry, evicting the oldest on overflow.
    pub fn record(&self, level: LogLevel, kind: LogKind, message: impl Into<String>) {
        if level > self.threshold {
            return;
        }
        let message = message.into();

        match level {
            LogLevel::Error => error!(kind = kind.as_str(), "{message}"),
            LogLevel::Warning => warn!(kind = kind.as_str(), "{message}"),
            LogLevel::Info => info!(kind = kind.as_str(), "{message}"),
            LogLevel::Debug => debug!(kind = kind.as_str(), "{message}"),
        }

        let entry = LogEntry {
            timestamp: self.clock.now(),
            level,
            kind,
            message: message.clone(),
        };

        {
            let mut entries = self.entries.lock().unwrap();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }

        self.bus.publish(SimEvent::LogRecorded { level, kind, message });
    }

    /// Entries matching the given level/kind filters, oldest first.
    pub fn entries(&self, level: Option<LogLevel>, kind: Option<LogKind>) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| level.map_or(true, |l| e.level == l))
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Plain-text dump of the ring, one line per entry. This is the
    /// payload GetDiagnostics uploads.
    pub fn snapshot(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut out = String::with_capacity(entries.len() * 64);
        for e in entries.iter() {
            out.push_str(&format!(
                "{} [{}] {}: {}\n",
                e.timestamp.to_rfc3339(),
                e.level,
                e.kind.as_str(),
                e.message
            ));
        }
        out
    }
}
