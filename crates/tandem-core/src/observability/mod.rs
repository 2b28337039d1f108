//! Observability - lifecycle event journal.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    /// Invocation that emitted the event
    pub run_id: Uuid,
    pub event_type: String,
    pub tier: Option<String>,
    pub pid: Option<u32>,
    pub message: String,
}

/// Appends JSON lines to the journal. Write failures never fail the run.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    events_path: PathBuf,
    run_id: Uuid,
}

impl EventEmitter {
    pub fn new(events_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn append(&self, event: &LifecycleEvent) -> std::io::Result<()> {
        if let Some(parent) = self.events_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;

        let line = serde_json::to_string(event)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }

    /// Emit an event about a tier.
    pub fn emit_tier(&self, event_type: &str, tier: &str, pid: Option<u32>, message: &str) {
        self.emit_event(event_type, Some(tier), pid, message);
    }

    /// Emit a run-level event.
    pub fn emit_simple(&self, event_type: &str, message: &str) {
        self.emit_event(event_type, None, None, message);
    }

    fn emit_event(&self, event_type: &str, tier: Option<&str>, pid: Option<u32>, message: &str) {
        let event = LifecycleEvent {
            timestamp: Utc::now(),
            run_id: self.run_id,
            event_type: event_type.to_string(),
            tier: tier.map(str::to_string),
            pid,
            message: message.to_string(),
        };
        if let Err(e) = self.append(&event) {
            tracing::debug!(path = %self.events_path.display(), error = %e, "Failed to write event");
        }
    }

    /// Read recent events.
    pub fn read_recent(&self, limit: usize) -> Vec<LifecycleEvent> {
        let file = match std::fs::File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let mut events: Vec<LifecycleEvent> = reader
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        // Return last N events
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }

        events
    }
}
