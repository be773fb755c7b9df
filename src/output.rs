// src/output.rs
//! Result events and the fan-out output writer.
//!
//! The writer deduplicates by (template, matched location, matcher,
//! extracted values) and forwards every surviving event to all registered
//! sinks in write order. A failing sink is logged once and never stops the
//! others.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::error::TemplarError;
use crate::templates::model::{Info, Severity};

/// One published finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(rename = "template-id")]
    pub template_id: String,
    #[serde(rename = "template-path", skip_serializing_if = "String::is_empty")]
    pub template_path: String,
    pub info: Info,
    #[serde(rename = "matcher-name", skip_serializing_if = "Option::is_none")]
    pub matcher_name: Option<String>,
    #[serde(
        rename = "extracted-results",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub extracted_results: Vec<String>,
    pub host: String,
    #[serde(rename = "matched-at")]
    pub matched_at: String,
    #[serde(rename = "type")]
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub timestamp: String,
}

impl ResultEvent {
    fn dedup_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.template_id.hash(&mut hasher);
        self.matched_at.hash(&mut hasher);
        self.matcher_name.hash(&mut hasher);
        let mut extracted = self.extracted_results.clone();
        extracted.sort();
        extracted.hash(&mut hasher);
        hasher.finish()
    }

    pub fn severity(&self) -> Severity {
        self.info.severity
    }
}

/// A single destination for result events
pub trait OutputSink: Send {
    fn write_event(&mut self, event: &ResultEvent) -> Result<(), TemplarError>;
    fn flush(&mut self) -> Result<(), TemplarError> {
        Ok(())
    }
}

/// Colorized plain-text sink for terminals
pub struct TextSink {
    colored: bool,
}

impl TextSink {
    pub fn new(colored: bool) -> Self {
        Self { colored }
    }

    fn severity_color(severity: Severity) -> &'static str {
        match severity {
            Severity::Critical => "\x1b[1;31m",
            Severity::High => "\x1b[31m",
            Severity::Medium => "\x1b[33m",
            Severity::Low => "\x1b[36m",
            Severity::Info => "\x1b[34m",
            Severity::Unknown => "\x1b[90m",
        }
    }
}

impl OutputSink for TextSink {
    fn write_event(&mut self, event: &ResultEvent) -> Result<(), TemplarError> {
        let line = if self.colored {
            format!(
                "[\x1b[32m{}\x1b[0m] [{}] [{}{}\x1b[0m] {}{}",
                event.template_id,
                event.protocol,
                Self::severity_color(event.severity()),
                event.severity(),
                event.matched_at,
                if event.extracted_results.is_empty() {
                    String::new()
                } else {
                    format!(" \x1b[90m{:?}\x1b[0m", event.extracted_results)
                }
            )
        } else {
            format!(
                "[{}] [{}] [{}] {}{}",
                event.template_id,
                event.protocol,
                event.severity(),
                event.matched_at,
                if event.extracted_results.is_empty() {
                    String::new()
                } else {
                    format!(" {:?}", event.extracted_results)
                }
            )
        };
        println!("{}", line);
        Ok(())
    }
}

/// NDJSON sink: one JSON object per line, stable field names
pub struct JsonSink;

impl OutputSink for JsonSink {
    fn write_event(&mut self, event: &ResultEvent) -> Result<(), TemplarError> {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    }
}

/// File sink: NDJSON into a results file
pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self, TemplarError> {
        let file = std::fs::File::create(path).map_err(|e| {
            TemplarError::Fatal(format!("cannot write output file {}: {}", path.display(), e))
        })?;
        Ok(Self { file })
    }
}

impl OutputSink for FileSink {
    fn write_event(&mut self, event: &ResultEvent) -> Result<(), TemplarError> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{}", line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TemplarError> {
        self.file.flush()?;
        Ok(())
    }
}

/// In-memory sink used by tests and the SDK callback path
#[derive(Default, Clone)]
pub struct MemorySink {
    pub events: std::sync::Arc<Mutex<Vec<ResultEvent>>>,
}

impl MemorySink {
    pub fn collected(&self) -> Vec<ResultEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }
}

impl OutputSink for MemorySink {
    fn write_event(&mut self, event: &ResultEvent) -> Result<(), TemplarError> {
        self.events
            .lock()
            .expect("memory sink poisoned")
            .push(event.clone());
        Ok(())
    }
}

struct WriterState {
    sinks: Vec<Box<dyn OutputSink>>,
    seen: HashSet<u64>,
    failed_sinks: HashSet<usize>,
    warned: HashSet<String>,
    closed: bool,
}

/// Deduplicated multi-sink writer
pub struct OutputWriter {
    state: Mutex<WriterState>,
}

impl OutputWriter {
    pub fn new(sinks: Vec<Box<dyn OutputSink>>) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sinks,
                seen: HashSet::new(),
                failed_sinks: HashSet::new(),
                warned: HashSet::new(),
                closed: false,
            }),
        }
    }

    /// Register an additional sink; it only sees events written after
    /// this call.
    pub fn add_sink(&self, sink: Box<dyn OutputSink>) {
        self.state
            .lock()
            .expect("output writer poisoned")
            .sinks
            .push(sink);
    }

    /// Forward an event to every sink. Returns true when the event was new
    /// and published; duplicates are dropped silently.
    pub fn write(&self, event: &ResultEvent) -> bool {
        let mut state = self.state.lock().expect("output writer poisoned");
        if state.closed || !state.seen.insert(event.dedup_key()) {
            return false;
        }

        for index in 0..state.sinks.len() {
            if state.failed_sinks.contains(&index) {
                continue;
            }
            if let Err(e) = state.sinks[index].write_event(event) {
                warn!("output sink {} failed, disabling it: {}", index, e);
                state.failed_sinks.insert(index);
            }
        }
        true
    }

    /// Log a warning at most once per distinct message
    pub fn warn_once(&self, message: &str) {
        let mut state = self.state.lock().expect("output writer poisoned");
        if state.warned.insert(message.to_string()) {
            warn!("{}", message);
        }
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().expect("output writer poisoned").seen.len()
    }

    /// Flush all sinks; safe to call more than once
    pub fn close(&self) {
        let mut state = self.state.lock().expect("output writer poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        for sink in &mut state.sinks {
            if let Err(e) = sink.flush() {
                warn!("output sink flush failed: {}", e);
            }
        }
    }
}
