// src/resume.rs
//! Resume checkpointing.
//!
//! The controller tracks per-template progress while the scan runs. On a
//! graceful stop the engine drains in-flight work and persists a snapshot;
//! nothing is written from signal context — the signal handler only flips
//! the cancellation flag and the main loop does the I/O.
//!
//! Restore re-enqueues in-flight targets (at-least-once; the output
//! writer's dedup absorbs repeats) and skips targets already completed.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::error::TemplarError;
use crate::input::MetaInput;

/// Persisted snapshot of one scan's progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeCfg {
    pub scan_id: String,
    pub per_template: HashMap<String, TemplateProgress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateProgress {
    pub in_flight: HashSet<MetaInput>,
    pub completed_count: u64,
}

impl ResumeCfg {
    pub fn load(path: &Path) -> Result<Self, TemplarError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TemplarError::Config(format!("cannot read resume file {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Whether (template, target at position `index`) still needs to run.
    /// Targets inside the completed prefix run again only when they were
    /// recorded in flight.
    pub fn should_run(&self, template_id: &str, index: u64, target: &MetaInput) -> bool {
        match self.per_template.get(template_id) {
            Some(progress) => {
                index >= progress.completed_count || progress.in_flight.contains(target)
            }
            None => true,
        }
    }
}

/// Live progress tracker, snapshot source for the resume file
pub struct ResumeController {
    scan_id: String,
    state: Mutex<HashMap<String, TemplateProgress>>,
}

impl ResumeController {
    pub fn new() -> Self {
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Continue a previous scan's identity and progress
    pub fn from_cfg(cfg: &ResumeCfg) -> Self {
        Self {
            scan_id: cfg.scan_id.clone(),
            state: Mutex::new(cfg.per_template.clone()),
        }
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn mark_started(&self, template_id: &str, target: &MetaInput) {
        let mut state = self.state.lock().expect("resume state poisoned");
        state
            .entry(template_id.to_string())
            .or_default()
            .in_flight
            .insert(target.clone());
    }

    pub fn mark_completed(&self, template_id: &str, target: &MetaInput) {
        let mut state = self.state.lock().expect("resume state poisoned");
        let progress = state.entry(template_id.to_string()).or_default();
        if progress.in_flight.remove(target) {
            progress.completed_count += 1;
        }
    }

    /// Snapshot the current progress
    pub fn capture(&self) -> ResumeCfg {
        let state = self.state.lock().expect("resume state poisoned");
        ResumeCfg {
            scan_id: self.scan_id.clone(),
            per_template: state.clone(),
        }
    }

    /// Persist the snapshot as a single pretty JSON document
    pub fn save(&self, path: &Path) -> Result<(), TemplarError> {
        let cfg = self.capture();
        let raw = serde_json::to_string_pretty(&cfg)?;
        std::fs::write(path, raw).map_err(|e| {
            TemplarError::Fatal(format!(
                "cannot write resume file {}: {}",
                path.display(),
                e
            ))
        })?;
        info!("resume state written to {}", path.display());
        Ok(())
    }
}

impl Default for ResumeController {
    fn default() -> Self {
        Self::new()
    }
}
