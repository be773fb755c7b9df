// src/input.rs
//! Target inputs and the deduplicating input provider.
//!
//! Targets come from `-u` values, a `-l` list file, or stdin. Each unique
//! target is iterated at most once; uniqueness is the hash of the whole
//! `MetaInput`, so the same URL with a different custom IP is a distinct
//! target.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use crate::error::TemplarError;

/// One scan target, immutable after construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaInput {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl MetaInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            custom_ip: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_ip(input: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            custom_ip: Some(ip.into()),
            headers: BTreeMap::new(),
        }
    }

    /// Host portion of the input, for host-keyed caches
    pub fn host(&self) -> String {
        if let Ok(url) = url::Url::parse(&self.input) {
            if let Some(host) = url.host_str() {
                return host.to_string();
            }
        }
        // Bare host or host:port
        self.input
            .split(':')
            .next()
            .unwrap_or(&self.input)
            .to_string()
    }
}

impl fmt::Display for MetaInput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.custom_ip {
            Some(ip) => write!(f, "{} [{}]", self.input, ip),
            None => write!(f, "{}", self.input),
        }
    }
}

/// Optional liveness probe applied when a target is added with probing
/// enabled. The default implementation accepts everything unchanged.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns the (possibly rewritten) input, or `None` if the target is
    /// dead and should not be added.
    async fn probe(&self, input: &str) -> Option<String>;
}

pub struct NoopProbe;

#[async_trait]
impl LivenessProbe for NoopProbe {
    async fn probe(&self, input: &str) -> Option<String> {
        Some(input.to_string())
    }
}

/// Iterable, deduplicated source of targets
#[derive(Default)]
pub struct InputProvider {
    targets: Vec<MetaInput>,
    seen: HashSet<MetaInput>,
}

impl InputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single target; duplicates are dropped silently.
    pub fn add(&mut self, target: MetaInput) {
        let trimmed = target.input.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return;
        }
        let target = MetaInput {
            input: trimmed.to_string(),
            ..target
        };
        if self.seen.insert(target.clone()) {
            self.targets.push(target);
        }
    }

    /// Add a target after passing it through a liveness probe.
    pub async fn add_with_probe(&mut self, input: &str, probe: &dyn LivenessProbe) {
        if let Some(rewritten) = probe.probe(input).await {
            self.add(MetaInput::new(rewritten));
        }
    }

    /// Load newline-separated targets from a file. Blank lines and `#`
    /// comments are skipped.
    pub fn load_file(&mut self, path: &Path) -> Result<(), TemplarError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TemplarError::Config(format!("could not read target list {}: {}", path.display(), e))
        })?;
        for line in content.lines() {
            self.add(MetaInput::new(line));
        }
        Ok(())
    }

    /// Load targets from any reader (stdin)
    pub fn load_reader(&mut self, reader: impl BufRead) -> Result<(), TemplarError> {
        for line in reader.lines() {
            self.add(MetaInput::new(line?));
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = &MetaInput> {
        self.targets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let mut provider = InputProvider::new();
        provider.add(MetaInput::new("http://a.test"));
        provider.add(MetaInput::new("http://b.test"));
        provider.add(MetaInput::new("http://a.test"));
        assert_eq!(provider.count(), 2);
        let inputs: Vec<_> = provider.iter().map(|t| t.input.as_str()).collect();
        assert_eq!(inputs, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn test_custom_ip_is_a_distinct_target() {
        let mut provider = InputProvider::new();
        provider.add(MetaInput::new("http://a.test"));
        provider.add(MetaInput::with_ip("http://a.test", "10.0.0.1"));
        assert_eq!(provider.count(), 2);
    }

    #[test]
    fn test_blank_lines_and_comments_skipped() {
        let mut provider = InputProvider::new();
        let data = "http://a.test\n\n# comment\n  \nhttp://b.test\n";
        provider.load_reader(std::io::Cursor::new(data)).unwrap();
        assert_eq!(provider.count(), 2);
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(MetaInput::new("http://a.test:8080/x").host(), "a.test");
        assert_eq!(MetaInput::new("a.test:443").host(), "a.test");
        assert_eq!(MetaInput::new("a.test").host(), "a.test");
    }

    #[test]
    fn test_display_with_ip() {
        let target = MetaInput::with_ip("http://a.test", "10.0.0.1");
        assert_eq!(target.to_string(), "http://a.test [10.0.0.1]");
    }

    #[tokio::test]
    async fn test_noop_probe_accepts() {
        let mut provider = InputProvider::new();
        provider.add_with_probe("http://a.test", &NoopProbe).await;
        assert_eq!(provider.count(), 1);
    }
}
