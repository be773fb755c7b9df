// src/templates/store.rs
//! Template store: transforms catalog paths into the published template
//! and workflow sets. Parsing errors are counted, never fatal; filters and
//! signature validation run before clustering.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::catalog::Catalog;
use super::cluster::{self, ExecutionUnit};
use super::model::{Severity, Template};
use super::workflow::Workflow;
use crate::error::TemplarError;

/// User selectors applied after parsing
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub severities: Vec<Severity>,
    pub authors: Vec<String>,
    pub ids: Vec<String>,
    pub protocols: Vec<String>,
}

impl TemplateFilter {
    pub fn matches(&self, template: &Template) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &template.id) {
            return false;
        }
        if !self.tags.is_empty()
            && !self
                .tags
                .iter()
                .any(|t| template.info.tags.iter().any(|tag| tag == t))
        {
            return false;
        }
        if self
            .exclude_tags
            .iter()
            .any(|t| template.info.tags.iter().any(|tag| tag == t))
        {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&template.info.severity) {
            return false;
        }
        if !self.authors.is_empty()
            && !self
                .authors
                .iter()
                .any(|a| template.info.author.eq_ignore_ascii_case(a))
        {
            return false;
        }
        if !self.protocols.is_empty() {
            let has = |proto: &str| match proto {
                "http" => !template.http.is_empty(),
                "dns" => !template.dns.is_empty(),
                "network" | "tcp" => !template.network.is_empty(),
                "ssl" => !template.ssl.is_empty(),
                "headless" => !template.headless.is_empty(),
                _ => false,
            };
            if !self.protocols.iter().any(|p| has(p)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub filter: TemplateFilter,
    pub exclude_tags_from_ignore: Vec<String>,
    pub validate_signatures: bool,
    pub suppress_unsigned_warning: bool,
}

/// Load counters surfaced after `load()`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    pub parsed: usize,
    pub filtered_out: usize,
    pub parse_errors: usize,
    pub duplicates: usize,
    pub unsigned: usize,
    pub signature_mismatches: usize,
}

/// Owns the published templates and workflows for one scan
pub struct Store {
    config: StoreConfig,
    templates: Vec<Arc<Template>>,
    workflows: Vec<Workflow>,
    stats: LoadStats,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            templates: Vec::new(),
            workflows: Vec::new(),
            stats: LoadStats::default(),
        }
    }

    /// Parse, filter, validate, and publish every template the catalog
    /// resolves for `patterns`.
    pub fn load(&mut self, catalog: &Catalog, patterns: &[String]) -> Result<(), TemplarError> {
        let paths = catalog.resolve(patterns)?;
        let ignore_tags: Vec<String> = catalog
            .ignore()
            .tags
            .iter()
            .chain(&self.config.exclude_tags_from_ignore)
            .cloned()
            .collect();

        let mut seen_ids = HashSet::new();
        let mut parsed_workflows = Vec::new();

        for path in &paths {
            let raw = match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) => {
                    self.stats.parse_errors += 1;
                    warn!("could not read {}: {}", path.display(), e);
                    continue;
                }
            };

            match parse_document(&raw, path) {
                Ok(Document::Workflow(workflow)) => parsed_workflows.push(workflow),
                Ok(Document::Template(mut template)) => {
                    self.stats.parsed += 1;

                    if !seen_ids.insert(template.id.clone()) {
                        self.stats.duplicates += 1;
                        warn!("duplicate template id {} at {}", template.id, path.display());
                        continue;
                    }
                    if ignore_tags
                        .iter()
                        .any(|t| template.info.tags.iter().any(|tag| tag == t))
                    {
                        self.stats.filtered_out += 1;
                        continue;
                    }
                    if !self.config.filter.matches(&template) {
                        self.stats.filtered_out += 1;
                        continue;
                    }

                    self.verify_signature(&mut template, &raw);
                    self.templates.push(Arc::new(*template));
                }
                Err(e) => {
                    self.stats.parse_errors += 1;
                    warn!("could not parse {}: {}", path.display(), e);
                }
            }
        }

        // Workflows validate against the loaded template set
        let known: HashSet<String> = self.templates.iter().map(|t| t.id.clone()).collect();
        for workflow in parsed_workflows {
            match workflow.validate(&known) {
                Ok(()) => self.workflows.push(workflow),
                Err(e) => {
                    self.stats.parse_errors += 1;
                    warn!("{}", e);
                }
            }
        }

        debug!(
            "store loaded {} templates, {} workflows ({} parse errors, {} filtered)",
            self.templates.len(),
            self.workflows.len(),
            self.stats.parse_errors,
            self.stats.filtered_out
        );
        Ok(())
    }

    fn verify_signature(&mut self, template: &mut Template, raw: &str) {
        match extract_digest(raw) {
            Some(digest) => {
                template.signature = Some(digest.clone());
                if self.config.validate_signatures && digest != compute_digest(raw) {
                    self.stats.signature_mismatches += 1;
                    warn!("template {} has a signature mismatch", template.id);
                }
            }
            None => {
                self.stats.unsigned += 1;
                if self.config.validate_signatures && !self.config.suppress_unsigned_warning {
                    warn!("template {} is unsigned", template.id);
                }
            }
        }
    }

    pub fn templates(&self) -> &[Arc<Template>] {
        &self.templates
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    /// True when there is nothing to execute. Fatal only for callers that
    /// intend to execute, which is their decision to make.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty() && self.workflows.is_empty()
    }

    /// The scheduled units, clustered unless disabled
    pub fn execution_units(&self, disable_clustering: bool) -> Vec<ExecutionUnit> {
        if disable_clustering {
            self.templates
                .iter()
                .cloned()
                .map(ExecutionUnit::Single)
                .collect()
        } else {
            cluster::cluster(self.templates.to_vec())
        }
    }

    /// Direct insertion used by the SDK facade for in-memory templates
    pub fn push_template(&mut self, template: Template) {
        self.templates.push(Arc::new(template));
    }
}

enum Document {
    Template(Box<Template>),
    Workflow(Workflow),
}

fn parse_document(raw: &str, path: &Path) -> Result<Document, TemplarError> {
    // A document with a `workflows:` sequence is a workflow, not a template
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default)]
        workflows: Vec<serde_yaml::Value>,
    }
    let probe: Probe = serde_yaml::from_str(raw)?;

    if !probe.workflows.is_empty() {
        let mut workflow: Workflow = serde_yaml::from_str(raw)?;
        workflow.path = path.display().to_string();
        return Ok(Document::Workflow(workflow));
    }

    let mut template: Template = serde_yaml::from_str(raw)?;
    if template.id.is_empty() {
        return Err(TemplarError::Load("template is missing an id".to_string()));
    }
    template.path = path.display().to_string();
    Ok(Document::Template(Box::new(template)))
}

/// Pull the `# digest:` trailer out of a raw document
fn extract_digest(raw: &str) -> Option<String> {
    raw.lines()
        .rev()
        .find(|line| line.starts_with("# digest:"))
        .map(|line| line.trim_start_matches("# digest:").trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Digest over the document body with the trailer stripped
fn compute_digest(raw: &str) -> String {
    let body: String = raw
        .lines()
        .filter(|line| !line.starts_with("# digest:"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_root(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("templar-store-{}-{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_template(root: &Path, file: &str, id: &str, severity: &str, tags: &str) {
        let yaml = format!(
            r#"
id: {}
info:
  name: {}
  author: tester
  severity: {}
  tags: {}
http:
  - method: GET
    path: ["/"]
    matchers:
      - type: status
        status: [200]
"#,
            id, id, severity, tags
        );
        fs::write(root.join(file), yaml).unwrap();
    }

    #[test]
    fn test_parse_errors_are_not_fatal() {
        let root = temp_root("errors");
        write_template(&root, "good.yaml", "good", "high", "panel");
        fs::write(root.join("bad.yaml"), ": not yaml at all {{{{").unwrap();

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig::default());
        store.load(&catalog, &[".".to_string()]).unwrap();

        assert_eq!(store.templates().len(), 1);
        assert_eq!(store.stats().parse_errors, 1);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_tag_and_severity_filters() {
        let root = temp_root("filters");
        write_template(&root, "a.yaml", "a", "high", "panel");
        write_template(&root, "b.yaml", "b", "low", "panel");
        write_template(&root, "c.yaml", "c", "high", "misc");

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig {
            filter: TemplateFilter {
                tags: vec!["panel".to_string()],
                severities: vec![Severity::High],
                ..Default::default()
            },
            ..Default::default()
        });
        store.load(&catalog, &[".".to_string()]).unwrap();

        assert_eq!(store.templates().len(), 1);
        assert_eq!(store.templates()[0].id, "a");
        assert_eq!(store.stats().filtered_out, 2);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let root = temp_root("dups");
        write_template(&root, "a.yaml", "same", "high", "x");
        write_template(&root, "b.yaml", "same", "low", "x");

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig::default());
        store.load(&catalog, &[".".to_string()]).unwrap();

        assert_eq!(store.templates().len(), 1);
        assert_eq!(store.stats().duplicates, 1);
        // Deterministic order: a.yaml sorts first and wins
        assert_eq!(store.templates()[0].info.severity, Severity::High);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_unsigned_templates_counted() {
        let root = temp_root("unsigned");
        write_template(&root, "a.yaml", "a", "high", "x");

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig {
            validate_signatures: true,
            ..Default::default()
        });
        store.load(&catalog, &[".".to_string()]).unwrap();

        assert_eq!(store.stats().unsigned, 1);
        assert!(store.templates()[0].signature.is_none());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_signed_template_round_trip() {
        let root = temp_root("signed");
        let body = r#"
id: signed
info:
  name: signed
http:
  - method: GET
    path: ["/"]
"#;
        let digest = compute_digest(body);
        fs::write(
            root.join("signed.yaml"),
            format!("{}\n# digest: {}", body, digest),
        )
        .unwrap();

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig {
            validate_signatures: true,
            ..Default::default()
        });
        store.load(&catalog, &[".".to_string()]).unwrap();

        assert_eq!(store.stats().signature_mismatches, 0);
        assert!(store.templates()[0].signature.is_some());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_workflow_loading_and_validation() {
        let root = temp_root("wf");
        write_template(&root, "det.yaml", "detect-server", "info", "tech");
        write_template(&root, "cve.yaml", "nginx-cve", "high", "cve");
        fs::write(
            root.join("chain.yaml"),
            r#"
id: chain
workflows:
  - template: detect-server
    subtemplates:
      - template: nginx-cve
"#,
        )
        .unwrap();
        fs::write(
            root.join("broken.yaml"),
            r#"
id: broken
workflows:
  - template: missing-template
"#,
        )
        .unwrap();

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig::default());
        store.load(&catalog, &[".".to_string()]).unwrap();

        assert_eq!(store.workflows().len(), 1);
        assert_eq!(store.workflows()[0].id, "chain");
        assert_eq!(store.stats().parse_errors, 1);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_execution_units_cluster_unless_disabled() {
        let root = temp_root("units");
        write_template(&root, "a.yaml", "a", "high", "x");
        write_template(&root, "b.yaml", "b", "high", "x");

        let catalog = Catalog::new(&root);
        let mut store = Store::new(StoreConfig::default());
        store.load(&catalog, &[".".to_string()]).unwrap();

        // identical request bytes: GET /
        assert_eq!(store.execution_units(false).len(), 1);
        assert_eq!(store.execution_units(true).len(), 2);
        fs::remove_dir_all(&root).unwrap();
    }
}
