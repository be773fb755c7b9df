// src/templates/model.rs
//! Template data model: the YAML probe definitions, their request blocks,
//! and the matcher/extractor predicates evaluated against responses.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A declarative probe definition loaded from one YAML document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub info: Info,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<DnsRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkRequest>,

    // Protocol kinds that parse but have no compiled-in executer. They are
    // retained so the store can count them and the engine can skip them
    // with a warning instead of failing the load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssl: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headless: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub websocket: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub whois: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub javascript: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file: Vec<serde_yaml::Value>,

    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default, rename = "self-contained")]
    pub self_contained: bool,
    #[serde(default, rename = "stop-at-first-match")]
    pub stop_at_first_match: bool,
    #[serde(default, rename = "multi-match")]
    pub multi_match: bool,
    #[serde(default, rename = "disable-clustering")]
    pub disable_clustering: bool,

    /// `# digest:` trailer lifted from the raw document, if present
    #[serde(skip)]
    pub signature: Option<String>,
    /// Path the template was loaded from
    #[serde(skip)]
    pub path: String,
}

impl Template {
    /// All request blocks in declaration order as the tagged variant the
    /// engine dispatches on.
    pub fn requests(&self) -> Vec<RequestBlock<'_>> {
        let mut blocks = Vec::new();
        for r in &self.http {
            blocks.push(RequestBlock::Http(r));
        }
        for r in &self.dns {
            blocks.push(RequestBlock::Dns(r));
        }
        for r in &self.network {
            blocks.push(RequestBlock::Network(r));
        }
        for _ in self
            .ssl
            .iter()
            .chain(&self.headless)
            .chain(&self.code)
            .chain(&self.websocket)
            .chain(&self.whois)
            .chain(&self.javascript)
            .chain(&self.file)
        {
            blocks.push(RequestBlock::Unsupported);
        }
        blocks
    }

    /// True when the template needs the headless execution pool
    pub fn is_headless(&self) -> bool {
        !self.headless.is_empty()
    }

    /// Request blocks that parse but have no compiled-in executer
    pub fn unsupported_blocks(&self) -> usize {
        self.ssl.len()
            + self.code.len()
            + self.websocket.len()
            + self.whois.len()
            + self.javascript.len()
            + self.file.len()
    }

    /// DSL matchers are dispatched but not interpreted; callers surface a
    /// warning for templates that carry them.
    pub fn dsl_matcher_count(&self) -> usize {
        let count = |matchers: &[Matcher]| {
            matchers
                .iter()
                .filter(|m| m.kind == MatcherKind::Dsl)
                .count()
        };
        self.http.iter().map(|b| count(&b.matchers)).sum::<usize>()
            + self.dns.iter().map(|b| count(&b.matchers)).sum::<usize>()
            + self.network.iter().map(|b| count(&b.matchers)).sum::<usize>()
    }

    /// True when any request block references the interactsh placeholder
    pub fn uses_interactsh(&self) -> bool {
        self.http.iter().any(|r| r.references_interactsh())
            || self.dns.iter().any(|r| r.name.contains("{{interactsh-url}}"))
            || self
                .network
                .iter()
                .any(|r| r.inputs.iter().any(|i| i.data.contains("{{interactsh-url}}")))
    }
}

/// Request block as a tagged variant over protocol kinds
#[derive(Debug, Clone, Copy)]
pub enum RequestBlock<'a> {
    Http(&'a HttpRequest),
    Dns(&'a DnsRequest),
    Network(&'a NetworkRequest),
    /// Parsed but not executable in this build
    Unsupported,
}

/// Template metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default, rename = "cve-id", skip_serializing_if = "Option::is_none")]
    pub cve_id: Option<String>,
    #[serde(default, rename = "cwe-id", skip_serializing_if = "Option::is_none")]
    pub cwe_id: Option<String>,
}

// Tags appear either as a YAML list or a comma-joined string.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TagList {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match TagList::deserialize(deserializer)? {
        TagList::List(tags) => tags,
        TagList::Joined(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Severity::Unknown => "unknown",
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            "unknown" => Ok(Severity::Unknown),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// One HTTP request block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub payloads: HashMap<String, Vec<String>>,
    #[serde(default, rename = "matchers-condition")]
    pub matchers_condition: Condition,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    #[serde(default, rename = "stop-at-first-match")]
    pub stop_at_first_match: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    pub fn references_interactsh(&self) -> bool {
        let needle = "{{interactsh-url}}";
        self.path.iter().any(|p| p.contains(needle))
            || self.headers.values().any(|v| v.contains(needle))
            || self.body.as_deref().map(|b| b.contains(needle)).unwrap_or(false)
    }
}

/// One DNS request block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRequest {
    /// Query name; `{{FQDN}}` expands to the target host
    #[serde(default = "default_dns_name")]
    pub name: String,
    #[serde(default = "default_dns_type", rename = "type")]
    pub record_type: String,
    #[serde(default, rename = "matchers-condition")]
    pub matchers_condition: Condition,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
}

fn default_dns_name() -> String {
    "{{FQDN}}".to_string()
}

fn default_dns_type() -> String {
    "A".to_string()
}

/// One raw TCP request block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// `{{Hostname}}` expands to host:port of the target
    #[serde(default)]
    pub host: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<NetworkInput>,
    #[serde(default = "default_read_size", rename = "read-size")]
    pub read_size: usize,
    #[serde(default, rename = "matchers-condition")]
    pub matchers_condition: Condition,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInput {
    pub data: String,
}

fn default_read_size() -> usize {
    1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    #[default]
    Or,
    And,
}

/// A predicate over a protocol response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub kind: MatcherKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_part")]
    pub part: String,
    #[serde(default)]
    pub negative: bool,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub status: Vec<u16>,
    #[serde(default)]
    pub size: Vec<usize>,
    #[serde(default)]
    pub regex: Vec<String>,
    #[serde(default)]
    pub dsl: Vec<String>,
}

fn default_part() -> String {
    "body".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    Status,
    Size,
    Word,
    Regex,
    Dsl,
}

/// A projection from a response into named values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extractor {
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_part")]
    pub part: String,
    #[serde(default)]
    pub regex: Vec<String>,
    #[serde(default)]
    pub group: usize,
    #[serde(default)]
    pub kval: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    Regex,
    Kval,
}

/// Normalized response view the matchers run against
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub duration_ms: u64,
}

impl ResponseData {
    fn part(&self, part: &str) -> String {
        match part {
            "body" => self.body.clone(),
            "header" | "headers" => self
                .headers
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join("\n"),
            "all" | "response" => {
                let headers = self
                    .headers
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{}\n\n{}", headers, self.body)
            }
            _ => self.body.clone(),
        }
    }
}

impl Matcher {
    /// Evaluate against a response. DSL matchers are dispatched but not
    /// interpreted here; they never match and the caller surfaces a
    /// warning for them.
    pub fn matches(&self, response: &ResponseData) -> bool {
        let result = match self.kind {
            MatcherKind::Status => self.match_condition(
                self.status.iter().map(|s| *s == response.status),
                self.status.len(),
            ),
            MatcherKind::Size => self.match_condition(
                self.size.iter().map(|s| *s == response.body.len()),
                self.size.len(),
            ),
            MatcherKind::Word => {
                let haystack = response.part(&self.part);
                self.match_condition(
                    self.words.iter().map(|w| haystack.contains(w.as_str())),
                    self.words.len(),
                )
            }
            MatcherKind::Regex => {
                let haystack = response.part(&self.part);
                self.match_condition(
                    self.regex
                        .iter()
                        .map(|r| Regex::new(r).map(|re| re.is_match(&haystack)).unwrap_or(false)),
                    self.regex.len(),
                )
            }
            MatcherKind::Dsl => false,
        };
        result != self.negative
    }

    fn match_condition(&self, outcomes: impl Iterator<Item = bool>, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        match self.condition {
            Condition::Or => outcomes.into_iter().any(|m| m),
            Condition::And => outcomes.into_iter().all(|m| m),
        }
    }
}

impl Extractor {
    /// Project named values out of a response
    pub fn extract(&self, response: &ResponseData) -> Vec<String> {
        match self.kind {
            ExtractorKind::Regex => {
                let haystack = response.part(&self.part);
                let mut values = Vec::new();
                for pattern in &self.regex {
                    if let Ok(re) = Regex::new(pattern) {
                        for caps in re.captures_iter(&haystack) {
                            if let Some(m) = caps.get(self.group) {
                                values.push(m.as_str().to_string());
                            }
                        }
                    }
                }
                values
            }
            ExtractorKind::Kval => self
                .kval
                .iter()
                .filter_map(|key| {
                    response
                        .headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(key))
                        .map(|(_, v)| v.clone())
                })
                .collect(),
        }
    }
}
