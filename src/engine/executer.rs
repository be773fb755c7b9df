// src/engine/executer.rs
//! The executer capability: one adapter per protocol kind. The engine
//! treats executers opaquely; every `execute` call resolves to exactly one
//! terminal outcome. Results travel over a bounded channel to the output
//! writer, which keeps delivery ordered and backpressure explicit.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cruise::CruiseControl;
use crate::error::TemplarError;
use crate::input::MetaInput;
use crate::interactsh::InteractshClient;
use crate::output::ResultEvent;
use crate::progress::StatsRegistry;
use crate::project::ProjectFile;
use crate::templates::cluster::ExecutionUnit;
use crate::templates::model::Template;

use super::workpool::CancellationHandle;

/// Terminal outcome of one (unit, target) execution
#[derive(Debug)]
pub enum Outcome {
    Matched,
    NoMatch,
    Failed(TemplarError),
    Skipped(String),
}

/// Shared handles passed down to every executer, built leaf-first
#[derive(Clone)]
pub struct ExecuterOptions {
    pub cruise: Arc<CruiseControl>,
    pub interactsh: Option<Arc<InteractshClient>>,
    pub project: Option<Arc<ProjectFile>>,
    pub stats: Arc<StatsRegistry>,
    pub cancel: CancellationHandle,
    pub results: mpsc::Sender<ResultEvent>,
    pub retries: u32,
}

impl ExecuterOptions {
    /// Publish one result event through the bounded channel.
    pub async fn publish(&self, event: ResultEvent) {
        self.stats.incr_matched();
        // The receiver only closes after the pools drain; a send failure
        // means shutdown is already underway and the event is lost by
        // intent.
        let _ = self.results.send(event).await;
    }
}

/// Protocol adapter contract
#[async_trait]
pub trait Executer: Send + Sync {
    /// Protocol tag used in result events
    fn protocol(&self) -> &'static str;

    /// One-time pure validation of a template's blocks for this protocol
    fn compile(&self, template: &Template) -> Result<(), TemplarError>;

    /// Run every applicable block of the unit against the target
    async fn execute(
        &self,
        unit: &ExecutionUnit,
        target: &MetaInput,
        opts: &ExecuterOptions,
    ) -> Outcome;

    /// Total network requests issued by this executer so far
    fn requests(&self) -> u64;
}

/// Retry a fallible call with exponential backoff. Cancellation is checked
/// between attempts.
pub async fn with_retries<T, F, Fut>(
    retries: u32,
    backoff: Duration,
    cancel: &CancellationHandle,
    mut call: F,
) -> Result<T, TemplarError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TemplarError>>,
{
    let mut wait = backoff;
    let mut last = None;
    for attempt in 0..=retries {
        if cancel.is_cancelled() {
            return Err(TemplarError::Cancelled);
        }
        match call().await {
            Ok(value) => return Ok(value),
            Err(TemplarError::Cancelled) => return Err(TemplarError::Cancelled),
            Err(e) => {
                last = Some(e);
                if attempt < retries {
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(Duration::from_secs(10));
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| TemplarError::Execution("retry loop without attempts".to_string())))
}

/// Target-derived template variables
pub fn target_variables(target: &MetaInput) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let input = target.input.clone();

    if let Ok(parsed) = url::Url::parse(&input) {
        let host = parsed.host_str().unwrap_or_default().to_string();
        let port = parsed
            .port_or_known_default()
            .map(|p| p.to_string())
            .unwrap_or_default();
        vars.insert("BaseURL".to_string(), input.trim_end_matches('/').to_string());
        vars.insert("RootURL".to_string(), format!(
            "{}://{}{}",
            parsed.scheme(),
            host,
            parsed.port().map(|p| format!(":{}", p)).unwrap_or_default()
        ));
        vars.insert("Hostname".to_string(), format!("{}:{}", host, port));
        vars.insert("Host".to_string(), host.clone());
        vars.insert("FQDN".to_string(), host);
        vars.insert("Port".to_string(), port);
        vars.insert("Scheme".to_string(), parsed.scheme().to_string());
    } else {
        // Bare host or host:port
        let mut parts = input.splitn(2, ':');
        let host = parts.next().unwrap_or(&input).to_string();
        let port = parts.next().unwrap_or("").to_string();
        vars.insert("BaseURL".to_string(), input.clone());
        vars.insert(
            "Hostname".to_string(),
            if port.is_empty() {
                host.clone()
            } else {
                format!("{}:{}", host, port)
            },
        );
        vars.insert("Host".to_string(), host.clone());
        vars.insert("FQDN".to_string(), host);
        vars.insert("Port".to_string(), port);
    }
    vars
}

/// Replace every `{{name}}` placeholder present in `vars`
pub fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut output = input.to_string();
    for (key, value) in vars {
        let placeholder = format!("{{{{{}}}}}", key);
        if output.contains(&placeholder) {
            output = output.replace(&placeholder, value);
        }
    }
    output
}

/// Assemble a result event for a matched template
#[allow(clippy::too_many_arguments)]
pub fn build_event(
    template: &Arc<Template>,
    target: &MetaInput,
    matched_at: String,
    protocol: &str,
    matcher_name: Option<String>,
    extracted: Vec<String>,
    request: Option<String>,
    response: Option<String>,
) -> ResultEvent {
    ResultEvent {
        template_id: template.id.clone(),
        template_path: template.path.clone(),
        info: template.info.clone(),
        matcher_name,
        extracted_results: extracted,
        host: target.input.clone(),
        matched_at,
        protocol: protocol.to_string(),
        request,
        response,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}
