// src/engine/http.rs
//! HTTP executer: builds requests from template blocks, sends them through
//! the shared rate limiter, and evaluates every member's matcher set over
//! the response. Cluster units issue a single request for all members.

use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use async_trait::async_trait;

use crate::error::TemplarError;
use crate::input::MetaInput;
use crate::project;
use crate::templates::cluster::ExecutionUnit;
use crate::templates::model::{Condition, HttpRequest, Matcher, ResponseData, Template};

use super::executer::{
    build_event, substitute, target_variables, with_retries, Executer, ExecuterOptions, Outcome,
};

pub struct HttpExecuter {
    client: reqwest::Client,
    timeout: Duration,
    retry_backoff: Duration,
    requests: AtomicU64,
}

impl HttpExecuter {
    pub fn new(timeout: Duration, retry_backoff: Duration) -> Result<Self, TemplarError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("templar/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            timeout,
            retry_backoff,
            requests: AtomicU64::new(0),
        })
    }

    /// Client honouring a target's custom IP override
    fn client_for(&self, target: &MetaInput) -> Result<reqwest::Client, TemplarError> {
        let Some(ip) = &target.custom_ip else {
            return Ok(self.client.clone());
        };
        let ip: IpAddr = ip
            .parse()
            .map_err(|e| TemplarError::Config(format!("invalid custom ip {}: {}", ip, e)))?;
        let host = target.host();
        Ok(reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("templar/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .resolve(&host, SocketAddr::new(ip, 0))
            .build()?)
    }

    async fn send(
        &self,
        target: &MetaInput,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
        opts: &ExecuterOptions,
    ) -> Result<ResponseData, TemplarError> {
        // Identical requests are answered from the project cache without
        // touching the network or the rate limiter.
        let cache_key = project::request_hash(method, url, headers, body.unwrap_or(""));
        if let Some(cache) = &opts.project {
            if let Some(cached) = cache.get(&cache_key) {
                debug!("project cache hit for {}", url);
                return Ok(cached.into_response());
            }
        }

        opts.cruise.limiter().acquire().await?;

        let client = self.client_for(target)?;
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| TemplarError::Config(format!("invalid http method {}: {}", method, e)))?;

        let response = with_retries(opts.retries, self.retry_backoff, &opts.cancel, || {
            let client = client.clone();
            let method = method.clone();
            let url = url.to_string();
            let headers = headers.to_vec();
            let body = body.map(|b| b.to_string());
            async move {
                let mut request = client.request(method, &url);
                for (key, value) in &headers {
                    request = request.header(key, value);
                }
                if let Some(body) = body {
                    request = request.body(body);
                }
                let started = std::time::Instant::now();
                let response = request.send().await.map_err(TemplarError::from)?;
                let status = response.status().as_u16();
                let mut header_map = HashMap::new();
                for (key, value) in response.headers() {
                    if let Ok(value) = value.to_str() {
                        header_map.insert(key.as_str().to_string(), value.to_string());
                    }
                }
                let text = response.text().await.map_err(TemplarError::from)?;
                Ok(ResponseData {
                    status,
                    headers: header_map,
                    body: text,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
        })
        .await?;

        self.requests.fetch_add(1, Ordering::Relaxed);
        opts.stats.incr_requests();

        if let Some(cache) = &opts.project {
            cache.put(&cache_key, (&response).into());
        }
        Ok(response)
    }

    /// Evaluate one template's matcher set against a shared response.
    /// Returns true when anything matched.
    async fn evaluate(
        template: &Arc<Template>,
        block: &HttpRequest,
        target: &MetaInput,
        matched_at: &str,
        response: &ResponseData,
        request_snapshot: &str,
        opts: &ExecuterOptions,
    ) -> bool {
        let extracted: Vec<String> = block
            .extractors
            .iter()
            .flat_map(|e| e.extract(response))
            .collect();

        match block.matchers_condition {
            Condition::And => {
                if !block.matchers.is_empty()
                    && block.matchers.iter().all(|m| m.matches(response))
                {
                    let event = build_event(
                        template,
                        target,
                        matched_at.to_string(),
                        "http",
                        None,
                        extracted,
                        Some(request_snapshot.to_string()),
                        None,
                    );
                    opts.publish(event).await;
                    return true;
                }
                false
            }
            Condition::Or => {
                let mut matched = false;
                for matcher in &block.matchers {
                    if matcher.matches(response) {
                        matched = true;
                        let event = build_event(
                            template,
                            target,
                            matched_at.to_string(),
                            "http",
                            matcher.name.clone(),
                            extracted.clone(),
                            Some(request_snapshot.to_string()),
                            None,
                        );
                        opts.publish(event).await;
                        if !template.multi_match {
                            break;
                        }
                    }
                }
                matched
            }
        }
    }

    /// Run the single shared request of a cluster and fan the response out
    /// to every member's matchers.
    async fn execute_cluster(
        &self,
        members: &[Arc<Template>],
        target: &MetaInput,
        opts: &ExecuterOptions,
    ) -> Outcome {
        let representative = &members[0];
        let block = &representative.http[0];
        let vars = template_vars(representative, target);

        let Some(path) = block.path.first() else {
            return Outcome::Skipped("http block has no path".to_string());
        };
        let url = substitute(path, &vars);
        let headers = render_headers(block, target, &vars);
        let body = block.body.as_ref().map(|b| substitute(b, &vars));
        let snapshot = format!("{} {}", block.method, url);

        let response = match self
            .send(target, &block.method, &url, &headers, body.as_deref(), opts)
            .await
        {
            Ok(response) => response,
            Err(e) => return Outcome::Failed(e),
        };

        let mut any = false;
        for member in members {
            let matched = Self::evaluate(
                member,
                &member.http[0],
                target,
                &url,
                &response,
                &snapshot,
                opts,
            )
            .await;
            any |= matched;
            // A matching member with stop-at-first-match short-circuits
            // the rest of the cluster, never the scan.
            if matched && member.stop_at_first_match {
                break;
            }
        }
        if any {
            Outcome::Matched
        } else {
            Outcome::NoMatch
        }
    }

    async fn execute_single(
        &self,
        template: &Arc<Template>,
        target: &MetaInput,
        opts: &ExecuterOptions,
    ) -> Outcome {
        let base_vars = template_vars(template, target);
        let mut matched_any = false;
        let mut first_failure: Option<TemplarError> = None;

        'blocks: for block in &template.http {
            for payload_vars in expand_payloads(&block.payloads) {
                if opts.cancel.is_cancelled() {
                    return Outcome::Failed(TemplarError::Cancelled);
                }

                let mut vars = base_vars.clone();
                vars.extend(payload_vars);

                // OOB templates get a live correlation payload, or skip
                // the probe entirely when the oracle is down.
                if block.references_interactsh() {
                    let registered = match &opts.interactsh {
                        Some(oracle) => {
                            let matcher = block.matchers.first().cloned();
                            oracle
                                .register(template.clone(), target.clone(), matcher, None)
                                .await
                        }
                        None => None,
                    };
                    match registered {
                        Some(payload) => {
                            vars.insert("interactsh-url".to_string(), payload.url);
                        }
                        None => continue,
                    }
                }

                for path in &block.path {
                    let url = substitute(path, &vars);
                    let headers = render_headers(block, target, &vars);
                    let body = block.body.as_ref().map(|b| substitute(b, &vars));
                    let snapshot = format!("{} {}", block.method, url);

                    match self
                        .send(target, &block.method, &url, &headers, body.as_deref(), opts)
                        .await
                    {
                        Ok(response) => {
                            let matched = Self::evaluate(
                                template, block, target, &url, &response, &snapshot, opts,
                            )
                            .await;
                            matched_any |= matched;
                            if matched
                                && (template.stop_at_first_match || block.stop_at_first_match)
                            {
                                break 'blocks;
                            }
                        }
                        Err(TemplarError::Cancelled) => {
                            return Outcome::Failed(TemplarError::Cancelled)
                        }
                        Err(e) => {
                            if first_failure.is_none() {
                                first_failure = Some(e);
                            }
                        }
                    }
                }
            }
        }

        if matched_any {
            Outcome::Matched
        } else if let Some(failure) = first_failure {
            Outcome::Failed(failure)
        } else {
            Outcome::NoMatch
        }
    }
}

#[async_trait]
impl Executer for HttpExecuter {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn compile(&self, template: &Template) -> Result<(), TemplarError> {
        for block in &template.http {
            if block.path.is_empty() {
                return Err(TemplarError::Load(format!(
                    "template {} has an http block without paths",
                    template.id
                )));
            }
            for matcher in &block.matchers {
                compile_matcher_regexes(matcher)?;
            }
            for extractor in &block.extractors {
                for pattern in &extractor.regex {
                    Regex::new(pattern).map_err(|e| {
                        TemplarError::Load(format!(
                            "template {} extractor regex invalid: {}",
                            template.id, e
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        unit: &ExecutionUnit,
        target: &MetaInput,
        opts: &ExecuterOptions,
    ) -> Outcome {
        match unit {
            ExecutionUnit::Cluster(members) => self.execute_cluster(members, target, opts).await,
            ExecutionUnit::Single(template) => {
                if template.http.is_empty() {
                    return Outcome::Skipped("no http blocks".to_string());
                }
                self.execute_single(template, target, opts).await
            }
        }
    }

    fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

fn compile_matcher_regexes(matcher: &Matcher) -> Result<(), TemplarError> {
    for pattern in &matcher.regex {
        Regex::new(pattern)
            .map_err(|e| TemplarError::Load(format!("matcher regex invalid: {}", e)))?;
    }
    Ok(())
}

fn template_vars(template: &Template, target: &MetaInput) -> HashMap<String, String> {
    let mut vars = target_variables(target);
    for (key, value) in &template.variables {
        vars.insert(key.clone(), substitute(value, &vars));
    }
    vars
}

fn render_headers(
    block: &HttpRequest,
    target: &MetaInput,
    vars: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = block
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, vars)))
        .collect();
    for (key, value) in &target.headers {
        headers.push((key.clone(), value.clone()));
    }
    headers
}

/// Cartesian product of the payload sets; one empty map when there are no
/// payloads.
fn expand_payloads(payloads: &HashMap<String, Vec<String>>) -> Vec<HashMap<String, String>> {
    let mut combos = vec![HashMap::new()];
    let mut names: Vec<_> = payloads.keys().collect();
    names.sort();
    for name in names {
        let values = &payloads[name];
        let mut next = Vec::with_capacity(combos.len() * values.len().max(1));
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        if !next.is_empty() {
            combos = next;
        }
    }
    combos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_payloads_cartesian() {
        let payloads = HashMap::from([
            ("user".to_string(), vec!["a".to_string(), "b".to_string()]),
            ("pass".to_string(), vec!["x".to_string()]),
        ]);
        let combos = expand_payloads(&payloads);
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c.contains_key("user") && c.contains_key("pass")));
    }

    #[test]
    fn test_expand_payloads_empty() {
        let combos = expand_payloads(&HashMap::new());
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn test_compile_rejects_bad_regex() {
        let executer = HttpExecuter::new(Duration::from_secs(5), Duration::from_millis(10)).unwrap();
        let template: Template = serde_yaml::from_str(
            r#"
id: bad-regex
info:
  name: bad
http:
  - method: GET
    path: ["/"]
    matchers:
      - type: regex
        regex: ["(unclosed"]
"#,
        )
        .unwrap();
        assert!(executer.compile(&template).is_err());
    }

    #[test]
    fn test_compile_rejects_missing_paths() {
        let executer = HttpExecuter::new(Duration::from_secs(5), Duration::from_millis(10)).unwrap();
        let template: Template = serde_yaml::from_str(
            r#"
id: no-paths
info:
  name: none
http:
  - method: GET
"#,
        )
        .unwrap();
        assert!(executer.compile(&template).is_err());
    }

    #[test]
    fn test_template_vars_merge_template_variables() {
        let template: Template = serde_yaml::from_str(
            r#"
id: vars
info:
  name: vars
variables:
  probe_path: "{{BaseURL}}/probe"
http:
  - method: GET
    path: ["{{probe_path}}"]
"#,
        )
        .unwrap();
        let vars = template_vars(&template, &MetaInput::new("http://a.test"));
        assert_eq!(vars["probe_path"], "http://a.test/probe");
    }
}
