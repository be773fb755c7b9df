// src/engine/dns.rs
//! DNS executer: resolves template queries through hickory and matches
//! over the rendered records.

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{NetworkErrorKind, TemplarError};
use crate::input::MetaInput;
use crate::templates::cluster::ExecutionUnit;
use crate::templates::model::{Condition, DnsRequest, ResponseData, Template};

use super::executer::{
    build_event, substitute, target_variables, with_retries, Executer, ExecuterOptions, Outcome,
};

pub struct DnsExecuter {
    resolver: TokioAsyncResolver,
    retry_backoff: Duration,
    requests: AtomicU64,
}

impl DnsExecuter {
    pub fn new(timeout: Duration, retry_backoff: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Self {
            resolver,
            retry_backoff,
            requests: AtomicU64::new(0),
        }
    }

    pub fn parse_record_type(value: &str) -> Option<RecordType> {
        match value.to_uppercase().as_str() {
            "A" => Some(RecordType::A),
            "AAAA" => Some(RecordType::AAAA),
            "CNAME" => Some(RecordType::CNAME),
            "MX" => Some(RecordType::MX),
            "NS" => Some(RecordType::NS),
            "TXT" => Some(RecordType::TXT),
            "SOA" => Some(RecordType::SOA),
            "PTR" => Some(RecordType::PTR),
            "SRV" => Some(RecordType::SRV),
            "CAA" => Some(RecordType::CAA),
            _ => None,
        }
    }

    async fn query(
        &self,
        name: &str,
        record_type: RecordType,
        opts: &ExecuterOptions,
    ) -> Result<ResponseData, TemplarError> {
        opts.cruise.limiter().acquire().await?;

        let records = with_retries(opts.retries, self.retry_backoff, &opts.cancel, || {
            let name = name.to_string();
            async move {
                let started = std::time::Instant::now();
                let lookup = self
                    .resolver
                    .lookup(name.clone(), record_type)
                    .await
                    .map_err(|e| {
                        TemplarError::Network(NetworkErrorKind::Dns, e.to_string())
                    })?;
                let rendered: Vec<String> = lookup
                    .record_iter()
                    .map(|record| record.to_string())
                    .collect();
                Ok((rendered, started.elapsed().as_millis() as u64))
            }
        })
        .await;

        self.requests.fetch_add(1, Ordering::Relaxed);
        opts.stats.incr_requests();

        let (rendered, duration_ms) = records?;
        Ok(ResponseData {
            status: 0,
            headers: HashMap::from([(
                "record-type".to_string(),
                record_type.to_string(),
            )]),
            body: rendered.join("\n"),
            duration_ms,
        })
    }

    async fn execute_block(
        &self,
        template: &Arc<Template>,
        block: &DnsRequest,
        target: &MetaInput,
        opts: &ExecuterOptions,
    ) -> Result<bool, TemplarError> {
        let vars = target_variables(target);
        let name = substitute(&block.name, &vars);
        let record_type = Self::parse_record_type(&block.record_type).ok_or_else(|| {
            TemplarError::Load(format!(
                "template {} has an unknown dns record type {}",
                template.id, block.record_type
            ))
        })?;

        let response = self.query(&name, record_type, opts).await?;

        let extracted: Vec<String> = block
            .extractors
            .iter()
            .flat_map(|e| e.extract(&response))
            .collect();

        let mut matched = false;
        match block.matchers_condition {
            Condition::And => {
                if !block.matchers.is_empty()
                    && block.matchers.iter().all(|m| m.matches(&response))
                {
                    matched = true;
                    let event = build_event(
                        template,
                        target,
                        name.clone(),
                        "dns",
                        None,
                        extracted,
                        Some(format!("{} {}", block.record_type, name)),
                        Some(response.body.clone()),
                    );
                    opts.publish(event).await;
                }
            }
            Condition::Or => {
                for matcher in &block.matchers {
                    if matcher.matches(&response) {
                        matched = true;
                        let event = build_event(
                            template,
                            target,
                            name.clone(),
                            "dns",
                            matcher.name.clone(),
                            extracted.clone(),
                            Some(format!("{} {}", block.record_type, name)),
                            Some(response.body.clone()),
                        );
                        opts.publish(event).await;
                        if !template.multi_match {
                            break;
                        }
                    }
                }
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl Executer for DnsExecuter {
    fn protocol(&self) -> &'static str {
        "dns"
    }

    fn compile(&self, template: &Template) -> Result<(), TemplarError> {
        for block in &template.dns {
            if Self::parse_record_type(&block.record_type).is_none() {
                return Err(TemplarError::Load(format!(
                    "template {} has an unknown dns record type {}",
                    template.id, block.record_type
                )));
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
        let ExecutionUnit::Single(template) = unit else {
            return Outcome::Skipped("dns blocks never cluster".to_string());
        };
        if template.dns.is_empty() {
            return Outcome::Skipped("no dns blocks".to_string());
        }

        let mut matched_any = false;
        let mut first_failure = None;
        for block in &template.dns {
            if opts.cancel.is_cancelled() {
                return Outcome::Failed(TemplarError::Cancelled);
            }
            match self.execute_block(template, block, target, opts).await {
                Ok(matched) => {
                    matched_any |= matched;
                    if matched && template.stop_at_first_match {
                        break;
                    }
                }
                Err(TemplarError::Cancelled) => return Outcome::Failed(TemplarError::Cancelled),
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
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

    fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_parsing() {
        assert_eq!(
            DnsExecuter::parse_record_type("txt"),
            Some(RecordType::TXT)
        );
        assert_eq!(DnsExecuter::parse_record_type("A"), Some(RecordType::A));
        assert_eq!(DnsExecuter::parse_record_type("BOGUS"), None);
    }

    #[test]
    fn test_compile_rejects_unknown_record_type() {
        let executer = DnsExecuter::new(Duration::from_secs(2), Duration::from_millis(10));
        let template: Template = serde_yaml::from_str(
            r#"
id: bad-type
info:
  name: bad
dns:
  - name: "{{FQDN}}"
    type: WKS
"#,
        )
        .unwrap();
        assert!(executer.compile(&template).is_err());
    }

    #[test]
    fn test_fqdn_substitution() {
        let vars = target_variables(&MetaInput::new("https://sub.example.test"));
        assert_eq!(substitute("{{FQDN}}", &vars), "sub.example.test");
    }
}
