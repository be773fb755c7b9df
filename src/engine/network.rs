// src/engine/network.rs
//! Raw TCP executer: connects, optionally writes the block inputs, reads
//! a banner up to `read-size`, and matches over the bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use async_trait::async_trait;

use crate::error::{NetworkErrorKind, TemplarError};
use crate::input::MetaInput;
use crate::templates::cluster::ExecutionUnit;
use crate::templates::model::{Condition, NetworkRequest, ResponseData, Template};

use super::executer::{
    build_event, substitute, target_variables, with_retries, Executer, ExecuterOptions, Outcome,
};

pub struct NetworkExecuter {
    timeout: Duration,
    retry_backoff: Duration,
    requests: AtomicU64,
}

impl NetworkExecuter {
    pub fn new(timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            timeout,
            retry_backoff,
            requests: AtomicU64::new(0),
        }
    }

    async fn exchange(
        &self,
        address: &str,
        inputs: &[String],
        read_size: usize,
        opts: &ExecuterOptions,
    ) -> Result<ResponseData, TemplarError> {
        opts.cruise.limiter().acquire().await?;

        let io_timeout = self.timeout;
        let response = with_retries(opts.retries, self.retry_backoff, &opts.cancel, || {
            let address = address.to_string();
            let inputs = inputs.to_vec();
            async move {
                let started = std::time::Instant::now();
                let mut stream = timeout(io_timeout, TcpStream::connect(&address))
                    .await
                    .map_err(|_| {
                        TemplarError::Network(
                            NetworkErrorKind::Timeout,
                            format!("connect to {} timed out", address),
                        )
                    })?
                    .map_err(|e| {
                        let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                            NetworkErrorKind::ConnectionRefused
                        } else if e.kind() == std::io::ErrorKind::TimedOut {
                            NetworkErrorKind::Timeout
                        } else {
                            NetworkErrorKind::Other
                        };
                        TemplarError::Network(kind, e.to_string())
                    })?;

                for input in &inputs {
                    stream.write_all(input.as_bytes()).await.map_err(|e| {
                        TemplarError::Network(NetworkErrorKind::Other, e.to_string())
                    })?;
                }

                let mut buffer = vec![0u8; read_size.max(1)];
                let read = match timeout(io_timeout, stream.read(&mut buffer)).await {
                    Ok(Ok(read)) => read,
                    // A peer that sends nothing within the window still
                    // produced a successful connect; match on empty bytes.
                    Ok(Err(_)) | Err(_) => 0,
                };
                buffer.truncate(read);

                Ok(ResponseData {
                    status: 0,
                    headers: HashMap::new(),
                    body: String::from_utf8_lossy(&buffer).to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
        })
        .await;

        self.requests.fetch_add(1, Ordering::Relaxed);
        opts.stats.incr_requests();
        response
    }

    async fn execute_block(
        &self,
        template: &Arc<Template>,
        block: &NetworkRequest,
        target: &MetaInput,
        opts: &ExecuterOptions,
    ) -> Result<bool, TemplarError> {
        let vars = target_variables(target);
        let mut matched = false;

        let hosts: Vec<String> = if block.host.is_empty() {
            vec!["{{Hostname}}".to_string()]
        } else {
            block.host.clone()
        };

        for host in &hosts {
            let address = substitute(host, &vars);
            let inputs: Vec<String> = block
                .inputs
                .iter()
                .map(|i| substitute(&i.data, &vars))
                .collect();

            let response = self
                .exchange(&address, &inputs, block.read_size, opts)
                .await?;

            let extracted: Vec<String> = block
                .extractors
                .iter()
                .flat_map(|e| e.extract(&response))
                .collect();

            match block.matchers_condition {
                Condition::And => {
                    if !block.matchers.is_empty()
                        && block.matchers.iter().all(|m| m.matches(&response))
                    {
                        matched = true;
                        let event = build_event(
                            template,
                            target,
                            address.clone(),
                            "network",
                            None,
                            extracted,
                            None,
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
                                address.clone(),
                                "network",
                                matcher.name.clone(),
                                extracted.clone(),
                                None,
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

            if matched && template.stop_at_first_match {
                break;
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl Executer for NetworkExecuter {
    fn protocol(&self) -> &'static str {
        "network"
    }

    fn compile(&self, template: &Template) -> Result<(), TemplarError> {
        for block in &template.network {
            if block.matchers.is_empty() && block.extractors.is_empty() {
                return Err(TemplarError::Load(format!(
                    "template {} has a network block with neither matchers nor extractors",
                    template.id
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
            return Outcome::Skipped("network blocks never cluster".to_string());
        };
        if template.network.is_empty() {
            return Outcome::Skipped("no network blocks".to_string());
        }

        let mut matched_any = false;
        let mut first_failure = None;
        for block in &template.network {
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
    use crate::cruise::CruiseControl;
    use crate::progress::StatsRegistry;
    use crate::engine::workpool::CancellationHandle;
    use tokio::net::TcpListener;

    fn options() -> (ExecuterOptions, tokio::sync::mpsc::Receiver<crate::output::ResultEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        (
            ExecuterOptions {
                cruise: Arc::new(CruiseControl::default()),
                interactsh: None,
                project: None,
                stats: StatsRegistry::new(),
                cancel: CancellationHandle::new(),
                results: tx,
                retries: 0,
            },
            rx,
        )
    }

    fn banner_template(words: &str) -> Arc<Template> {
        Arc::new(
            serde_yaml::from_str(&format!(
                r#"
id: banner-grab
info:
  name: banner grab
  severity: info
network:
  - host: ["{{{{Hostname}}}}"]
    read-size: 128
    matchers:
      - type: word
        words: ["{}"]
"#,
                words
            ))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_banner_match_emits_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let _ = socket.write_all(b"220 smtp.test ESMTP ready\r\n").await;
            }
        });

        let executer = NetworkExecuter::new(Duration::from_secs(2), Duration::from_millis(10));
        let (opts, mut rx) = options();
        let template = banner_template("ESMTP");
        let unit = ExecutionUnit::Single(template);
        let target = MetaInput::new(format!("127.0.0.1:{}", addr.port()));

        let outcome = executer.execute(&unit, &target, &opts).await;
        assert!(matches!(outcome, Outcome::Matched));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.template_id, "banner-grab");
        assert_eq!(event.protocol, "network");
        assert_eq!(executer.requests(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let executer = NetworkExecuter::new(Duration::from_secs(1), Duration::from_millis(10));
        let (opts, _rx) = options();
        let unit = ExecutionUnit::Single(banner_template("anything"));
        let target = MetaInput::new(format!("127.0.0.1:{}", addr.port()));

        let outcome = executer.execute(&unit, &target, &opts).await;
        match outcome {
            Outcome::Failed(e) => {
                assert_eq!(
                    e.network_kind(),
                    Some(NetworkErrorKind::ConnectionRefused)
                );
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_requires_predicates() {
        let executer = NetworkExecuter::new(Duration::from_secs(1), Duration::from_millis(10));
        let template: Template = serde_yaml::from_str(
            r#"
id: no-predicates
info:
  name: nothing to check
network:
  - host: ["{{Hostname}}"]
"#,
        )
        .unwrap();
        assert!(executer.compile(&template).is_err());
    }
}
