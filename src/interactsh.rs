// src/interactsh.rs
//! Out-of-band interaction oracle.
//!
//! Templates that embed `{{interactsh-url}}` get a correlation payload
//! pointing at a collaborator server. A background task polls the server
//! and correlates returned interactions back to the registrations by
//! correlation-id prefix, publishing late results through the normal
//! output path. The registry is bounded and TTL-evicted; dropped entries
//! can no longer generate events.

use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::TemplarError;
use crate::input::MetaInput;
use crate::output::{OutputWriter, ResultEvent};
use crate::templates::model::{Matcher, ResponseData, Template};

pub const CORRELATION_ID_LENGTH: usize = 33;
/// Interactions are matched on this many leading characters of the id
pub const CORRELATION_PREFIX_LENGTH: usize = 20;

#[derive(Debug, Clone)]
pub struct InteractshOptions {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub cache_capacity: usize,
    pub eviction_ttl: Duration,
    pub disabled: bool,
}

impl Default for InteractshOptions {
    fn default() -> Self {
        Self {
            server_url: "https://oast.pro".to_string(),
            auth_token: None,
            poll_interval: Duration::from_secs(5),
            cooldown: Duration::from_secs(5),
            cache_capacity: 5000,
            eviction_ttl: Duration::from_secs(60),
            disabled: false,
        }
    }
}

/// One outstanding OOB request awaiting its callback
struct Registration {
    correlation_id: String,
    template: Arc<Template>,
    target: MetaInput,
    matcher: Option<Matcher>,
    request_snapshot: Option<String>,
    issued_at: Instant,
}

/// Payload handed back to the executer for substitution into the request
#[derive(Debug, Clone)]
pub struct OobPayload {
    pub correlation_id: String,
    pub url: String,
}

/// One interaction record returned by the collaborator
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    #[serde(default)]
    pub protocol: String,
    #[serde(rename = "unique-id", alias = "unique_id")]
    pub unique_id: String,
    #[serde(default, rename = "raw-request", alias = "raw_request")]
    pub raw_request: String,
    #[serde(default, rename = "raw-response", alias = "raw_response")]
    pub raw_response: String,
    #[serde(default, rename = "remote-address", alias = "remote_address")]
    pub remote_address: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    data: Vec<Interaction>,
}

/// The oracle: correlation registry plus the polling task
pub struct InteractshClient {
    options: InteractshOptions,
    server_host: String,
    http: reqwest::Client,
    writer: Arc<OutputWriter>,
    registry: Mutex<HashMap<String, Registration>>,
    last_registration: Mutex<Option<Instant>>,
    disabled: AtomicBool,
    unreachable_logged: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl InteractshClient {
    pub fn new(
        options: InteractshOptions,
        writer: Arc<OutputWriter>,
    ) -> Result<Arc<Self>, TemplarError> {
        let server_host = url::Url::parse(&options.server_url)?
            .host_str()
            .ok_or_else(|| {
                TemplarError::Config(format!(
                    "interactsh server url has no host: {}",
                    options.server_url
                ))
            })?
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let disabled = options.disabled;
        Ok(Arc::new(Self {
            options,
            server_host,
            http,
            writer,
            registry: Mutex::new(HashMap::new()),
            last_registration: Mutex::new(None),
            disabled: AtomicBool::new(disabled),
            unreachable_logged: AtomicBool::new(false),
            poll_task: Mutex::new(None),
        }))
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Issue a correlation payload and record the registration. Returns
    /// `None` when the oracle is disabled; OOB templates then run as
    /// non-triggering.
    pub async fn register(
        &self,
        template: Arc<Template>,
        target: MetaInput,
        matcher: Option<Matcher>,
        request_snapshot: Option<String>,
    ) -> Option<OobPayload> {
        if self.is_disabled() {
            return None;
        }

        let correlation_id = generate_correlation_id();
        let prefix = correlation_id[..CORRELATION_PREFIX_LENGTH].to_string();
        let payload = OobPayload {
            url: format!("{}.{}", correlation_id, self.server_host),
            correlation_id: correlation_id.clone(),
        };

        let mut registry = self.registry.lock().await;
        if registry.len() >= self.options.cache_capacity {
            evict_oldest(&mut registry);
        }
        registry.insert(
            prefix,
            Registration {
                correlation_id,
                template,
                target,
                matcher,
                request_snapshot,
                issued_at: Instant::now(),
            },
        );
        drop(registry);

        *self.last_registration.lock().await = Some(Instant::now());
        Some(payload)
    }

    /// Spawn the background poller. Call once after construction.
    pub async fn start_polling(self: &Arc<Self>) {
        if self.is_disabled() {
            return;
        }
        let client = self.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = client.options.poll_interval;
            loop {
                tokio::time::sleep(backoff).await;
                if client.is_disabled() {
                    return;
                }
                match client.poll_once().await {
                    Ok(()) => backoff = client.options.poll_interval,
                    Err(TemplarError::Network(_, message)) => {
                        client.note_unreachable(&message);
                        return;
                    }
                    Err(e) => {
                        debug!("interactsh poll error, backing off: {}", e);
                        backoff = (backoff * 2).min(Duration::from_secs(60));
                    }
                }
            }
        });
        *self.poll_task.lock().await = Some(handle);
    }

    /// One poll cycle: fetch interactions, correlate, evict stale entries
    pub async fn poll_once(&self) -> Result<(), TemplarError> {
        let mut request = self
            .http
            .get(format!("{}/poll", self.options.server_url.trim_end_matches('/')));
        if let Some(token) = &self.options.auth_token {
            request = request.header("Authorization", token.clone());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TemplarError::Execution(format!(
                "interactsh poll returned {}",
                response.status()
            )));
        }

        let poll: PollResponse = response.json().await.map_err(|e| {
            TemplarError::Execution(format!("interactsh poll body unreadable: {}", e))
        })?;

        for interaction in poll.data {
            self.handle_interaction(interaction).await;
        }
        self.evict_expired().await;
        Ok(())
    }

    /// Correlate one interaction; each registration fires at most once.
    pub async fn handle_interaction(&self, interaction: Interaction) {
        if interaction.unique_id.len() < CORRELATION_PREFIX_LENGTH {
            return;
        }
        let prefix = &interaction.unique_id[..CORRELATION_PREFIX_LENGTH];

        let registration = {
            let mut registry = self.registry.lock().await;
            registry.remove(prefix)
        };
        let Some(registration) = registration else {
            return;
        };

        let view = ResponseData {
            status: 0,
            headers: HashMap::from([
                ("protocol".to_string(), interaction.protocol.clone()),
                (
                    "remote-address".to_string(),
                    interaction.remote_address.clone(),
                ),
            ]),
            body: format!("{}\n\n{}", interaction.raw_request, interaction.raw_response),
            duration_ms: 0,
        };

        let (matched, matcher_name) = match &registration.matcher {
            Some(matcher) => (matcher.matches(&view), matcher.name.clone()),
            None => (true, None),
        };
        if !matched {
            return;
        }

        let matched_at = format!("{}.{}", registration.correlation_id, self.server_host);
        let event = ResultEvent {
            template_id: registration.template.id.clone(),
            template_path: registration.template.path.clone(),
            info: registration.template.info.clone(),
            matcher_name,
            extracted_results: vec![],
            host: registration.target.input.clone(),
            matched_at,
            protocol: format!(
                "interactsh-{}",
                if interaction.protocol.is_empty() {
                    "dns"
                } else {
                    &interaction.protocol
                }
            ),
            request: registration.request_snapshot,
            response: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.writer.write(&event);
        debug!(
            "interactsh correlated {} for template {}",
            registration.correlation_id, event.template_id
        );
    }

    async fn evict_expired(&self) {
        let ttl = self.options.eviction_ttl;
        let mut registry = self.registry.lock().await;
        registry.retain(|_, r| r.issued_at.elapsed() < ttl);
    }

    fn note_unreachable(&self, message: &str) {
        if !self.unreachable_logged.swap(true, Ordering::AcqRel) {
            warn!(
                "interactsh server unreachable, out-of-band matching disabled: {}",
                message
            );
        }
        self.disabled.store(true, Ordering::Release);
    }

    pub async fn outstanding(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Wait out the cooldown, run a final poll, and stop the poller.
    pub async fn close(&self) {
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
        if self.is_disabled() {
            return;
        }

        let has_outstanding = self.outstanding().await > 0;
        if has_outstanding {
            if let Some(last) = *self.last_registration.lock().await {
                let elapsed = last.elapsed();
                if elapsed < self.options.cooldown {
                    tokio::time::sleep(self.options.cooldown - elapsed).await;
                }
            }
            if let Err(e) = self.poll_once().await {
                debug!("final interactsh poll failed: {}", e);
            }
        }

        let deregister = self
            .http
            .post(format!(
                "{}/deregister",
                self.options.server_url.trim_end_matches('/')
            ))
            .send()
            .await;
        if let Err(e) = deregister {
            debug!("interactsh deregister failed: {}", e);
        }
        self.disabled.store(true, Ordering::Release);
    }
}

fn generate_correlation_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..CORRELATION_ID_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn evict_oldest(registry: &mut HashMap<String, Registration>) {
    if let Some(oldest) = registry
        .iter()
        .min_by_key(|(_, r)| r.issued_at)
        .map(|(k, _)| k.clone())
    {
        registry.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;

    fn template(id: &str) -> Arc<Template> {
        Arc::new(
            serde_yaml::from_str(&format!(
                r#"
id: {}
info:
  name: {}
http:
  - method: GET
    path: ["/?cb={{{{interactsh-url}}}}"]
"#,
                id, id
            ))
            .unwrap(),
        )
    }

    fn client_with_sink() -> (Arc<InteractshClient>, MemorySink) {
        let sink = MemorySink::default();
        let writer = Arc::new(OutputWriter::new(vec![Box::new(sink.clone())]));
        let client = InteractshClient::new(InteractshOptions::default(), writer).unwrap();
        (client, sink)
    }

    #[test]
    fn test_correlation_id_shape() {
        let id = generate_correlation_id();
        assert_eq!(id.len(), CORRELATION_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_register_returns_collaborator_url() {
        let (client, _) = client_with_sink();
        let payload = client
            .register(template("oob"), MetaInput::new("http://x.test"), None, None)
            .await
            .unwrap();
        assert!(payload.url.ends_with(".oast.pro"));
        assert_eq!(payload.correlation_id.len(), CORRELATION_ID_LENGTH);
        assert_eq!(client.outstanding().await, 1);
    }

    #[tokio::test]
    async fn test_disabled_oracle_registers_nothing() {
        let sink = MemorySink::default();
        let writer = Arc::new(OutputWriter::new(vec![Box::new(sink)]));
        let client = InteractshClient::new(
            InteractshOptions {
                disabled: true,
                ..Default::default()
            },
            writer,
        )
        .unwrap();
        let payload = client
            .register(template("oob"), MetaInput::new("http://x.test"), None, None)
            .await;
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn test_interaction_correlates_exactly_once() {
        let (client, sink) = client_with_sink();
        let payload = client
            .register(template("oob"), MetaInput::new("http://x.test"), None, None)
            .await
            .unwrap();

        let interaction = Interaction {
            protocol: "dns".to_string(),
            unique_id: payload.correlation_id.clone(),
            raw_request: "A query".to_string(),
            raw_response: "NOERROR".to_string(),
            remote_address: "10.0.0.9".to_string(),
        };

        client.handle_interaction(interaction.clone()).await;
        client.handle_interaction(interaction).await;

        let events = sink.collected();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].template_id, "oob");
        assert!(events[0].matched_at.contains(&payload.correlation_id));
        assert_eq!(client.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_interaction_is_dropped() {
        let (client, sink) = client_with_sink();
        client
            .handle_interaction(Interaction {
                protocol: "http".to_string(),
                unique_id: "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz".to_string(),
                raw_request: String::new(),
                raw_response: String::new(),
                remote_address: String::new(),
            })
            .await;
        assert!(sink.collected().is_empty());
    }

    #[tokio::test]
    async fn test_matcher_gates_interaction() {
        let (client, sink) = client_with_sink();
        let matcher: Matcher = serde_yaml::from_str(
            r#"
type: word
part: body
words:
  - "MX lookup"
"#,
        )
        .unwrap();
        let payload = client
            .register(
                template("oob"),
                MetaInput::new("http://x.test"),
                Some(matcher),
                None,
            )
            .await
            .unwrap();

        client
            .handle_interaction(Interaction {
                protocol: "dns".to_string(),
                unique_id: payload.correlation_id,
                raw_request: "A lookup".to_string(),
                raw_response: String::new(),
                remote_address: String::new(),
            })
            .await;
        assert!(sink.collected().is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_correlates_against_live_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let sink = MemorySink::default();
        let writer = Arc::new(OutputWriter::new(vec![Box::new(sink.clone())]));

        // Stub collaborator: register first so the poll body can carry a
        // correlated id.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = InteractshClient::new(
            InteractshOptions {
                server_url: format!("http://127.0.0.1:{}", addr.port()),
                ..Default::default()
            },
            writer,
        )
        .unwrap();

        let payload = client
            .register(template("late-oob"), MetaInput::new("http://x.test"), None, None)
            .await
            .unwrap();

        let body = format!(
            r#"{{"data":[{{"protocol":"dns","unique-id":"{}","raw-request":"A query","raw-response":"NOERROR","remote-address":"10.0.0.9"}}]}}"#,
            payload.correlation_id
        );
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buffer = [0u8; 2048];
            let _ = socket.read(&mut buffer).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });

        client.poll_once().await.unwrap();

        let events = sink.collected();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].template_id, "late-oob");
        assert!(events[0].protocol.starts_with("interactsh-"));
    }

    #[tokio::test]
    async fn test_capacity_eviction_drops_oldest() {
        let sink = MemorySink::default();
        let writer = Arc::new(OutputWriter::new(vec![Box::new(sink)]));
        let client = InteractshClient::new(
            InteractshOptions {
                cache_capacity: 2,
                ..Default::default()
            },
            writer,
        )
        .unwrap();

        for i in 0..3 {
            client
                .register(
                    template(&format!("t{}", i)),
                    MetaInput::new("http://x.test"),
                    None,
                    None,
                )
                .await
                .unwrap();
        }
        assert_eq!(client.outstanding().await, 2);
    }
}
