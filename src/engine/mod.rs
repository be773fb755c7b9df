// src/engine/mod.rs
//! The orchestrator: takes the loaded store and the input provider and
//! drives (host x template) execution through the work pool, gated by the
//! host error cache and throttled by cruise-control.

pub mod dns;
pub mod executer;
pub mod http;
pub mod network;
pub mod workpool;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cruise::CruiseControl;
use crate::error::TemplarError;
use crate::hosterrors::HostErrorCache;
use crate::input::{InputProvider, MetaInput};
use crate::interactsh::InteractshClient;
use crate::output::{OutputWriter, ResultEvent};
use crate::progress::StatsRegistry;
use crate::project::ProjectFile;
use crate::resume::{ResumeCfg, ResumeController};
use crate::templates::cluster::ExecutionUnit;
use crate::templates::store::Store;
use crate::templates::workflow::{Workflow, WorkflowStep};

use executer::{Executer, ExecuterOptions, Outcome};
use workpool::{CancellationHandle, PoolKind, WorkPool, WorkPoolConfig};

const RESULT_CHANNEL_CAPACITY: usize = 512;

/// Engine-level switches
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub disable_clustering: bool,
    pub automatic_scan: bool,
    pub headless_enabled: bool,
    pub resume_path: Option<PathBuf>,
    pub retries: u32,
}

/// The scan orchestrator. Construct leaf-first: cruise-control, caches,
/// writer, executers, then the engine; handles flow down, never back up.
pub struct Engine {
    config: EngineConfig,
    cruise: Arc<CruiseControl>,
    host_errors: Arc<HostErrorCache>,
    writer: Arc<OutputWriter>,
    stats: Arc<StatsRegistry>,
    interactsh: Option<Arc<InteractshClient>>,
    project: Option<Arc<ProjectFile>>,
    resume: Arc<ResumeController>,
    resume_from: Option<ResumeCfg>,
    workpool: Arc<WorkPool>,
    cancel: CancellationHandle,
    http: Arc<http::HttpExecuter>,
    dns: Arc<dns::DnsExecuter>,
    network: Arc<network::NetworkExecuter>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        cruise: Arc<CruiseControl>,
        host_errors: Arc<HostErrorCache>,
        writer: Arc<OutputWriter>,
        stats: Arc<StatsRegistry>,
        interactsh: Option<Arc<InteractshClient>>,
        project: Option<Arc<ProjectFile>>,
        resume_from: Option<ResumeCfg>,
        cancel: CancellationHandle,
    ) -> Result<Self, TemplarError> {
        let profile = *cruise.standard();
        let headless_profile = *cruise.headless();
        let workpool = Arc::new(WorkPool::new(
            WorkPoolConfig {
                host_concurrency: profile.concurrency.hosts,
                template_concurrency: profile.concurrency.templates,
                headless_host_concurrency: headless_profile.concurrency.hosts,
                headless_template_concurrency: headless_profile.concurrency.templates,
            },
            cancel.clone(),
        ));

        let resume = Arc::new(match &resume_from {
            Some(cfg) => ResumeController::from_cfg(cfg),
            None => ResumeController::new(),
        });

        let http = Arc::new(http::HttpExecuter::new(
            profile.durations.timeout,
            profile.durations.retry_backoff,
        )?);
        let dns = Arc::new(dns::DnsExecuter::new(
            profile.durations.timeout,
            profile.durations.retry_backoff,
        ));
        let network = Arc::new(network::NetworkExecuter::new(
            profile.durations.timeout,
            profile.durations.retry_backoff,
        ));

        Ok(Self {
            config,
            cruise,
            host_errors,
            writer,
            stats,
            interactsh,
            project,
            resume,
            resume_from,
            workpool,
            cancel,
            http,
            dns,
            network,
        })
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    pub fn resume_controller(&self) -> Arc<ResumeController> {
        self.resume.clone()
    }

    /// Total requests issued across all protocol executers
    pub fn requests_issued(&self) -> u64 {
        self.http.requests() + self.dns.requests() + self.network.requests()
    }

    /// One-time validation of every template the store published. Returns
    /// the ids that failed to compile; those are excluded from execution.
    pub fn compile_all(&self, store: &Store) -> Vec<String> {
        let mut rejected = Vec::new();
        for template in store.templates() {
            let compiled = self
                .http
                .compile(template)
                .and_then(|_| self.dns.compile(template))
                .and_then(|_| self.network.compile(template));
            if let Err(e) = compiled {
                warn!("{}", e);
                rejected.push(template.id.clone());
                continue;
            }

            let unsupported = template.unsupported_blocks();
            if unsupported > 0 {
                self.stats.incr_warnings();
                self.writer.warn_once(&format!(
                    "template {} has {} request blocks with no compiled-in executer",
                    template.id, unsupported
                ));
            }
            let dsl = template.dsl_matcher_count();
            if dsl > 0 {
                self.stats.incr_warnings();
                self.writer.warn_once(&format!(
                    "template {} uses {} dsl matchers, which are dispatched but never match",
                    template.id, dsl
                ));
            }
        }
        rejected
    }

    /// Run the full scan. Returns true when at least one result was found.
    pub async fn execute_scan(
        &self,
        store: &Store,
        inputs: &InputProvider,
    ) -> Result<bool, TemplarError> {
        if store.is_empty() {
            return Err(TemplarError::Config("no templates to execute".to_string()));
        }
        if inputs.is_empty() {
            return Err(TemplarError::Config("no targets to scan".to_string()));
        }

        let rejected: HashSet<String> = self.compile_all(store).into_iter().collect();
        // Templates referenced by a workflow execute through the workflow
        // gating, never directly.
        let workflow_refs: HashSet<String> = store
            .workflows()
            .iter()
            .flat_map(|w| w.referenced_templates())
            .collect();
        let units: Vec<ExecutionUnit> = self
            .store_units(store)
            .into_iter()
            .filter(|u| {
                u.templates()
                    .iter()
                    .all(|t| !rejected.contains(&t.id) && !workflow_refs.contains(&t.id))
            })
            .filter(|u| {
                if !self.config.headless_enabled && u.representative().is_headless() {
                    self.stats.incr_skipped();
                    debug!("headless template {} skipped, pool disabled", unit_label(u));
                    return false;
                }
                true
            })
            .collect();

        let found_any = if self.config.automatic_scan {
            if !store.workflows().is_empty() {
                warn!("automatic scan takes precedence, explicit workflows are skipped");
            }
            self.execute_automatic(units, inputs).await
        } else {
            let found = self.execute_units(&units, inputs, None).await;
            let wf_found = self.execute_workflows(store, inputs).await;
            found || wf_found
        };

        self.workpool.wait().await;
        if let Some(oracle) = &self.interactsh {
            oracle.close().await;
        }

        if self.cancel.is_cancelled() {
            if let Some(path) = &self.config.resume_path {
                self.resume.save(path)?;
            }
        }

        Ok(found_any)
    }

    fn store_units(&self, store: &Store) -> Vec<ExecutionUnit> {
        let units = store.execution_units(self.config.disable_clustering);
        debug!("engine scheduling {} execution units", units.len());
        units
    }

    /// Dispatch every unit against every input. `host_filter` restricts
    /// units per host (used by the automatic-scan expansion phase).
    async fn execute_units(
        &self,
        units: &[ExecutionUnit],
        inputs: &InputProvider,
        host_filter: Option<&HashMap<String, HashSet<String>>>,
    ) -> bool {
        let total = (inputs.count() * units.len()) as u64;
        self.stats.set_total(self.stats.snapshot().total + total);

        let (tx, rx) = mpsc::channel::<ResultEvent>(RESULT_CHANNEL_CAPACITY);
        let found_any = Arc::new(AtomicBool::new(false));
        let forwarder = self.spawn_forwarder(rx, found_any.clone());

        let opts = ExecuterOptions {
            cruise: self.cruise.clone(),
            interactsh: self.interactsh.clone(),
            project: self.project.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
            results: tx.clone(),
            retries: self.config.retries,
        };

        for (index, target) in inputs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                debug!("cancellation observed, no new hosts dispatched");
                break;
            }

            let standard: Vec<ExecutionUnit> = units
                .iter()
                .filter(|u| !u.representative().is_headless())
                .cloned()
                .collect();
            let headless: Vec<ExecutionUnit> = units
                .iter()
                .filter(|u| u.representative().is_headless())
                .cloned()
                .collect();

            for (kind, pool_units) in [
                (PoolKind::Standard, standard),
                (PoolKind::Headless, headless),
            ] {
                if pool_units.is_empty() {
                    continue;
                }
                let Ok(host_permit) = self.workpool.acquire_host(kind).await else {
                    break;
                };
                let job = self.host_job(
                    kind,
                    pool_units,
                    target.clone(),
                    index as u64,
                    opts.clone(),
                    host_filter.map(|f| f.get(&target.host()).cloned().unwrap_or_default()),
                );
                self.workpool
                    .spawn(async move {
                        job.await;
                        drop(host_permit);
                    })
                    .await;
            }
        }

        drop(opts);
        drop(tx);
        self.workpool.wait().await;
        let _ = forwarder.await;
        found_any.load(Ordering::Acquire)
    }

    fn spawn_forwarder(
        &self,
        mut rx: mpsc::Receiver<ResultEvent>,
        found_any: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if writer.write(&event) {
                    found_any.store(true, Ordering::Release);
                }
            }
        })
    }

    /// Everything one host needs: template tokens, error gating, dispatch
    fn host_job(
        &self,
        kind: PoolKind,
        units: Vec<ExecutionUnit>,
        target: MetaInput,
        target_index: u64,
        opts: ExecuterOptions,
        allowed_tags: Option<HashSet<String>>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let workpool = self.workpool.clone();
        let host_errors = self.host_errors.clone();
        let resume = self.resume.clone();
        let resume_from = self.resume_from.clone();
        let stats = self.stats.clone();
        let http = self.http.clone();
        let dns = self.dns.clone();
        let network = self.network.clone();

        async move {
            let template_tokens = workpool.template_tokens(kind);
            let host = target.host();
            let mut inner = Vec::new();

            for unit in units {
                if opts.cancel.is_cancelled() {
                    break;
                }

                if let Some(allowed) = &allowed_tags {
                    let relevant = unit.templates().iter().any(|t| {
                        t.info.tags.iter().any(|tag| allowed.contains(tag))
                    });
                    if !relevant {
                        continue;
                    }
                }

                if host_errors.check(&host) {
                    stats.incr_skipped();
                    debug!("skipping {} for {}: too many errors", unit_label(&unit), host);
                    continue;
                }

                if let Some(cfg) = &resume_from {
                    let pending = unit.templates().iter().any(|t| {
                        cfg.should_run(&t.id, target_index, &target)
                    });
                    if !pending {
                        stats.incr_skipped();
                        continue;
                    }
                }

                let Ok(permit) = workpool.acquire_template(&template_tokens).await else {
                    break;
                };

                let unit = unit.clone();
                let target = target.clone();
                let host = host.clone();
                let opts = opts.clone();
                let host_errors = host_errors.clone();
                let resume = resume.clone();
                let stats = stats.clone();
                let http = http.clone();
                let dns = dns.clone();
                let network = network.clone();

                inner.push(tokio::spawn(async move {
                    for template in unit.templates() {
                        resume.mark_started(&template.id, &target);
                    }

                    // Re-check after the token wait: errors recorded while
                    // queued must still open the breaker before any call.
                    if host_errors.check(&host) {
                        stats.incr_skipped();
                    } else {
                        let outcome =
                            execute_unit(&http, &dns, &network, &unit, &target, &opts).await;
                        handle_outcome(&outcome, &unit, &target, &host, &host_errors, &stats);
                    }

                    for template in unit.templates() {
                        resume.mark_completed(&template.id, &target);
                    }
                    drop(permit);
                }));
            }

            for handle in inner {
                let _ = handle.await;
            }
        }
    }

    /// Smart scan: detect technologies first, then expand per host
    async fn execute_automatic(&self, units: Vec<ExecutionUnit>, inputs: &InputProvider) -> bool {
        let (detection, rest): (Vec<ExecutionUnit>, Vec<ExecutionUnit>) =
            units.into_iter().partition(|u| {
                u.templates()
                    .iter()
                    .any(|t| t.info.tags.iter().any(|tag| tag == "tech"))
            });

        if detection.is_empty() {
            warn!("automatic scan requested but no tech-detection templates are loaded");
            return false;
        }

        info!(
            "automatic scan: running {} detection units first",
            detection.len()
        );

        // Capture detection results on a side channel so the expansion
        // phase can map hosts to technologies.
        let (tx, mut rx) = mpsc::channel::<ResultEvent>(RESULT_CHANNEL_CAPACITY);
        let collected = tokio::spawn(async move {
            let mut per_host: HashMap<String, HashSet<String>> = HashMap::new();
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                let host = MetaInput::new(event.host.clone()).host();
                let tags = per_host.entry(host).or_default();
                if let Some(name) = &event.matcher_name {
                    tags.insert(name.to_lowercase());
                }
                for value in &event.extracted_results {
                    tags.insert(value.to_lowercase());
                }
                events.push(event);
            }
            (per_host, events)
        });

        {
            let opts = ExecuterOptions {
                cruise: self.cruise.clone(),
                interactsh: self.interactsh.clone(),
                project: self.project.clone(),
                stats: self.stats.clone(),
                cancel: self.cancel.clone(),
                results: tx,
                retries: self.config.retries,
            };
            self.run_detection_phase(&detection, inputs, opts).await;
        }

        let (per_host, events) = collected.await.unwrap_or_default();
        let mut found_any = false;
        for event in &events {
            found_any |= self.writer.write(event);
        }

        let detected: usize = per_host.values().map(|t| t.len()).sum();
        info!(
            "automatic scan: detected {} technologies across {} hosts",
            detected,
            per_host.len()
        );

        found_any |= self.execute_units(&rest, inputs, Some(&per_host)).await;
        found_any
    }

    async fn run_detection_phase(
        &self,
        detection: &[ExecutionUnit],
        inputs: &InputProvider,
        opts: ExecuterOptions,
    ) {
        self.stats
            .set_total(self.stats.snapshot().total + (inputs.count() * detection.len()) as u64);

        for (index, target) in inputs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(host_permit) = self.workpool.acquire_host(PoolKind::Standard).await else {
                break;
            };
            let job = self.host_job(
                PoolKind::Standard,
                detection.to_vec(),
                target.clone(),
                index as u64,
                opts.clone(),
                None,
            );
            self.workpool
                .spawn(async move {
                    job.await;
                    drop(host_permit);
                })
                .await;
        }
        self.workpool.wait().await;
    }

    /// Run every workflow: a step's subtemplates execute only when the
    /// step's template matched (optionally a specific matcher).
    async fn execute_workflows(&self, store: &Store, inputs: &InputProvider) -> bool {
        if store.workflows().is_empty() {
            return false;
        }

        let by_id: HashMap<String, ExecutionUnit> = store
            .templates()
            .iter()
            .map(|t| (t.id.clone(), ExecutionUnit::Single(t.clone())))
            .collect();

        let mut found_any = false;
        for workflow in store.workflows() {
            for target in inputs.iter() {
                if self.cancel.is_cancelled() {
                    return found_any;
                }
                found_any |= self
                    .execute_workflow_steps(workflow, &workflow.workflows, target, &by_id)
                    .await;
            }
        }
        found_any
    }

    async fn execute_workflow_steps(
        &self,
        workflow: &Workflow,
        steps: &[WorkflowStep],
        target: &MetaInput,
        by_id: &HashMap<String, ExecutionUnit>,
    ) -> bool {
        let mut found_any = false;
        for step in steps {
            let Some(unit) = by_id.get(&step.template) else {
                continue;
            };
            let host = target.host();
            if self.host_errors.check(&host) {
                self.stats.incr_skipped();
                continue;
            }

            let (outcome, events) = self.execute_unit_collect(unit, target).await;
            handle_outcome(
                &outcome,
                unit,
                target,
                &host,
                &self.host_errors,
                &self.stats,
            );

            let mut step_passed = false;
            for event in &events {
                found_any |= self.writer.write(event);
                step_passed |= match &step.matcher_name {
                    Some(name) => event.matcher_name.as_deref() == Some(name.as_str()),
                    None => true,
                };
            }

            if step_passed && !step.subtemplates.is_empty() {
                debug!(
                    "workflow {}: step {} matched, descending",
                    workflow.id, step.template
                );
                found_any |= Box::pin(self.execute_workflow_steps(
                    workflow,
                    &step.subtemplates,
                    target,
                    by_id,
                ))
                .await;
            }
        }
        found_any
    }

    /// Execute one unit and collect its events instead of streaming them
    async fn execute_unit_collect(
        &self,
        unit: &ExecutionUnit,
        target: &MetaInput,
    ) -> (Outcome, Vec<ResultEvent>) {
        let (tx, mut rx) = mpsc::channel::<ResultEvent>(RESULT_CHANNEL_CAPACITY);
        // Drain concurrently so a chatty unit can never fill the channel
        // and block its own sender.
        let collector = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        let opts = ExecuterOptions {
            cruise: self.cruise.clone(),
            interactsh: self.interactsh.clone(),
            project: self.project.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
            results: tx,
            retries: self.config.retries,
        };

        let outcome = execute_unit(&self.http, &self.dns, &self.network, unit, target, &opts).await;
        drop(opts);

        let events = collector.await.unwrap_or_default();
        (outcome, events)
    }
}

/// Dispatch one unit to the executer(s) matching its request blocks
async fn execute_unit(
    http: &Arc<http::HttpExecuter>,
    dns: &Arc<dns::DnsExecuter>,
    network: &Arc<network::NetworkExecuter>,
    unit: &ExecutionUnit,
    target: &MetaInput,
    opts: &ExecuterOptions,
) -> Outcome {
    let template = unit.representative();

    if matches!(unit, ExecutionUnit::Cluster(_)) {
        return http.execute(unit, target, opts).await;
    }

    let mut matched = false;
    let mut failure: Option<TemplarError> = None;
    let mut executed = false;
    let mut skip_reason: Option<String> = None;

    let executers: [&dyn Executer; 3] = [http.as_ref(), dns.as_ref(), network.as_ref()];
    for exec in executers {
        let applicable = match exec.protocol() {
            "http" => !template.http.is_empty(),
            "dns" => !template.dns.is_empty(),
            "network" => !template.network.is_empty(),
            _ => false,
        };
        if !applicable {
            continue;
        }
        executed = true;
        match exec.execute(unit, target, opts).await {
            Outcome::Matched => {
                matched = true;
                if template.stop_at_first_match {
                    break;
                }
            }
            Outcome::NoMatch => {}
            Outcome::Failed(TemplarError::Cancelled) => {
                return Outcome::Failed(TemplarError::Cancelled)
            }
            Outcome::Failed(e) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Outcome::Skipped(reason) => skip_reason = Some(reason),
        }
    }

    if !executed && template.unsupported_blocks() > 0 {
        return Outcome::Skipped("unsupported protocol".to_string());
    }

    if matched {
        Outcome::Matched
    } else if let Some(e) = failure {
        Outcome::Failed(e)
    } else if !executed {
        Outcome::Skipped(skip_reason.unwrap_or_else(|| "no executable blocks".to_string()))
    } else {
        Outcome::NoMatch
    }
}

fn handle_outcome(
    outcome: &Outcome,
    unit: &ExecutionUnit,
    target: &MetaInput,
    host: &str,
    host_errors: &HostErrorCache,
    stats: &StatsRegistry,
) {
    match outcome {
        Outcome::Matched | Outcome::NoMatch => {}
        Outcome::Failed(TemplarError::Cancelled) => {}
        Outcome::Failed(e) => {
            stats.incr_failed();
            host_errors.mark_failed(host, e);
            warn!(
                "{} failed against {}: {}",
                unit_label(unit),
                target,
                e
            );
        }
        Outcome::Skipped(reason) => {
            stats.incr_skipped();
            debug!("{} skipped for {}: {}", unit_label(unit), target, reason);
        }
    }
}

fn unit_label(unit: &ExecutionUnit) -> String {
    match unit {
        ExecutionUnit::Single(t) => t.id.clone(),
        ExecutionUnit::Cluster(ts) => format!("cluster[{}]", ts.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;
    use crate::templates::store::StoreConfig;
    use crate::templates::Catalog;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 stub that answers every request with 200 and the
    /// given body, counting the requests it serves.
    async fn stub_server(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nServer: stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let mut buffer = [0u8; 4096];
                let _ = socket.read(&mut buffer).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://127.0.0.1:{}", addr.port()), hits)
    }

    fn write_status_template(dir: &std::path::Path, id: &str, path: &str, word: Option<&str>) {
        let matcher = match word {
            Some(word) => format!(
                r#"
      - type: word
        part: body
        words: ["{}"]"#,
                word
            ),
            None => r#"
      - type: status
        status: [200]"#
                .to_string(),
        };
        let yaml = format!(
            r#"
id: {}
info:
  name: {}
  severity: high
http:
  - method: GET
    path: ["{{{{BaseURL}}}}{}"]
    matchers:{}
"#,
            id, id, path, matcher
        );
        std::fs::write(dir.join(format!("{}.yaml", id)), yaml).unwrap();
    }

    struct Harness {
        engine: Engine,
        store: Store,
        sink: MemorySink,
        stats: Arc<StatsRegistry>,
        host_errors: Arc<HostErrorCache>,
    }

    fn harness(dir: &std::path::Path, max_host_errors: u32, template_concurrency: usize) -> Harness {
        let mut profile = crate::cruise::Profile::default();
        profile.concurrency.templates = template_concurrency;
        profile.durations.timeout = std::time::Duration::from_secs(2);
        profile.rate.requests_per_second = 0;
        let cruise = Arc::new(CruiseControl::new(profile, profile));

        let sink = MemorySink::default();
        let writer = Arc::new(OutputWriter::new(vec![Box::new(sink.clone())]));
        let stats = StatsRegistry::new();
        let host_errors = Arc::new(HostErrorCache::new(max_host_errors, vec![]));

        let mut store = Store::new(StoreConfig::default());
        let catalog = Catalog::new(dir);
        store.load(&catalog, &[".".to_string()]).unwrap();

        let engine = Engine::new(
            EngineConfig {
                retries: 0,
                ..Default::default()
            },
            cruise,
            host_errors.clone(),
            writer,
            stats.clone(),
            None,
            None,
            None,
            CancellationHandle::new(),
        )
        .unwrap();

        Harness {
            engine,
            store,
            sink,
            stats,
            host_errors,
        }
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("templar-engine-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_single_template_single_target_match() {
        let dir = temp_dir("single");
        write_status_template(&dir, "status-ok", "/", None);
        let (base, hits) = stub_server("welcome").await;

        let h = harness(&dir, 30, 4);
        let mut inputs = InputProvider::new();
        inputs.add(MetaInput::new(base.clone()));

        let found = h.engine.execute_scan(&h.store, &inputs).await.unwrap();
        assert!(found);

        let events = h.sink.collected();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].template_id, "status-ok");
        assert_eq!(events[0].protocol, "http");
        assert!(events[0].matched_at.starts_with(&base));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_host_error_circuit_breaker() {
        let dir = temp_dir("breaker");
        // Distinct paths so the templates do not cluster
        for i in 0..10 {
            write_status_template(&dir, &format!("probe-{}", i), &format!("/p{}", i), None);
        }

        // Bind then drop for a connection-refused target
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target = format!("http://127.0.0.1:{}", addr.port());

        // Serialized templates so failures accumulate deterministically
        let h = harness(&dir, 3, 1);
        let mut inputs = InputProvider::new();
        inputs.add(MetaInput::new(target));

        let found = h.engine.execute_scan(&h.store, &inputs).await.unwrap();
        assert!(!found);
        assert!(h.sink.collected().is_empty());

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.failed, 3);
        assert_eq!(snapshot.skipped, 7);
        assert!(h.host_errors.check("127.0.0.1"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_cluster_issues_one_request() {
        let dir = temp_dir("cluster");
        // Five identical requests, different matchers; two can match
        write_status_template(&dir, "m-status", "/admin", None);
        write_status_template(&dir, "m-welcome", "/admin", Some("welcome"));
        write_status_template(&dir, "m-absent-1", "/admin", Some("zzz-not-there"));
        write_status_template(&dir, "m-absent-2", "/admin", Some("yyy-not-there"));
        write_status_template(&dir, "m-absent-3", "/admin", Some("xxx-not-there"));

        let (base, hits) = stub_server("welcome").await;
        let h = harness(&dir, 30, 4);
        assert_eq!(h.store.execution_units(false).len(), 1);

        let mut inputs = InputProvider::new();
        inputs.add(MetaInput::new(base));

        let found = h.engine.execute_scan(&h.store, &inputs).await.unwrap();
        assert!(found);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let mut matched: Vec<String> = h
            .sink
            .collected()
            .into_iter()
            .map(|e| e.template_id)
            .collect();
        matched.sort();
        assert_eq!(matched, vec!["m-status", "m-welcome"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_multiple_targets_each_reported_once() {
        let dir = temp_dir("targets");
        write_status_template(&dir, "status-ok", "/", None);
        let (base_a, _) = stub_server("alpha").await;
        let (base_b, _) = stub_server("beta").await;

        let h = harness(&dir, 30, 4);
        let mut inputs = InputProvider::new();
        inputs.add(MetaInput::new(base_a));
        inputs.add(MetaInput::new(base_b));

        h.engine.execute_scan(&h.store, &inputs).await.unwrap();
        assert_eq!(h.sink.collected().len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_scan_writes_resume_file() {
        let dir = temp_dir("resume");
        write_status_template(&dir, "status-ok", "/", None);
        let resume_path = dir.join("resume.json");

        let mut profile = crate::cruise::Profile::default();
        profile.rate.requests_per_second = 0;
        let cruise = Arc::new(CruiseControl::new(profile, profile));
        let writer = Arc::new(OutputWriter::new(vec![]));
        let cancel = CancellationHandle::new();
        let engine = Engine::new(
            EngineConfig {
                resume_path: Some(resume_path.clone()),
                retries: 0,
                ..Default::default()
            },
            cruise,
            Arc::new(HostErrorCache::new(30, vec![])),
            writer,
            StatsRegistry::new(),
            None,
            None,
            None,
            cancel.clone(),
        )
        .unwrap();

        let mut store = Store::new(StoreConfig::default());
        store.load(&Catalog::new(&dir), &[".".to_string()]).unwrap();
        let mut inputs = InputProvider::new();
        inputs.add(MetaInput::new("http://127.0.0.1:9"));

        // Cancel before dispatch: the scan drains immediately and must
        // still persist its (empty) progress.
        cancel.cancel();
        let _ = engine.execute_scan(&store, &inputs).await;
        assert!(resume_path.is_file());
        let cfg = ResumeCfg::load(&resume_path).unwrap();
        assert!(!cfg.scan_id.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_workflow_subtemplates_gated_on_match() {
        let dir = temp_dir("workflow");
        write_status_template(&dir, "detect", "/", Some("welcome"));
        write_status_template(&dir, "followup", "/", None);
        write_status_template(&dir, "never", "/", Some("zz-absent"));
        std::fs::write(
            dir.join("chain.yaml"),
            r#"
id: chain
workflows:
  - template: detect
    subtemplates:
      - template: followup
  - template: never
    subtemplates:
      - template: followup
"#,
        )
        .unwrap();

        let (base, _) = stub_server("welcome").await;
        let h = harness(&dir, 30, 4);
        let mut inputs = InputProvider::new();
        inputs.add(MetaInput::new(base));

        let found = h.engine.execute_scan(&h.store, &inputs).await.unwrap();
        assert!(found);
        let ids: Vec<String> = h
            .sink
            .collected()
            .into_iter()
            .map(|e| e.template_id)
            .collect();
        // The workflow runs detect and its gated followup; "never" does
        // not match so its subtree stays untouched.
        assert!(ids.contains(&"detect".to_string()));
        assert!(ids.contains(&"followup".to_string()));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
