// src/sdk.rs
//! Programmatic facade over the engine.
//!
//! `TemplarEngine` wires the whole stack together in leaf-first order:
//! cruise-control, caches, output writer, oracle, then the engine itself.
//! Single-instance mode shares pools across calls; thread-safe mode gives
//! every facade its own sub-engine and rejects options that would couple
//! instances (rate-limit composition and persistent caches).

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cruise::{Concurrency, CruiseControl, Durations, Profile, Rate};
use crate::engine::workpool::CancellationHandle;
use crate::engine::{Engine, EngineConfig};
use crate::error::TemplarError;
use crate::hosterrors::{HostErrorCache, DEFAULT_MAX_ERRORS};
use crate::input::InputProvider;
use crate::interactsh::{InteractshClient, InteractshOptions};
use crate::output::{
    FileSink, JsonSink, MemorySink, OutputSink, OutputWriter, ResultEvent, TextSink,
};
use crate::progress::StatsRegistry;
use crate::project::ProjectFile;
use crate::resume::ResumeCfg;
use crate::templates::model::Template;
use crate::templates::store::{Store, StoreConfig, TemplateFilter};
use crate::templates::{Catalog, Severity};

/// Everything a scan needs, with CLI-aligned defaults
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub templates: Vec<String>,
    pub templates_dir: PathBuf,
    pub targets: Vec<String>,
    pub target_list: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub json: bool,
    pub no_color: bool,
    pub severities: Vec<Severity>,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub authors: Vec<String>,
    pub template_ids: Vec<String>,
    pub protocols: Vec<String>,
    pub rate_limit: u32,
    pub burst: u32,
    pub host_concurrency: usize,
    pub template_concurrency: usize,
    pub headless_host_concurrency: usize,
    pub headless_template_concurrency: usize,
    pub timeout_secs: u64,
    pub retries: u32,
    pub max_host_errors: u32,
    pub track_errors: Vec<String>,
    pub project_path: Option<PathBuf>,
    pub resume_path: Option<PathBuf>,
    pub interactsh_url: Option<String>,
    pub no_interactsh: bool,
    pub disable_clustering: bool,
    pub automatic_scan: bool,
    pub headless: bool,
    pub validate_signatures: bool,
    pub stats: bool,
    pub stats_interval_secs: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            templates_dir: PathBuf::from("."),
            targets: Vec::new(),
            target_list: None,
            output_file: None,
            json: false,
            no_color: false,
            severities: Vec::new(),
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            authors: Vec::new(),
            template_ids: Vec::new(),
            protocols: Vec::new(),
            rate_limit: 150,
            burst: 150,
            host_concurrency: 25,
            template_concurrency: 25,
            headless_host_concurrency: 10,
            headless_template_concurrency: 10,
            timeout_secs: 10,
            retries: 1,
            max_host_errors: DEFAULT_MAX_ERRORS,
            track_errors: Vec::new(),
            project_path: None,
            resume_path: None,
            interactsh_url: None,
            no_interactsh: false,
            disable_clustering: false,
            automatic_scan: false,
            headless: false,
            validate_signatures: false,
            stats: false,
            stats_interval_secs: 5,
        }
    }
}

impl ScanOptions {
    pub fn validate(&self) -> Result<(), TemplarError> {
        if self.host_concurrency == 0 {
            return Err(TemplarError::Config(
                "host concurrency must be positive".to_string(),
            ));
        }
        if self.template_concurrency == 0 {
            return Err(TemplarError::Config(
                "template concurrency must be positive".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(TemplarError::Config("timeout must be positive".to_string()));
        }
        if let Some(url) = &self.interactsh_url {
            url::Url::parse(url)
                .map_err(|e| TemplarError::Config(format!("invalid interactsh url: {}", e)))?;
        }
        Ok(())
    }

    fn cruise(&self) -> CruiseControl {
        let standard = Profile {
            concurrency: Concurrency {
                hosts: self.host_concurrency,
                templates: self.template_concurrency,
                payloads: self.template_concurrency,
            },
            durations: Durations {
                timeout: Duration::from_secs(self.timeout_secs),
                retry_backoff: Duration::from_millis(100),
            },
            rate: Rate {
                requests_per_second: self.rate_limit,
                burst: self.burst,
            },
        };
        let headless = Profile {
            concurrency: Concurrency {
                hosts: self.headless_host_concurrency,
                templates: self.headless_template_concurrency,
                payloads: self.headless_template_concurrency,
            },
            ..standard
        };
        CruiseControl::new(standard, headless)
    }

    fn filter(&self) -> TemplateFilter {
        TemplateFilter {
            tags: self.tags.clone(),
            exclude_tags: self.exclude_tags.clone(),
            severities: self.severities.clone(),
            authors: self.authors.clone(),
            ids: self.template_ids.clone(),
            protocols: self.protocols.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineMode {
    SingleInstance,
    ThreadSafe,
}

/// Result callback invoked for every published event
pub type ResultCallback = Arc<dyn Fn(&ResultEvent) + Send + Sync>;

struct CallbackSink {
    callback: ResultCallback,
}

impl OutputSink for CallbackSink {
    fn write_event(&mut self, event: &ResultEvent) -> Result<(), TemplarError> {
        (self.callback)(event);
        Ok(())
    }
}

/// The stable programmatic surface
pub struct TemplarEngine {
    options: ScanOptions,
    mode: EngineMode,
    cruise: Arc<CruiseControl>,
    host_errors: Arc<HostErrorCache>,
    writer: Arc<OutputWriter>,
    stats: Arc<StatsRegistry>,
    interactsh: Option<Arc<InteractshClient>>,
    store: Store,
    inputs: InputProvider,
    engine: Engine,
    memory_sink: MemorySink,
    templates_loaded: bool,
    closed: bool,
}

impl std::fmt::Debug for TemplarEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplarEngine").finish()
    }
}

impl TemplarEngine {
    /// Shared-pool engine, the default mode
    pub fn new(options: ScanOptions) -> Result<Self, TemplarError> {
        Self::build(options, EngineMode::SingleInstance)
    }

    /// Isolated engine for concurrent embedding. Options that couple
    /// instances are rejected.
    pub fn new_thread_safe(options: ScanOptions) -> Result<Self, TemplarError> {
        if options.project_path.is_some() {
            return Err(TemplarError::Config(
                "project-path is not supported in thread safe mode".to_string(),
            ));
        }
        let defaults = ScanOptions::default();
        if options.rate_limit != defaults.rate_limit || options.burst != defaults.burst {
            return Err(TemplarError::Config(
                "rate-limit overrides are not supported in thread safe mode".to_string(),
            ));
        }
        Self::build(options, EngineMode::ThreadSafe)
    }

    fn build(options: ScanOptions, mode: EngineMode) -> Result<Self, TemplarError> {
        options.validate()?;

        let cruise = Arc::new(options.cruise());
        let host_errors = Arc::new(HostErrorCache::new(
            options.max_host_errors,
            options.track_errors.clone(),
        ));
        let stats = StatsRegistry::new();

        let memory_sink = MemorySink::default();
        let mut sinks: Vec<Box<dyn OutputSink>> = Vec::new();
        if options.json {
            sinks.push(Box::new(JsonSink));
        } else {
            sinks.push(Box::new(TextSink::new(!options.no_color)));
        }
        if let Some(path) = &options.output_file {
            sinks.push(Box::new(FileSink::create(path)?));
        }
        sinks.push(Box::new(memory_sink.clone()));
        let writer = Arc::new(OutputWriter::new(sinks));

        let project = match &options.project_path {
            Some(path) => Some(Arc::new(ProjectFile::open(path)?)),
            None => None,
        };

        let interactsh = if options.no_interactsh {
            None
        } else {
            let mut oracle_options = InteractshOptions::default();
            if let Some(url) = &options.interactsh_url {
                oracle_options.server_url = url.clone();
            }
            Some(InteractshClient::new(oracle_options, writer.clone())?)
        };

        let resume_from = match &options.resume_path {
            Some(path) if path.is_file() => Some(ResumeCfg::load(path)?),
            _ => None,
        };

        let cancel = CancellationHandle::new();
        let engine = Engine::new(
            EngineConfig {
                disable_clustering: options.disable_clustering,
                automatic_scan: options.automatic_scan,
                headless_enabled: options.headless,
                resume_path: options.resume_path.clone(),
                retries: options.retries,
            },
            cruise.clone(),
            host_errors.clone(),
            writer.clone(),
            stats.clone(),
            interactsh.clone(),
            project,
            resume_from,
            cancel,
        )?;

        let store = Store::new(StoreConfig {
            filter: options.filter(),
            exclude_tags_from_ignore: Vec::new(),
            validate_signatures: options.validate_signatures,
            suppress_unsigned_warning: false,
        });

        Ok(Self {
            options,
            mode,
            cruise,
            host_errors,
            writer,
            stats,
            interactsh,
            store,
            inputs: InputProvider::new(),
            engine,
            memory_sink,
            templates_loaded: false,
            closed: false,
        })
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.engine.cancellation()
    }

    pub fn is_thread_safe(&self) -> bool {
        self.mode == EngineMode::ThreadSafe
    }

    /// Add targets (urls, hosts, host:port)
    pub fn load_targets(&mut self, targets: &[String]) {
        for target in targets {
            self.inputs.add(crate::input::MetaInput::new(target));
        }
    }

    pub fn load_targets_from_reader(&mut self, reader: impl BufRead) -> Result<(), TemplarError> {
        self.inputs.load_reader(reader)
    }

    /// Resolve and load every template the options select
    pub fn load_all_templates(&mut self) -> Result<(), TemplarError> {
        let catalog = Catalog::new(&self.options.templates_dir);
        let patterns = if self.options.templates.is_empty() {
            vec![".".to_string()]
        } else {
            self.options.templates.clone()
        };
        self.store.load(&catalog, &patterns)?;
        self.templates_loaded = true;
        Ok(())
    }

    pub fn templates(&self) -> &[Arc<Template>] {
        self.store.templates()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn stats(&self) -> Arc<StatsRegistry> {
        self.stats.clone()
    }

    /// All events published so far (deduplicated)
    pub fn results(&self) -> Vec<ResultEvent> {
        self.memory_sink.collected()
    }

    /// Load targets and templates as configured, run the scan, and invoke
    /// the callback for every published result. Returns true when at
    /// least one result was found.
    pub async fn execute_with_callback(
        &mut self,
        callback: Option<ResultCallback>,
    ) -> Result<bool, TemplarError> {
        if self.closed {
            return Err(TemplarError::Config("engine is closed".to_string()));
        }
        if !self.templates_loaded {
            self.load_all_templates()?;
        }
        if self.store.is_empty() {
            return Err(TemplarError::Config(
                "no templates available after filtering".to_string(),
            ));
        }

        for target in self.options.targets.clone() {
            self.inputs.add(crate::input::MetaInput::new(target));
        }
        if let Some(list) = self.options.target_list.clone() {
            self.inputs.load_file(&list)?;
        }
        if self.inputs.is_empty() {
            return Err(TemplarError::Config("no targets to scan".to_string()));
        }

        if let Some(callback) = callback {
            self.writer.add_sink(Box::new(CallbackSink { callback }));
        }

        if let Some(oracle) = &self.interactsh {
            oracle.start_polling().await;
        }
        let _reporter = if self.options.stats {
            Some(
                self.stats
                    .spawn_reporter(Duration::from_secs(self.options.stats_interval_secs.max(1))),
            )
        } else {
            None
        };

        info!(
            "scanning {} targets with {} templates",
            self.inputs.count(),
            self.store.templates().len()
        );
        let found = self.engine.execute_scan(&self.store, &self.inputs).await?;

        let snapshot = self.stats.snapshot();
        info!(
            "scan finished: {} requests issued, {} matched, {} failed, {} skipped",
            self.engine.requests_issued(),
            snapshot.matched,
            snapshot.failed,
            snapshot.skipped
        );
        Ok(found)
    }

    /// Release every shared resource; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cruise.close();
        self.host_errors.close();
        self.writer.close();
    }
}

impl Drop for TemplarEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_safe_rejects_project_path() {
        let options = ScanOptions {
            project_path: Some(PathBuf::from("/tmp/templar-cache")),
            ..Default::default()
        };
        let err = TemplarEngine::new_thread_safe(options).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_thread_safe_rejects_rate_limit_override() {
        let options = ScanOptions {
            rate_limit: 10,
            ..Default::default()
        };
        assert!(TemplarEngine::new_thread_safe(options).is_err());
        assert!(TemplarEngine::new_thread_safe(ScanOptions::default()).is_ok());
    }

    #[test]
    fn test_options_validation() {
        let options = ScanOptions {
            host_concurrency: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ScanOptions {
            interactsh_url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        assert!(ScanOptions::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_execute_without_targets_is_config_error() {
        let dir = std::env::temp_dir().join(format!("templar-sdk-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("t.yaml"),
            r#"
id: t
info:
  name: t
http:
  - method: GET
    path: ["{{BaseURL}}/"]
    matchers:
      - type: status
        status: [200]
"#,
        )
        .unwrap();

        let options = ScanOptions {
            templates_dir: dir.clone(),
            no_interactsh: true,
            ..Default::default()
        };
        let mut engine = TemplarEngine::new(options).unwrap();
        let err = engine.execute_with_callback(None).await.unwrap_err();
        assert!(matches!(err, TemplarError::Config(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_execute_without_templates_is_config_error() {
        let dir = std::env::temp_dir().join(format!("templar-sdk-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let options = ScanOptions {
            templates_dir: dir.clone(),
            targets: vec!["http://127.0.0.1:1".to_string()],
            no_interactsh: true,
            ..Default::default()
        };
        let mut engine = TemplarEngine::new(options).unwrap();
        let err = engine.execute_with_callback(None).await.unwrap_err();
        assert!(matches!(err, TemplarError::Config(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
