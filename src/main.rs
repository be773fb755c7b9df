// src/main.rs
use clap::Parser;
use std::io::{BufReader, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};

use templar::sdk::{ScanOptions, TemplarEngine};
use templar::templates::Severity;
use templar::TemplarError;

#[derive(Parser)]
#[command(name = "templar")]
#[command(version)]
#[command(about = "Template-driven network vulnerability scanner", long_about = None)]
struct Cli {
    /// Template files, directories, or globs
    #[arg(short = 't', long = "templates")]
    templates: Vec<String>,

    /// Root directory templates are resolved against
    #[arg(long, default_value = ".")]
    templates_dir: PathBuf,

    /// Target URL or host (repeatable)
    #[arg(short = 'u', long = "target")]
    targets: Vec<String>,

    /// File with one target per line
    #[arg(short = 'l', long = "list")]
    list: Option<PathBuf>,

    /// Results file (NDJSON)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Emit NDJSON on stdout instead of colorized text
    #[arg(long)]
    json: bool,

    /// Disable colors in text output
    #[arg(long)]
    no_color: bool,

    /// Severities to include (comma-separated: info,low,medium,high,critical)
    #[arg(short = 's', long)]
    severity: Option<String>,

    /// Tags to include (comma-separated)
    #[arg(long)]
    tags: Option<String>,

    /// Tags to exclude (comma-separated)
    #[arg(long)]
    exclude_tags: Option<String>,

    /// Template authors to include (comma-separated)
    #[arg(long)]
    author: Option<String>,

    /// Template ids to include (comma-separated)
    #[arg(long)]
    id: Option<String>,

    /// Requests per second across the whole scan
    #[arg(long, default_value = "150")]
    rate_limit: u32,

    /// Concurrent hosts
    #[arg(short = 'c', long, default_value = "25")]
    concurrency: usize,

    /// Concurrent templates per host
    #[arg(long = "bs", default_value = "25")]
    bulk_size: usize,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Retries per protocol call
    #[arg(long, default_value = "1")]
    retries: u32,

    /// Failures tolerated per host before it is skipped
    #[arg(long, default_value = "30")]
    max_host_error: u32,

    /// Extra error substrings counted against hosts (repeatable)
    #[arg(long = "track-error")]
    track_errors: Vec<String>,

    /// Directory for the request/response cache
    #[arg(long)]
    project_path: Option<PathBuf>,

    /// Resume file to restore from and checkpoint into
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Validate templates and exit
    #[arg(long)]
    validate: bool,

    /// List matching templates and exit
    #[arg(long = "tl")]
    template_list: bool,

    /// Print periodic progress statistics
    #[arg(long)]
    stats: bool,

    /// Statistics interval in seconds
    #[arg(long = "si", default_value = "5")]
    stats_interval: u64,

    /// Collaborator server for out-of-band testing
    #[arg(long)]
    interactsh_url: Option<String>,

    /// Disable out-of-band testing entirely
    #[arg(long)]
    no_interactsh: bool,

    /// Enable the headless template pool
    #[arg(long)]
    headless: bool,

    /// Technology detection first, then matching templates per host
    #[arg(long)]
    automatic_scan: bool,

    /// Disable request clustering
    #[arg(long = "no-cluster")]
    no_cluster: bool,

    /// Verify template signatures while loading
    #[arg(long)]
    validate_signatures: bool,
}

fn split_csv(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_severities(value: &Option<String>) -> Result<Vec<Severity>, TemplarError> {
    split_csv(value)
        .iter()
        .map(|s| {
            s.parse::<Severity>()
                .map_err(TemplarError::Config)
        })
        .collect()
}

fn cloud_upload_warnings() {
    if std::env::var("ENABLE_CLOUD_UPLOAD").is_ok()
        && std::env::var("DISABLE_CLOUD_UPLOAD_WRN").is_err()
    {
        warn!("cloud upload requested but not compiled into this build; results stay local");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    cloud_upload_warnings();

    let severities = match parse_severities(&cli.severity) {
        Ok(severities) => severities,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let options = ScanOptions {
        templates: cli.templates.clone(),
        templates_dir: cli.templates_dir.clone(),
        targets: cli.targets.clone(),
        target_list: cli.list.clone(),
        output_file: cli.output.clone(),
        json: cli.json,
        no_color: cli.no_color,
        severities,
        tags: split_csv(&cli.tags),
        exclude_tags: split_csv(&cli.exclude_tags),
        authors: split_csv(&cli.author),
        template_ids: split_csv(&cli.id),
        protocols: Vec::new(),
        rate_limit: cli.rate_limit,
        burst: cli.rate_limit,
        host_concurrency: cli.concurrency,
        template_concurrency: cli.bulk_size,
        headless_host_concurrency: if cli.headless { 10 } else { 1 },
        headless_template_concurrency: if cli.headless { 10 } else { 1 },
        timeout_secs: cli.timeout,
        retries: cli.retries,
        max_host_errors: cli.max_host_error,
        track_errors: cli.track_errors.clone(),
        project_path: cli.project_path.clone(),
        resume_path: cli.resume.clone(),
        interactsh_url: cli.interactsh_url.clone(),
        no_interactsh: cli.no_interactsh,
        disable_clustering: cli.no_cluster,
        automatic_scan: cli.automatic_scan,
        headless: cli.headless,
        validate_signatures: cli.validate_signatures,
        stats: cli.stats,
        stats_interval_secs: cli.stats_interval,
    };

    let mut engine = match TemplarEngine::new(options) {
        Ok(engine) => engine,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    // Validation and listing modes never execute
    if cli.validate || cli.template_list {
        if let Err(e) = engine.load_all_templates() {
            error!("{}", e);
            return ExitCode::from(2);
        }
        let stats = engine.store().stats();
        if cli.template_list {
            for template in engine.templates() {
                println!(
                    "{} [{}] {}",
                    template.id,
                    template.info.severity,
                    template.info.name
                );
            }
            return ExitCode::SUCCESS;
        }
        if stats.parse_errors > 0 || stats.signature_mismatches > 0 {
            error!(
                "validation failed: {} parse errors, {} signature mismatches",
                stats.parse_errors, stats.signature_mismatches
            );
            return ExitCode::from(2);
        }
        println!(
            "all templates validated: {} loaded, {} unsigned",
            engine.templates().len(),
            stats.unsigned
        );
        return ExitCode::SUCCESS;
    }

    // Targets can also arrive on stdin
    let stdin = std::io::stdin();
    if cli.targets.is_empty() && cli.list.is_none() && !stdin.is_terminal() {
        if let Err(e) = engine.load_targets_from_reader(BufReader::new(stdin.lock())) {
            error!("{}", e);
            return ExitCode::from(1);
        }
    }

    // The signal handler only flips the cancellation flag; the engine
    // drains in-flight work and persists resume state from the main loop.
    let cancel = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nreceived interrupt, draining in-flight work...");
            cancel.cancel();
        }
    });

    let result = engine.execute_with_callback(None).await;
    engine.close();

    match result {
        Ok(_found) => ExitCode::SUCCESS,
        Err(TemplarError::Cancelled) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}
