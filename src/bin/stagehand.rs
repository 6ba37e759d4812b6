//! stagehand CLI - declarative HTTP API scenario test runner.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde_json::Value;
use stagehand::{
    Engine, EngineConfig, RunReport, Scenario, ScenarioLoader, ScenarioReport, ScenarioRunner,
    StageStatus, StaticHost,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// stagehand - JSON-based HTTP API scenario test runner.
#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about)]
struct Cli {
    /// Scenario file or directory path.
    #[arg(short = 'p', long = "path")]
    scenario_path: Option<String>,

    /// Filter scenarios by name (partial match).
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Override the per-request timeout in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<f64>,

    /// Base URL joined onto relative stage URLs.
    #[arg(short = 'b', long = "base-url", env = "STAGEHAND_BASE_URL")]
    base_url: Option<String>,

    /// Scenario file suffix (`test_<name>.<suffix>.json`).
    #[arg(long = "suffix", default_value = "http")]
    suffix: String,

    /// JSON file providing fixture values (`{"name": value}`).
    #[arg(long = "fixtures")]
    fixtures: Option<PathBuf>,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_report(report: &ScenarioReport, verbose: bool) {
    let status = if report.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} scenario: {} ({} ms)",
        status, report.name, report.duration_ms
    );

    for (i, stage) in report.stages.iter().enumerate() {
        let mark = match stage.status {
            StageStatus::Passed => "\x1b[32m✓\x1b[0m",
            StageStatus::Failed => "\x1b[31m✗\x1b[0m",
            StageStatus::Skipped => "\x1b[33m-\x1b[0m",
        };
        let key = stage
            .iteration
            .as_ref()
            .map(|k| format!(" [{k}]"))
            .unwrap_or_default();
        info!(
            "  {}. {} {}{} ({} ms)",
            i + 1,
            mark,
            stage.name,
            key,
            stage.duration_ms
        );
        if let Some(err) = &stage.error {
            error!("     \x1b[31m{}\x1b[0m", err);
        } else if verbose {
            debug!("     status: {:?}", stage.status);
        }
    }
}

fn save_report(
    report: &ScenarioReport,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized = report.name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized}-{timestamp}.json"),
            serde_json::to_string_pretty(report)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized}-{timestamp}.yaml"),
            serde_yaml::to_string(report)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Scenario: {}\n", report.name));
            content.push_str(&format!(
                "Status: {}\n",
                if report.success { "PASS" } else { "FAIL" }
            ));
            if let Some(err) = &report.error {
                content.push_str(&format!("Error: {err}\n"));
            }
            content.push_str(&format!("Duration: {} ms\n\nStages:\n", report.duration_ms));
            for (i, stage) in report.stages.iter().enumerate() {
                content.push_str(&format!(
                    "  {}. {} ({:?})\n",
                    i + 1,
                    stage.name,
                    stage.status
                ));
                if let Some(err) = &stage.error {
                    content.push_str(&format!("     Error: {err}\n"));
                }
            }
            (format!("{sanitized}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;
    Ok(file_path)
}

fn discover_scenarios(config: &EngineConfig, path: Option<String>) -> Result<Vec<Scenario>> {
    let mut loader = ScenarioLoader::new(config.clone());
    for default in ["tests/scenarios", "test/scenarios"] {
        if Path::new(default).exists() {
            loader.add_path(default);
        }
    }
    loader.add_path(".");

    let scenarios = if let Some(path) = path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(anyhow!("path does not exist: {}", path.display()));
        }
        if path.is_file() {
            vec![loader.load_scenario(&path)?]
        } else {
            loader.load_scenarios_from_dir(&path)?
        }
    } else {
        loader.load_all_scenarios()?
    };

    if scenarios.is_empty() {
        return Err(anyhow!("no scenarios found"));
    }
    Ok(scenarios)
}

fn load_fixtures(path: &Path) -> Result<StaticHost> {
    let text = fs::read_to_string(path)?;
    let values: serde_json::Map<String, Value> = serde_json::from_str(&text)?;
    let mut host = StaticHost::new();
    for (name, value) in values {
        host = host.with_fixture(name, value);
    }
    Ok(host)
}

#[allow(clippy::too_many_arguments)]
async fn run_all(
    engine: &Engine,
    host: &StaticHost,
    scenarios: Vec<Scenario>,
    filter: Option<String>,
    timeout_override: Option<f64>,
    verbose: bool,
    report_dir: Option<&Path>,
    report_format: ReportFormat,
) -> Result<(bool, Vec<ScenarioReport>)> {
    let filtered: Vec<Scenario> = match &filter {
        Some(needle) => scenarios
            .into_iter()
            .filter(|s| s.name.to_lowercase().contains(&needle.to_lowercase()))
            .collect(),
        None => scenarios,
    };
    if filtered.is_empty() {
        return Err(anyhow!("no scenarios matching the filter"));
    }

    let total = filtered.len();
    info!("running {} scenario(s)...", total);

    let mut all_success = true;
    let mut reports = Vec::new();

    for (idx, mut scenario) in filtered.into_iter().enumerate() {
        if let Some(timeout) = timeout_override {
            for stage in &mut scenario.stages {
                stage.request.timeout = timeout;
            }
        }

        info!("scenario {}/{}: {}", idx + 1, total, scenario.name);
        match engine.run(&scenario, host).await {
            Ok(report) => {
                print_report(&report, verbose);
                if let Some(dir) = report_dir {
                    match save_report(&report, dir, report_format) {
                        Ok(path) => info!("report saved: {}", path.display()),
                        Err(e) => error!("failed to save report: {}", e),
                    }
                }
                if !report.success {
                    all_success = false;
                }
                reports.push(report);
            }
            Err(e) => {
                error!("\x1b[31mscenario error: {} - {}\x1b[0m", scenario.name, e);
                all_success = false;
            }
        }
    }

    Ok((all_success, reports))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let config = EngineConfig {
        suffix: args.suffix.clone(),
        base_url: args.base_url.clone(),
        ..EngineConfig::default()
    };

    let scenarios = discover_scenarios(&config, args.scenario_path)?;
    let host = match &args.fixtures {
        Some(path) => load_fixtures(path)?,
        None => StaticHost::new(),
    };
    let engine = Engine::new(config);

    let report_dir = args.report_dir.map(PathBuf::from);
    let total_start = Instant::now();

    let (success, reports) = run_all(
        &engine,
        &host,
        scenarios,
        args.filter,
        args.timeout,
        args.verbose,
        report_dir.as_deref(),
        args.report_format,
    )
    .await?;

    let passed = reports.iter().filter(|r| r.success).count();
    let failed = reports.len() - passed;
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        reports.len(),
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    if let Some(dir) = &report_dir {
        let run = RunReport {
            scenarios: reports,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            timestamp: Utc::now().to_rfc3339(),
        };
        let path = dir.join("run.json");
        fs::write(&path, serde_json::to_string_pretty(&run)?)?;
        info!("run report saved: {}", path.display());
    }

    if !success {
        exit(1);
    }
    Ok(())
}
