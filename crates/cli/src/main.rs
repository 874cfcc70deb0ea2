//! flowcheck - replay recorded browser flows and collect evidence
//!
//! Exit status: 0 when every recording ran and every step was OK, 1 when a
//! recording failed or a step was NG, 2 on a fatal error.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flowcheck_replay::config::{Browser, ScreenshotPolicy};
use flowcheck_replay::{run_session, BrowserPage, PlaywrightPage, ReplayConfig, SessionReport};

#[derive(Parser)]
#[command(name = "flowcheck")]
#[command(about = "Replay recorded browser flows with screenshots and response capture")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "flowcheck.toml")]
    config: PathBuf,

    /// Directory containing recordings
    #[arg(short, long)]
    recordings: Option<PathBuf>,

    /// Results directory (cleared on every run)
    #[arg(long)]
    results: Option<PathBuf>,

    /// Run the browser headless
    #[arg(long)]
    headless: bool,

    /// Browser engine: chromium, firefox or webkit
    #[arg(short, long)]
    browser: Option<String>,

    /// Per-step readiness wait in milliseconds
    #[arg(long)]
    readiness_timeout_ms: Option<u64>,

    /// Screenshot policy: every-step or skip-first
    #[arg(long)]
    screenshot_policy: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<ReplayConfig> {
        let mut config = ReplayConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(dir) = &self.recordings {
            config.paths.recordings_dir = dir.clone();
        }
        if let Some(dir) = &self.results {
            config.paths.results_dir = dir.clone();
        }
        if self.headless {
            config.browser.headless = true;
        }
        if let Some(browser) = &self.browser {
            config.browser.browser = browser.parse::<Browser>()?;
        }
        if let Some(ms) = self.readiness_timeout_ms {
            config.hooks.readiness_timeout_ms = ms;
        }
        if let Some(policy) = &self.screenshot_policy {
            config.hooks.screenshot_policy = policy.parse::<ScreenshotPolicy>()?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(cli: &Cli) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

fn print_summary(report: &SessionReport) {
    println!();
    println!(
        "{:<28} {:>7} {:>4} {:>4} {:>9}  ERROR",
        "RECORDING", "STEPS", "OK", "NG", "RESPONSES"
    );
    for recording in &report.batch.recordings {
        println!(
            "{:<28} {:>7} {:>4} {:>4} {:>9}  {}",
            recording.name,
            format!("{}/{}", recording.steps_run, recording.total_steps),
            recording.ok,
            recording.ng,
            recording.responses,
            recording.error.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!(
        "{} passed, {} failed, {} NG step(s), {} response(s) captured, {} capture failure(s)",
        report.batch.passed(),
        report.batch.failed(),
        report.batch.ng_steps(),
        report.capture.responses,
        report.capture.failures,
    );
}

async fn run(cli: &Cli) -> anyhow::Result<SessionReport> {
    let config = cli.load_config()?;
    info!(
        recordings = %config.paths.recordings_dir.display(),
        results = %config.paths.results_dir.display(),
        "flowcheck v{}",
        env!("CARGO_PKG_VERSION")
    );

    let page = Arc::new(
        PlaywrightPage::launch(&config.browser)
            .await
            .context("launching browser")?,
    );
    let outcome = run_session(&config, page.clone()).await;
    if let Err(e) = page.close().await {
        warn!("Failed to close browser: {}", e);
    }

    let report = outcome.context("replay session failed")?;
    print_summary(&report);
    Ok(report)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli).await {
        Ok(report) if report.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("flowcheck.toml");
        std::fs::write(
            &config_path,
            "[hooks]\nreadiness_timeout_ms = 9000\n\n[browser]\nbrowser = \"firefox\"\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "flowcheck",
            "--config",
            config_path.to_str().unwrap(),
            "--recordings",
            "flows",
            "--headless",
            "--browser",
            "webkit",
            "--screenshot-policy",
            "skip-first",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.paths.recordings_dir, PathBuf::from("flows"));
        assert!(config.browser.headless);
        assert_eq!(config.browser.browser, Browser::Webkit);
        assert_eq!(config.hooks.readiness_timeout_ms, 9000);
        assert_eq!(config.hooks.screenshot_policy, ScreenshotPolicy::SkipFirst);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let cli = Cli::parse_from([
            "flowcheck",
            "--config",
            "/nonexistent/flowcheck.toml",
            "--readiness-timeout-ms",
            "0",
        ]);
        assert!(cli.load_config().is_err());
    }
}
