//! Replay configuration
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! or missing file yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{ReplayError, ReplayResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Where recordings are read from and results written to
    pub paths: PathsConfig,

    /// Browser launch options
    pub browser: BrowserConfig,

    /// Step instrumentation policy
    pub hooks: HookConfig,

    /// Response capture policy
    pub capture: CaptureConfig,
}

impl ReplayConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> ReplayResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> ReplayResult<()> {
        if self.paths.extensions.is_empty() {
            return Err(ReplayError::InvalidConfig(
                "paths.extensions must name at least one recording extension".to_string(),
            ));
        }
        self.paths.validate_results_dir()?;
        if self.hooks.readiness_timeout_ms == 0 {
            return Err(ReplayError::InvalidConfig(
                "hooks.readiness_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.browser.viewport_width == 0 || self.browser.viewport_height == 0 {
            return Err(ReplayError::InvalidConfig(
                "browser viewport dimensions must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory scanned (non-recursively) for recording files
    pub recordings_dir: PathBuf,

    /// Results root; removed and recreated at the start of every batch
    pub results_dir: PathBuf,

    /// Recognized recording file extensions, compared case-insensitively
    pub extensions: Vec<String>,
}

impl PathsConfig {
    /// The results root is deleted at the start of every batch, so it must
    /// not hold the recordings, the working directory or the filesystem root.
    pub fn validate_results_dir(&self) -> ReplayResult<()> {
        let cwd = std::env::current_dir()?;
        let results = resolve(&cwd, &self.results_dir);
        let recordings = resolve(&cwd, &self.recordings_dir);
        let cwd = resolve(&cwd, &cwd);

        let refuse = |what: &str| {
            Err(ReplayError::InvalidConfig(format!(
                "paths.results_dir {} is cleared on every run and would remove {what}",
                self.results_dir.display()
            )))
        };
        if results.parent().is_none() {
            return refuse("the filesystem root");
        }
        if recordings.starts_with(&results) {
            return refuse("the recordings directory");
        }
        if cwd.starts_with(&results) {
            return refuse("the working directory");
        }
        Ok(())
    }
}

/// Absolute, lexically normalised form of `path`, with the part that exists
/// on disk canonicalised so symlinked spellings compare equal
fn resolve(cwd: &Path, path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in cwd.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other),
        }
    }

    let mut existing = normal.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_owned());
                existing = parent;
            }
            _ => return normal,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("./recordings"),
            results_dir: PathBuf::from("./result"),
            extensions: vec!["json".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(ReplayError::InvalidConfig(format!("unknown browser: {other}"))),
        }
    }
}

/// Configuration for the Playwright-backed page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub browser: Browser,
    pub headless: bool,

    /// Delay Playwright inserts between operations
    pub slow_mo_ms: u64,

    /// Extra browser process arguments
    pub args: Vec<String>,

    /// Browser locale (e.g. "ja-JP")
    pub locale: Option<String>,

    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Node.js executable used to host the driver script
    pub node_binary: PathBuf,

    /// Directory `playwright` is resolved from (defaults to the current directory)
    pub driver_dir: Option<PathBuf>,

    /// How long to wait for the browser to come up
    pub launch_timeout_ms: u64,

    /// Action timeout for steps that do not carry their own
    pub default_timeout_ms: u64,

    /// How long `close` waits for the driver process before killing it
    pub shutdown_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: false,
            slow_mo_ms: 50,
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-setuid-sandbox".to_string(),
                "--lang=ja".to_string(),
            ],
            locale: None,
            viewport_width: 1280,
            viewport_height: 720,
            node_binary: PathBuf::from("node"),
            driver_dir: None,
            launch_timeout_ms: 60_000,
            default_timeout_ms: 60_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl BrowserConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Which selector candidate the readiness wait targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessTarget {
    First,
    #[default]
    Last,
}

/// When the after-each hook captures a screenshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotPolicy {
    /// Capture after every step
    #[default]
    EveryStep,
    /// Capture after every step except the first
    SkipFirst,
}

impl ScreenshotPolicy {
    /// Whether a screenshot is taken after the given 1-based step
    pub fn captures(&self, step: usize) -> bool {
        match self {
            ScreenshotPolicy::EveryStep => step > 0,
            ScreenshotPolicy::SkipFirst => step > 1,
        }
    }
}

impl std::str::FromStr for ScreenshotPolicy {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "every_step" => Ok(ScreenshotPolicy::EveryStep),
            "skip_first" => Ok(ScreenshotPolicy::SkipFirst),
            other => Err(ReplayError::InvalidConfig(format!(
                "unknown screenshot policy: {other}"
            ))),
        }
    }
}

/// Step instrumentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Upper bound on the per-step readiness wait
    pub readiness_timeout_ms: u64,

    pub readiness_target: ReadinessTarget,

    /// Fixed pause before the readiness wait (0 disables it)
    pub settle_delay_ms: u64,

    pub screenshot_policy: ScreenshotPolicy,

    pub full_page_screenshots: bool,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: 5_000,
            readiness_target: ReadinessTarget::Last,
            settle_delay_ms: 0,
            screenshot_policy: ScreenshotPolicy::EveryStep,
            full_page_screenshots: true,
        }
    }
}

impl HookConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

/// Response capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Body extensions that are never persisted (headers still are)
    pub skip_body_extensions: Vec<String>,

    /// Content-type prefixes whose bodies are never persisted
    pub skip_body_type_prefixes: Vec<String>,

    /// Extension used when the content type maps to nothing known
    pub fallback_extension: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            skip_body_extensions: [
                "png", "jpg", "jpeg", "jpe", "gif", "webp", "avif", "bmp", "ico", "svg", "woff",
                "woff2", "ttf", "otf", "eot",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            skip_body_type_prefixes: vec!["image/".to_string(), "font/".to_string()],
            fallback_extension: "bin".to_string(),
        }
    }
}

impl CaptureConfig {
    pub fn skips_body(&self, extension: &str) -> bool {
        self.skip_body_extensions
            .iter()
            .any(|skip| skip.eq_ignore_ascii_case(extension))
    }

    /// Whether a `content-type` header names a media type whose body is skipped
    pub fn skips_content_type(&self, content_type: Option<&str>) -> bool {
        let Some(essence) = content_type.and_then(|ct| ct.split(';').next()) else {
            return false;
        };
        let essence = essence.trim().to_ascii_lowercase();
        self.skip_body_type_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && essence.starts_with(&prefix.to_ascii_lowercase()))
    }
}
