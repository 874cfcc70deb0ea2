//! Recorded flow model
//!
//! Recordings use the Chrome DevTools Recorder JSON format: a titled list of
//! typed steps, where interactive steps carry an ordered list of selector
//! candidates (most specific last).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ReplayError, ReplayResult};

/// A recording file as read from disk
#[derive(Debug, Clone)]
pub struct Recording {
    /// Base name of the file, used as the artifact namespace
    pub name: String,

    pub path: PathBuf,

    /// Raw file contents
    pub source: String,
}

impl Recording {
    /// Read a recording file
    pub fn load(path: &Path) -> ReplayResult<Self> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                ReplayError::RecordingParse(format!("no file name in {}", path.display()))
            })?;
        let source = std::fs::read_to_string(path)?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse the recording into a flow
    pub fn parse(&self) -> ReplayResult<Flow> {
        Flow::from_json(&self.source)
    }
}

/// A parsed recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub title: String,

    /// Flow-wide action timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,

    pub steps: Vec<Step>,
}

impl Flow {
    pub fn from_json(json: &str) -> ReplayResult<Self> {
        serde_json::from_str(json).map_err(|e| ReplayError::RecordingParse(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    SetViewport,
    Navigate,
    Click,
    DoubleClick,
    Hover,
    Change,
    KeyDown,
    KeyUp,
    Scroll,
    WaitForElement,
    WaitForExpression,
    Close,
    EmulateNetworkConditions,
    CustomStep,
    #[serde(other)]
    Unknown,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::SetViewport => "setViewport",
            StepType::Navigate => "navigate",
            StepType::Click => "click",
            StepType::DoubleClick => "doubleClick",
            StepType::Hover => "hover",
            StepType::Change => "change",
            StepType::KeyDown => "keyDown",
            StepType::KeyUp => "keyUp",
            StepType::Scroll => "scroll",
            StepType::WaitForElement => "waitForElement",
            StepType::WaitForExpression => "waitForExpression",
            StepType::Close => "close",
            StepType::EmulateNetworkConditions => "emulateNetworkConditions",
            StepType::CustomStep => "customStep",
            StepType::Unknown => "unknown",
        }
    }
}

/// One selector candidate: a plain selector or a chain that walks through
/// frames and shadow roots. A chain part naming an `<iframe>` or `<frame>`
/// is entered as a frame; other hops cross into shadow roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Single(String),
    Chain(Vec<String>),
}

impl Selector {
    /// Selector text as recorded
    pub fn display(&self) -> String {
        match self {
            Selector::Single(s) => s.clone(),
            Selector::Chain(parts) => parts.join(" >> "),
        }
    }

    /// Selector in Playwright syntax
    pub fn to_playwright(&self) -> String {
        match self {
            Selector::Single(s) => translate_part(s),
            Selector::Chain(parts) => {
                let mut out = String::new();
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push_str(if targets_frame(&parts[i - 1]) {
                            " >> internal:control=enter-frame >> "
                        } else {
                            " >> "
                        });
                    }
                    out.push_str(&translate_part(part));
                }
                out
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Selector::Single(s) => s.trim().is_empty(),
            Selector::Chain(parts) => parts.iter().all(|p| p.trim().is_empty()),
        }
    }
}

/// Whether the last compound of a selector names an `<iframe>` or `<frame>`.
/// `>>` only crosses shadow roots, so frame hops need an explicit entry.
fn targets_frame(part: &str) -> bool {
    let last = part
        .rsplit(|c: char| c.is_whitespace() || matches!(c, '>' | '+' | '~' | '/'))
        .find(|s| !s.is_empty())
        .unwrap_or("");
    let tag: String = last
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    tag == "iframe" || tag == "frame"
}

fn translate_part(part: &str) -> String {
    if let Some(rest) = part.strip_prefix("aria/") {
        return translate_aria(rest);
    }
    if let Some(rest) = part.strip_prefix("xpath/") {
        return format!("xpath={rest}");
    }
    if let Some(rest) = part.strip_prefix("pierce/") {
        // Playwright CSS already pierces open shadow roots
        return format!("css={rest}");
    }
    if let Some(rest) = part.strip_prefix("text/") {
        return format!("text={rest}");
    }
    part.to_string()
}

/// `aria/Name[role="button"]` → `role=button[name="Name"]`, `aria/Name` → `text="Name"`
fn translate_aria(rest: &str) -> String {
    if let Some(open) = rest.rfind("[role=\"") {
        if let Some(role) = rest[open + 7..].strip_suffix("\"]") {
            let name = &rest[..open];
            if name.is_empty() {
                return format!("role={role}");
            }
            return format!("role={role}[name=\"{}\"]", name.replace('"', "\\\""));
        }
    }
    format!("text=\"{}\"", rest.replace('"', "\\\""))
}

/// One recorded action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(rename = "type")]
    pub kind: StepType,

    #[serde(default)]
    pub selectors: Option<Vec<Selector>>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub expression: Option<String>,

    #[serde(default)]
    pub button: Option<String>,

    #[serde(default)]
    pub offset_x: Option<f64>,

    #[serde(default)]
    pub offset_y: Option<f64>,

    #[serde(default)]
    pub x: Option<f64>,

    #[serde(default)]
    pub y: Option<f64>,

    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    /// Step action timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Step {
    /// Non-empty selector candidates, in recorded order
    pub fn selector_candidates(&self) -> Vec<&Selector> {
        self.selectors
            .iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn primary_selector(&self) -> Option<&Selector> {
        self.selector_candidates().into_iter().next()
    }

    pub fn most_specific_selector(&self) -> Option<&Selector> {
        self.selector_candidates().into_iter().last()
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        match (self.kind, self.url.as_deref(), self.primary_selector()) {
            (_, Some(url), _) => format!("{}:{}", self.kind.as_str(), url),
            (_, None, Some(selector)) => format!("{}:{}", self.kind.as_str(), selector.display()),
            (_, None, None) => self.kind.as_str().to_string(),
        }
    }
}
