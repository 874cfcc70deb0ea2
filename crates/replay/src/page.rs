//! Browser page contract
//!
//! The engine talks to the browser only through [`BrowserPage`]: page
//! commands go in, replies come back, and everything the page reports on its
//! own (responses, console output, script errors) arrives on a separate
//! event channel that can be consumed independently of step execution.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{ReplayError, ReplayResult};

/// Driver-assigned handle for a response whose body can still be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub u64);

/// A command executed against the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum PageCommand {
    SetViewport {
        width: u32,
        height: u32,
    },
    Goto {
        url: String,
        timeout_ms: u64,
    },
    /// Interaction commands carry every candidate; the driver uses whichever matches first
    Click {
        selectors: Vec<String>,
        click_count: u32,
        button: Option<String>,
        offset_x: Option<f64>,
        offset_y: Option<f64>,
        timeout_ms: u64,
    },
    Hover {
        selectors: Vec<String>,
        timeout_ms: u64,
    },
    Fill {
        selectors: Vec<String>,
        value: String,
        timeout_ms: u64,
    },
    KeyDown {
        key: String,
    },
    KeyUp {
        key: String,
    },
    Scroll {
        selectors: Vec<String>,
        x: f64,
        y: f64,
    },
    /// Resolves once the selector is visible
    WaitFor {
        selector: String,
        timeout_ms: u64,
    },
    WaitForFunction {
        expression: String,
        timeout_ms: u64,
    },
    Screenshot {
        path: PathBuf,
        full_page: bool,
    },
    ResponseBody {
        response_id: ResponseId,
    },
    Close,
}

impl PageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PageCommand::SetViewport { .. } => "set_viewport",
            PageCommand::Goto { .. } => "goto",
            PageCommand::Click { .. } => "click",
            PageCommand::Hover { .. } => "hover",
            PageCommand::Fill { .. } => "fill",
            PageCommand::KeyDown { .. } => "key_down",
            PageCommand::KeyUp { .. } => "key_up",
            PageCommand::Scroll { .. } => "scroll",
            PageCommand::WaitFor { .. } => "wait_for",
            PageCommand::WaitForFunction { .. } => "wait_for_function",
            PageCommand::Screenshot { .. } => "screenshot",
            PageCommand::ResponseBody { .. } => "response_body",
            PageCommand::Close => "close",
        }
    }
}

/// A network response observed by the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub id: ResponseId,
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timing: serde_json::Value,
}

impl ResponseEvent {
    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Everything the page reports without being asked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PageEvent {
    Response(ResponseEvent),
    Console { level: String, text: String },
    PageError { message: String },
    Crashed,
}

pub type PageEvents = mpsc::UnboundedReceiver<PageEvent>;

#[derive(Debug, Deserialize)]
struct BodyReply {
    body_b64: String,
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Execute a command and return the driver's result payload
    async fn execute(&self, command: PageCommand) -> ReplayResult<serde_json::Value>;

    /// Take the page event stream; only the first caller gets it
    fn take_events(&self) -> Option<PageEvents>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> ReplayResult<()> {
        self.execute(PageCommand::WaitFor {
            selector: selector.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })
        .await?;
        Ok(())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> ReplayResult<()> {
        self.execute(PageCommand::Screenshot {
            path: path.to_path_buf(),
            full_page,
        })
        .await?;
        Ok(())
    }

    async fn response_body(&self, id: ResponseId) -> ReplayResult<Vec<u8>> {
        let value = self
            .execute(PageCommand::ResponseBody { response_id: id })
            .await?;
        let reply: BodyReply = serde_json::from_value(value)?;
        Ok(base64::engine::general_purpose::STANDARD.decode(reply.body_b64)?)
    }

    async fn close(&self) -> ReplayResult<()> {
        match self.execute(PageCommand::Close).await {
            Ok(_) | Err(ReplayError::DriverClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let cmd = PageCommand::WaitFor {
            selector: "#q".to_string(),
            timeout_ms: 5000,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value, json!({"cmd": "wait_for", "selector": "#q", "timeout_ms": 5000}));
        assert_eq!(cmd.name(), "wait_for");
    }

    #[test]
    fn test_response_event_from_driver() {
        let event: PageEvent = serde_json::from_value(json!({
            "event": "response",
            "id": 7,
            "url": "https://example.com/app.js",
            "status": 200,
            "headers": {"Content-Type": "application/javascript"},
            "timing": {"startTime": 1.5, "responseEnd": 20.25}
        }))
        .unwrap();
        let PageEvent::Response(response) = event else {
            panic!("expected response event");
        };
        assert_eq!(response.id, ResponseId(7));
        assert_eq!(response.header("content-type"), Some("application/javascript"));
    }

    #[test]
    fn test_console_event_from_driver() {
        let event: PageEvent = serde_json::from_value(json!({
            "event": "console", "level": "error", "text": "boom"
        }))
        .unwrap();
        assert_eq!(
            event,
            PageEvent::Console {
                level: "error".to_string(),
                text: "boom".to_string()
            }
        );
    }
}
