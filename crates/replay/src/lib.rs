//! flowcheck replay engine
//!
//! Replays recorded browser flows (Chrome DevTools Recorder JSON) against a
//! real browser and records what happened along the way:
//! - Waits for each step's target selector and logs OK/NG per step
//! - Takes a full-page screenshot after every step
//! - Saves every network response the page receives, keyed by arrival order
//! - Keeps going when a step, a response or a whole recording fails
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  BatchOrchestrator                                          │
//! │    for each <recordings>/<name>.json:                       │
//! │      RunContext ──bind──► ResponseCapture (event task)      │
//! │          │                      ▲                           │
//! │          ▼                      │ PageEvent::Response       │
//! │      ReplayEngine::run(flow, InstrumentationHooks)          │
//! │          ├── before_each: readiness wait → result.log       │
//! │          ├── PageCommand → BrowserPage                      │
//! │          └── after_each: screenshots/<n>.png                │
//! │      settle (flush capture) before the next recording       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrowserPage                                                │
//! │    ├── PlaywrightPage (node driver over stdio)              │
//! │    └── FakePage (scripted, for tests)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Results land in `<results>/<name>/{screenshots/, http/, result.log, error.json}`.

pub mod artifacts;
pub mod capture;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fake;
pub mod flow;
pub mod hooks;
pub mod orchestrator;
pub mod page;
pub mod playwright;
pub mod session;

pub use config::ReplayConfig;
pub use engine::{PageReplayer, ReplayEngine};
pub use error::{ReplayError, ReplayResult};
pub use flow::{Flow, Recording, Step};
pub use hooks::{Instrumentation, InstrumentationHooks, StepHooks};
pub use orchestrator::{BatchOrchestrator, BatchReport, RecordingReport};
pub use page::{BrowserPage, PageCommand, PageEvent};
pub use playwright::PlaywrightPage;
pub use session::{run_session, run_session_with, SessionReport};
