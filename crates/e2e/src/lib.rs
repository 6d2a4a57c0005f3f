//! Trialkit browser test runner
//!
//! Drives declarative YAML specs through the trialkit session core:
//! - Spawns (or health-checks) the application server per attempt
//! - Renders each spec into one Playwright script per attempt
//! - Retries, times out and cancels sessions per the harness configuration
//! - Reports every session to JSON lines and a suite summary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TestRunner                                                 │
//! │    ├── run_all / run_tagged / run_test                      │
//! │    └── SessionOrchestrator<(ServerResource,                 │
//! │                             PlaywrightResource)>            │
//! │          per attempt:  open server ─► open browser          │
//! │                        SpecBody::run (steps)                │
//! │                        close browser ─► close server        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestSpec (YAML)                                            │
//! │    ├── name, description, tags, viewport                    │
//! │    ├── retry overrides, timeout_ms                          │
//! │    └── steps: navigate | click | fill | press | wait        │
//! │               assert | screenshot | evaluate | log          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod playwright;
pub mod runner;
pub mod server;
pub mod spec;

pub use error::{E2eError, E2eResult};
pub use playwright::{Browser, PlaywrightConfig, PlaywrightResource, PlaywrightSession, StepReport};
pub use runner::{RunnerConfig, SpecBody, SuiteResult, TestRunner};
pub use server::{ServerConfig, ServerHandle, ServerResource};
pub use spec::{TestSpec, TestStep};
