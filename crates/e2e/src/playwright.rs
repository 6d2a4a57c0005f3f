//! Playwright browser automation
//!
//! A spec is rendered into a single Node script that owns one browser, one
//! context and one page for the length of the attempt. The script prints a
//! status line per step; the Rust side turns those lines into a
//! [`StepReport`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use trialkit_common::{AcquisitionError, ReleaseError, Resource};

use crate::error::{E2eError, E2eResult};
use crate::spec::{TestStep, Viewport};

/// Prefix marking the script's own status lines on stdout
const STATUS_PREFIX: &str = "@@trialkit ";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    /// Launch flags for running inside containers and CI runners
    fn launch_args(&self) -> &'static [&'static str] {
        match self {
            Browser::Chromium => &["--no-sandbox", "--disable-dev-shm-usage"],
            Browser::Firefox | Browser::Webkit => &[],
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> E2eResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" | "safari" => Ok(Browser::Webkit),
            other => Err(E2eError::Playwright(format!("unknown browser: {}", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,

    /// Default timeout for element actions
    pub action_timeout_ms: u64,

    /// Timeout for page navigations
    pub navigation_timeout_ms: u64,

    /// Capture the page when a step fails
    pub screenshot_on_failure: bool,

    /// Check `npx playwright --version` before each browser launch
    pub verify_install: bool,

    /// Node executable used to run the generated scripts
    pub node: PathBuf,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            action_timeout_ms: 30_000,
            navigation_timeout_ms: 60_000,
            screenshot_on_failure: true,
            verify_install: true,
            node: PathBuf::from("node"),
        }
    }
}

/// Per-attempt browser workspace
pub struct PlaywrightResource {
    config: PlaywrightConfig,
    screenshot_dir: PathBuf,
}

impl PlaywrightResource {
    pub fn new(config: PlaywrightConfig, screenshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            screenshot_dir: screenshot_dir.into(),
        }
    }

    pub fn config(&self) -> &PlaywrightConfig {
        &self.config
    }

    async fn check_playwright_installed() -> E2eResult<()> {
        let status = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    async fn prepare(&self) -> E2eResult<PlaywrightSession> {
        if self.config.verify_install {
            Self::check_playwright_installed().await?;
        }
        tokio::fs::create_dir_all(&self.screenshot_dir).await?;
        let work_dir = tempfile::Builder::new().prefix("trialkit-pw-").tempdir()?;

        Ok(PlaywrightSession {
            config: self.config.clone(),
            screenshot_dir: self.screenshot_dir.clone(),
            work_dir,
        })
    }
}

#[async_trait]
impl Resource for PlaywrightResource {
    type Handle = PlaywrightSession;

    fn name(&self) -> String {
        format!("playwright:{}", self.config.browser.as_str())
    }

    async fn open(&self) -> Result<PlaywrightSession, AcquisitionError> {
        self.prepare()
            .await
            .map_err(|e| AcquisitionError::new(self.name(), e))
    }

    async fn close(&self, session: PlaywrightSession) -> Result<(), ReleaseError> {
        let path = session.work_dir.path().to_path_buf();
        let work_dir = session.work_dir;
        tokio::task::spawn_blocking(move || work_dir.close())
            .await
            .map_err(|e| ReleaseError::new(self.name(), e.to_string()))?
            .map_err(|e| ReleaseError::new(self.name(), format!("{}: {}", path.display(), e)))
    }
}

/// An acquired browser workspace: a private script directory plus the
/// shared screenshot directory.
pub struct PlaywrightSession {
    config: PlaywrightConfig,
    screenshot_dir: PathBuf,
    work_dir: TempDir,
}

/// One line of script output
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum StepEvent {
    Passed {
        step: usize,
        #[serde(default)]
        screenshot: Option<PathBuf>,
    },
    Failed {
        /// `None` when the browser never got as far as the first step
        #[serde(default)]
        step: Option<usize>,
        error: String,
        #[serde(default)]
        screenshot: Option<PathBuf>,
    },
    Log {
        message: String,
    },
}

/// The step that stopped a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    /// 0-based index into the spec's steps
    pub step: usize,
    pub label: String,
    pub error: String,
}

/// What a script run got through
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub total: usize,
    pub passed: usize,
    pub failure: Option<StepFailure>,
    pub screenshots: Vec<PathBuf>,
}

impl StepReport {
    pub fn success(&self) -> bool {
        self.failure.is_none() && self.passed == self.total
    }
}

impl PlaywrightSession {
    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn screenshot_path(&self, test: &str, name: &str, attempt: u32) -> PathBuf {
        self.screenshot_dir.join(format!(
            "{}-{}-attempt{}.png",
            file_stem(test),
            file_stem(name),
            attempt
        ))
    }

    /// Run every step in one browser.
    ///
    /// A failing step is reported in the returned [`StepReport`]; an `Err`
    /// means the browser could not be driven at all.
    pub async fn run_steps(
        &self,
        base_url: &str,
        test: &str,
        attempt: u32,
        viewport: Viewport,
        steps: &[TestStep],
    ) -> E2eResult<StepReport> {
        let script = self.build_script(base_url, test, attempt, viewport, steps);
        let script_path = self.work_dir.path().join(format!("attempt-{}.js", attempt));
        tokio::fs::write(&script_path, &script).await?;

        debug!("Running Playwright script: {}", script_path.display());

        let output = Command::new(&self.config.node)
            .arg(&script_path)
            .current_dir(self.work_dir.path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                E2eError::Playwright(format!(
                    "failed to start {}: {}",
                    self.config.node.display(),
                    e
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = parse_report(&stdout, steps)?;

        if report.failure.is_none() && (!output.status.success() || report.passed < report.total) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(E2eError::Playwright(format!(
                "script ended after {} of {} steps ({}): {}",
                report.passed,
                report.total,
                output.status,
                stderr.trim()
            )));
        }

        Ok(report)
    }

    /// Build the Node script for a set of steps
    pub fn build_script(
        &self,
        base_url: &str,
        test: &str,
        attempt: u32,
        viewport: Viewport,
        steps: &[TestStep],
    ) -> String {
        let mut script = String::new();

        let args: Vec<String> = self
            .config
            .browser
            .launch_args()
            .iter()
            .map(|a| js_str(a))
            .collect();
        let failure_shot = if self.config.screenshot_on_failure {
            js_str(&self.screenshot_path(test, "failure", attempt).to_string_lossy())
        } else {
            "null".to_string()
        };

        script.push_str(&format!(
            r#"const {{ {browser} }} = require('playwright');

const baseUrl = {base_url};
const report = (event) => console.log({prefix} + JSON.stringify(event));
const failureShot = {failure_shot};

(async () => {{
  let current = null;
  let browser = null;
  let page = null;
  try {{
    browser = await {browser}.launch({{ headless: {headless}, args: [{args}] }});
    const context = await browser.newContext({{
      viewport: {{ width: {width}, height: {height} }},
      ignoreHTTPSErrors: true
    }});
    page = await context.newPage();
    page.setDefaultTimeout({action_timeout});
    page.setDefaultNavigationTimeout({navigation_timeout});
"#,
            browser = self.config.browser.as_str(),
            base_url = js_str(base_url),
            prefix = js_str(STATUS_PREFIX),
            failure_shot = failure_shot,
            headless = self.config.headless,
            args = args.join(", "),
            width = viewport.width,
            height = viewport.height,
            action_timeout = self.config.action_timeout_ms,
            navigation_timeout = self.config.navigation_timeout_ms,
        ));

        for (i, step) in steps.iter().enumerate() {
            let screenshot = match step {
                TestStep::Screenshot { name, .. } => {
                    Some(self.screenshot_path(test, name, attempt))
                }
                _ => None,
            };

            script.push_str(&format!("\n    // Step {}: {}\n", i + 1, step.label()));
            script.push_str(&format!("    current = {};\n", i));
            script.push_str(&step_to_js(step, screenshot.as_deref()));
            script.push('\n');
            match &screenshot {
                Some(path) => script.push_str(&format!(
                    "    report({{ status: 'passed', step: {}, screenshot: {} }});\n",
                    i,
                    js_str(&path.to_string_lossy())
                )),
                None => {
                    script.push_str(&format!("    report({{ status: 'passed', step: {} }});\n", i))
                }
            }
        }

        script.push_str(
            r#"  } catch (error) {
    let screenshot = null;
    if (page && failureShot) {
      try {
        await page.screenshot({ path: failureShot, fullPage: true });
        screenshot = failureShot;
      } catch (_) {}
    }
    report({ status: 'failed', step: current, error: error && error.message ? error.message : String(error), screenshot });
    process.exitCode = 1;
  } finally {
    if (browser) {
      await browser.close();
    }
  }
})();
"#,
        );

        script
    }
}

/// Convert a step to JavaScript statements
fn step_to_js(step: &TestStep, screenshot: Option<&Path>) -> String {
    match step {
        TestStep::Navigate {
            url,
            wait_for_selector,
        } => {
            let mut js = format!("    await page.goto(new URL({}, baseUrl).href);", js_str(url));
            if let Some(selector) = wait_for_selector {
                js.push_str(&format!("\n    await page.waitForSelector({});", js_str(selector)));
            }
            js
        }
        TestStep::Click {
            selector,
            timeout_ms,
        } => match timeout_ms {
            Some(ms) => format!(
                "    await page.click({}, {{ timeout: {} }});",
                js_str(selector),
                ms
            ),
            None => format!("    await page.click({});", js_str(selector)),
        },
        TestStep::Fill { selector, value } => {
            format!("    await page.fill({}, {});", js_str(selector), js_str(value))
        }
        TestStep::Press { selector, key } => match selector {
            Some(sel) => format!(
                "    await page.locator({}).press({});",
                js_str(sel),
                js_str(key)
            ),
            None => format!("    await page.keyboard.press({});", js_str(key)),
        },
        TestStep::Wait {
            selector,
            timeout_ms,
            state,
        } => {
            let timeout = timeout_ms
                .map(|ms| format!(", timeout: {}", ms))
                .unwrap_or_default();
            format!(
                "    await page.waitForSelector({}, {{ state: '{}'{} }});",
                js_str(selector),
                state.as_str(),
                timeout
            )
        }
        TestStep::Assert {
            selector,
            visible,
            text_contains,
            count,
        } => {
            let locator = format!("page.locator({})", js_str(selector));
            let mut assertions = Vec::new();

            if let Some(vis) = visible {
                let state = if *vis { "visible" } else { "hidden" };
                assertions.push(format!(
                    "    await {}.first().waitFor({{ state: '{}' }});",
                    locator, state
                ));
            }

            if let Some(expected) = text_contains {
                assertions.push(format!(
                    r#"    {{
      const text = await {locator}.first().textContent();
      if (text === null || !text.includes({expected})) {{
        throw new Error('expected ' + {selector} + ' to contain ' + {expected} + ', got ' + JSON.stringify(text));
      }}
    }}"#,
                    locator = locator,
                    expected = js_str(expected),
                    selector = js_str(selector),
                ));
            }

            if let Some(c) = count {
                assertions.push(format!(
                    r#"    {{
      const n = await {locator}.count();
      if (n !== {count}) {{
        throw new Error('expected ' + {count} + ' matches for ' + {selector} + ', found ' + n);
      }}
    }}"#,
                    locator = locator,
                    count = c,
                    selector = js_str(selector),
                ));
            }

            assertions.join("\n")
        }
        TestStep::Screenshot {
            selector,
            full_page,
            ..
        } => {
            let path = js_str(&screenshot.map(|p| p.to_string_lossy()).unwrap_or_default());
            match selector {
                Some(sel) => format!(
                    "    await page.locator({}).screenshot({{ path: {} }});",
                    js_str(sel),
                    path
                ),
                None => format!(
                    "    await page.screenshot({{ path: {}, fullPage: {} }});",
                    path, full_page
                ),
            }
        }
        TestStep::Evaluate { script, expected } => {
            let mut js = format!(
                "    {{\n      const value = await page.evaluate({});",
                js_str(script)
            );
            if let Some(expected) = expected {
                js.push_str(&format!(
                    r#"
      const expected = {expected};
      if (JSON.stringify(value) !== JSON.stringify(expected)) {{
        throw new Error('evaluate returned ' + JSON.stringify(value) + ', expected ' + JSON.stringify(expected));
      }}"#,
                    expected = expected
                ));
            }
            js.push_str("\n    }");
            js
        }
        TestStep::Log { message } => {
            format!("    report({{ status: 'log', message: {} }});", js_str(message))
        }
    }
}

/// Parse the script's status lines into a report
fn parse_report(stdout: &str, steps: &[TestStep]) -> E2eResult<StepReport> {
    let mut report = StepReport {
        total: steps.len(),
        ..Default::default()
    };

    for line in stdout.lines() {
        let Some(payload) = line.trim_end().strip_prefix(STATUS_PREFIX) else {
            continue;
        };

        match serde_json::from_str::<StepEvent>(payload)? {
            StepEvent::Passed { step, screenshot } => {
                debug!("Step {} passed", step + 1);
                report.passed += 1;
                report.screenshots.extend(screenshot);
            }
            StepEvent::Failed {
                step: Some(step),
                error,
                screenshot,
            } => {
                let label = steps
                    .get(step)
                    .map(TestStep::label)
                    .unwrap_or_else(|| format!("step {}", step + 1));
                warn!("Step {} ({}) failed: {}", step + 1, label, error);
                report.screenshots.extend(screenshot);
                report.failure = Some(StepFailure { step, label, error });
            }
            StepEvent::Failed {
                step: None, error, ..
            } => {
                return Err(E2eError::Playwright(format!("browser launch failed: {}", error)));
            }
            StepEvent::Log { message } => {
                info!("[TEST LOG] {}", message);
            }
        }
    }

    Ok(report)
}

/// A JavaScript string literal; JSON string syntax is valid JS.
fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// Keep names usable as a single path component
fn file_stem(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
