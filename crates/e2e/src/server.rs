//! Server management - spawning and health checking the application under test

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use trialkit_common::{AcquisitionError, ReleaseError, Resource};

use crate::error::{E2eError, E2eResult};

/// Configuration for the application server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Binary to spawn per attempt; `None` means `base_url` is already
    /// served by something else
    pub binary_path: Option<PathBuf>,

    pub args: Vec<String>,

    /// Extra environment for the spawned server
    pub env: HashMap<String, String>,

    /// Environment variable the server reads its port from
    pub port_env: String,

    /// Base URL of an externally managed server
    pub base_url: String,

    /// Port to listen on (None = find free port)
    pub port: Option<u16>,

    /// Path polled until it answers with a success status
    pub health_path: String,

    /// Timeout for server startup
    pub startup_timeout: Duration,

    /// How long a SIGTERM gets before the process is killed
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            args: Vec::new(),
            env: HashMap::new(),
            port_env: "PORT".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            port: None,
            health_path: "/health".to_string(),
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

/// Handle to a running (or external) server
pub struct ServerHandle {
    child: Option<Child>,
    base_url: String,
}

impl ServerHandle {
    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Process id of a server this handle spawned
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

pub struct ServerResource {
    config: ServerConfig,
    client: reqwest::Client,
}

impl ServerResource {
    pub fn new(config: ServerConfig) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn start(&self) -> E2eResult<ServerHandle> {
        let Some(binary) = &self.config.binary_path else {
            let base_url = self.config.base_url.trim_end_matches('/').to_string();
            self.check_health(&base_url).await?;
            return Ok(ServerHandle {
                child: None,
                base_url,
            });
        };

        let port = match self.config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        info!("Spawning {} on port {}", binary.display(), port);

        let mut cmd = Command::new(binary);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env(&self.config.port_env, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!("Failed to spawn {}: {}", binary.display(), e))
        })?;

        let mut handle = ServerHandle {
            child: Some(child),
            base_url,
        };

        if let Err(e) = self.wait_for_healthy(&mut handle).await {
            if let Err(stop_err) = self.stop(handle).await {
                warn!("Cleanup after failed startup: {}", stop_err);
            }
            return Err(e);
        }

        info!("Server is healthy at {}", handle.base_url);
        Ok(handle)
    }

    async fn check_health(&self, base_url: &str) -> E2eResult<()> {
        let health_url = format!("{}{}", base_url, self.config.health_path);
        let resp = self.client.get(&health_url).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(E2eError::ServerStartup(format!(
                "{} returned {}",
                health_url,
                resp.status()
            )))
        }
    }

    /// Poll the health endpoint until it answers or the startup timeout
    /// passes. Gives up early if the process exits.
    async fn wait_for_healthy(&self, handle: &mut ServerHandle) -> E2eResult<()> {
        let health_url = format!("{}{}", handle.base_url, self.config.health_path);
        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < self.config.startup_timeout {
            attempts += 1;

            if let Some(child) = handle.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(E2eError::ServerStartup(format!(
                        "server exited during startup ({})",
                        status
                    )));
                }
            }

            match self.client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for server to start...");
                    }
                    // Connection refused is expected while server is starting
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    /// Stop a spawned server: SIGTERM, a grace period, then SIGKILL
    async fn stop(&self, mut handle: ServerHandle) -> E2eResult<()> {
        let Some(mut child) = handle.child.take() else {
            return Ok(());
        };
        info!("Stopping server (pid: {:?})", child.id());

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("SIGTERM to {} failed: {}", pid, e);
                }
            }
        }

        match timeout(self.config.shutdown_grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Server exited with {}", status);
                Ok(())
            }
            Err(_) => {
                warn!("Server ignored SIGTERM for {:?}; killing", self.config.shutdown_grace);
                child.kill().await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Resource for ServerResource {
    type Handle = ServerHandle;

    fn name(&self) -> String {
        match &self.config.binary_path {
            Some(binary) => format!("server:{}", binary.display()),
            None => format!("server:{}", self.config.base_url),
        }
    }

    async fn open(&self) -> Result<ServerHandle, AcquisitionError> {
        self.start()
            .await
            .map_err(|e| AcquisitionError::new(self.name(), e))
    }

    async fn close(&self, handle: ServerHandle) -> Result<(), ReleaseError> {
        self.stop(handle)
            .await
            .map_err(|e| ReleaseError::new(self.name(), e))
    }
}

/// Find a free port to use
pub fn find_free_port() -> std::io::Result<u16> {
    use std::net::TcpListener;

    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}
