//! Agent subprocess launch and shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use toolgate_core::config::AgentConfig;

use super::transport::TransportError;

/// How to start the agent subprocess.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Path to the agent binary.
    pub binary: PathBuf,
    /// Working directory; missing or empty falls back to the home directory.
    pub working_directory: PathBuf,
    pub model: Option<String>,
    /// Session ID to resume (if any).
    pub resume_session: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            working_directory: std::env::current_dir().unwrap_or_default(),
            model: None,
            resume_session: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl LaunchOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            model: config.model.clone(),
            allowed_tools: config.allowed_tools.clone(),
            disallowed_tools: config.disallowed_tools.clone(),
            ..Self::default()
        }
    }

    fn resolve_working_dir(&self) -> PathBuf {
        if !self.working_directory.as_os_str().is_empty() && self.working_directory.exists() {
            return self.working_directory.clone();
        }
        let fallback = dirs::home_dir().unwrap_or_else(|| {
            warn!("dirs::home_dir() returned None; falling back to temp_dir for working directory");
            std::env::temp_dir()
        });
        warn!(
            requested = %self.working_directory.display(),
            fallback = %fallback.display(),
            "Working directory missing or empty, using fallback"
        );
        fallback
    }

    /// Build the agent command. Permission prompts are always routed over the
    /// stdio control protocol.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(self.resolve_working_dir())
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-prompt-tool")
            .arg("stdio")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Ensure essential env vars are available to the subprocess even
        // when the host runs with a stripped environment.
        for key in ["HOME", "PATH", "ANTHROPIC_API_KEY"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&self.env);

        if let Some(ref model) = self.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref session) = self.resume_session {
            cmd.arg("--resume").arg(session);
        }
        if !self.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools").arg(self.disallowed_tools.join(","));
        }
        cmd.args(&self.extra_args);
        cmd
    }
}

/// A freshly started agent with its pipes taken.
pub struct SpawnedAgent {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Start the agent. Stderr is drained on a background task and logged.
pub fn spawn(options: &LaunchOptions) -> Result<SpawnedAgent, TransportError> {
    info!(
        binary = %options.binary.display(),
        resume_session = ?options.resume_session,
        model = ?options.model,
        "Spawning agent subprocess"
    );
    let mut child = options
        .command()
        .spawn()
        .map_err(|e| TransportError::Launch(format!("{}: {e}", options.binary.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Launch("Failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Launch("Failed to capture stdout".to_string()))?;

    if let Some(stderr) = child.stderr.take() {
        let pid = child.id();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(?pid, "stderr: {}", line);
            }
            debug!(?pid, "stderr reader finished");
        });
    }

    Ok(SpawnedAgent {
        child,
        stdin,
        stdout,
    })
}

/// Stop the agent: SIGINT first, then a forced kill once `grace` runs out.
pub async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGINT is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "Agent exited gracefully"),
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for agent");
            child.kill().await.ok();
        }
        Err(_) => {
            warn!("Timeout waiting for graceful shutdown, killing");
            child.kill().await.ok();
        }
    }
}
