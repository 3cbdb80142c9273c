//! `toolgate`
//!
//! Runs one agent query with tool permissions decided by the broker and
//! prints the agent's final result.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolgate_core::ndjson::Frame;
use toolgate_core::{PermissionMode, config};
use toolgate_daemon::permission::{PermissionBroker, TracingAudit};
use toolgate_daemon::query::{Gateway, QueryOptions};
use toolgate_daemon::subprocess::{LaunchOptions, PromptSource, TransportOptions};

#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about = "Run an agent with gated tool permissions")]
struct Args {
    /// Prompt sent to the agent as the first user turn
    prompt: String,

    /// Path to the agent CLI binary
    #[arg(long)]
    agent_bin: Option<PathBuf>,

    /// Working directory for the agent (also where project config is read from)
    #[arg(long, short = 'C')]
    cwd: Option<PathBuf>,

    /// Model to request from the agent
    #[arg(long)]
    model: Option<String>,

    /// Agent session to resume
    #[arg(long)]
    resume: Option<String>,

    /// Permission scope; defaults to the agent's session id
    #[arg(long)]
    scope: Option<String>,

    /// Permission mode: auto, skip or manual
    #[arg(long)]
    mode: Option<String>,

    /// Seconds a manual permission request waits for a decision
    #[arg(long)]
    permission_timeout: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "TOOLGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TOOLGATE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = config::load_config(Some(&project_dir))?;

    // CLI flags win over every config layer
    if let Some(bin) = &args.agent_bin {
        config.agent.binary.clone_from(bin);
    }
    if let Some(model) = &args.model {
        config.agent.model = Some(model.clone());
    }
    if let Some(mode) = &args.mode {
        config.permissions.default_mode = PermissionMode::parse(mode);
    }
    if let Some(secs) = args.permission_timeout {
        config.permissions.timeout_secs = secs;
    }
    if let Some(level) = &args.log_level {
        config.log_level.clone_from(level);
    }

    let log_filter = format!(
        "toolgate_daemon={level},toolgate_core={level},toolgate={level}",
        level = config.log_level
    );
    toolgate_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent = %config.agent.binary.display(),
        mode = %config.permissions.default_mode,
        "Starting toolgate"
    );
    if !config.permissions.default_mode.is_recognized() {
        anyhow::bail!(
            "unknown permission mode: {}",
            config.permissions.default_mode
        );
    }
    if config.permissions.default_mode == PermissionMode::Manual {
        warn!(
            timeout_secs = config.permissions.timeout_secs,
            "Manual mode has no interactive approver here; requests deny on timeout"
        );
    }

    let broker = PermissionBroker::from_config(&config.permissions)
        .with_audit(Arc::new(TracingAudit));
    let gateway = Gateway::new(Arc::new(broker));

    let launch = LaunchOptions {
        working_directory: project_dir,
        resume_session: args.resume.clone(),
        ..LaunchOptions::from_config(&config.agent)
    };
    let transport = TransportOptions {
        scope_id: args.scope.clone(),
        ..TransportOptions::from_config(&config.agent)
    };

    let cancel = CancellationToken::new();
    let mut query = gateway.query(
        &cancel,
        PromptSource::Text(args.prompt),
        QueryOptions {
            launch,
            transport,
            approval: None,
        },
    )?;

    let mut outcome = None;
    loop {
        tokio::select! {
            frame = query.next() => match frame {
                Some(Frame::Result(result)) => {
                    outcome = Some(result);
                    break;
                }
                Some(frame) => debug!(frame_type = frame.frame_type(), "Agent frame"),
                None => {
                    warn!("Agent output ended without a result");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, interrupting agent");
                if let Err(e) = query.interrupt().await {
                    warn!(error = %e, "Interrupt failed");
                }
                break;
            }
        }
    }

    query.close().await;

    let Some(result) = outcome else {
        anyhow::bail!("agent did not produce a result");
    };
    info!(
        session_id = %result.session_id,
        num_turns = result.num_turns,
        duration_ms = result.duration_ms,
        "Agent finished"
    );
    if let Some(text) = &result.result {
        #[allow(clippy::print_stdout)]
        {
            println!("{text}");
        }
    }
    if result.is_error {
        anyhow::bail!("agent reported an error ({})", result.subtype.as_str());
    }
    Ok(())
}
