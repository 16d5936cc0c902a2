mod auth;
mod config;
mod handler;
mod http;
mod rpc;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use config::AgentConfig;
use gridmate_control::state_dir::{default_state_dir, ensure_state_dir};
use gridmate_control::now_secs;
use state::{AgentState, SharedState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(author, version, about = "gridmate volunteer-computing agent")]
struct Args {
    /// State directory for agent data.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Management RPC port (overrides the config file).
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Accept management RPC connections from other hosts.
    #[arg(long)]
    allow_remote_rpc: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridmate_agent=info".into()),
        )
        .init();

    let args = Args::parse();

    let state_dir = match args.state_dir {
        Some(dir) => dir,
        None => default_state_dir().context("failed to determine state directory")?,
    };
    ensure_state_dir(&state_dir)?;

    let mut config = AgentConfig::load(&state_dir)?;
    if let Some(port) = args.rpc_port {
        config.rpc_port = port;
    }
    if args.allow_remote_rpc {
        config.allow_remote_rpc = true;
    }

    let password = auth::load_or_create_password(&state_dir)?;
    let agent = AgentState::load(&state_dir, &config)
        .with_context(|| format!("failed to load state from {}", state_dir.display()))?;
    tracing::info!(
        state_dir = %state_dir.display(),
        projects = agent.ctx.projects.len(),
        "agent state loaded"
    );
    let state: SharedState = Arc::new(Mutex::new(agent));

    let bind_ip = if config.allow_remote_rpc {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, config.rpc_port))
        .await
        .with_context(|| format!("failed to bind RPC port {}", config.rpc_port))?;
    tokio::spawn(rpc::serve(state.clone(), listener, password));

    run_tick_loop(state).await
}

/// The cooperative main loop: one tick a second, each component polled
/// once per tick, all under a single lock acquisition.
async fn run_tick_loop(state: SharedState) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut st = state.lock().await;
                st.poll_all(now_secs());
                if st.quit_requested {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received; shutting down");
                break;
            }
        }
    }

    let st = state.lock().await;
    if let Err(e) = st.ctx.save() {
        tracing::warn!(err = %e, "failed to flush context state");
    }
    if let Err(e) = st.ctx.projects.save() {
        tracing::warn!(err = %e, "failed to flush project state");
    }
    tracing::info!("agent stopped");
    Ok(())
}
