use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gridmate::client::AgentClient;
use gridmate::protocol::{
    AcctMgrAttachStatus, AcctMgrInfoView, AgentVersion, NewerVersionView, NoticeView,
    ProjectCommand, ProjectView, Request, RunMode,
};
use gridmate_control::state_dir::default_state_dir;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gridmate", about = "gridmate management console")]
struct Cli {
    /// Agent host.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// Agent RPC port.
    #[arg(long, global = true, default_value_t = 24_680)]
    port: u16,

    /// RPC password; prompted for when talking to a remote host.
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Agent version, account manager binding, and update status.
    Status,
    /// List attached projects.
    Projects,
    /// Show notices.
    Notices {
        /// Only notices newer than this seqno.
        #[arg(long, default_value_t = 0)]
        seqno: u64,
    },
    /// Apply an operation to one project.
    Project {
        url: String,
        #[arg(value_parser = parse_project_command)]
        op: ProjectCommand,
    },
    /// Bind to an account manager.
    AttachManager {
        url: String,
        name: String,
        /// Manager password; prompted for when omitted.
        #[arg(long)]
        manager_password: Option<String>,
    },
    /// Detach from the current account manager.
    DetachManager,
    /// Contact the current account manager now.
    SyncManager,
    /// Set the run mode.
    RunMode { mode: String },
    /// Shut the agent down.
    Quit,
}

fn parse_project_command(s: &str) -> Result<ProjectCommand, String> {
    match s {
        "suspend" => Ok(ProjectCommand::Suspend),
        "resume" => Ok(ProjectCommand::Resume),
        "no-more-work" => Ok(ProjectCommand::NoMoreWork),
        "allow-more-work" => Ok(ProjectCommand::AllowMoreWork),
        "detach-when-done" => Ok(ProjectCommand::DetachWhenDone),
        "detach" => Ok(ProjectCommand::Detach),
        "update" => Ok(ProjectCommand::Update),
        other => Err(format!(
            "unknown operation '{other}'; expected suspend|resume|no-more-work|\
             allow-more-work|detach-when-done|detach|update"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut client = AgentClient::connect(&cli.host, cli.port).await?;
    if let Some(password) = resolve_password(&cli)? {
        client.authorize(&password).await?;
    }

    match cli.command {
        Command::Status => {
            let data = client
                .request_data(Request::ExchangeVersions {
                    major: parse_env_version(env!("CARGO_PKG_VERSION_MAJOR")),
                    minor: parse_env_version(env!("CARGO_PKG_VERSION_MINOR")),
                    release: parse_env_version(env!("CARGO_PKG_VERSION_PATCH")),
                })
                .await?;
            let version: AgentVersion =
                serde_json::from_value(data.context("missing version payload")?)?;
            println!(
                "agent version: {}.{}.{}",
                version.major, version.minor, version.release
            );

            let data = client.request_data(Request::GetAcctMgrInfo).await?;
            let info: AcctMgrInfoView =
                serde_json::from_value(data.context("missing manager payload")?)?;
            if info.url.is_empty() {
                println!("account manager: none");
            } else {
                println!("account manager: {} ({})", info.name, info.url);
            }

            let data = client.request_data(Request::GetNewerVersion).await?;
            let newer: NewerVersionView =
                serde_json::from_value(data.context("missing version payload")?)?;
            if newer.newer_version.is_empty() {
                println!("up to date");
            } else {
                println!("newer version available: {}", newer.newer_version);
            }
        }

        Command::Projects => {
            let data = client.request_data(Request::GetProjects).await?;
            let projects: Vec<ProjectView> =
                serde_json::from_value(data.context("missing project payload")?)?;
            if projects.is_empty() {
                println!("no attached projects");
            }
            for p in projects {
                let mut flags = Vec::new();
                if p.attached_via_acct_mgr {
                    flags.push("via-manager");
                }
                if p.suspended_via_gui {
                    flags.push("suspended");
                }
                if p.dont_request_more_work {
                    flags.push("no-new-work");
                }
                if p.detach_when_done {
                    flags.push("detach-when-done");
                }
                println!(
                    "{}  share={}  [{}]",
                    p.master_url,
                    p.resource_share,
                    flags.join(", ")
                );
            }
        }

        Command::Notices { seqno } => {
            let data = client.request_data(Request::GetNotices { seqno }).await?;
            let notices: Vec<NoticeView> =
                serde_json::from_value(data.context("missing notice payload")?)?;
            for n in notices {
                println!("[{}] {}: {}", n.seqno, n.title, n.description);
            }
        }

        Command::Project { url, op } => {
            client
                .request_data(Request::ProjectOp { url, command: op })
                .await?;
            println!("ok");
        }

        Command::AttachManager {
            url,
            name,
            manager_password,
        } => {
            let password = match manager_password {
                Some(p) => p,
                None => rpassword::prompt_password("manager password: ")?,
            };
            client
                .request_data(Request::AcctMgrAttach { url, name, password })
                .await?;
            wait_for_manager(&mut client).await?;
        }

        Command::DetachManager => {
            client
                .request_data(Request::AcctMgrAttach {
                    url: String::new(),
                    name: String::new(),
                    password: String::new(),
                })
                .await?;
            println!("detached");
        }

        Command::SyncManager => {
            let data = client.request_data(Request::GetAcctMgrInfo).await?;
            let info: AcctMgrInfoView =
                serde_json::from_value(data.context("missing manager payload")?)?;
            if info.url.is_empty() {
                bail!("no account manager configured");
            }
            client
                .request_data(Request::AcctMgrAttach {
                    url: info.url,
                    name: String::new(),
                    password: String::new(),
                })
                .await?;
            wait_for_manager(&mut client).await?;
        }

        Command::RunMode { mode } => {
            let mode = match mode.as_str() {
                "auto" => RunMode::Auto,
                "always" => RunMode::Always,
                "never" => RunMode::Never,
                other => bail!("unknown run mode '{other}'; expected auto|always|never"),
            };
            client.request_data(Request::SetRunMode { mode }).await?;
            println!("run mode set to {mode}");
        }

        Command::Quit => {
            client.request_data(Request::Quit).await?;
            println!("agent shutting down");
        }
    }

    Ok(())
}

/// Poll the manager exchange until it settles.
async fn wait_for_manager(client: &mut AgentClient) -> Result<()> {
    loop {
        let data = client.request_data(Request::AcctMgrAttachPoll).await?;
        let status: AcctMgrAttachStatus =
            serde_json::from_value(data.context("missing status payload")?)?;
        if status.in_progress {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        if status.error.is_empty() {
            println!("account manager exchange complete");
            return Ok(());
        }
        bail!("account manager exchange failed: {}", status.error);
    }
}

/// Local connections are trusted by the agent; a password is only needed
/// for remote hosts (given or prompted), or when forced with `--password`.
fn resolve_password(cli: &Cli) -> Result<Option<String>> {
    if let Some(password) = &cli.password {
        return Ok(Some(password.clone()));
    }
    let local = cli.host == "127.0.0.1" || cli.host == "localhost" || cli.host == "::1";
    if local {
        // Best effort: reuse the agent's password file when readable.
        if let Ok(state_dir) = default_state_dir() {
            let path = state_dir.join("rpc_auth.cfg");
            if let Ok(contents) = std::fs::read_to_string(path) {
                let password = contents.trim().to_string();
                if !password.is_empty() {
                    return Ok(Some(password));
                }
            }
        }
        return Ok(None);
    }
    Ok(Some(rpassword::prompt_password("RPC password: ")?))
}

fn parse_env_version(s: &str) -> u32 {
    s.parse().unwrap_or(0)
}
