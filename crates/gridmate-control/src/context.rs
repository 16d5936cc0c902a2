use crate::notice::NoticeStore;
use crate::project::ProjectRegistry;
use crate::wire::TaskReport;
use anyhow::{Context as _, Result};
use gridmate::protocol::RunMode;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONTEXT_FILE: &str = "context.json";

/// Host identity, reported to the account manager.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostInfo {
    pub domain_name: String,
    pub os_name: String,
    pub os_version: String,
    pub p_ncpus: u32,
    /// Random cross-project host identifier, generated once and persisted.
    pub host_cpid: String,
}

impl HostInfo {
    fn detect(host_cpid: String) -> Self {
        let domain_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let p_ncpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            domain_name,
            os_name: std::env::consts::OS.to_string(),
            os_version: String::new(),
            p_ncpus,
            host_cpid,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContextRecord {
    host_cpid: String,
    run_mode: RunMode,
    #[serde(default)]
    global_prefs: Option<serde_json::Value>,
}

/// Shared state of the control plane, passed by reference into every
/// component. There is no process-wide singleton; whoever owns the
/// context decides how access is serialized (the agent holds it behind
/// one lock, taken once per tick or per RPC request).
pub struct ClientContext {
    pub state_dir: PathBuf,
    pub host: HostInfo,
    pub platform: String,
    pub client_version: String,
    pub run_mode: RunMode,
    pub projects: ProjectRegistry,
    pub notices: NoticeStore,
    pub global_prefs: Option<serde_json::Value>,
    /// Current and recently-active job descriptors, maintained by the
    /// (out-of-scope) job subsystem; reported to managers that ask.
    pub tasks: Vec<TaskReport>,
    /// Set by the (out-of-scope) scheduler when a schedulable resource
    /// sits idle; drives the account-manager starvation timer.
    pub resource_starved: bool,
    /// Narrow call-backs into the out-of-scope scheduling subsystems:
    /// polled and cleared by them, only ever set here.
    pub work_fetch_requested: bool,
    pub cpu_reschedule_requested: bool,
}

impl ClientContext {
    /// Load persisted state from the state directory, creating the
    /// durable host identifier on first run.
    pub fn load(state_dir: &Path, platform: String, client_version: String) -> Result<Self> {
        let record_path = state_dir.join(CONTEXT_FILE);
        let record: ContextRecord = if record_path.exists() {
            let data =
                std::fs::read_to_string(&record_path).context("failed to read context.json")?;
            serde_json::from_str(&data).context("invalid context.json")?
        } else {
            ContextRecord {
                host_cpid: new_host_cpid(),
                ..Default::default()
            }
        };

        let ctx = Self {
            state_dir: state_dir.to_path_buf(),
            host: HostInfo::detect(record.host_cpid),
            platform,
            client_version,
            run_mode: record.run_mode,
            projects: ProjectRegistry::load(state_dir)?,
            notices: NoticeStore::load(state_dir)?,
            global_prefs: record.global_prefs,
            tasks: Vec::new(),
            resource_starved: false,
            work_fetch_requested: false,
            cpu_reschedule_requested: false,
        };
        ctx.save()?;
        Ok(ctx)
    }

    /// Rewrite the durable part of the context.
    pub fn save(&self) -> Result<()> {
        let record = ContextRecord {
            host_cpid: self.host.host_cpid.clone(),
            run_mode: self.run_mode,
            global_prefs: self.global_prefs.clone(),
        };
        let path = self.state_dir.join(CONTEXT_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn request_work_fetch(&mut self) {
        self.work_fetch_requested = true;
    }

    pub fn request_cpu_reschedule(&mut self) {
        self.cpu_reschedule_requested = true;
    }
}

fn new_host_cpid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_cpid_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ClientContext::load(
            dir.path(),
            "x86_64-pc-linux-gnu".to_string(),
            "1.0.0".to_string(),
        )
        .unwrap();
        let cpid = ctx.host.host_cpid.clone();
        assert_eq!(cpid.len(), 32);
        drop(ctx);

        let ctx = ClientContext::load(
            dir.path(),
            "x86_64-pc-linux-gnu".to_string(),
            "1.0.0".to_string(),
        )
        .unwrap();
        assert_eq!(ctx.host.host_cpid, cpid);
    }

    #[test]
    fn run_mode_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ClientContext::load(
            dir.path(),
            "x86_64-pc-linux-gnu".to_string(),
            "1.0.0".to_string(),
        )
        .unwrap();
        ctx.run_mode = RunMode::Never;
        ctx.save().unwrap();

        let ctx = ClientContext::load(
            dir.path(),
            "x86_64-pc-linux-gnu".to_string(),
            "1.0.0".to_string(),
        )
        .unwrap();
        assert_eq!(ctx.run_mode, RunMode::Never);
    }
}
