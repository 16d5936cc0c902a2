use crate::config::AgentConfig;
use anyhow::Result;
use gridmate::protocol::{NETWORK_GRACE_SECS, RunMode};
use gridmate_control::acct_mgr::AcctMgr;
use gridmate_control::context::ClientContext;
use gridmate_control::feeds::FeedEngine;
use gridmate_control::transport::{HttpTransport, ReqwestTransport};
use gridmate_control::version_check::VersionChecker;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedState = Arc<Mutex<AgentState>>;

/// Everything the tick loop and the RPC handlers share. Held behind one
/// lock, taken once per tick and once per request, which keeps the
/// registry effectively single-owner.
pub struct AgentState {
    pub ctx: ClientContext,
    pub acct_mgr: AcctMgr,
    pub feeds: FeedEngine,
    pub version_check: VersionChecker,
    /// When an RPC last declared it needs the network up.
    pub last_network_rpc_time: u64,
    /// Highest accepted `Auth-Seqno` per `Auth-ID` (HTTP header auth).
    pub http_auth_seqnos: HashMap<String, u64>,
    pub quit_requested: bool,
}

impl AgentState {
    /// Load all persisted state and wire the components to one shared
    /// transport.
    pub fn load(state_dir: &Path, config: &AgentConfig) -> Result<Self> {
        Self::load_with_transport(state_dir, config, Arc::new(ReqwestTransport::new()))
    }

    pub fn load_with_transport(
        state_dir: &Path,
        config: &AgentConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let mut ctx = ClientContext::load(
            state_dir,
            config.platform.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
        )?;
        let acct_mgr = AcctMgr::load(state_dir, transport.clone())?;
        let mut feeds = FeedEngine::load(state_dir, transport.clone())?;

        feeds.load_project_feed_lists(&mut ctx.projects)?;
        feeds.load_archives(&mut ctx.notices)?;
        ctx.notices.renumber();
        feeds.update_feed_list(&ctx.projects, &acct_mgr.info.rss_feeds, &mut ctx.notices)?;

        let version_check =
            VersionChecker::new(config.version_check_url.clone(), transport);

        Ok(Self {
            ctx,
            acct_mgr,
            feeds,
            version_check,
            last_network_rpc_time: 0,
            http_auth_seqnos: HashMap::new(),
            quit_requested: false,
        })
    }

    /// True while the grace window opened by a network-needing RPC is
    /// still running.
    pub fn network_needed(&self, now: u64) -> bool {
        now < self.last_network_rpc_time + NETWORK_GRACE_SECS
    }

    /// Mark that the current RPC needs the network up.
    pub fn note_network_rpc(&mut self, now: u64) {
        self.last_network_rpc_time = now;
    }

    /// One tick of the cooperative loop: poll every component once.
    /// Errors are logged and never abort the loop.
    pub fn poll_all(&mut self, now: u64) {
        // With networking switched off, nothing is started or checked
        // unless a recent RPC opened the grace window.
        if self.ctx.run_mode == RunMode::Never && !self.network_needed(now) {
            return;
        }
        if let Err(e) = self.acct_mgr.poll(&mut self.ctx, &mut self.feeds, now) {
            tracing::warn!(err = %e, "account manager poll failed");
        }
        if let Err(e) = self.feeds.poll(&mut self.ctx.notices, now) {
            tracing::warn!(err = %e, "feed poll failed");
        }
        if let Err(e) = self.version_check.poll(&mut self.ctx, now) {
            tracing::warn!(err = %e, "version check poll failed");
        }
    }
}
