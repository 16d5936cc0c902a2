use crate::backoff::retry_backoff;
use crate::context::ClientContext;
use crate::error::ControlError;
use crate::feeds::FeedEngine;
use crate::http_op::HttpOpChannel;
use crate::project::{canonicalize_master_url, is_valid_master_url};
use crate::sign::verify_url_signature;
use crate::transport::{HttpRequest, HttpTransport, TransportResult};
use crate::wire::{
    AcctMgrAccount, AcctMgrReply, AcctMgrRequest, FeedDesc, HostInfoReport, ProjectReport,
};
use anyhow::{Context as _, Result};
use gridmate::protocol::{AcctMgrAttachStatus, NoticeSeverity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ACCT_MGR_INFO_FILE: &str = "acct_mgr_info.json";
const ACCT_MGR_LOGIN_FILE: &str = "acct_mgr_login.json";

/// Retry window after a failed exchange.
const RETRY_MIN_SECS: u64 = 600;
const RETRY_MAX_SECS: u64 = 86_400;

/// Contact interval when the manager does not name one.
const DEFAULT_INTERVAL_SECS: u64 = 86_400;

/// Starvation re-contact: initial grace, doubling up to the cap.
const STARVATION_GRACE_SECS: u64 = 600;
const STARVATION_BACKOFF_MAX_SECS: u64 = 86_400;

/// The starvation condition is only examined about once a minute of wall
/// time, not on every tick.
const STARVATION_CHECK_INTERVAL_SECS: u64 = 60;

/// An authenticator containing an underscore is replaceable by a manager
/// reply; anything else is never overwritten.
fn is_weak_authenticator(authenticator: &str) -> bool {
    authenticator.contains('_')
}

/// Hash a manager password for the login record and the status report.
pub fn hash_password(password: &str, login_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(login_name.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Public half of the durable manager record: identity and behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcctMgrInfo {
    pub master_url: String,
    #[serde(default)]
    pub name: String,
    /// Accepted once; a later reply carrying a different key is a hard
    /// inconsistency.
    #[serde(default)]
    pub signing_key: String,
    /// The manager may change the project set between exchanges.
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub no_project_notices: bool,
    /// Feed descriptors supplied by the manager itself, merged into the
    /// master feed list alongside the per-project ones.
    #[serde(default)]
    pub rss_feeds: Vec<FeedDesc>,
}

/// Credential-bearing half of the durable manager record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcctMgrLogin {
    #[serde(default)]
    pub login_name: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub authenticator: String,
    #[serde(default)]
    pub previous_host_cpid: String,
    #[serde(default)]
    pub next_rpc_time: u64,
    #[serde(default)]
    pub rpc_failures: u32,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub send_tasks_all: bool,
    #[serde(default)]
    pub send_tasks_active: bool,
    /// Opaque blob the manager round-trips between exchanges.
    #[serde(default)]
    pub opaque: Option<serde_json::Value>,
}

struct PendingBind {
    master_url: String,
    login_name: String,
    password_hash: String,
}

/// The account-manager protocol state machine: Idle ⇄ Busy, one exchange
/// at a time, re-armed on a schedule or on resource starvation.
pub struct AcctMgr {
    state_dir: PathBuf,
    channel: HttpOpChannel,
    pub info: AcctMgrInfo,
    pub login: AcctMgrLogin,
    busy: bool,
    /// Set while a GUI-initiated bind to a (possibly new) manager is in
    /// flight; adopted into the durable records only on success.
    pending: Option<PendingBind>,
    last_rpc_error: String,
    last_starved_check: u64,
    starved_since: Option<u64>,
    starvation_backoff: u64,
}

impl AcctMgr {
    /// Load both persisted records, or start unbound.
    pub fn load(state_dir: &Path, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let info_path = state_dir.join(ACCT_MGR_INFO_FILE);
        let info: AcctMgrInfo = if info_path.exists() {
            let data = std::fs::read_to_string(&info_path)
                .context("failed to read acct_mgr_info.json")?;
            serde_json::from_str(&data).context("invalid acct_mgr_info.json")?
        } else {
            AcctMgrInfo::default()
        };
        let login_path = state_dir.join(ACCT_MGR_LOGIN_FILE);
        let login: AcctMgrLogin = if login_path.exists() {
            let data = std::fs::read_to_string(&login_path)
                .context("failed to read acct_mgr_login.json")?;
            serde_json::from_str(&data).context("invalid acct_mgr_login.json")?
        } else {
            AcctMgrLogin::default()
        };
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            channel: HttpOpChannel::new(transport),
            info,
            login,
            busy: false,
            pending: None,
            last_rpc_error: String::new(),
            last_starved_check: 0,
            starved_since: None,
            starvation_backoff: STARVATION_GRACE_SECS,
        })
    }

    pub fn configured(&self) -> bool {
        !self.info.master_url.is_empty()
    }

    pub fn in_progress(&self) -> bool {
        self.busy
    }

    pub fn attach_status(&self) -> AcctMgrAttachStatus {
        AcctMgrAttachStatus {
            in_progress: self.busy,
            error: self.last_rpc_error.clone(),
        }
    }

    fn save_records(&self) -> Result<()> {
        let info_path = self.state_dir.join(ACCT_MGR_INFO_FILE);
        std::fs::write(&info_path, serde_json::to_string_pretty(&self.info)?)
            .with_context(|| format!("failed to write {}", info_path.display()))?;
        let login_path = self.state_dir.join(ACCT_MGR_LOGIN_FILE);
        std::fs::write(&login_path, serde_json::to_string_pretty(&self.login)?)
            .with_context(|| format!("failed to write {}", login_path.display()))?;
        Ok(())
    }

    fn delete_records(&self) {
        std::fs::remove_file(self.state_dir.join(ACCT_MGR_INFO_FILE)).ok();
        std::fs::remove_file(self.state_dir.join(ACCT_MGR_LOGIN_FILE)).ok();
    }

    /// Start a manager exchange on behalf of the console.
    ///
    /// An empty URL with a manager configured is a detach: the durable
    /// records are cleared, every project loses its attached-via-manager
    /// flag, the feed master list is refreshed, and no network call is
    /// made. Otherwise the URL is canonicalized and validated before any
    /// I/O. A non-empty `login_name` binds with fresh credentials;
    /// otherwise the stored ones are reused.
    pub fn do_rpc(
        &mut self,
        ctx: &mut ClientContext,
        feeds: &mut FeedEngine,
        url: &str,
        login_name: &str,
        password: &str,
        now: u64,
    ) -> Result<(), ControlError> {
        if self.busy {
            return Err(ControlError::InProgress);
        }
        if url.trim().is_empty() {
            if !self.configured() {
                return Err(ControlError::NotAttached);
            }
            return self
                .detach_manager(ctx, feeds)
                .map_err(|e| ControlError::Io(std::io::Error::other(e.to_string())));
        }

        let canonical = canonicalize_master_url(url);
        if !is_valid_master_url(&canonical) {
            return Err(ControlError::InvalidUrl(canonical));
        }

        let (login_name, password_hash) = if login_name.is_empty() {
            (self.login.login_name.clone(), self.login.password_hash.clone())
        } else {
            (login_name.to_string(), hash_password(password, login_name))
        };
        let authenticator = self.login.authenticator.clone();
        let dynamic = self.info.dynamic;
        self.pending = Some(PendingBind {
            master_url: canonical.clone(),
            login_name: login_name.clone(),
            password_hash: password_hash.clone(),
        });
        let started =
            self.start_exchange(ctx, &canonical, &login_name, &password_hash, &authenticator, dynamic);
        if started.is_err() {
            self.pending = None;
        }
        started
    }

    /// Start an exchange with the stored manager and credentials.
    fn start_stored(&mut self, ctx: &ClientContext) -> Result<(), ControlError> {
        let url = self.info.master_url.clone();
        let login_name = self.login.login_name.clone();
        let password_hash = self.login.password_hash.clone();
        let authenticator = self.login.authenticator.clone();
        let dynamic = self.info.dynamic;
        self.pending = None;
        self.start_exchange(ctx, &url, &login_name, &password_hash, &authenticator, dynamic)
    }

    fn start_exchange(
        &mut self,
        ctx: &ClientContext,
        url: &str,
        login_name: &str,
        password_hash: &str,
        authenticator: &str,
        dynamic: bool,
    ) -> Result<(), ControlError> {
        let request = self.build_request(ctx, login_name, password_hash, authenticator, dynamic);
        let body = serde_json::to_string(&request)?;
        self.channel.start(HttpRequest::post(url, body))?;
        self.busy = true;
        self.last_rpc_error.clear();
        tracing::info!(url = %url, "account manager exchange started");
        Ok(())
    }

    /// Build the status report described to the manager.
    fn build_request(
        &self,
        ctx: &ClientContext,
        login_name: &str,
        password_hash: &str,
        authenticator: &str,
        dynamic: bool,
    ) -> AcctMgrRequest {
        let projects = ctx
            .projects
            .iter()
            .map(|p| ProjectReport {
                url: p.master_url.clone(),
                project_name: p.project_name.clone(),
                suspended_via_gui: p.suspended_via_gui,
                dont_request_more_work: p.dont_request_more_work,
                detach_when_done: p.detach_when_done,
                attached_via_acct_mgr: p.attached_via_acct_mgr,
                resource_share: p.resource_share,
                elapsed_time: p.elapsed_time,
                resource_usage: dynamic.then(|| p.resource_usage.clone()),
            })
            .collect();

        let tasks = if self.login.send_tasks_all {
            Some(ctx.tasks.clone())
        } else if self.login.send_tasks_active {
            Some(
                ctx.tasks
                    .iter()
                    .filter(|t| t.state == "active")
                    .cloned()
                    .collect(),
            )
        } else {
            None
        };

        AcctMgrRequest {
            name: login_name.to_string(),
            password_hash: password_hash.to_string(),
            authenticator: (!authenticator.is_empty()).then(|| authenticator.to_string()),
            host_cpid: ctx.host.host_cpid.clone(),
            previous_host_cpid: self.login.previous_host_cpid.clone(),
            client_version: ctx.client_version.clone(),
            run_mode: ctx.run_mode,
            platforms: vec![ctx.platform.clone()],
            projects,
            host_info: HostInfoReport {
                domain_name: ctx.host.domain_name.clone(),
                os_name: ctx.host.os_name.clone(),
                os_version: ctx.host.os_version.clone(),
                p_ncpus: ctx.host.p_ncpus,
            },
            global_prefs: ctx.global_prefs.clone(),
            opaque: self.login.opaque.clone(),
            tasks,
        }
    }

    /// Detach from the configured manager. No network call.
    fn detach_manager(&mut self, ctx: &mut ClientContext, feeds: &mut FeedEngine) -> Result<()> {
        tracing::info!(url = %self.info.master_url, "detaching from account manager");
        self.info = AcctMgrInfo::default();
        self.login = AcctMgrLogin::default();
        self.pending = None;
        self.last_rpc_error.clear();
        self.starved_since = None;
        self.starvation_backoff = STARVATION_GRACE_SECS;
        self.delete_records();

        for project in ctx.projects.iter_mut() {
            project.attached_via_acct_mgr = false;
        }
        ctx.projects.save()?;
        feeds.update_feed_list(&ctx.projects, &self.info.rss_feeds, &mut ctx.notices)?;
        Ok(())
    }

    /// One cooperative tick.
    pub fn poll(&mut self, ctx: &mut ClientContext, feeds: &mut FeedEngine, now: u64) -> Result<()> {
        if self.busy {
            if let Some(outcome) = self.channel.poll() {
                self.busy = false;
                self.handle_completion(ctx, feeds, outcome, now)?;
            }
            return Ok(());
        }
        if !self.configured() {
            return Ok(());
        }

        if self.login.next_rpc_time > 0 && now >= self.login.next_rpc_time {
            tracing::info!(url = %self.info.master_url, "periodic account manager exchange due");
            // Safety net until the reply (or failure) sets the real time.
            self.login.next_rpc_time = now + DEFAULT_INTERVAL_SECS;
            if let Err(e) = self.start_stored(ctx) {
                tracing::warn!(err = %e, "could not start account manager exchange");
            }
            return Ok(());
        }

        if self.info.dynamic && now >= self.last_starved_check + STARVATION_CHECK_INTERVAL_SECS {
            self.last_starved_check = now;
            if ctx.resource_starved {
                match self.starved_since {
                    None => self.starved_since = Some(now),
                    Some(since) if now >= since + self.starvation_backoff => {
                        tracing::info!(
                            url = %self.info.master_url,
                            backoff = self.starvation_backoff,
                            "idle resources; contacting account manager early"
                        );
                        self.starvation_backoff =
                            (self.starvation_backoff * 2).min(STARVATION_BACKOFF_MAX_SECS);
                        self.starved_since = Some(now);
                        if let Err(e) = self.start_stored(ctx) {
                            tracing::warn!(err = %e, "could not start account manager exchange");
                        }
                    }
                    Some(_) => {}
                }
            } else {
                self.starved_since = None;
                self.starvation_backoff = STARVATION_GRACE_SECS;
            }
        }
        Ok(())
    }

    fn handle_completion(
        &mut self,
        ctx: &mut ClientContext,
        feeds: &mut FeedEngine,
        outcome: TransportResult,
        now: u64,
    ) -> Result<()> {
        let reply = match outcome {
            Err(e) => {
                tracing::warn!(err = %e, "account manager exchange failed");
                return self.exchange_failed(ctx, now, format!("exchange failed: {e}"));
            }
            Ok(resp) => match serde_json::from_str::<AcctMgrReply>(&resp.body) {
                Err(e) => {
                    tracing::warn!(err = %e, "malformed account manager reply");
                    return self.exchange_failed(ctx, now, format!("malformed reply: {e}"));
                }
                Ok(reply) => reply,
            },
        };

        if reply.error_num != 0 || !reply.error.is_empty() {
            let msg = if reply.error.is_empty() {
                format!("account manager error {}", reply.error_num)
            } else {
                reply.error.clone()
            };
            ctx.notices
                .post("Account manager error", &msg, NoticeSeverity::Alert, now)?;
            return self.exchange_failed(ctx, now, msg);
        }

        self.apply_reply(ctx, feeds, reply, now)
    }

    /// Transport, parse, and application-level failures all land here:
    /// count the failure, back off, and stop; the reply is not applied.
    fn exchange_failed(&mut self, ctx: &ClientContext, now: u64, msg: String) -> Result<()> {
        self.last_rpc_error = msg;
        if self.pending.take().is_some() && !self.configured() {
            // A first-time bind failed; there is no durable record to
            // reschedule.
            return Ok(());
        }
        self.login.rpc_failures += 1;
        self.login.next_rpc_time =
            now + retry_backoff(self.login.rpc_failures, RETRY_MIN_SECS, RETRY_MAX_SECS);
        self.login.previous_host_cpid = ctx.host.host_cpid.clone();
        self.save_records()
    }

    fn apply_reply(
        &mut self,
        ctx: &mut ClientContext,
        feeds: &mut FeedEngine,
        reply: AcctMgrReply,
        now: u64,
    ) -> Result<()> {
        // Detach finished detach-when-done projects first; repeat until a
        // pass changes nothing so secondary effects cascade.
        loop {
            let Some(url) = ctx
                .projects
                .iter()
                .find(|p| p.detach_when_done && p.pending_job_count == 0)
                .map(|p| p.master_url.clone())
            else {
                break;
            };
            tracing::info!(project = %url, "detaching finished project");
            ctx.projects.detach(&url).ok();
            ctx.request_cpu_reschedule();
        }

        self.login.rpc_failures = 0;
        self.last_rpc_error.clear();

        if let Some(bind) = self.pending.take() {
            if bind.master_url != self.info.master_url {
                // Fresh binding: manager-specific state starts over.
                self.info = AcctMgrInfo {
                    master_url: bind.master_url,
                    ..AcctMgrInfo::default()
                };
                self.login = AcctMgrLogin::default();
            }
            self.login.login_name = bind.login_name;
            self.login.password_hash = bind.password_hash;
        }

        let mut sig_ok = true;
        if !reply.signing_key.is_empty() {
            if self.info.signing_key.is_empty() {
                self.info.signing_key = reply.signing_key.clone();
            } else if self.info.signing_key != reply.signing_key {
                sig_ok = false;
                tracing::error!(
                    url = %self.info.master_url,
                    "account manager signing key changed; ignoring its project instructions"
                );
                ctx.notices.post(
                    "Account manager inconsistency",
                    "the account manager's signing key changed unexpectedly; \
                     its project instructions were ignored",
                    NoticeSeverity::Alert,
                    now,
                )?;
            }
        }

        if !reply.name.is_empty() {
            self.info.name = reply.name.clone();
        }
        self.info.dynamic = reply.dynamic;
        self.info.no_project_notices = reply.no_project_notices;
        self.login.send_tasks_all = reply.send_tasks_all;
        self.login.send_tasks_active = reply.send_tasks_active;
        if let Some(user_name) = reply.user_name.clone() {
            self.login.user_name = user_name;
        }
        if let Some(team_name) = reply.team_name.clone() {
            self.login.team_name = team_name;
        }
        if let Some(opaque) = reply.opaque.clone() {
            self.login.opaque = Some(opaque);
        }

        let mut projects_changed = false;
        if sig_ok {
            for account in &reply.accounts {
                projects_changed |= self.process_account(ctx, account)?;
            }
            if !reply.accounts.is_empty() {
                ctx.projects.save()?;
            }
        }

        if let Some(descs) = reply.rss_feeds.clone() {
            self.info.rss_feeds = descs;
        }
        feeds.update_feed_list(&ctx.projects, &self.info.rss_feeds, &mut ctx.notices)?;

        if let Some(prefs) = reply.global_prefs.clone() {
            ctx.global_prefs = Some(prefs);
            ctx.request_cpu_reschedule();
            ctx.save()?;
        }
        if projects_changed {
            ctx.request_work_fetch();
        }

        self.login.previous_host_cpid = ctx.host.host_cpid.clone();
        self.login.next_rpc_time = now + reply.repeat_sec.unwrap_or(DEFAULT_INTERVAL_SECS);
        self.save_records()
    }

    /// Reconcile one account line item against the attached project set.
    /// Returns whether the project set itself changed.
    fn process_account(
        &mut self,
        ctx: &mut ClientContext,
        account: &AcctMgrAccount,
    ) -> Result<bool> {
        let canonical = canonicalize_master_url(&account.url);

        if let Some(project) = ctx.projects.find(&canonical) {
            if account.detach {
                if !project.attached_via_acct_mgr {
                    // Attached by hand; the manager does not own it.
                    return Ok(false);
                }
                tracing::info!(project = %canonical, "detaching project on manager instruction");
                ctx.projects.detach(&canonical).ok();
                ctx.request_cpu_reschedule();
                return Ok(true);
            }

            let mut needs_reschedule = false;
            {
                let Some(project) = ctx.projects.find_mut(&canonical) else {
                    return Ok(false);
                };
                if let Some(new_auth) =
                    account.authenticator.as_deref().filter(|a| !a.is_empty())
                {
                    if project.authenticator != new_auth {
                        if is_weak_authenticator(&project.authenticator)
                            && is_weak_authenticator(new_auth)
                        {
                            tracing::info!(project = %canonical, "replacing weak authenticator");
                            project.authenticator = new_auth.to_string();
                        } else {
                            tracing::warn!(
                                project = %canonical,
                                "manager sent an authenticator but the local one is not replaceable"
                            );
                        }
                    }
                }
                project.attached_via_acct_mgr = true;
                if let Some(v) = account.dont_request_more_work {
                    project.dont_request_more_work = v;
                }
                if let Some(v) = account.detach_when_done {
                    project.detach_when_done = v;
                    if v {
                        project.dont_request_more_work = true;
                    }
                }
                if let Some(v) = account.no_cpu {
                    project.no_cpu_work = v;
                }
                if let Some(v) = account.no_gpu {
                    project.no_gpu_work = v;
                }
                match account.resource_share {
                    Some(share) => project.resource_share = share,
                    // No explicit override: back to the share from the
                    // project's own web preferences.
                    None => project.resource_share = project.web_resource_share,
                }
                if account.update {
                    project.sched_rpc_pending = true;
                }
                if let Some(suspend) = account.suspend {
                    if project.suspended_via_gui != suspend {
                        project.suspended_via_gui = suspend;
                        needs_reschedule = true;
                    }
                }
                if account.abort_not_started == Some(true) {
                    project.abort_not_started_pending = true;
                }
            }
            if needs_reschedule {
                ctx.request_cpu_reschedule();
            }
            return Ok(false);
        }

        // Not attached.
        if account.detach {
            return Ok(false);
        }
        let Some(authenticator) = account.authenticator.as_deref().filter(|a| !a.is_empty())
        else {
            tracing::warn!(project = %canonical, "attach instruction without authenticator; skipped");
            return Ok(false);
        };
        let Some(signature) = account.url_signature.as_deref() else {
            tracing::warn!(project = %canonical, "attach instruction without URL signature; skipped");
            return Ok(false);
        };
        if !verify_url_signature(&self.info.signing_key, &account.url, signature) {
            tracing::warn!(project = %canonical, "URL signature verification failed; skipped");
            return Ok(false);
        }
        tracing::info!(project = %canonical, "attaching project on manager instruction");
        ctx.projects
            .attach(canonical, authenticator.to_string(), true)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::test_keys::{keypair, sign_url};
    use crate::transport::MockTransport;

    const NOW: u64 = 1_700_000_000;
    const MGR_URL: &str = "https://mgr.example.com/";

    fn setup() -> (
        AcctMgr,
        ClientContext,
        FeedEngine,
        Arc<MockTransport>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        let mgr = AcctMgr::load(dir.path(), transport.clone()).unwrap();
        let ctx = ClientContext::load(
            dir.path(),
            "x86_64-pc-linux-gnu".to_string(),
            "1.0.0".to_string(),
        )
        .unwrap();
        let feeds = FeedEngine::load(dir.path(), Arc::new(MockTransport::new())).unwrap();
        (mgr, ctx, feeds, transport, dir)
    }

    fn configure(mgr: &mut AcctMgr, dynamic: bool) {
        mgr.info.master_url = MGR_URL.to_string();
        mgr.info.dynamic = dynamic;
        mgr.login.login_name = "volunteer".to_string();
        mgr.login.password_hash = hash_password("pw", "volunteer");
        mgr.save_records().unwrap();
    }

    async fn run_until_idle(
        mgr: &mut AcctMgr,
        ctx: &mut ClientContext,
        feeds: &mut FeedEngine,
        now: u64,
    ) {
        for _ in 0..1000 {
            if !mgr.in_progress() {
                return;
            }
            mgr.poll(ctx, feeds, now).unwrap();
            tokio::task::yield_now().await;
        }
        panic!("exchange never completed");
    }

    /// Run one console-initiated exchange against the stored manager.
    async fn sync(
        mgr: &mut AcctMgr,
        ctx: &mut ClientContext,
        feeds: &mut FeedEngine,
    ) {
        mgr.do_rpc(ctx, feeds, MGR_URL, "", "", NOW).unwrap();
        run_until_idle(mgr, ctx, feeds, NOW).await;
    }

    #[tokio::test]
    async fn second_rpc_while_busy_returns_in_progress() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        transport.push_body("{}");
        mgr.do_rpc(&mut ctx, &mut feeds, MGR_URL, "volunteer", "pw", NOW)
            .unwrap();
        let err = mgr
            .do_rpc(&mut ctx, &mut feeds, MGR_URL, "volunteer", "pw", NOW)
            .unwrap_err();
        assert!(matches!(err, ControlError::InProgress));
        // The rejected call performed no I/O.
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn detach_clears_flags_without_network() {
        let (mut mgr, mut ctx, mut feeds, transport, dir) = setup();
        configure(&mut mgr, false);
        ctx.projects
            .attach("https://grid.example.com/".to_string(), "auth".to_string(), true)
            .unwrap();

        mgr.do_rpc(&mut ctx, &mut feeds, "", "", "", NOW).unwrap();

        assert!(!mgr.configured());
        assert!(transport.requests().is_empty());
        let project = ctx.projects.find("https://grid.example.com/").unwrap();
        assert!(!project.attached_via_acct_mgr);
        assert!(!dir.path().join(ACCT_MGR_INFO_FILE).exists());
        assert!(!dir.path().join(ACCT_MGR_LOGIN_FILE).exists());
    }

    #[test]
    fn detach_without_manager_is_an_error() {
        let (mut mgr, mut ctx, mut feeds, _t, _dir) = setup();
        let err = mgr.do_rpc(&mut ctx, &mut feeds, "", "", "", NOW).unwrap_err();
        assert!(matches!(err, ControlError::NotAttached));
    }

    #[test]
    fn invalid_url_is_rejected_synchronously() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        let err = mgr
            .do_rpc(&mut ctx, &mut feeds, "ftp://mgr.example.com/", "u", "p", NOW)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidUrl(_)));
        let err = mgr
            .do_rpc(&mut ctx, &mut feeds, "nodots", "u", "p", NOW)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidUrl(_)));
        assert!(transport.requests().is_empty());
        assert_eq!(mgr.login.rpc_failures, 0);
    }

    #[tokio::test]
    async fn transport_failure_backs_off_and_keeps_reply_unapplied() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        transport.push_outcome(Err(crate::transport::TransportError::Timeout));

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        assert_eq!(mgr.login.rpc_failures, 1);
        assert!(mgr.login.next_rpc_time >= NOW + RETRY_MIN_SECS);
        assert!(mgr.login.next_rpc_time < NOW + RETRY_MAX_SECS);
        assert!(!mgr.attach_status().error.is_empty());
    }

    #[tokio::test]
    async fn reply_error_field_is_a_failure_with_alert_notice() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        transport.push_body(
            r#"{"error_num":-112,"error":"bad credentials",
                "accounts":[{"url":"https://p.example.com/","authenticator":"x"}]}"#,
        );

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        assert_eq!(mgr.login.rpc_failures, 1);
        assert!(mgr.attach_status().error.contains("bad credentials"));
        // The rest of the reply was not applied.
        assert!(ctx.projects.is_empty());
        let alerts = ctx.notices.write_since(0, false);
        assert!(alerts.iter().any(|n| n.severity == NoticeSeverity::Alert));
    }

    #[tokio::test]
    async fn accepted_signing_key_never_silently_changes() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        mgr.info.signing_key = "ORIGINAL".to_string();
        let (signing, _key) = keypair();
        let url = "https://p.example.com/";
        let body = serde_json::json!({
            "signing_key": "DIFFERENT",
            "accounts": [{
                "url": url,
                "authenticator": "fresh_auth",
                "url_signature": sign_url(&signing, url),
            }],
        });
        transport.push_body(body.to_string());

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        assert_eq!(mgr.info.signing_key, "ORIGINAL");
        // Project-attach effects of the reply were rejected wholesale.
        assert!(ctx.projects.is_empty());
        assert_eq!(mgr.login.rpc_failures, 0);
    }

    #[tokio::test]
    async fn strong_authenticator_is_never_overwritten() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        ctx.projects
            .attach("https://p.example.com/".to_string(), "strongauth".to_string(), true)
            .unwrap();
        transport.push_body(
            r#"{"accounts":[{"url":"https://p.example.com/","authenticator":"weak_new"}]}"#,
        );

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        let project = ctx.projects.find("https://p.example.com/").unwrap();
        assert_eq!(project.authenticator, "strongauth");
    }

    #[tokio::test]
    async fn weak_authenticator_is_replaced_by_weak() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        ctx.projects
            .attach("https://p.example.com/".to_string(), "old_weak".to_string(), true)
            .unwrap();
        transport.push_body(
            r#"{"accounts":[{"url":"https://p.example.com/","authenticator":"new_weak"}]}"#,
        );

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        let project = ctx.projects.find("https://p.example.com/").unwrap();
        assert_eq!(project.authenticator, "new_weak");
    }

    #[tokio::test]
    async fn bad_signature_skips_item_without_aborting_reply() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        let (_signing, key_b64) = keypair();
        mgr.info.signing_key = key_b64.clone();
        ctx.projects
            .attach("https://known.example.com/".to_string(), "auth".to_string(), true)
            .unwrap();
        let body = serde_json::json!({
            "signing_key": key_b64,
            "accounts": [
                {
                    "url": "https://new.example.com/",
                    "authenticator": "fresh_auth",
                    "url_signature": "bm90IGEgc2lnbmF0dXJl",
                },
                {
                    "url": "https://known.example.com/",
                    "dont_request_more_work": true,
                },
            ],
        });
        transport.push_body(body.to_string());

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        assert!(ctx.projects.find("https://new.example.com/").is_none());
        let known = ctx.projects.find("https://known.example.com/").unwrap();
        assert!(known.dont_request_more_work);
    }

    #[tokio::test]
    async fn valid_signature_attaches_new_project() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        let (signing, key_b64) = keypair();
        mgr.info.signing_key = key_b64.clone();
        let url = "https://new.example.com/";
        let body = serde_json::json!({
            "signing_key": key_b64,
            "accounts": [{
                "url": url,
                "authenticator": "fresh_auth",
                "url_signature": sign_url(&signing, url),
            }],
        });
        transport.push_body(body.to_string());

        sync(&mut mgr, &mut ctx, &mut feeds).await;

        let project = ctx.projects.find(url).unwrap();
        assert!(project.attached_via_acct_mgr);
        assert_eq!(project.authenticator, "fresh_auth");
        assert!(ctx.work_fetch_requested);
    }

    #[tokio::test]
    async fn absent_resource_share_restores_web_share() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        {
            let project = ctx
                .projects
                .attach("https://p.example.com/".to_string(), "auth".to_string(), true)
                .unwrap();
            project.resource_share = 50.0;
            project.web_resource_share = 250.0;
        }
        transport.push_body(r#"{"accounts":[{"url":"https://p.example.com/"}]}"#);
        sync(&mut mgr, &mut ctx, &mut feeds).await;
        let share = ctx.projects.find("https://p.example.com/").unwrap().resource_share;
        assert_eq!(share, 250.0);

        transport
            .push_body(r#"{"accounts":[{"url":"https://p.example.com/","resource_share":25.0}]}"#);
        sync(&mut mgr, &mut ctx, &mut feeds).await;
        let share = ctx.projects.find("https://p.example.com/").unwrap().resource_share;
        assert_eq!(share, 25.0);
    }

    #[tokio::test]
    async fn detach_when_done_forces_no_new_work_and_cascades() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        ctx.projects
            .attach("https://p.example.com/".to_string(), "auth".to_string(), true)
            .unwrap();
        transport.push_body(
            r#"{"accounts":[{"url":"https://p.example.com/","detach_when_done":true}]}"#,
        );
        sync(&mut mgr, &mut ctx, &mut feeds).await;
        {
            let project = ctx.projects.find("https://p.example.com/").unwrap();
            assert!(project.detach_when_done);
            assert!(project.dont_request_more_work);
        }

        // With no outstanding jobs, the next successful exchange detaches it.
        transport.push_body("{}");
        sync(&mut mgr, &mut ctx, &mut feeds).await;
        assert!(ctx.projects.find("https://p.example.com/").is_none());
    }

    #[tokio::test]
    async fn repeat_sec_schedules_the_next_exchange() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, false);
        transport.push_body(r#"{"repeat_sec":3600}"#);
        sync(&mut mgr, &mut ctx, &mut feeds).await;
        assert_eq!(mgr.login.next_rpc_time, NOW + 3600);
        assert_eq!(mgr.login.rpc_failures, 0);
    }

    #[tokio::test]
    async fn starvation_triggers_early_exchange_with_doubling_backoff() {
        let (mut mgr, mut ctx, mut feeds, transport, _dir) = setup();
        configure(&mut mgr, true);
        mgr.login.next_rpc_time = NOW + DEFAULT_INTERVAL_SECS;
        ctx.resource_starved = true;

        // First check arms the timer; nothing is sent yet.
        mgr.poll(&mut ctx, &mut feeds, NOW).unwrap();
        assert!(!mgr.in_progress());
        assert!(transport.requests().is_empty());

        // Still inside the grace period a minute later.
        mgr.poll(&mut ctx, &mut feeds, NOW + 61).unwrap();
        assert!(!mgr.in_progress());

        // Past the 600s grace period the exchange fires.
        transport.push_body(r#"{"dynamic":true}"#);
        mgr.poll(&mut ctx, &mut feeds, NOW + STARVATION_GRACE_SECS + 1)
            .unwrap();
        assert!(mgr.in_progress());
        assert_eq!(mgr.starvation_backoff, STARVATION_GRACE_SECS * 2);
        run_until_idle(&mut mgr, &mut ctx, &mut feeds, NOW + STARVATION_GRACE_SECS + 2).await;

        // Condition clears: the timer resets.
        ctx.resource_starved = false;
        mgr.poll(&mut ctx, &mut feeds, NOW + STARVATION_GRACE_SECS + 120)
            .unwrap();
        assert_eq!(mgr.starvation_backoff, STARVATION_GRACE_SECS);
        assert!(mgr.starved_since.is_none());
    }
}
