use crate::auth::AuthSession;
use crate::state::{AgentState, SharedState};
use gridmate::protocol::{
    AcctMgrInfoView, AgentVersion, ErrorCode, NewerVersionView, ProjectCommand, ProjectView,
    Request, Response,
};
use serde::Serialize;

/// Static classification of one request kind.
pub struct RequestPolicy {
    /// Must the session be authenticated first?
    pub requires_auth: bool,
    /// Does the handler mutate agent state?
    pub mutating: bool,
    /// Does serving this request open the network grace window?
    pub needs_network: bool,
}

/// The dispatch table's privilege metadata. `exchange_versions`, the
/// auth handshake, and public notices are the only operations an
/// unauthenticated caller gets.
pub fn policy_of(req: &Request) -> RequestPolicy {
    let p = |requires_auth, mutating, needs_network| RequestPolicy {
        requires_auth,
        mutating,
        needs_network,
    };
    match req {
        Request::ExchangeVersions { .. } => p(false, false, false),
        Request::Auth1 | Request::Auth2 { .. } => p(false, false, false),
        Request::GetPublicNotices { .. } => p(false, false, false),
        Request::GetNotices { .. } => p(true, false, false),
        Request::GetProjects => p(true, false, false),
        Request::ProjectOp { command, .. } => {
            p(true, true, matches!(command, ProjectCommand::Update))
        }
        Request::GetAcctMgrInfo => p(true, false, false),
        Request::AcctMgrAttach { .. } => p(true, true, true),
        Request::AcctMgrAttachPoll => p(true, false, false),
        Request::GetNewerVersion => p(true, false, false),
        Request::SetRunMode { .. } => p(true, true, false),
        Request::NetworkAvailable => p(true, true, true),
        Request::Quit => p(true, true, false),
    }
}

/// Parse one framed request body and answer it. Returns the reply plus
/// whether the connection must close.
pub async fn process_frame(
    state: &SharedState,
    session: &mut AuthSession,
    bytes: &[u8],
    now: u64,
) -> (Response, bool) {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            return (
                Response::error(ErrorCode::InvalidRequest, format!("invalid request: {e}")),
                false,
            );
        }
    };
    let req: Request = match serde_json::from_value(value) {
        Ok(req) => req,
        Err(_) => {
            return (
                Response::error(ErrorCode::UnrecognizedOp, "unrecognized op"),
                false,
            );
        }
    };
    handle_request(state, session, req, now).await
}

/// Classify, authenticate, and dispatch one request.
pub async fn handle_request(
    state: &SharedState,
    session: &mut AuthSession,
    req: Request,
    now: u64,
) -> (Response, bool) {
    let policy = policy_of(&req);
    if policy.requires_auth && !session.authorized() {
        let close = session.unauthorized_strike();
        return (Response::Unauthorized, close);
    }

    match req {
        Request::Auth1 => (session.auth1(now * 1000), false),
        Request::Auth2 { nonce_hash } => session.auth2(&nonce_hash),
        req => {
            let mut st = state.lock().await;
            if policy.needs_network {
                st.note_network_rpc(now);
            }
            let resp = dispatch(&mut st, req, now);
            session.note_success();
            (resp, false)
        }
    }
}

/// Run one handler synchronously under the state lock.
fn dispatch(st: &mut AgentState, req: Request, now: u64) -> Response {
    match req {
        // Handled by the session layer before the lock is taken.
        Request::Auth1 | Request::Auth2 { .. } => Response::ok(None),

        Request::ExchangeVersions { major, minor, release } => {
            tracing::debug!(major, minor, release, "console version");
            json_reply(agent_version())
        }

        Request::GetNotices { seqno } => json_reply(st.ctx.notices.write_since(seqno, false)),
        Request::GetPublicNotices { seqno } => json_reply(st.ctx.notices.write_since(seqno, true)),

        Request::GetProjects => {
            let views: Vec<ProjectView> = st
                .ctx
                .projects
                .iter()
                .map(|p| ProjectView {
                    master_url: p.master_url.clone(),
                    project_name: p.project_name.clone(),
                    attached_via_acct_mgr: p.attached_via_acct_mgr,
                    suspended_via_gui: p.suspended_via_gui,
                    dont_request_more_work: p.dont_request_more_work,
                    detach_when_done: p.detach_when_done,
                    resource_share: p.resource_share,
                    sched_rpc_pending: p.sched_rpc_pending,
                })
                .collect();
            json_reply(views)
        }

        Request::ProjectOp { url, command } => project_op(st, &url, command),

        Request::GetAcctMgrInfo => {
            let view = AcctMgrInfoView {
                url: st.acct_mgr.info.master_url.clone(),
                name: st.acct_mgr.info.name.clone(),
                have_credentials: !st.acct_mgr.login.password_hash.is_empty()
                    || !st.acct_mgr.login.authenticator.is_empty(),
                dynamic: st.acct_mgr.info.dynamic,
                next_rpc_time: st.acct_mgr.login.next_rpc_time,
            };
            json_reply(view)
        }

        Request::AcctMgrAttach { url, name, password } => {
            let AgentState {
                ref mut ctx,
                ref mut acct_mgr,
                ref mut feeds,
                ..
            } = *st;
            match acct_mgr.do_rpc(ctx, feeds, &url, &name, &password, now) {
                Ok(()) => Response::ok(None),
                Err(e) => {
                    let (code, message) = e.to_error_code();
                    Response::error(code, message)
                }
            }
        }

        Request::AcctMgrAttachPoll => json_reply(st.acct_mgr.attach_status()),

        Request::GetNewerVersion => json_reply(NewerVersionView {
            newer_version: st.version_check.newer_version.clone(),
        }),

        Request::SetRunMode { mode } => {
            st.ctx.run_mode = mode;
            st.ctx.request_cpu_reschedule();
            if let Err(e) = st.ctx.save() {
                tracing::warn!(err = %e, "failed to persist run mode");
                return Response::error(ErrorCode::Internal, "failed to persist run mode");
            }
            tracing::info!(mode = %mode, "run mode changed");
            Response::ok(None)
        }

        Request::NetworkAvailable => Response::ok(None),

        Request::Quit => {
            tracing::info!("shutdown requested over RPC");
            st.quit_requested = true;
            Response::ok(None)
        }
    }
}

fn project_op(st: &mut AgentState, url: &str, command: ProjectCommand) -> Response {
    let mut reschedule = false;
    let mut work_fetch = false;
    let mut detach = false;
    {
        let Some(project) = st.ctx.projects.find_mut(url) else {
            return Response::error(ErrorCode::NotFound, format!("no such project: {url}"));
        };
        match command {
            ProjectCommand::Suspend => {
                project.suspended_via_gui = true;
                reschedule = true;
            }
            ProjectCommand::Resume => {
                project.suspended_via_gui = false;
                reschedule = true;
            }
            ProjectCommand::NoMoreWork => project.dont_request_more_work = true,
            ProjectCommand::AllowMoreWork => {
                project.dont_request_more_work = false;
                work_fetch = true;
            }
            ProjectCommand::DetachWhenDone => {
                project.detach_when_done = true;
                project.dont_request_more_work = true;
            }
            ProjectCommand::Update => {
                project.sched_rpc_pending = true;
                work_fetch = true;
            }
            ProjectCommand::Detach => detach = true,
        }
    }

    if detach {
        if let Err(e) = st.ctx.projects.detach(url) {
            let (code, message) = e.to_error_code();
            return Response::error(code, message);
        }
        let AgentState {
            ref mut ctx,
            ref mut feeds,
            ref acct_mgr,
            ..
        } = *st;
        if let Err(e) =
            feeds.update_feed_list(&ctx.projects, &acct_mgr.info.rss_feeds, &mut ctx.notices)
        {
            tracing::warn!(err = %e, "feed list refresh after detach failed");
        }
        reschedule = true;
    } else if let Err(e) = st.ctx.projects.save() {
        tracing::warn!(err = %e, "failed to persist project state");
        return Response::error(ErrorCode::Internal, "failed to persist project state");
    }

    if reschedule {
        st.ctx.request_cpu_reschedule();
    }
    if work_fetch {
        st.ctx.request_work_fetch();
    }
    tracing::info!(project = %url, op = ?command, "project operation applied");
    Response::ok(None)
}

fn agent_version() -> AgentVersion {
    AgentVersion {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        release: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    }
}

fn json_reply<T: Serialize>(value: T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::ok(Some(data)),
        Err(e) => Response::error(ErrorCode::Internal, format!("encoding failure: {e}")),
    }
}
