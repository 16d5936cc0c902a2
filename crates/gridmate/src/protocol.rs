use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a single framed request or reply (256 KiB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Frame delimiter for the raw socket transport. Each JSON document is
/// terminated by exactly one sentinel byte.
pub const FRAME_SENTINEL: u8 = 0x03;

/// Seconds the network-suspension policy keeps the network up after an
/// RPC that needs it.
pub const NETWORK_GRACE_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Typed enums shared between the agent and its console
// ---------------------------------------------------------------------------

/// Global run mode of the agent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Auto,
    Always,
    Never,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Auto => write!(f, "auto"),
            RunMode::Always => write!(f, "always"),
            RunMode::Never => write!(f, "never"),
        }
    }
}

/// Per-project control operations issued from the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectCommand {
    Suspend,
    Resume,
    NoMoreWork,
    AllowMoreWork,
    DetachWhenDone,
    Detach,
    Update,
}

/// Notice severity, from informational to user-visible alert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSeverity {
    #[default]
    Info,
    Warning,
    Alert,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from a management console to the agent.
///
/// `exchange_versions`, `auth1`, `auth2` and `get_public_notices` are the
/// only operations allowed before authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Report console version, get the agent version back.
    ExchangeVersions {
        major: u32,
        minor: u32,
        release: u32,
    },
    /// Request an authentication nonce.
    Auth1,
    /// Answer the nonce challenge with `md5(nonce + password)` in hex.
    Auth2 { nonce_hash: String },

    // -- Notices --
    /// All notices newer than `seqno` (0 for everything).
    GetNotices {
        #[serde(default)]
        seqno: u64,
    },
    /// Public notices only; available without authentication.
    GetPublicNotices {
        #[serde(default)]
        seqno: u64,
    },

    // -- Projects --
    /// List attached projects.
    GetProjects,
    /// Apply a control operation to one project by master URL.
    ProjectOp {
        url: String,
        command: ProjectCommand,
    },

    // -- Account manager --
    /// Current account-manager binding, if any.
    GetAcctMgrInfo,
    /// Start an account-manager RPC. An empty URL detaches from the
    /// currently configured manager.
    AcctMgrAttach {
        url: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        password: String,
    },
    /// Poll the outcome of a previously started account-manager RPC.
    AcctMgrAttachPoll,

    // -- Misc --
    /// Newest client version discovered by the version-check poller.
    GetNewerVersion,
    /// Set the global run mode.
    SetRunMode { mode: RunMode },
    /// Declare that the network is up; opens the network grace window.
    NetworkAvailable,
    /// Shut the agent down.
    Quit,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Machine-readable error codes carried in `Response::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnrecognizedOp,
    InvalidRequest,
    InProgress,
    InvalidUrl,
    NotFound,
    NotAttached,
    Internal,
}

/// A reply from the agent. Exactly one per request, same framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    /// The request needed authentication and the session has none.
    Unauthorized,
    /// Reply to `auth1`.
    Nonce { nonce: String },
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reply payloads
// ---------------------------------------------------------------------------

/// Agent version, returned by `exchange_versions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentVersion {
    pub major: u32,
    pub minor: u32,
    pub release: u32,
}

/// One attached project as seen by the console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectView {
    pub master_url: String,
    pub project_name: String,
    pub attached_via_acct_mgr: bool,
    pub suspended_via_gui: bool,
    pub dont_request_more_work: bool,
    pub detach_when_done: bool,
    pub resource_share: f64,
    pub sched_rpc_pending: bool,
}

/// Account-manager binding as seen by the console. Credentials never
/// leave the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcctMgrInfoView {
    pub url: String,
    pub name: String,
    pub have_credentials: bool,
    pub dynamic: bool,
    pub next_rpc_time: u64,
}

/// One notice, newest seqnos last in `get_notices` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeView {
    pub seqno: u64,
    pub title: String,
    pub description: String,
    pub create_time: u64,
    pub arrival_time: u64,
    pub severity: NoticeSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
}

/// Outcome of `acct_mgr_attach_poll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcctMgrAttachStatus {
    /// True while the RPC is still in flight.
    pub in_progress: bool,
    /// Error string of the last completed RPC, empty on success.
    #[serde(default)]
    pub error: String,
}

/// Newer-version report, empty string when up to date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewerVersionView {
    pub newer_version: String,
}

// ---------------------------------------------------------------------------
// Authentication digests
// ---------------------------------------------------------------------------

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Digest the console sends as `auth2` for a nonce issued by `auth1`.
pub fn auth2_hash(nonce: &str, password: &str) -> String {
    md5_hex(&format!("{nonce}{password}"))
}

/// Digest for the HTTP header auth scheme (`Auth-ID`/`Auth-Seqno`/`Auth-Hash`).
/// The seqno must be strictly increasing per ID; the server tracks the
/// highest value seen.
pub fn http_auth_hash(auth_id: &str, seqno: u64, password: &str) -> String {
    md5_hex(&format!("{auth_id}{seqno}{password}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request::ProjectOp {
            url: "https://project.example.com/".to_string(),
            command: ProjectCommand::NoMoreWork,
        };
        let line = serde_json::to_string(&req).unwrap();
        assert!(line.contains("\"op\":\"project_op\""));
        assert!(line.contains("no_more_work"));
        let back: Request = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, Request::ProjectOp { .. }));
    }

    #[test]
    fn unknown_op_fails_to_parse() {
        let err = serde_json::from_str::<Request>(r#"{"op":"reboot_host"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn auth_hash_is_stable_hex() {
        let h = auth2_hash("1699999999.123_ab12cd34", "secret");
        assert_eq!(h.len(), 32);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, auth2_hash("1699999999.123_ab12cd34", "secret"));
        assert_ne!(h, auth2_hash("1699999999.123_ab12cd34", "other"));
    }

    #[test]
    fn http_auth_hash_varies_with_seqno() {
        let a = http_auth_hash("console-1", 1, "pw");
        let b = http_auth_hash("console-1", 2, "pw");
        assert_ne!(a, b);
    }
}
