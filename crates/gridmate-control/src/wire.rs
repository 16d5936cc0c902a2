//! Wire documents exchanged with remote coordination servers: the
//! account-manager request/reply pair, feed descriptor and feed content
//! documents, and the version-check descriptor.
//!
//! Reply fields that the original protocol marks optional are `Option`s
//! with `#[serde(default)]`: an absent field and an explicit `false`/`0`
//! have different reconciliation effects, so the distinction must survive
//! parsing.

use gridmate::protocol::RunMode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FEED_POLL_INTERVAL_SECS: u64 = 86_400;

fn default_poll_interval() -> u64 {
    DEFAULT_FEED_POLL_INTERVAL_SECS
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

/// One feed descriptor, as carried in scheduler and account-manager
/// replies and in the persisted feed list files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedDesc {
    pub url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub use_seqno: bool,
}

/// A list of feed descriptors, the shape of both persisted feed list
/// files and the `feeds` block of remote replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedListDocument {
    #[serde(default)]
    pub feeds: Vec<FeedDesc>,
}

/// The document a feed URL serves: a sequence of notice items.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedDocument {
    #[serde(default)]
    pub items: Vec<FeedItem>,
    /// Highest item seqno on the server, for incremental fetch.
    #[serde(default)]
    pub last_seqno: Option<i64>,
}

/// One item of a feed document. Items become notices on arrival.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub create_time: u64,
    #[serde(default)]
    pub is_private: bool,
}

// ---------------------------------------------------------------------------
// Account manager
// ---------------------------------------------------------------------------

/// Per-resource usage line of a project status block. Only sent to
/// dynamic managers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceUsageReport {
    pub name: String,
    pub busy_time: f64,
}

/// One attached project, as reported to the account manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectReport {
    pub url: String,
    pub project_name: String,
    pub suspended_via_gui: bool,
    pub dont_request_more_work: bool,
    pub detach_when_done: bool,
    pub attached_via_acct_mgr: bool,
    pub resource_share: f64,
    pub elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<Vec<ResourceUsageReport>>,
}

/// Host identity block of the status report.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostInfoReport {
    pub domain_name: String,
    pub os_name: String,
    pub os_version: String,
    pub p_ncpus: u32,
}

/// A current or recently-active job descriptor, included when the
/// manager asked for task reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub project_url: String,
    pub state: String,
    pub elapsed_time: f64,
}

/// The status report POSTed to the account manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcctMgrRequest {
    pub name: String,
    pub password_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticator: Option<String>,
    pub host_cpid: String,
    pub previous_host_cpid: String,
    pub client_version: String,
    pub run_mode: RunMode,
    pub platforms: Vec<String>,
    pub projects: Vec<ProjectReport>,
    pub host_info: HostInfoReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_prefs: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskReport>>,
}

/// One per-project line item of a manager reply.
///
/// The four trailing `Option` fields carry the absent / explicit-false /
/// explicit-true distinction the reconciliation step depends on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcctMgrAccount {
    pub url: String,
    #[serde(default)]
    pub authenticator: Option<String>,
    #[serde(default)]
    pub url_signature: Option<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub dont_request_more_work: Option<bool>,
    #[serde(default)]
    pub detach_when_done: Option<bool>,
    #[serde(default)]
    pub suspend: Option<bool>,
    #[serde(default)]
    pub abort_not_started: Option<bool>,
    #[serde(default)]
    pub resource_share: Option<f64>,
    #[serde(default)]
    pub no_cpu: Option<bool>,
    #[serde(default)]
    pub no_gpu: Option<bool>,
}

/// The account-manager reply document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcctMgrReply {
    #[serde(default)]
    pub error_num: i32,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub signing_key: String,
    #[serde(default)]
    pub repeat_sec: Option<u64>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub no_project_notices: bool,
    #[serde(default)]
    pub send_tasks_all: bool,
    #[serde(default)]
    pub send_tasks_active: bool,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub opaque: Option<serde_json::Value>,
    #[serde(default)]
    pub accounts: Vec<AcctMgrAccount>,
    #[serde(default)]
    pub rss_feeds: Option<Vec<FeedDesc>>,
    #[serde(default)]
    pub global_prefs: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Version check
// ---------------------------------------------------------------------------

/// The version-check endpoint document: repeated version blocks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionDocument {
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

/// One released client version.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionEntry {
    pub dbplatform: String,
    pub version_num: u64,
    /// Display string, e.g. "1.2.0".
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub min_os_version: Option<String>,
    #[serde(default)]
    pub max_os_version: Option<String>,
}
