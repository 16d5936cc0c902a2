//! Control-plane core of the gridmate volunteer-computing agent.
//!
//! Everything here is driven by a single cooperative tick: the owner calls
//! each component's `poll()` roughly once a second, components never block,
//! and network exchanges are represented as started-but-unfinished
//! operations on an [`http_op::HttpOpChannel`] that a later tick checks
//! again. The shared project/feed/notice registry lives on a
//! [`context::ClientContext`] passed explicitly into every call; there is
//! no process-wide state.

pub mod acct_mgr;
pub mod backoff;
pub mod context;
pub mod error;
pub mod feeds;
pub mod http_op;
pub mod notice;
pub mod project;
pub mod sign;
pub mod state_dir;
pub mod transport;
pub mod version_check;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
