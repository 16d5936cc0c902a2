use crate::backoff::retry_backoff;
use crate::context::ClientContext;
use crate::http_op::HttpOpChannel;
use crate::transport::{HttpRequest, HttpTransport, TransportResult};
use crate::wire::{VersionDocument, VersionEntry};
use anyhow::Result;
use gridmate::protocol::NoticeSeverity;
use std::cmp::Ordering;
use std::sync::Arc;

/// How often the version descriptor is re-fetched.
const CHECK_PERIOD_SECS: u64 = 14 * 86_400;

/// Retry window after a failed fetch.
const RETRY_MIN_SECS: u64 = 3_600;
const RETRY_MAX_SECS: u64 = 7 * 86_400;

/// Compare dotted numeric version strings ("1.2.10" style). Returns
/// `None` when either side has a non-numeric segment.
pub fn cmp_dotted_versions(a: &str, b: &str) -> Option<Ordering> {
    let parse = |s: &str| -> Option<Vec<u64>> {
        s.split('.').map(|seg| seg.parse::<u64>().ok()).collect()
    };
    let (a, b) = (parse(a)?, parse(b)?);
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(Ordering::Equal)
}

/// Encode "major.minor.release" the way the descriptor's `version_num`
/// does: `major * 10000 + minor * 100 + release`.
pub fn version_num_of(version: &str) -> u64 {
    let mut parts = version.split('.').map(|s| s.parse::<u64>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let release = parts.next().unwrap_or(0);
    major * 10_000 + minor * 100 + release
}

/// Periodic consumer of the version-check endpoint: fetches the
/// descriptor, picks the newest release for this platform, and posts a
/// notice when it is newer than the running client.
pub struct VersionChecker {
    channel: HttpOpChannel,
    url: String,
    next_check_time: u64,
    failures: u32,
    /// Display string of a newer release, empty when up to date.
    pub newer_version: String,
}

impl VersionChecker {
    pub fn new(url: String, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            channel: HttpOpChannel::new(transport),
            url,
            next_check_time: 0,
            failures: 0,
            newer_version: String::new(),
        }
    }

    /// One cooperative tick.
    pub fn poll(&mut self, ctx: &mut ClientContext, now: u64) -> Result<()> {
        if let Some(outcome) = self.channel.poll() {
            self.handle_fetch_done(ctx, outcome, now)?;
            return Ok(());
        }
        if self.channel.busy() || self.url.is_empty() {
            return Ok(());
        }
        if now >= self.next_check_time {
            tracing::debug!(url = %self.url, "checking for a newer client version");
            self.channel.start(HttpRequest::get(self.url.clone())).ok();
            self.next_check_time = now + CHECK_PERIOD_SECS;
        }
        Ok(())
    }

    fn handle_fetch_done(
        &mut self,
        ctx: &mut ClientContext,
        outcome: TransportResult,
        now: u64,
    ) -> Result<()> {
        let doc = match outcome {
            Ok(resp) => match serde_json::from_str::<VersionDocument>(&resp.body) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(err = %e, "malformed version descriptor");
                    self.note_failure(now);
                    return Ok(());
                }
            },
            Err(e) => {
                tracing::warn!(err = %e, "version check failed");
                self.note_failure(now);
                return Ok(());
            }
        };

        self.failures = 0;
        self.next_check_time = now + CHECK_PERIOD_SECS;

        let running = version_num_of(&ctx.client_version);
        let newest = doc
            .versions
            .iter()
            .filter(|v| v.dbplatform == ctx.platform)
            .filter(|v| os_bounds_satisfied(v, &ctx.host.os_version))
            .max_by_key(|v| v.version_num);
        let Some(newest) = newest else {
            return Ok(());
        };
        if newest.version_num <= running {
            self.newer_version.clear();
            return Ok(());
        }

        let version_label = if newest.version.is_empty() {
            newest.version_num.to_string()
        } else {
            newest.version.clone()
        };
        if self.newer_version != version_label {
            self.newer_version = version_label.clone();
            tracing::info!(version = %version_label, "newer client version available");
            ctx.notices.post(
                "New version available",
                format!("gridmate {version_label} is available; you are running {}", ctx.client_version),
                NoticeSeverity::Info,
                now,
            )?;
        }
        Ok(())
    }

    fn note_failure(&mut self, now: u64) {
        self.failures += 1;
        self.next_check_time = now + retry_backoff(self.failures, RETRY_MIN_SECS, RETRY_MAX_SECS);
    }
}

/// A version entry applies when the host OS version sits inside its
/// optional bounds. An unknown host OS version only matches unbounded
/// entries.
fn os_bounds_satisfied(entry: &VersionEntry, os_version: &str) -> bool {
    if entry.min_os_version.is_none() && entry.max_os_version.is_none() {
        return true;
    }
    if os_version.is_empty() {
        return false;
    }
    if let Some(min) = &entry.min_os_version {
        match cmp_dotted_versions(os_version, min) {
            Some(Ordering::Less) | None => return false,
            _ => {}
        }
    }
    if let Some(max) = &entry.max_os_version {
        match cmp_dotted_versions(os_version, max) {
            Some(Ordering::Greater) | None => return false,
            _ => {}
        }
    }
    true
}
