use crate::backoff::retry_backoff;
use crate::http_op::HttpOpChannel;
use crate::notice::{Notice, NoticeStore};
use crate::project::ProjectRegistry;
use crate::state_dir::escape_url_for_file;
use crate::transport::{HttpRequest, HttpTransport, TransportError};
use crate::wire::{FeedDesc, FeedDocument, FeedListDocument};
use anyhow::{Context, Result};
use gridmate::protocol::NoticeSeverity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MASTER_FEED_FILE: &str = "feeds.json";

/// Floor for the retry delay after a failed fetch.
const FEED_RETRY_MIN_SECS: u64 = 600;

/// Strip the query string: the base URL is the feed's identity across
/// projects and names its on-disk files.
pub fn base_url_of(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// One entry of the merged master feed list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RssFeed {
    pub url: String,
    pub base_url: String,
    pub poll_interval: u64,
    #[serde(default)]
    pub next_poll_time: u64,
    #[serde(default)]
    pub use_seqno: bool,
    #[serde(default)]
    pub last_seqno: Option<i64>,
    /// Transient reconciliation mark; never persisted.
    #[serde(skip)]
    pub found: bool,
    #[serde(skip)]
    pub fetch_failures: u32,
}

impl RssFeed {
    pub fn from_desc(desc: &FeedDesc) -> Self {
        Self {
            url: desc.url.clone(),
            base_url: base_url_of(&desc.url).to_string(),
            poll_interval: desc.poll_interval,
            next_poll_time: 0,
            use_seqno: desc.use_seqno,
            last_seqno: None,
            found: false,
            fetch_failures: 0,
        }
    }

    fn update_from_desc(&mut self, desc: &FeedDesc) {
        self.url = desc.url.clone();
        self.poll_interval = desc.poll_interval;
        self.use_seqno = desc.use_seqno;
    }

    /// URL actually fetched; carries a `seqno` parameter when the feed
    /// supports incremental fetch.
    fn request_url(&self) -> String {
        if !self.use_seqno {
            return self.url.clone();
        }
        let seqno = self.last_seqno.unwrap_or(0);
        if self.url.contains('?') {
            format!("{}&seqno={seqno}", self.url)
        } else {
            format!("{}?seqno={seqno}", self.url)
        }
    }
}

/// Per-feed poll scheduling plus mark-and-sweep reconciliation of the
/// merged master feed list. One fetch in flight at a time.
pub struct FeedEngine {
    state_dir: PathBuf,
    channel: HttpOpChannel,
    feeds: Vec<RssFeed>,
    /// Base URL of the feed whose fetch is outstanding.
    in_flight: Option<String>,
}

impl FeedEngine {
    /// Load the master list from disk, or start empty.
    pub fn load(state_dir: &Path, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let path = state_dir.join(MASTER_FEED_FILE);
        let feeds = if path.exists() {
            let data = std::fs::read_to_string(&path).context("failed to read feeds.json")?;
            serde_json::from_str(&data).context("invalid feeds.json")?
        } else {
            Vec::new()
        };
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            channel: HttpOpChannel::new(transport),
            feeds,
            in_flight: None,
        })
    }

    pub fn feeds(&self) -> &[RssFeed] {
        &self.feeds
    }

    fn save_master(&self) -> Result<()> {
        let path = self.state_dir.join(MASTER_FEED_FILE);
        let data = serde_json::to_string_pretty(&self.feeds)?;
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn project_feed_path(&self, project_url: &str) -> PathBuf {
        self.state_dir
            .join(format!("feeds_{}.json", escape_url_for_file(project_url)))
    }

    /// Load every attached project's persisted feed list into the
    /// registry. Done once at startup, before the first reconciliation.
    pub fn load_project_feed_lists(&self, registry: &mut ProjectRegistry) -> Result<()> {
        for project in registry.iter_mut() {
            let path = self.project_feed_path(&project.master_url);
            if path.exists() {
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let doc: FeedListDocument =
                    serde_json::from_str(&data).context("invalid project feed list")?;
                project.rss_feeds = doc.feeds;
            }
        }
        Ok(())
    }

    /// Load the notice archive of every known feed. Seqno renumbering is
    /// the caller's job once all archives are in.
    pub fn load_archives(&self, notices: &mut NoticeStore) -> Result<()> {
        for feed in &self.feeds {
            notices.load_feed_archive(&feed.base_url)?;
        }
        Ok(())
    }

    /// Mark-and-sweep merge of every attached project's feed list (plus
    /// the account manager's, if any) into the master list.
    ///
    /// Known feeds referenced by some source are updated in place; new
    /// ones are added; feeds no source references any more are removed,
    /// cancelling an in-flight fetch whose target is gone and dropping
    /// the feed's notices and archive. The master list file is rewritten
    /// only when membership changed, so repeated calls with an unchanged
    /// mapping are idempotent.
    pub fn update_feed_list(
        &mut self,
        registry: &ProjectRegistry,
        manager_feeds: &[FeedDesc],
        notices: &mut NoticeStore,
    ) -> Result<bool> {
        for feed in &mut self.feeds {
            feed.found = false;
        }

        let mut changed = false;
        let sources = registry
            .iter()
            .flat_map(|p| p.rss_feeds.iter())
            .chain(manager_feeds.iter());
        for desc in sources {
            let base = base_url_of(&desc.url).to_string();
            match self.feeds.iter_mut().find(|f| f.base_url == base) {
                Some(feed) => {
                    feed.found = true;
                    feed.update_from_desc(desc);
                }
                None => {
                    let mut feed = RssFeed::from_desc(desc);
                    feed.found = true;
                    self.feeds.push(feed);
                    changed = true;
                }
            }
        }

        let stale: Vec<String> = self
            .feeds
            .iter()
            .filter(|f| !f.found)
            .map(|f| f.base_url.clone())
            .collect();
        for base in &stale {
            if self.in_flight.as_deref() == Some(base) {
                self.channel.cancel();
                self.in_flight = None;
                tracing::info!(feed = %base, "cancelled fetch for removed feed");
            }
            notices.remove_for_feed(base);
            let archive = self
                .state_dir
                .join(format!("notices_{}.jsonl", escape_url_for_file(base)));
            if archive.exists() {
                std::fs::remove_file(&archive).ok();
            }
            changed = true;
        }
        self.feeds.retain(|f| f.found);

        if changed {
            self.save_master()?;
        }
        Ok(changed)
    }

    /// Replace one project's feed set from a scheduler reply, then
    /// refresh the master list if anything changed.
    pub fn handle_scheduler_feeds(
        &mut self,
        registry: &mut ProjectRegistry,
        manager_feeds: &[FeedDesc],
        notices: &mut NoticeStore,
        project_url: &str,
        descs: Vec<FeedDesc>,
    ) -> Result<bool> {
        let path;
        let changed;
        {
            let Some(project) = registry.find_mut(project_url) else {
                anyhow::bail!("no such project: {project_url}");
            };
            let old: Vec<&str> = project.rss_feeds.iter().map(|d| d.url.as_str()).collect();
            let new: Vec<&str> = descs.iter().map(|d| d.url.as_str()).collect();
            changed = old != new;
            project.rss_feeds = descs;
            path = self.project_feed_path(&project.master_url);
            let doc = FeedListDocument {
                feeds: project.rss_feeds.clone(),
            };
            std::fs::write(&path, serde_json::to_string_pretty(&doc)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        if changed {
            self.update_feed_list(registry, manager_feeds, notices)?;
        }
        Ok(changed)
    }

    /// One cooperative tick: finish a completed fetch, or start the next
    /// due one. Never blocks.
    pub fn poll(&mut self, notices: &mut NoticeStore, now: u64) -> Result<()> {
        if let Some(outcome) = self.channel.poll() {
            if let Some(base) = self.in_flight.take() {
                self.handle_fetch_done(notices, &base, outcome, now)?;
            }
            return Ok(());
        }
        if self.channel.busy() {
            return Ok(());
        }

        let due = self.feeds.iter().position(|f| f.next_poll_time <= now);
        if let Some(idx) = due {
            let url = {
                let feed = &mut self.feeds[idx];
                let url = feed.request_url();
                feed.next_poll_time = now + feed.poll_interval;
                url
            };
            let base = self.feeds[idx].base_url.clone();
            tracing::debug!(feed = %base, "starting feed fetch");
            self.channel.start(HttpRequest::get(url)).ok();
            self.in_flight = Some(base);
            self.save_master()?;
        }
        Ok(())
    }

    fn handle_fetch_done(
        &mut self,
        notices: &mut NoticeStore,
        base: &str,
        outcome: Result<crate::transport::HttpResponse, TransportError>,
        now: u64,
    ) -> Result<()> {
        let Some(idx) = self.feeds.iter().position(|f| f.base_url == base) else {
            // Feed was reconciled away while the fetch was in flight.
            tracing::debug!(feed = %base, "discarding fetch result for removed feed");
            return Ok(());
        };

        let doc = match outcome {
            Ok(resp) => match serde_json::from_str::<FeedDocument>(&resp.body) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(feed = %base, err = %e, "malformed feed document");
                    self.note_fetch_failure(idx, now);
                    return Ok(());
                }
            },
            Err(e) => {
                tracing::warn!(feed = %base, err = %e, "feed fetch failed");
                self.note_fetch_failure(idx, now);
                return Ok(());
            }
        };

        let mut inserted = 0usize;
        notices.unkeep_for_feed(base);
        for item in &doc.items {
            let notice = Notice {
                seqno: 0,
                title: item.title.clone(),
                description: item.description.clone(),
                create_time: item.create_time,
                arrival_time: now,
                is_private: item.is_private,
                severity: NoticeSeverity::Info,
                feed_url: Some(base.to_string()),
                dont_keep: false,
            };
            if notices.append(notice, true)? {
                inserted += 1;
            }
        }
        let removed = notices.remove_unkept(base);

        {
            let feed = &mut self.feeds[idx];
            feed.fetch_failures = 0;
            if let Some(seqno) = doc.last_seqno {
                feed.last_seqno = Some(seqno);
            }
        }
        if inserted > 0 {
            notices.write_archive(Some(base))?;
            self.save_master()?;
        }
        tracing::debug!(feed = %base, inserted, removed, "feed fetch processed");
        Ok(())
    }

    fn note_fetch_failure(&mut self, idx: usize, now: u64) {
        let feed = &mut self.feeds[idx];
        feed.fetch_failures += 1;
        let max = feed.poll_interval.max(FEED_RETRY_MIN_SECS + 1);
        feed.next_poll_time = now + retry_backoff(feed.fetch_failures, FEED_RETRY_MIN_SECS, max);
    }
}
