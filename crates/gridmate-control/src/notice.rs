use crate::state_dir::escape_url_for_file;
use anyhow::{Context, Result};
use gridmate::protocol::{NoticeSeverity, NoticeView};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Notices older than this are evicted whenever an insert is considered.
pub const NOTICE_RETENTION_SECS: u64 = 30 * 86_400;

const SYSTEM_NOTICE_FILE: &str = "notices.jsonl";

/// A user-visible message of local or remote (feed) origin.
///
/// Seqnos are assigned on insert (highest + 1) and re-assigned when the
/// archives are loaded at startup; they are not stable across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    #[serde(skip)]
    pub seqno: u64,
    pub title: String,
    pub description: String,
    pub create_time: u64,
    pub arrival_time: u64,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub severity: NoticeSeverity,
    /// Base URL of the owning feed; `None` for local notices.
    #[serde(default)]
    pub feed_url: Option<String>,
    /// Transient mark-and-sweep flag used while re-parsing a feed.
    #[serde(skip)]
    pub dont_keep: bool,
}

impl Notice {
    /// Two notices are equivalent when title and description match.
    fn same_content(&self, other: &Notice) -> bool {
        self.title == other.title && self.description == other.description
    }

    pub fn to_view(&self) -> NoticeView {
        NoticeView {
            seqno: self.seqno,
            title: self.title.clone(),
            description: self.description.clone(),
            create_time: self.create_time,
            arrival_time: self.arrival_time,
            severity: self.severity,
            feed_url: self.feed_url.clone(),
        }
    }
}

/// Ordered collection of notices, newest first.
pub struct NoticeStore {
    state_dir: PathBuf,
    notices: Vec<Notice>,
}

impl NoticeStore {
    /// Load the system-notice archive; feed archives are loaded by the
    /// feed engine once the feed list is known. Call [`renumber`]
    /// after all archives are in.
    ///
    /// [`renumber`]: NoticeStore::renumber
    pub fn load(state_dir: &Path) -> Result<Self> {
        let mut store = Self {
            state_dir: state_dir.to_path_buf(),
            notices: Vec::new(),
        };
        let path = store.archive_path(None);
        if path.exists() {
            store.load_archive_file(&path)?;
        }
        Ok(store)
    }

    /// Load one feed's archive into the store.
    pub fn load_feed_archive(&mut self, feed_base_url: &str) -> Result<()> {
        let path = self.archive_path(Some(feed_base_url));
        if path.exists() {
            self.load_archive_file(&path)?;
        }
        Ok(())
    }

    fn load_archive_file(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let notice: Notice = serde_json::from_str(line)
                .with_context(|| format!("invalid notice entry in {}", path.display()))?;
            self.notices.push(notice);
        }
        Ok(())
    }

    /// Re-assign seqnos after loading: newest arrival gets the highest.
    pub fn renumber(&mut self) {
        self.notices
            .sort_by(|a, b| b.arrival_time.cmp(&a.arrival_time));
        let count = self.notices.len() as u64;
        for (i, notice) in self.notices.iter_mut().enumerate() {
            notice.seqno = count - i as u64;
        }
    }

    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notice> {
        self.notices.iter()
    }

    /// Consider `notice` for insertion.
    ///
    /// Runs the de-dup pass first: evicts everything past the retention
    /// window, then resolves content-equivalent notices: with
    /// `keep_old` the existing notice wins (and loses any pending
    /// mark-and-sweep removal mark); without it the existing notice is
    /// replaced. Returns whether the notice was inserted. Non-feed
    /// inserts rewrite the system archive immediately.
    pub fn append(&mut self, mut notice: Notice, keep_old: bool) -> Result<bool> {
        if !self.remove_dups(&notice, keep_old) {
            return Ok(false);
        }
        notice.seqno = self.notices.first().map(|n| n.seqno).unwrap_or(0) + 1;
        let from_feed = notice.feed_url.is_some();
        self.notices.insert(0, notice);
        if !from_feed {
            self.write_archive(None)?;
        }
        Ok(true)
    }

    /// Retention eviction plus duplicate resolution. Returns whether the
    /// candidate may be inserted.
    fn remove_dups(&mut self, candidate: &Notice, keep_old: bool) -> bool {
        let now = candidate.arrival_time;
        self.notices
            .retain(|n| n.arrival_time + NOTICE_RETENTION_SECS > now);

        let existing = self
            .notices
            .iter_mut()
            .find(|n| n.same_content(candidate));
        match existing {
            None => true,
            Some(old) => {
                if keep_old {
                    old.dont_keep = false;
                    false
                } else {
                    let seqno = old.seqno;
                    self.notices.retain(|n| n.seqno != seqno);
                    true
                }
            }
        }
    }

    /// Insert a locally generated notice.
    pub fn post(
        &mut self,
        title: impl Into<String>,
        description: impl Into<String>,
        severity: NoticeSeverity,
        now: u64,
    ) -> Result<bool> {
        self.append(
            Notice {
                seqno: 0,
                title: title.into(),
                description: description.into(),
                create_time: now,
                arrival_time: now,
                is_private: false,
                severity,
                feed_url: None,
                dont_keep: false,
            },
            false,
        )
    }

    /// Every notice with `seqno > since`, oldest first. `since == 0`
    /// returns the whole store (a full refresh). Private notices are
    /// skipped when `public_only` is set.
    pub fn write_since(&self, since: u64, public_only: bool) -> Vec<NoticeView> {
        let mut out: Vec<NoticeView> = self
            .notices
            .iter()
            .filter(|n| n.seqno > since)
            .filter(|n| !(public_only && n.is_private))
            .map(Notice::to_view)
            .collect();
        out.sort_by_key(|n| n.seqno);
        out
    }

    // -- Feed mark-and-sweep --------------------------------------------

    /// Mark every notice of a feed for removal, ahead of re-parsing the
    /// feed's contents. Items found again clear their mark in `append`.
    pub fn unkeep_for_feed(&mut self, feed_base_url: &str) {
        for n in &mut self.notices {
            if n.feed_url.as_deref() == Some(feed_base_url) {
                n.dont_keep = true;
            }
        }
    }

    /// Drop every still-marked notice of a feed. Returns how many were
    /// removed.
    pub fn remove_unkept(&mut self, feed_base_url: &str) -> usize {
        let before = self.notices.len();
        self.notices
            .retain(|n| !(n.dont_keep && n.feed_url.as_deref() == Some(feed_base_url)));
        before - self.notices.len()
    }

    /// Drop every notice belonging to a feed (the feed is gone).
    pub fn remove_for_feed(&mut self, feed_base_url: &str) {
        self.notices
            .retain(|n| n.feed_url.as_deref() != Some(feed_base_url));
    }

    // -- Persistence ----------------------------------------------------

    fn archive_path(&self, feed_base_url: Option<&str>) -> PathBuf {
        match feed_base_url {
            None => self.state_dir.join(SYSTEM_NOTICE_FILE),
            Some(url) => self
                .state_dir
                .join(format!("notices_{}.jsonl", escape_url_for_file(url))),
        }
    }

    /// Rewrite one archive: the system archive (`None`) or a feed's.
    pub fn write_archive(&self, feed_base_url: Option<&str>) -> Result<()> {
        let path = self.archive_path(feed_base_url);
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("failed to rewrite {}", path.display()))?;
        for notice in self
            .notices
            .iter()
            .filter(|n| n.feed_url.as_deref() == feed_base_url)
        {
            writeln!(file, "{}", serde_json::to_string(notice)?)?;
        }
        Ok(())
    }
}
