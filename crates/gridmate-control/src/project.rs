use crate::error::ControlError;
use crate::wire::FeedDesc;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PROJECTS_FILE: &str = "projects.json";

fn default_resource_share() -> f64 {
    100.0
}

/// One attached project. Identified by its canonical master URL.
///
/// The registry is the only writer; the account-manager reconciliation
/// step and the RPC handlers mutate entries through it, everything else
/// just reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub master_url: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub authenticator: String,
    #[serde(default)]
    pub attached_via_acct_mgr: bool,
    #[serde(default)]
    pub suspended_via_gui: bool,
    #[serde(default)]
    pub dont_request_more_work: bool,
    #[serde(default)]
    pub detach_when_done: bool,
    #[serde(default = "default_resource_share")]
    pub resource_share: f64,
    /// Share last set on the project's own web preferences; restored when
    /// a manager reply stops carrying an explicit override.
    #[serde(default = "default_resource_share")]
    pub web_resource_share: f64,
    #[serde(default)]
    pub no_cpu_work: bool,
    #[serde(default)]
    pub no_gpu_work: bool,
    /// A scheduler RPC should be made at the next opportunity.
    #[serde(default)]
    pub sched_rpc_pending: bool,
    /// Not-yet-started jobs should be aborted; consumed by the job
    /// subsystem.
    #[serde(default)]
    pub abort_not_started_pending: bool,
    /// Jobs currently queued or running for this project.
    #[serde(default)]
    pub pending_job_count: u32,
    #[serde(default)]
    pub elapsed_time: f64,
    /// Per-resource busy time, reported to dynamic managers.
    #[serde(default)]
    pub resource_usage: Vec<crate::wire::ResourceUsageReport>,
    /// Feed descriptors last supplied for this project. Persisted in a
    /// per-project feed list file, not here.
    #[serde(skip)]
    pub rss_feeds: Vec<FeedDesc>,
}

impl Project {
    pub fn new(master_url: String) -> Self {
        Self {
            master_url,
            project_name: String::new(),
            authenticator: String::new(),
            attached_via_acct_mgr: false,
            suspended_via_gui: false,
            dont_request_more_work: false,
            detach_when_done: false,
            resource_share: default_resource_share(),
            web_resource_share: default_resource_share(),
            no_cpu_work: false,
            no_gpu_work: false,
            sched_rpc_pending: false,
            abort_not_started_pending: false,
            pending_job_count: 0,
            elapsed_time: 0.0,
            resource_usage: Vec::new(),
            rss_feeds: Vec::new(),
        }
    }
}

/// Persistent registry of attached projects, backed by one JSON file.
pub struct ProjectRegistry {
    path: PathBuf,
    projects: Vec<Project>,
}

impl ProjectRegistry {
    /// Load from disk, or start empty.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(PROJECTS_FILE);
        let projects = if path.exists() {
            let data =
                std::fs::read_to_string(&path).context("failed to read projects.json")?;
            serde_json::from_str(&data).context("invalid projects.json")?
        } else {
            Vec::new()
        };
        Ok(Self { path, projects })
    }

    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(&self.projects)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Project> {
        self.projects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Project> {
        self.projects.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Look up a project by master URL (canonicalized before compare).
    pub fn find(&self, url: &str) -> Option<&Project> {
        let canonical = canonicalize_master_url(url);
        self.projects.iter().find(|p| p.master_url == canonical)
    }

    pub fn find_mut(&mut self, url: &str) -> Option<&mut Project> {
        let canonical = canonicalize_master_url(url);
        self.projects
            .iter_mut()
            .find(|p| p.master_url == canonical)
    }

    /// Attach a new project. The URL must already be canonical.
    pub fn attach(
        &mut self,
        master_url: String,
        authenticator: String,
        via_acct_mgr: bool,
    ) -> Result<&mut Project> {
        let mut project = Project::new(master_url);
        project.authenticator = authenticator;
        project.attached_via_acct_mgr = via_acct_mgr;
        let idx = self.projects.len();
        self.projects.push(project);
        self.save()?;
        Ok(&mut self.projects[idx])
    }

    /// Detach a project, returning its record.
    pub fn detach(&mut self, url: &str) -> Result<Project, ControlError> {
        let canonical = canonicalize_master_url(url);
        let idx = self
            .projects
            .iter()
            .position(|p| p.master_url == canonical)
            .ok_or_else(|| ControlError::ProjectNotFound(canonical.clone()))?;
        let project = self.projects.remove(idx);
        self.save()
            .map_err(|e| ControlError::Io(std::io::Error::other(e.to_string())))?;
        Ok(project)
    }
}

// ---------------------------------------------------------------------------
// Master URLs
// ---------------------------------------------------------------------------

/// Canonical form: scheme defaulted to https, scheme and host lowercased,
/// trailing slash ensured.
pub fn canonicalize_master_url(url: &str) -> String {
    let mut s = url.trim().to_string();
    if !s.contains("://") {
        s = format!("https://{s}");
    }
    if let Some(scheme_end) = s.find("://") {
        let (scheme, rest) = s.split_at(scheme_end);
        let rest = &rest[3..];
        let host_end = rest.find('/').unwrap_or(rest.len());
        let (host, path) = rest.split_at(host_end);
        s = format!("{}://{}{}", scheme.to_ascii_lowercase(), host.to_ascii_lowercase(), path);
    }
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// A valid master URL is http(s), has a dotted host, and no whitespace.
pub fn is_valid_master_url(url: &str) -> bool {
    let rest = if let Some(r) = url.strip_prefix("https://") {
        r
    } else if let Some(r) = url.strip_prefix("http://") {
        r
    } else {
        return false;
    };
    let host = rest.split('/').next().unwrap_or("");
    !host.is_empty()
        && host.contains('.')
        && !host.ends_with('.')
        && !url.chars().any(|c| c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_normalizes_case_scheme_and_slash() {
        assert_eq!(
            canonicalize_master_url("HTTPS://Grid.Example.COM/Proj"),
            "https://grid.example.com/Proj/"
        );
        assert_eq!(
            canonicalize_master_url("grid.example.com"),
            "https://grid.example.com/"
        );
        assert_eq!(
            canonicalize_master_url("http://grid.example.com/"),
            "http://grid.example.com/"
        );
    }

    #[test]
    fn validation_rejects_junk() {
        assert!(is_valid_master_url("https://grid.example.com/"));
        assert!(!is_valid_master_url("ftp://grid.example.com/"));
        assert!(!is_valid_master_url("https://localhost/"));
        assert!(!is_valid_master_url("https://grid example.com/"));
        assert!(!is_valid_master_url(""));
    }

    #[test]
    fn registry_attach_find_detach() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = ProjectRegistry::load(dir.path()).unwrap();
        assert!(reg.is_empty());

        reg.attach(
            "https://grid.example.com/".to_string(),
            "auth".to_string(),
            true,
        )
        .unwrap();
        assert!(reg.find("https://GRID.example.com").is_some());

        // Survives a reload.
        let mut reg = ProjectRegistry::load(dir.path()).unwrap();
        assert_eq!(reg.len(), 1);

        reg.detach("https://grid.example.com/").unwrap();
        assert!(reg.is_empty());
        let err = reg.detach("https://grid.example.com/").unwrap_err();
        assert!(matches!(err, ControlError::ProjectNotFound(_)));
    }
}
