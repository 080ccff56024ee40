use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::core::gateway::ToolGateway;
use crate::error::Result;

const POLICY_MARKER: &str = "# bids2datalad storage policy";

/// Text formats always committed to git rather than the annex.
pub const PLAIN_PATTERNS: &[&str] = &[
    "*.json", "*.tsv", "*.bval", "*.bvec", "*.txt", "*.md", "README*", "CHANGES", "LICENSE",
];

/// `.gitattributes` rules deciding plain vs. annexed storage.
///
/// Later lines win in gitattributes, so the size catch-all comes first and
/// the plain-text overrides after it.
#[derive(Debug, Clone)]
pub struct StoragePolicy {
    threshold: String,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self::new("1mb")
    }
}

impl StoragePolicy {
    pub fn new(threshold: impl Into<String>) -> Self {
        Self {
            threshold: threshold.into(),
        }
    }

    pub fn render(&self) -> String {
        let mut text = format!(
            "{POLICY_MARKER}\n* annex.largefiles=(largerthan={})\n",
            self.threshold
        );
        for pattern in PLAIN_PATTERNS {
            text.push_str(&format!("{pattern} annex.largefiles=nothing\n"));
        }
        text
    }

    /// Append the policy to `<dataset>/.gitattributes` unless already present.
    pub fn apply(&self, dataset: &Path) -> io::Result<bool> {
        let path = dataset.join(".gitattributes");
        let mut existing = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        if existing.contains(POLICY_MARKER) {
            return Ok(false);
        }
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(&self.render());
        fs::write(&path, existing)?;
        Ok(true)
    }
}

/// Outcome of creating the per-subject sub-datasets.
#[derive(Debug, Default, Clone)]
pub struct SubUnitReport {
    pub created: Vec<String>,
    /// Already present (update runs).
    pub reused: Vec<String>,
    /// Subject name and the reason its sub-dataset could not be created.
    pub skipped: Vec<(String, String)>,
}

impl SubUnitReport {
    pub fn available(&self) -> usize {
        self.created.len() + self.reused.len()
    }
}

pub struct DatasetBuilder<'a> {
    gateway: &'a ToolGateway,
    policy: StoragePolicy,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(gateway: &'a ToolGateway, policy: StoragePolicy) -> Self {
        Self { gateway, policy }
    }

    pub fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    /// Create the top-level dataset and commit the storage policy as its first change.
    pub async fn create_top(&self, path: &Path, force: bool) -> Result<()> {
        self.gateway.create_dataset(path, force).await?;
        self.commit_policy(path).await
    }

    /// Write and save the storage policy of an existing dataset.
    pub async fn commit_policy(&self, path: &Path) -> Result<()> {
        if self.gateway.is_dry_run() {
            info!(dataset = %path.display(), "[dry-run] would write storage policy");
            return Ok(());
        }

        let written = self
            .policy
            .apply(path)
            .map_err(|e| crate::error::PipelineError::io("writing .gitattributes", e))?;
        if written {
            self.gateway
                .save(path, "Configure storage policy", false)
                .await?;
        }
        Ok(())
    }

    /// One sub-dataset per subject. Failures skip that subject only.
    pub async fn create_subunits(
        &self,
        top: &Path,
        subjects: &[String],
        reuse_existing: bool,
    ) -> SubUnitReport {
        let mut report = SubUnitReport::default();

        for subject in subjects {
            let path = top.join(subject);
            if reuse_existing && path.join(".datalad").is_dir() {
                info!(subject = %subject, "Sub-dataset already present, reusing");
                report.reused.push(subject.clone());
                continue;
            }

            match self.gateway.create_subdataset(top, &path).await {
                Ok(_) => {
                    if let Err(e) = self.commit_policy(&path).await {
                        warn!(subject = %subject, error = %e, "Storage policy not committed for sub-dataset");
                    }
                    info!(subject = %subject, "Sub-dataset created");
                    report.created.push(subject.clone());
                }
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Skipping subject: sub-dataset creation failed");
                    report.skipped.push((subject.clone(), e.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedRunner;
    use crate::core::retry::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn gateway(runner: &SimulatedRunner, dry_run: bool) -> ToolGateway {
        ToolGateway::new(
            Arc::new(runner.clone()),
            RetryPolicy::new(2, Duration::ZERO),
            dry_run,
        )
    }

    #[test]
    fn policy_orders_catch_all_before_plain_overrides() {
        let text = StoragePolicy::new("1mb").render();
        let catch_all = text.find("* annex.largefiles=(largerthan=1mb)").unwrap();
        let json = text.find("*.json annex.largefiles=nothing").unwrap();
        assert!(catch_all < json);
        assert!(text.contains("README* annex.largefiles=nothing"));
    }

    #[test]
    fn policy_is_applied_once() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".gitattributes"), "* annex.backend=MD5E").unwrap();
        let policy = StoragePolicy::default();

        assert!(policy.apply(temp.path()).unwrap());
        assert!(!policy.apply(temp.path()).unwrap());

        let text = fs::read_to_string(temp.path().join(".gitattributes")).unwrap();
        assert!(text.starts_with("* annex.backend=MD5E\n"));
        assert_eq!(text.matches(POLICY_MARKER).count(), 1);
    }

    #[tokio::test]
    async fn top_dataset_commits_policy_first() {
        let temp = tempdir().unwrap();
        let ds = temp.path().join("study");
        let runner = SimulatedRunner::new();
        let gw = gateway(&runner, false);

        DatasetBuilder::new(&gw, StoragePolicy::default())
            .create_top(&ds, false)
            .await
            .unwrap();

        assert!(ds.join(".datalad").is_dir());
        let commits = fs::read_to_string(ds.join(".git/simulated-commits")).unwrap();
        assert_eq!(commits.lines().next(), Some("Configure storage policy"));
    }

    #[tokio::test]
    async fn failed_subject_is_skipped_not_fatal() {
        let temp = tempdir().unwrap();
        let ds = temp.path().join("study");
        let runner = SimulatedRunner::new();
        let gw = gateway(&runner, false);
        let builder = DatasetBuilder::new(&gw, StoragePolicy::default());
        builder.create_top(&ds, false).await.unwrap();

        runner.fail_matching("study/sub-02");
        let subjects = vec!["sub-01".to_string(), "sub-02".to_string(), "sub-03".to_string()];
        let report = builder.create_subunits(&ds, &subjects, false).await;

        assert_eq!(report.created, vec!["sub-01", "sub-03"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "sub-02");
        assert!(ds.join("sub-03/.gitattributes").exists());
    }

    #[tokio::test]
    async fn existing_subunits_are_reused_on_update() {
        let temp = tempdir().unwrap();
        let ds = temp.path().join("study");
        fs::create_dir_all(ds.join("sub-01/.datalad")).unwrap();
        let runner = SimulatedRunner::new();
        let gw = gateway(&runner, false);

        let report = DatasetBuilder::new(&gw, StoragePolicy::default())
            .create_subunits(&ds, &["sub-01".to_string()], true)
            .await;
        assert_eq!(report.reused, vec!["sub-01"]);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn dry_run_creates_nothing() {
        let temp = tempdir().unwrap();
        let ds = temp.path().join("study");
        let runner = SimulatedRunner::new();
        let gw = gateway(&runner, true);

        let builder = DatasetBuilder::new(&gw, StoragePolicy::default());
        builder.create_top(&ds, false).await.unwrap();
        let report = builder
            .create_subunits(&ds, &["sub-01".to_string()], false)
            .await;

        assert_eq!(report.created, vec!["sub-01"]);
        assert!(!ds.exists());
        assert!(runner.calls().is_empty());
    }
}
