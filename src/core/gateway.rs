//! Resilient access to the dataset-versioning tools (datalad, git, git-annex).
//!
//! Every call goes through [`ToolGateway::invoke`]: output is captured,
//! classified by an [`OutputClassifier`], and fatal results are retried with
//! the configured [`RetryPolicy`]. In dry-run mode nothing is executed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::core::command::{CommandOutput, CommandRunner, command_line};
use crate::core::retry::{RetryError, RetryPolicy, with_retry};
use crate::error::{PipelineError, Result};

/// Classification of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Non-zero exit that is semantically a no-op (e.g. nothing to save).
    BenignFailure(String),
    FatalFailure(String),
}

/// Turns raw tool output into an [`Outcome`].
pub trait OutputClassifier: Send + Sync {
    fn classify(&self, output: &CommandOutput) -> Outcome;
}

/// Regex-based classifier over the combined output.
pub struct PatternClassifier {
    benign: Vec<Regex>,
}

impl PatternClassifier {
    pub fn new(patterns: &[&str]) -> std::result::Result<Self, regex::Error> {
        let benign = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<_, _>>()?;
        Ok(Self { benign })
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(&[
            r"(?i)nothing to save",
            r"(?i)nothing to commit",
            r"(?i)already exists",
        ])
        .expect("static patterns")
    }
}

impl OutputClassifier for PatternClassifier {
    fn classify(&self, output: &CommandOutput) -> Outcome {
        if output.success() {
            return Outcome::Success;
        }

        let text = output.combined();
        if let Some(m) = self.benign.iter().find_map(|re| re.find(&text)) {
            return Outcome::BenignFailure(m.as_str().to_string());
        }

        if text.is_empty() {
            Outcome::FatalFailure(match output.code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            })
        } else {
            Outcome::FatalFailure(text)
        }
    }
}

/// Operations offered by the versioning subsystem.
#[derive(Debug, Clone)]
pub enum ToolOp {
    CreateDataset {
        path: PathBuf,
        force: bool,
    },
    CreateSubDataset {
        parent: PathBuf,
        path: PathBuf,
    },
    Save {
        dataset: PathBuf,
        message: String,
        recursive: bool,
    },
    Drop {
        dataset: PathBuf,
        recursive: bool,
        no_check: bool,
    },
    Remove {
        dataset: PathBuf,
    },
    Status {
        dataset: PathBuf,
    },
    Git {
        repo: PathBuf,
        args: Vec<String>,
    },
}

impl ToolOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateDataset { .. } => "create dataset",
            Self::CreateSubDataset { .. } => "create sub-dataset",
            Self::Save { .. } => "save",
            Self::Drop { .. } => "drop",
            Self::Remove { .. } => "remove",
            Self::Status { .. } => "status",
            Self::Git { .. } => "git",
        }
    }

    /// Dataset the operation acts on.
    pub fn dataset(&self) -> &Path {
        match self {
            Self::CreateDataset { path, .. } | Self::CreateSubDataset { path, .. } => path,
            Self::Save { dataset, .. }
            | Self::Drop { dataset, .. }
            | Self::Remove { dataset }
            | Self::Status { dataset } => dataset,
            Self::Git { repo, .. } => repo,
        }
    }

    fn is_save_class(&self) -> bool {
        match self {
            Self::Save { .. } => true,
            Self::Git { args, .. } => args.first().is_some_and(|a| a == "commit"),
            _ => false,
        }
    }

    pub fn invocation(&self) -> (&'static str, Vec<String>) {
        let path = |p: &Path| p.display().to_string();
        match self {
            Self::CreateDataset { path: p, force } => {
                let mut args = vec!["create".to_string()];
                if *force {
                    args.push("--force".to_string());
                }
                args.push(path(p));
                ("datalad", args)
            }
            Self::CreateSubDataset { parent, path: p } => (
                "datalad",
                vec!["create".into(), "-d".into(), path(parent), path(p)],
            ),
            Self::Save {
                dataset,
                message,
                recursive,
            } => {
                let mut args = vec![
                    "save".to_string(),
                    "-d".to_string(),
                    path(dataset),
                    "-m".to_string(),
                    message.clone(),
                ];
                if *recursive {
                    args.push("-r".to_string());
                }
                ("datalad", args)
            }
            Self::Drop {
                dataset,
                recursive,
                no_check,
            } => {
                let mut args = vec!["drop".to_string(), "-d".to_string(), path(dataset)];
                if *recursive {
                    args.push("-r".to_string());
                }
                if *no_check {
                    args.push("--reckless".to_string());
                    args.push("kill".to_string());
                }
                ("datalad", args)
            }
            Self::Remove { dataset } => (
                "datalad",
                vec![
                    "remove".into(),
                    "-d".into(),
                    path(dataset),
                    "-r".into(),
                    "--reckless".into(),
                    "kill".into(),
                ],
            ),
            Self::Status { dataset } => ("datalad", vec!["status".into(), "-d".into(), path(dataset)]),
            Self::Git { repo, args } => {
                let mut full = vec!["-C".to_string(), path(repo)];
                full.extend(args.iter().cloned());
                ("git", full)
            }
        }
    }
}

impl fmt::Display for ToolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (program, args) = self.invocation();
        f.write_str(&command_line(program, &args))
    }
}

/// Result of a gateway call.
#[derive(Debug, Clone)]
pub struct ToolReport {
    pub outcome: Outcome,
    pub output: CommandOutput,
    pub attempts: u32,
    /// True when the call was intercepted by dry-run.
    pub skipped: bool,
}

/// One line of `datalad status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub state: String,
    pub path: String,
}

/// Which rung of the sub-dataset save ladder succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStrategy {
    Direct,
    AfterCleanup,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderOutcome {
    Saved(SaveStrategy),
    /// All strategies failed; `fix_command` repairs the metadata by hand.
    Failed { fix_command: String, detail: String },
}

#[derive(Debug)]
enum InvokeError {
    Spawn(std::io::Error),
    Failed(String),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "could not start process: {e}"),
            Self::Failed(detail) => f.write_str(detail),
        }
    }
}

pub struct ToolGateway {
    runner: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
    classifier: Arc<dyn OutputClassifier>,
    dry_run: bool,
}

impl ToolGateway {
    pub fn new(runner: Arc<dyn CommandRunner>, policy: RetryPolicy, dry_run: bool) -> Self {
        Self {
            runner,
            policy,
            classifier: Arc::new(PatternClassifier::default()),
            dry_run,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn OutputClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Execute `op` with classification and retries.
    pub async fn invoke(&self, op: &ToolOp) -> Result<ToolReport> {
        if self.dry_run {
            info!(command = %op, "[dry-run] would run");
            return Ok(ToolReport {
                outcome: Outcome::Success,
                output: CommandOutput::ok(""),
                attempts: 0,
                skipped: true,
            });
        }

        let (program, args) = op.invocation();
        let line = command_line(program, &args);
        debug!(command = %line, "Invoking tool");

        let result = with_retry(
            &self.policy,
            op.name(),
            |attempt| {
                let args = &args;
                let line = &line;
                async move {
                    if attempt > 1 && op.is_save_class() {
                        self.resync(op.dataset()).await;
                    }

                    let output = self
                        .runner
                        .run(program, args, None)
                        .await
                        .map_err(InvokeError::Spawn)?;

                    match self.classifier.classify(&output) {
                        Outcome::Success => Ok(ToolReport {
                            outcome: Outcome::Success,
                            output,
                            attempts: attempt,
                            skipped: false,
                        }),
                        Outcome::BenignFailure(reason) => {
                            debug!(command = %line, reason = %reason, "Benign failure treated as success");
                            Ok(ToolReport {
                                outcome: Outcome::BenignFailure(reason),
                                output,
                                attempts: attempt,
                                skipped: false,
                            })
                        }
                        Outcome::FatalFailure(detail) => Err(InvokeError::Failed(detail)),
                    }
                }
            },
            |e| matches!(e, InvokeError::Failed(_)),
        )
        .await;

        result.map_err(|RetryError { attempts, last }| PipelineError::Tool {
            operation: format!("{} ({line})", op.name()),
            attempts,
            detail: last.to_string(),
        })
    }

    /// Best-effort cleanup of dangling index state before a save is retried.
    pub async fn resync(&self, dataset: &Path) {
        if self.dry_run {
            return;
        }

        let lock = dataset.join(".git/index.lock");
        if lock.exists() {
            match std::fs::remove_file(&lock) {
                Ok(()) => info!(path = %lock.display(), "Removed stale git index lock"),
                Err(e) => debug!(path = %lock.display(), error = %e, "Could not remove index lock"),
            }
        }

        let args = vec![
            "-C".to_string(),
            dataset.display().to_string(),
            "reset".to_string(),
            "--quiet".to_string(),
        ];
        match self.runner.run("git", &args, None).await {
            Ok(out) if out.success() => debug!(dataset = %dataset.display(), "Index resynchronised"),
            Ok(out) => debug!(dataset = %dataset.display(), output = %out.combined(), "git reset failed"),
            Err(e) => debug!(dataset = %dataset.display(), error = %e, "git reset could not start"),
        }
    }

    pub async fn create_dataset(&self, path: &Path, force: bool) -> Result<ToolReport> {
        self.invoke(&ToolOp::CreateDataset {
            path: path.to_path_buf(),
            force,
        })
        .await
    }

    pub async fn create_subdataset(&self, parent: &Path, path: &Path) -> Result<ToolReport> {
        self.invoke(&ToolOp::CreateSubDataset {
            parent: parent.to_path_buf(),
            path: path.to_path_buf(),
        })
        .await
    }

    pub async fn save(&self, dataset: &Path, message: &str, recursive: bool) -> Result<ToolReport> {
        self.invoke(&ToolOp::Save {
            dataset: dataset.to_path_buf(),
            message: message.to_string(),
            recursive,
        })
        .await
    }

    pub async fn drop_content(
        &self,
        dataset: &Path,
        recursive: bool,
        no_check: bool,
    ) -> Result<ToolReport> {
        self.invoke(&ToolOp::Drop {
            dataset: dataset.to_path_buf(),
            recursive,
            no_check,
        })
        .await
    }

    pub async fn remove(&self, dataset: &Path) -> Result<ToolReport> {
        self.invoke(&ToolOp::Remove {
            dataset: dataset.to_path_buf(),
        })
        .await
    }

    pub async fn git(&self, repo: &Path, args: &[&str]) -> Result<ToolReport> {
        self.invoke(&ToolOp::Git {
            repo: repo.to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
        .await
    }

    /// Entries of `datalad status` that are not clean.
    pub async fn status(&self, dataset: &Path) -> Result<Vec<StatusEntry>> {
        let report = self
            .invoke(&ToolOp::Status {
                dataset: dataset.to_path_buf(),
            })
            .await?;
        Ok(parse_status(&report.output.stdout))
    }

    /// Save one sub-dataset, escalating through direct retry, a cleanup
    /// pass, and a manual git-level commit. Never returns an error: the
    /// caller downgrades [`LadderOutcome::Failed`] to a warning.
    pub async fn save_subdataset(&self, subdataset: &Path, message: &str) -> LadderOutcome {
        let first = match self.save(subdataset, message, false).await {
            Ok(_) => return LadderOutcome::Saved(SaveStrategy::Direct),
            Err(e) => e,
        };
        warn!(
            dataset = %subdataset.display(),
            error = %first,
            "Direct save failed, retrying after cleanup"
        );

        self.resync(subdataset).await;
        if self.save(subdataset, message, false).await.is_ok() {
            return LadderOutcome::Saved(SaveStrategy::AfterCleanup);
        }

        warn!(
            dataset = %subdataset.display(),
            "Save after cleanup failed, falling back to manual commit"
        );
        match self.manual_commit(subdataset, message).await {
            Ok(()) => LadderOutcome::Saved(SaveStrategy::Manual),
            Err(e) => LadderOutcome::Failed {
                fix_command: command_line(
                    "datalad",
                    &[
                        "save".to_string(),
                        "-d".to_string(),
                        subdataset.display().to_string(),
                        "-m".to_string(),
                        message.to_string(),
                    ],
                ),
                detail: e.to_string(),
            },
        }
    }

    async fn manual_commit(&self, repo: &Path, message: &str) -> Result<()> {
        self.git(repo, &["annex", "add", "."]).await?;
        self.git(repo, &["add", "-A"]).await?;
        self.git(repo, &["commit", "-m", message]).await?;
        Ok(())
    }
}

fn parse_status(stdout: &str) -> Vec<StatusEntry> {
    let line_re = Regex::new(r"^\s*(added|modified|deleted|untracked|unknown|type_changed):\s+(.+?)(?:\s+\(\w+\))?\s*$")
        .expect("static regex");

    stdout
        .lines()
        .filter_map(|line| {
            line_re.captures(line).map(|caps| StatusEntry {
                state: caps[1].to_string(),
                path: caps[2].to_string(),
            })
        })
        .collect()
}
