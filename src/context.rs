use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local, Utc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::command::CommandRunner;
use crate::core::decide::Decider;
use crate::core::gateway::ToolGateway;
use crate::core::models::{Checkpoint, DestinationOrigin, PipelineState};
use crate::core::retry::RetryPolicy;
use crate::error::{IoContext, Result};
use crate::logging::{LogSink, Status, print_status};

/// Mutable progress of one conversion run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: PipelineState,
    pub checkpoints: Vec<Checkpoint>,
    pub dataset: Option<PathBuf>,
    pub origin: Option<DestinationOrigin>,
    pub files_copied: u64,
    pub bytes_copied: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: PipelineState::Locking,
            checkpoints: Vec::new(),
            dataset: None,
            origin: None,
            files_copied: 0,
            bytes_copied: 0,
        }
    }
}

/// Everything a component needs from the current run.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<AppConfig>,
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub log: LogSink,
    pub runner: Arc<dyn CommandRunner>,
    pub decider: Arc<dyn Decider>,
    state: Arc<Mutex<RunState>>,
}

impl RunContext {
    pub fn new(
        config: AppConfig,
        runner: Arc<dyn CommandRunner>,
        decider: Arc<dyn Decider>,
        log: LogSink,
    ) -> Self {
        Self {
            config: Arc::new(config),
            run_id: Uuid::now_v7(),
            started_at: Local::now(),
            log,
            runner,
            decider,
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    pub fn gateway(&self) -> ToolGateway {
        ToolGateway::new(
            Arc::clone(&self.runner),
            RetryPolicy::from_config(&self.config),
            self.config.dry_run,
        )
    }

    /// `YYYYmmdd_HHMMSS` of the run start, used in file names.
    pub fn timestamp(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn log_file_name(&self) -> String {
        format!("conversion_{}.log", self.timestamp())
    }

    /// Where the log goes when no dataset is left to hold it.
    pub fn fallback_log_path(&self) -> PathBuf {
        self.config
            .log_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(self.log_file_name())
    }

    pub fn report(&self, kind: Status, message: impl AsRef<str>) {
        print_status(kind, message.as_ref());
    }

    pub fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> RunState {
        self.state().clone()
    }

    pub fn set_phase(&self, phase: PipelineState) {
        self.state().phase = phase;
    }

    /// Record a named checkpoint and write it to `dir`.
    pub fn checkpoint(&self, name: &str, dir: &Path) -> Result<()> {
        let checkpoint = {
            let mut state = self.state();
            let checkpoint = Checkpoint {
                name: name.to_string(),
                state: state.phase,
                reached_at: Utc::now(),
            };
            state.checkpoints.push(checkpoint.clone());
            checkpoint
        };

        let body = serde_json::to_string_pretty(&checkpoint).unwrap_or_default();
        std::fs::write(dir.join(format!("checkpoint_{name}.json")), body)
            .io_context(|| format!("writing checkpoint {name}"))?;
        tracing::debug!(checkpoint = name, "Checkpoint written");
        Ok(())
    }

    /// Lines telling the operator what an interrupted run left behind.
    pub fn breadcrumbs(&self) -> Vec<String> {
        let state = self.snapshot();
        let mut lines = vec![format!("Interrupted during {}", state.phase)];
        if let Some(last) = state.checkpoints.last() {
            lines.push(format!("Last checkpoint: {} at {}", last.name, last.reached_at));
        }
        match (&state.dataset, state.origin) {
            (Some(dataset), Some(origin)) if dataset.exists() && !self.config.dry_run => {
                lines.push(format!("Partial dataset at {}", dataset.display()));
                if origin.rollback_allowed() {
                    lines.push(format!(
                        "Remove it with: bids2datalad cleanup {}",
                        dataset.display()
                    ));
                } else {
                    lines.push("Existing dataset was reused; rerun with --update to finish".to_string());
                }
            }
            _ => lines.push("No destination was modified".to_string()),
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedRunner;
    use crate::core::decide::FixedDecider;
    use tempfile::tempdir;

    fn context(config: AppConfig) -> RunContext {
        RunContext::new(
            config,
            Arc::new(SimulatedRunner::new()),
            Arc::new(FixedDecider::fail_closed()),
            LogSink::buffered(),
        )
    }

    #[test]
    fn checkpoints_are_recorded_and_written() {
        let temp = tempdir().unwrap();
        let ctx = context(AppConfig::default());
        ctx.set_phase(PipelineState::FileCopy);

        ctx.checkpoint("post-copy", temp.path()).unwrap();

        let state = ctx.snapshot();
        assert_eq!(state.checkpoints.len(), 1);
        assert_eq!(state.checkpoints[0].state, PipelineState::FileCopy);
        let written = std::fs::read_to_string(temp.path().join("checkpoint_post-copy.json")).unwrap();
        assert!(written.contains("FileCopy"));
    }

    #[test]
    fn breadcrumbs_name_cleanup_command() {
        let temp = tempdir().unwrap();
        let ctx = context(AppConfig::default());
        {
            let mut state = ctx.state();
            state.phase = PipelineState::FileCopy;
            state.dataset = Some(temp.path().to_path_buf());
            state.origin = Some(DestinationOrigin::Created);
        }

        let lines = ctx.breadcrumbs();
        assert!(lines[0].contains("file copy"));
        assert!(lines.iter().any(|l| l.contains("bids2datalad cleanup")));
    }

    #[test]
    fn fallback_log_honours_log_dir() {
        let temp = tempdir().unwrap();
        let ctx = context(AppConfig {
            log_dir: Some(temp.path().to_path_buf()),
            ..AppConfig::default()
        });
        let path = ctx.fallback_log_path();
        assert!(path.starts_with(temp.path()));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("conversion_"));
    }
}
