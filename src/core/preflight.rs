//! Read-only checks run before anything is written.

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, access};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::command::{CommandRunner, args};
use crate::core::hashing::HashVerifier;
use crate::core::transfer_engine::{TransferEngineType, human_bytes};
use crate::error::{PipelineError, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Required headroom on top of the source size.
pub const SPACE_FACTOR: f64 = 1.1;
const LOW_MEMORY: u64 = 2 * GIB;

/// Free bytes on the filesystem holding `path`, or its nearest existing ancestor.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let existing = nearest_existing(path)?;
    let stat = statvfs(&existing).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

fn nearest_existing(path: &Path) -> io::Result<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))
}

#[derive(Debug)]
pub struct PreflightReport {
    pub verifier: HashVerifier,
    pub free_bytes: u64,
    pub git_identity: (String, String),
    pub warnings: Vec<String>,
}

pub struct Preflight<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a AppConfig,
}

impl<'a> Preflight<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a AppConfig) -> Self {
        Self { runner, config }
    }

    /// Programs the run needs, with the argument that proves each is usable.
    fn required_programs(&self) -> Vec<(String, Vec<String>)> {
        let mut programs = vec![
            ("datalad".to_string(), args(["--version"])),
            ("git".to_string(), args(["--version"])),
            ("git-annex".to_string(), args(["version"])),
        ];
        if self.config.transfer_engine == TransferEngineType::Rsync {
            programs.push(("rsync".to_string(), args(["--version"])));
        }
        if !self.config.skip_validation
            && let Some(program) = self.config.validator_command.first()
        {
            programs.push((program.clone(), args(["--version"])));
        }
        programs
    }

    /// Every missing dependency is reported in one error.
    pub async fn check_dependencies(&self) -> Result<HashVerifier> {
        let mut missing = Vec::new();
        for (program, probe) in self.required_programs() {
            match self.runner.run(&program, &probe, None).await {
                Ok(out) if out.success() => debug!(program = %program, "Dependency found"),
                Ok(out) => {
                    debug!(program = %program, output = %out.combined(), "Version probe failed");
                    missing.push(program);
                }
                Err(_) => missing.push(program),
            }
        }

        let verifier = match HashVerifier::new(self.config.digest) {
            Ok(v) => Some(v),
            Err(PipelineError::MissingDependencies(tools)) => {
                missing.extend(tools);
                None
            }
            Err(e) => return Err(e),
        };

        match verifier {
            Some(v) if missing.is_empty() => Ok(v),
            _ => Err(PipelineError::MissingDependencies(missing)),
        }
    }

    pub async fn check_git_identity(&self) -> Result<(String, String)> {
        let mut values = Vec::with_capacity(2);
        for key in ["user.name", "user.email"] {
            let value = match self.runner.run("git", &args(["config", key]), None).await {
                Ok(out) if out.success() => out.stdout.trim().to_string(),
                _ => String::new(),
            };
            if value.is_empty() {
                return Err(PipelineError::Preflight(format!(
                    "git identity is not configured ({key} unset). Run: git config --global {key} \"...\""
                )));
            }
            values.push(value);
        }
        let email = values.pop().unwrap_or_default();
        let name = values.pop().unwrap_or_default();
        Ok((name, email))
    }

    pub fn check_permissions(&self, source: &Path, destination: &Path) -> Result<()> {
        std::fs::read_dir(source).map_err(|e| {
            PipelineError::Preflight(format!("source {} is not readable: {e}", source.display()))
        })?;

        let target = nearest_existing(destination).map_err(|e| PipelineError::io("destination", e))?;
        access(&target, AccessFlags::W_OK).map_err(|e| {
            PipelineError::Preflight(format!(
                "destination {} is not writable ({})",
                target.display(),
                e.desc()
            ))
        })?;
        Ok(())
    }

    pub fn check_space(&self, destination: &Path, source_bytes: u64) -> Result<u64> {
        let free = available_space(destination)
            .map_err(|e| PipelineError::io("checking free space", e))?;
        let required = (source_bytes as f64 * SPACE_FACTOR).ceil() as u64;
        info!(
            free = %human_bytes(free),
            required = %human_bytes(required),
            "Disk space check"
        );
        if free < required {
            return Err(PipelineError::Resource(format!(
                "{} free at {}, need {} (source size x {SPACE_FACTOR})",
                human_bytes(free),
                destination.display(),
                human_bytes(required)
            )));
        }
        Ok(free)
    }

    /// Advisory memory and load warnings. Never fails.
    pub fn check_system_load(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(available) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| mem_available(&text))
            && available < LOW_MEMORY
        {
            warnings.push(format!("low available memory: {}", human_bytes(available)));
        }

        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        if let Some(load) = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|text| text.split_whitespace().next()?.parse::<f64>().ok())
            && load > cpus as f64
        {
            warnings.push(format!("high system load: {load:.2} on {cpus} CPU(s)"));
        }

        for w in &warnings {
            warn!("{w}");
        }
        warnings
    }

    pub async fn run(
        &self,
        source: &Path,
        destination: &Path,
        source_bytes: u64,
    ) -> Result<PreflightReport> {
        let verifier = self.check_dependencies().await?;
        info!(digest = verifier.label(), "Dependencies present");

        let git_identity = self.check_git_identity().await?;
        debug!(name = %git_identity.0, email = %git_identity.1, "git identity");

        self.check_permissions(source, destination)?;
        let free_bytes = self.check_space(destination, source_bytes)?;
        let warnings = self.check_system_load();

        Ok(PreflightReport {
            verifier,
            free_bytes,
            git_identity,
            warnings,
        })
    }
}

fn mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedRunner;
    use tempfile::tempdir;

    fn config() -> AppConfig {
        AppConfig {
            transfer_engine: TransferEngineType::Native,
            ..AppConfig::default()
        }
    }

    #[test]
    fn free_space_resolves_missing_paths_through_ancestors() {
        let temp = tempdir().unwrap();
        let free = available_space(&temp.path().join("not/yet/created")).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn parses_mem_available() {
        let meminfo = "MemTotal:       16000000 kB\nMemAvailable:    1048576 kB\n";
        assert_eq!(mem_available(meminfo), Some(1024 * 1024 * 1024));
        assert_eq!(mem_available("MemTotal: 1 kB\n"), None);
    }

    #[tokio::test]
    async fn missing_dependencies_are_reported_together() {
        let runner = SimulatedRunner::new();
        runner.mark_missing("datalad");
        runner.mark_missing("git-annex");
        let config = config();

        let err = Preflight::new(&runner, &config)
            .check_dependencies()
            .await
            .unwrap_err();

        match err {
            PipelineError::MissingDependencies(list) => {
                assert_eq!(list, vec!["datalad".to_string(), "git-annex".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn git_identity_is_read_from_config() {
        let runner = SimulatedRunner::new();
        let config = config();
        let (name, email) = Preflight::new(&runner, &config)
            .check_git_identity()
            .await
            .unwrap();
        assert_eq!(name, "Simulated Operator");
        assert_eq!(email, "operator@example.org");
    }

    #[tokio::test]
    async fn unset_git_identity_fails() {
        let runner = SimulatedRunner::new();
        runner.fail_matching("git config user.email");
        let config = config();
        let err = Preflight::new(&runner, &config)
            .check_git_identity()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user.email"));
    }

    #[test]
    fn insufficient_space_is_fatal() {
        let temp = tempdir().unwrap();
        let runner = SimulatedRunner::new();
        let config = config();
        let err = Preflight::new(&runner, &config)
            .check_space(temp.path(), u64::MAX / 2)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Resource(_)));
    }

    #[test]
    fn unreadable_source_fails() {
        let temp = tempdir().unwrap();
        let runner = SimulatedRunner::new();
        let config = config();
        let err = Preflight::new(&runner, &config)
            .check_permissions(&temp.path().join("absent"), temp.path())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Preflight(_)));
    }
}
