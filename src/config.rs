use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::hashing::DigestKind;
use crate::core::transfer_engine::TransferEngineType;
use crate::error::{PipelineError, Result};

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "bids2datalad.toml";

const ENV_PREFIX: &str = "BIDS2DATALAD_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub skip_validation: bool,
    pub dry_run: bool,
    pub backup: bool,
    pub parallel_hash: bool,
    pub force_empty: bool,
    pub fast_track: bool,
    pub non_interactive: bool,
    /// Reuse an existing dataset at the destination instead of refusing it.
    pub update: bool,
    pub no_gzheader_check: bool,
    /// Write a JSON integrity report to this path after the audit.
    pub report: Option<PathBuf>,

    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub lock_path: PathBuf,
    pub low_space_threshold_gb: u64,
    /// git-annex size expression, e.g. `1mb`.
    pub large_file_threshold: String,
    pub hash_workers: usize,
    pub transfer_engine: TransferEngineType,
    pub digest: DigestKind,
    pub validator_command: Vec<String>,
    /// Where the run log goes when no dataset is left to hold it.
    pub log_dir: Option<PathBuf>,

    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            skip_validation: false,
            dry_run: false,
            backup: false,
            parallel_hash: false,
            force_empty: false,
            fast_track: false,
            non_interactive: false,
            update: false,
            no_gzheader_check: false,
            report: None,
            retry_attempts: 3,
            retry_backoff_ms: 2000,
            lock_path: std::env::temp_dir().join("bids2datalad.lock"),
            low_space_threshold_gb: 5,
            large_file_threshold: "1mb".to_string(),
            hash_workers: 4,
            transfer_engine: TransferEngineType::Rsync,
            digest: DigestKind::Blake3,
            validator_command: vec![
                "deno".to_string(),
                "run".to_string(),
                "-A".to_string(),
                "jsr:@bids/validator".to_string(),
            ],
            log_dir: None,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `BIDS2DATALAD_*` environment variables
    /// and finally the command line arguments.
    pub fn new<T: Serialize>(config_file: Option<&Path>, args: Option<&T>) -> Result<Self> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(args) = args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment
            .extract()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(PipelineError::Config(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.hash_workers == 0 {
            return Err(PipelineError::Config(
                "hash_workers must be at least 1".to_string(),
            ));
        }
        let size = Regex::new(r"^\d+(kb|mb|gb|KB|MB|GB|b)$").expect("static regex");
        if !size.is_match(&self.large_file_threshold) {
            return Err(PipelineError::Config(format!(
                "large_file_threshold '{}' is not a size like 1mb",
                self.large_file_threshold
            )));
        }
        if self.validator_command.is_empty() && !self.skip_validation {
            return Err(PipelineError::Config(
                "validator_command is empty; set it or use --skip-validation".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration for the initialization checkpoint.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_else(|e| format!("# unrenderable config: {e}\n"))
    }
}
