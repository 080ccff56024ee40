use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Buffer size for streaming file reads (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Digest algorithm selected in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    /// In-process BLAKE3
    #[default]
    Blake3,
    /// SHA-256 through the host's digest tool
    Sha256,
}

/// Lowercase hex content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two interchangeable SHA-256 command forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestTool {
    /// GNU coreutils `sha256sum`
    Sha256sum,
    /// Perl `shasum -a 256` (macOS)
    Shasum,
}

impl DigestTool {
    /// Pick whichever form is installed.
    pub fn detect() -> Result<Self> {
        let probe = |program: &str, args: &[&str]| {
            Command::new(program)
                .args(args)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        };

        if probe("sha256sum", &["--version"]) {
            Ok(Self::Sha256sum)
        } else if probe("shasum", &["--version"]) {
            Ok(Self::Shasum)
        } else {
            Err(PipelineError::MissingDependencies(vec![
                "sha256sum or shasum (digest tool)".to_string(),
            ]))
        }
    }

    fn hash(&self, path: &Path) -> io::Result<Digest> {
        let output = match self {
            Self::Sha256sum => Command::new("sha256sum").arg(path).output()?,
            Self::Shasum => Command::new("shasum").args(["-a", "256"]).arg(path).output()?,
        };

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "digest tool failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .next()
            .map(Digest::from_hex)
            .ok_or_else(|| io::Error::other("digest tool produced no output"))
    }
}

#[derive(Debug, Clone, Copy)]
enum HashMethod {
    Blake3,
    External(DigestTool),
}

/// Computes and compares content digests.
#[derive(Debug, Clone, Copy)]
pub struct HashVerifier {
    method: HashMethod,
}

impl Default for HashVerifier {
    fn default() -> Self {
        Self {
            method: HashMethod::Blake3,
        }
    }
}

impl HashVerifier {
    pub fn new(kind: DigestKind) -> Result<Self> {
        let method = match kind {
            DigestKind::Blake3 => HashMethod::Blake3,
            DigestKind::Sha256 => HashMethod::External(DigestTool::detect()?),
        };
        Ok(Self { method })
    }

    pub fn label(&self) -> &'static str {
        match self.method {
            HashMethod::Blake3 => "blake3",
            HashMethod::External(DigestTool::Sha256sum) => "sha256 (sha256sum)",
            HashMethod::External(DigestTool::Shasum) => "sha256 (shasum)",
        }
    }

    /// Digest of one file. Blocking.
    pub fn digest(&self, path: &Path) -> io::Result<Digest> {
        match self.method {
            HashMethod::Blake3 => blake3_file(path).map(|h| Digest::from_hex(h.to_hex().as_str())),
            HashMethod::External(tool) => tool.hash(path),
        }
    }

    /// Whether two files have identical content. Blocking.
    pub fn same_content(&self, a: &Path, b: &Path) -> io::Result<bool> {
        Ok(self.digest(a)? == self.digest(b)?)
    }
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files
pub fn blake3_file(path: &Path) -> io::Result<blake3::Hash> {
    let file = File::open(path).map_err(|e| {
        io::Error::new(e.kind(), format!("failed to open {}: {}", path.display(), e))
    })?;

    let mut reader = io::BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Fan `job` out over `items` on at most `workers` blocking threads.
///
/// Workers pull the next index from a shared cursor; results are appended to
/// a channel as they complete, so the returned order is unspecified.
pub async fn run_pool<T, R, F>(items: Vec<T>, workers: usize, job: F) -> Vec<R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&T) -> R + Send + Sync + 'static,
{
    let total = items.len();
    let items = Arc::new(items);
    let job = Arc::new(job);
    let cursor = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let workers = workers.clamp(1, total.max(1));
    debug!(workers, total, "Starting worker pool");

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let items = Arc::clone(&items);
        let job = Arc::clone(&job);
        let cursor = Arc::clone(&cursor);
        let tx = tx.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(item) = items.get(index) else {
                    break;
                };
                if tx.send(job(item)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Hash worker panicked");
        }
    }

    rx.into_iter().collect()
}
