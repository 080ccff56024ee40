use crate::core::transfer_engine::{
    IntegrityMode, TransferEngine, TransferRequest, TransferResult, TransferStatus,
};
use crate::error::{PipelineError, Result};
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Instant;
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, info};

// "  12,345,678   45%  10.2MB/s ..."
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+)\s+(\d+)%").expect("valid progress regex"));
static REGULAR_FILES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Number of files: [\d,]+ \(reg: ([\d,]+)").expect("valid stats regex")
});
static TRANSFERRED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Number of regular files transferred: ([\d,]+)").expect("valid stats regex")
});
static TRANSFERRED_BYTES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Total transferred file size: ([\d,]+)").expect("valid stats regex")
});

pub struct RsyncEngine;

/// Argument vector for one rsync invocation.
pub fn rsync_args(req: &TransferRequest) -> Vec<String> {
    let mut args = vec![
        "-a".to_string(),
        "--info=progress2".to_string(),
        "--no-inc-recursive".to_string(),
        "--stats".to_string(),
        // Links leaving the source tree would dangle in the dataset
        "--copy-unsafe-links".to_string(),
    ];
    if req.mode == IntegrityMode::Standard {
        args.push("--checksum".to_string());
    }
    for pattern in req.exclusions.patterns() {
        args.push(format!("--exclude={pattern}"));
    }
    // trailing slash to copy contents
    args.push(format!("{}/", req.source.to_string_lossy()));
    args.push(req.destination.to_string_lossy().into_owned());
    args
}

fn parse_count(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text)?
        .get(1)?
        .as_str()
        .replace(',', "")
        .parse()
        .ok()
}

impl TransferEngine for RsyncEngine {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn transfer(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult>> + Send>> {
        let req = req.clone();
        Box::pin(async move {
            let _ = tx.send(TransferStatus::Ready).await;

            if let Err(e) = std::fs::create_dir_all(&req.destination) {
                let msg = format!("Failed to create destination directory: {}", e);
                let _ = tx.send(TransferStatus::Failed(msg.clone())).await;
                return Err(PipelineError::Transfer(msg));
            }

            let args = rsync_args(&req);
            info!(
                source = %req.source.display(),
                destination = %req.destination.display(),
                mode = req.mode.describe(),
                "Transferring with rsync"
            );
            debug!(args = ?args, "rsync invocation");

            let started = Instant::now();
            let mut child_process = Command::new("rsync")
                .args(&args)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| PipelineError::Transfer(format!("Failed to spawn rsync process: {}", e)))?;

            let stdout = child_process
                .stdout
                .take()
                .ok_or_else(|| PipelineError::Transfer("Failed to get stdout".to_string()))?;
            let mut stderr = child_process
                .stderr
                .take()
                .ok_or_else(|| PipelineError::Transfer("Failed to get stderr".to_string()))?;
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            let mut reader = BufReader::new(stdout);
            let mut transcript = String::new();
            let mut line_buffer = Vec::new();
            let mut byte_buffer = [0u8; 1];

            while let Ok(n) = reader.read(&mut byte_buffer).await {
                if n == 0 {
                    break;
                }

                let b = byte_buffer[0];

                if b == b'\r' || b == b'\n' {
                    if line_buffer.is_empty() {
                        continue;
                    }

                    let line = String::from_utf8_lossy(&line_buffer);

                    if let Some(capts) = PROGRESS_RE.captures(&line) {
                        let bytes_copied = capts
                            .get(1)
                            .map(|m| m.as_str().replace(',', ""))
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0);
                        let percentage = capts
                            .get(2)
                            .and_then(|m| m.as_str().parse().ok())
                            .unwrap_or(0);

                        let _ = tx
                            .send(TransferStatus::InProgress {
                                total_bytes: 0,
                                bytes_copied,
                                current_file: String::new(),
                                percentage,
                            })
                            .await;
                    } else {
                        transcript.push_str(&line);
                        transcript.push('\n');
                    }

                    line_buffer.clear();
                } else {
                    line_buffer.push(b);
                }
            }

            let status = child_process
                .wait()
                .await
                .map_err(|e| PipelineError::Transfer(format!("Failed to wait for rsync: {}", e)))?;
            let stderr_text = stderr_task.await.unwrap_or_default();

            if status.success() {
                let _ = tx.send(TransferStatus::Complete).await;
                let regular = parse_count(&REGULAR_FILES_RE, &transcript).unwrap_or(0);
                let copied = parse_count(&TRANSFERRED_RE, &transcript).unwrap_or(0);
                Ok(TransferResult {
                    files_copied: copied,
                    files_unchanged: regular.saturating_sub(copied),
                    total_bytes: parse_count(&TRANSFERRED_BYTES_RE, &transcript).unwrap_or(0),
                    duration_secs: started.elapsed().as_secs(),
                    file_hashes: None,
                })
            } else {
                let msg = format!("rsync failed with status {}: {}", status, stderr_text.trim());
                let _ = tx.send(TransferStatus::Failed(msg.clone())).await;
                Err(PipelineError::Transfer(msg))
            }
        })
    }
}
