use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::core::command::{CommandOutput, CommandRunner, command_line};

/// Runs real processes through `tokio::process`.
///
/// Children are killed when the awaiting future is dropped, so an
/// interrupted run does not leave datalad or git processes behind.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> io::Result<CommandOutput> {
        debug!(command = %command_line(program, args), "Spawning process");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::args;

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let output = SystemRunner
            .run("sh", &args(["-c", "echo out; echo err >&2; exit 3"]), None)
            .await
            .unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let result = SystemRunner
            .run("definitely-not-a-real-tool-xyz", &[], None)
            .await;
        assert!(result.is_err());
    }
}
