use std::io;
use std::path::Path;

use async_trait::async_trait;

/// Captured result of one external command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, the way an operator would have seen them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Executes external programs (datalad, git, validators, rsync probes).
///
/// Implementations live in `crate::adapters`: the real process runner and a
/// simulated one that emulates the tools on the local filesystem.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally inside `cwd`, and capture its output.
    ///
    /// An `Err` means the program could not be started at all (for example
    /// it is not installed); a non-zero exit is reported through
    /// [`CommandOutput::code`].
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>)
    -> io::Result<CommandOutput>;
}

/// Shell-like rendering of an invocation for logs and remediation hints.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
            line.push('"');
            line.push_str(&arg.replace('"', "\\\""));
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Convenience to build owned argument vectors from literals.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_joins_both_streams() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "partial\n".to_string(),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(output.combined(), "partial\nboom");
        assert!(!output.success());
    }

    #[test]
    fn command_line_quotes_messages() {
        let line = command_line("datalad", &args(["save", "-m", "Add sub-01 data"]));
        assert_eq!(line, "datalad save -m \"Add sub-01 data\"");
    }
}
