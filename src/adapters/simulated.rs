use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::system::SystemRunner;
use crate::core::command::{CommandOutput, CommandRunner, command_line};

/// Programs answered by the simulator; everything else runs for real.
const EMULATED: &[&str] = &["datalad", "git", "git-annex", "deno", "bids-validator"];

struct FailureRule {
    pattern: String,
    message: String,
    /// Remaining failures, `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct SimulatorState {
    calls: Vec<String>,
    failures: Vec<FailureRule>,
    missing: Vec<String>,
}

/// Emulates datalad, git, git-annex and the BIDS validator on the local
/// filesystem. Datasets are plain directories with `.datalad/` and `.git/`
/// markers; saves are appended to `.git/simulated-commits`.
///
/// Failures can be injected per command-line substring, and every
/// invocation is recorded for inspection.
#[derive(Clone, Default)]
pub struct SimulatedRunner {
    state: Arc<Mutex<SimulatorState>>,
}

impl SimulatedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every invocation whose command line contains `pattern`.
    pub fn fail_matching(&self, pattern: &str) {
        self.fail_with(pattern, "simulated failure", None);
    }

    /// Fail invocations containing `pattern` with `message` on stderr,
    /// `times` times (forever when `None`).
    pub fn fail_with(&self, pattern: &str, message: &str, times: Option<u32>) {
        self.lock().failures.push(FailureRule {
            pattern: pattern.to_string(),
            message: message.to_string(),
            remaining: times,
        });
    }

    /// Pretend `program` is not installed.
    pub fn mark_missing(&self, program: &str) {
        self.lock().missing.push(program.to_string());
    }

    /// Every command line seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn injected_failure(&self, line: &str) -> Option<CommandOutput> {
        let mut state = self.lock();
        let rule = state
            .failures
            .iter_mut()
            .find(|r| line.contains(&r.pattern) && r.remaining != Some(0))?;
        if let Some(left) = rule.remaining.as_mut() {
            *left -= 1;
        }
        Some(CommandOutput::failed(1, format!("{}: {}", rule.message, line)))
    }
}

impl SimulatedRunner {
    /// `save -r` re-enters every installed sub-dataset, so failures injected
    /// for a nested save surface on the recursive call too.
    fn nested_save_failure(&self, args: &[String]) -> Option<CommandOutput> {
        let parsed = parse_datalad(args);
        if parsed.command != "save" || !args.iter().any(|a| a == "-r") {
            return None;
        }
        let dataset = parsed.dataset?;
        let message = parsed.message.unwrap_or_default();

        let mut nested: Vec<PathBuf> = fs::read_dir(&dataset)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join(".datalad").is_dir())
            .collect();
        nested.sort();

        nested.iter().find_map(|sub| {
            let line = command_line(
                "datalad",
                &[
                    "save".to_string(),
                    "-d".to_string(),
                    sub.display().to_string(),
                    "-m".to_string(),
                    message.clone(),
                ],
            );
            self.injected_failure(&line)
        })
    }
}

#[async_trait]
impl CommandRunner for SimulatedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> io::Result<CommandOutput> {
        let line = command_line(program, args);
        debug!(command = %line, "Simulated invocation");

        {
            let mut state = self.lock();
            state.calls.push(line.clone());
            if state.missing.iter().any(|m| m == program) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{program}: not installed (simulated)"),
                ));
            }
        }

        if let Some(failure) = self.injected_failure(&line) {
            return Ok(failure);
        }
        if program == "datalad"
            && let Some(failure) = self.nested_save_failure(args)
        {
            return Ok(failure);
        }

        if !EMULATED.contains(&program) {
            return SystemRunner.run(program, args, cwd).await;
        }

        if args.iter().any(|a| a == "--version") || args.first().map(String::as_str) == Some("version")
        {
            return Ok(CommandOutput::ok(format!("{program} 0.0.0-simulated")));
        }

        let output = match program {
            "datalad" => simulate_datalad(args),
            "git" => simulate_git(args),
            "git-annex" => Ok(CommandOutput::ok("")),
            _ => Ok(CommandOutput::ok(
                "This dataset appears to be BIDS compatible.",
            )),
        };

        output.or_else(|e| Ok(CommandOutput::failed(1, e.to_string())))
    }
}

struct DataladArgs {
    command: String,
    dataset: Option<PathBuf>,
    message: Option<String>,
    force: bool,
    positional: Vec<PathBuf>,
}

fn parse_datalad(args: &[String]) -> DataladArgs {
    let mut parsed = DataladArgs {
        command: args.first().cloned().unwrap_or_default(),
        dataset: None,
        message: None,
        force: false,
        positional: Vec::new(),
    };

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-d" | "--dataset" => parsed.dataset = iter.next().map(PathBuf::from),
            "-m" | "--message" => parsed.message = iter.next().cloned(),
            "--reckless" => {
                iter.next();
            }
            "-f" | "--force" => parsed.force = true,
            flag if flag.starts_with('-') => {}
            path => parsed.positional.push(PathBuf::from(path)),
        }
    }
    parsed
}

fn simulate_datalad(args: &[String]) -> io::Result<CommandOutput> {
    let parsed = parse_datalad(args);

    match parsed.command.as_str() {
        "create" => {
            let target = parsed
                .positional
                .first()
                .cloned()
                .or_else(|| parsed.dataset.clone())
                .ok_or_else(|| io::Error::other("create: no path given"))?;

            if target.join(".datalad").exists() {
                return Ok(CommandOutput::failed(
                    1,
                    format!("create(error): {} (dataset) [already exists]", target.display()),
                ));
            }
            let non_empty = fs::read_dir(&target)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if non_empty && !parsed.force {
                return Ok(CommandOutput::failed(
                    1,
                    "create(error): will not create a dataset in a non-empty directory, use `--force` option to ignore",
                ));
            }

            fs::create_dir_all(target.join(".datalad"))?;
            fs::create_dir_all(target.join(".git"))?;
            fs::write(
                target.join(".datalad/config"),
                format!("[datalad \"dataset\"]\n\tid = {}\n", uuid::Uuid::now_v7()),
            )?;

            if let Some(parent) = parsed.dataset.as_ref().filter(|p| *p != &target) {
                let name = target
                    .strip_prefix(parent)
                    .unwrap_or(&target)
                    .display()
                    .to_string();
                let modules = parent.join(".gitmodules");
                let mut content = fs::read_to_string(&modules).unwrap_or_default();
                content.push_str(&format!("[submodule \"{name}\"]\n\tpath = {name}\n"));
                fs::write(modules, content)?;
            }

            Ok(CommandOutput::ok(format!(
                "create(ok): {} (dataset)",
                target.display()
            )))
        }
        "save" => {
            let dataset = parsed
                .dataset
                .ok_or_else(|| io::Error::other("save: no dataset given"))?;
            if !dataset.join(".git").is_dir() {
                return Ok(CommandOutput::failed(
                    1,
                    format!("No installed dataset found at {}", dataset.display()),
                ));
            }
            let record = dataset.join(".git/simulated-commits");
            let mut log = fs::read_to_string(&record).unwrap_or_default();
            log.push_str(parsed.message.as_deref().unwrap_or("[DATALAD] Recorded changes"));
            log.push('\n');
            fs::write(record, log)?;
            Ok(CommandOutput::ok(format!(
                "save(ok): {} (dataset)",
                dataset.display()
            )))
        }
        "status" => Ok(CommandOutput::ok("nothing to save, working tree clean")),
        "drop" => Ok(CommandOutput::ok("drop(ok)")),
        "remove" => {
            let dataset = parsed
                .dataset
                .or_else(|| parsed.positional.first().cloned())
                .ok_or_else(|| io::Error::other("remove: no dataset given"))?;
            fs::remove_dir_all(&dataset)?;
            Ok(CommandOutput::ok(format!(
                "remove(ok): {} (dataset)",
                dataset.display()
            )))
        }
        other => Ok(CommandOutput::failed(
            1,
            format!("datalad: unknown command '{other}'"),
        )),
    }
}

fn simulate_git(args: &[String]) -> io::Result<CommandOutput> {
    let mut rest = args;
    let mut repo: Option<PathBuf> = None;
    if rest.first().map(String::as_str) == Some("-C") && rest.len() >= 2 {
        repo = Some(PathBuf::from(&rest[1]));
        rest = &rest[2..];
    }

    match rest.first().map(String::as_str) {
        Some("config") => {
            let value = match rest.last().map(String::as_str) {
                Some("user.name") => "Simulated Operator",
                Some("user.email") => "operator@example.org",
                _ => "",
            };
            Ok(CommandOutput::ok(value))
        }
        Some("commit") => {
            let repo = repo.ok_or_else(|| io::Error::other("commit: no repository"))?;
            if !repo.join(".git").is_dir() {
                return Ok(CommandOutput::failed(128, "fatal: not a git repository"));
            }
            let message = rest
                .iter()
                .position(|a| a == "-m")
                .and_then(|i| rest.get(i + 1))
                .cloned()
                .unwrap_or_default();
            let record = repo.join(".git/simulated-commits");
            let mut log = fs::read_to_string(&record).unwrap_or_default();
            log.push_str(&message);
            log.push('\n');
            fs::write(record, log)?;
            Ok(CommandOutput::ok("[main] committed"))
        }
        _ => Ok(CommandOutput::ok("")),
    }
}
