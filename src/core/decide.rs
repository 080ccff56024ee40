use std::fmt;
use std::io::{self, BufRead, Write};

use crossterm::style::Stylize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Abort,
    BackupThenContinue,
    ContinueUnsafely,
    Yes,
    No,
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::BackupThenContinue => "back up, then continue",
            Self::ContinueUnsafely => "continue without backup (unsafe)",
            Self::Yes => "yes",
            Self::No => "no",
        })
    }
}

/// One operator decision point.
#[derive(Debug, Clone)]
pub struct Question {
    pub prompt: String,
    pub options: Vec<Choice>,
    /// Answer used whenever nobody can be asked.
    pub fail_closed: Choice,
}

impl Question {
    pub fn confirm(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: vec![Choice::Yes, Choice::No],
            fail_closed: Choice::No,
        }
    }

    pub fn existing_dataset(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: vec![
                Choice::Abort,
                Choice::BackupThenContinue,
                Choice::ContinueUnsafely,
            ],
            fail_closed: Choice::Abort,
        }
    }

    /// Map operator input (option number or leading word) to a choice.
    pub fn parse_answer(&self, input: &str) -> Option<Choice> {
        let input = input.trim().to_lowercase();
        if input.is_empty() {
            return None;
        }
        if let Ok(n) = input.parse::<usize>() {
            return self.options.get(n.checked_sub(1)?).copied();
        }
        self.options.iter().copied().find(|choice| {
            let label = choice.to_string();
            label.starts_with(&input) || input.starts_with(label.split_whitespace().next().unwrap_or(""))
        })
    }
}

/// Source of operator decisions.
pub trait Decider: Send + Sync {
    fn decide(&self, question: &Question) -> Choice;

    fn is_interactive(&self) -> bool;
}

/// Prompts on the terminal and reads the answer from stdin.
#[derive(Debug, Default)]
pub struct TerminalDecider;

impl Decider for TerminalDecider {
    fn decide(&self, question: &Question) -> Choice {
        ask(question, &mut io::stdin().lock(), &mut io::stderr())
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Up to three prompts on `output`, answers read from `input`. A prompt that
/// cannot be written, or a closed input, yields the fail-closed answer.
fn ask<R: BufRead, W: Write>(question: &Question, input: &mut R, output: &mut W) -> Choice {
    for _ in 0..3 {
        if let Err(e) = write_prompt(question, output) {
            info!(error = %e, "Prompt could not be shown");
            break;
        }

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if let Some(choice) = question.parse_answer(&line) {
            info!(question = %question.prompt, answer = %choice, "Operator decision");
            return choice;
        }
        if writeln!(output, "Unrecognised answer: {}", line.trim()).is_err() {
            break;
        }
    }

    info!(question = %question.prompt, answer = %question.fail_closed, "No usable answer, failing closed");
    question.fail_closed
}

fn write_prompt<W: Write>(question: &Question, output: &mut W) -> io::Result<()> {
    writeln!(output, "{} {}", "?".yellow().bold(), question.prompt.as_str().bold())?;
    for (i, option) in question.options.iter().enumerate() {
        writeln!(output, "  {}) {}", i + 1, option)?;
    }
    write!(output, "> ")?;
    output.flush()
}

/// Non-interactive decisions: a preset answer when it is offered, the
/// question's fail-closed default otherwise.
#[derive(Debug, Default, Clone)]
pub struct FixedDecider {
    answer: Option<Choice>,
}

impl FixedDecider {
    pub fn fail_closed() -> Self {
        Self { answer: None }
    }

    pub fn answering(answer: Choice) -> Self {
        Self {
            answer: Some(answer),
        }
    }
}

impl Decider for FixedDecider {
    fn decide(&self, question: &Question) -> Choice {
        let choice = self
            .answer
            .filter(|a| question.options.contains(a))
            .unwrap_or(question.fail_closed);
        info!(question = %question.prompt, answer = %choice, "Non-interactive decision");
        choice
    }

    fn is_interactive(&self) -> bool {
        false
    }
}
