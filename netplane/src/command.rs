//! External command execution.
//!
//! macOS has no stable programmatic API for network services, so DNS and
//! route changes there go through `networksetup`, `route` and `ifconfig`.
//! [`CommandRunner`] is the seam; [`SystemCommandRunner`] spawns real
//! processes and [`ScriptedRunner`] replays canned output in tests.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs external utilities with an argument list
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` and capture its output. A non-zero exit status is not
    /// an error here; see [`CommandRunner::run_checked`].
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run `program` and fail with [`Error::Command`] on a non-zero exit.
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.run(program, args).await?;
        if !output.success {
            return Err(Error::Command {
                command: command_line(program, args),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Spawns processes with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        log::debug!("exec: {}", command_line(program, args));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: command_line(program, args),
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Replays scripted outputs and records every invocation.
///
/// Responses are matched by command-line prefix, first match wins, and are
/// reused until replaced. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`. Several
    /// outputs for the same prefix are returned in order; the last one
    /// repeats.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        match responses.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(output),
            None => responses.push((prefix.to_string(), VecDeque::from([output]))),
        }
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Command lines that start with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.clone());

        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = responses
            .iter_mut()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, q)| q);
        let output = match queue {
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or_default(),
            Some(q) => q.front().cloned().unwrap_or_default(),
            None => CommandOutput::ok(""),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_matches_prefix() {
        let runner = ScriptedRunner::new();
        runner.respond("networksetup -getdnsservers", CommandOutput::ok("1.1.1.1\n"));

        let out = runner
            .run("networksetup", &["-getdnsservers", "Wi-Fi"])
            .await
            .unwrap();
        assert_eq!(out.stdout, "1.1.1.1\n");
        assert_eq!(runner.calls(), vec!["networksetup -getdnsservers Wi-Fi"]);
    }

    #[tokio::test]
    async fn test_scripted_runner_sequences_then_repeats() {
        let runner = ScriptedRunner::new();
        runner.respond("a", CommandOutput::ok("1"));
        runner.respond("a", CommandOutput::ok("2"));

        assert_eq!(runner.run("a", &[]).await.unwrap().stdout, "1");
        assert_eq!(runner.run("a", &[]).await.unwrap().stdout, "2");
        assert_eq!(runner.run("a", &[]).await.unwrap().stdout, "2");
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let runner = ScriptedRunner::new();
        runner.respond("route", CommandOutput::failed("not in table\n"));
        let err = runner.run_checked("route", &["-n", "delete", "10.0.0.0/8"]).await.unwrap_err();
        match err {
            Error::Command { command, stderr } => {
                assert_eq!(command, "route -n delete 10.0.0.0/8");
                assert_eq!(stderr, "not in table");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let out = SystemCommandRunner.run("echo", &["hello"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }
}
