//! Seam to the external agent loop that carries out `do` instructions.
//!
//! The loop itself (model calls, tool selection) lives outside this crate.
//! It receives an [`AgentSession`] giving it the live instance, a panel to
//! narrate into, a way to run shell commands, and the verification checks
//! the finished layer must pass.

use crate::backend::RemoteInstance;
use crate::error::SnapError;
use crate::exec::{self, Completion, Output, PollOptions};
use crate::progress::{LineStyle, Panel, ProgressReporter};
use crate::verify::{Check, VerificationReport, VerificationRunner};

/// What the agent loop reports when it stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub completed: bool,
    pub summary: String,
}

impl AgentOutcome {
    pub fn completed(summary: impl Into<String>) -> Self {
        Self {
            completed: true,
            summary: summary.into(),
        }
    }

    pub fn incomplete(summary: impl Into<String>) -> Self {
        Self {
            completed: false,
            summary: summary.into(),
        }
    }
}

#[allow(async_fn_in_trait)] // trait is consumed generically, never boxed
pub trait AgentLoop<I: RemoteInstance> {
    async fn run(&mut self, session: &mut AgentSession<'_, I>) -> Result<AgentOutcome, SnapError>;
}

/// Output of a shell command run on behalf of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub completion: Completion,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.completion == Completion::Exited(0)
    }
}

pub struct AgentSession<'a, I> {
    instance: &'a I,
    instructions: &'a str,
    panel: Panel,
    runner: VerificationRunner,
    checks: &'a [Box<dyn Check<I>>],
    poll: PollOptions,
    last_report: Option<VerificationReport>,
}

impl<'a, I: RemoteInstance> AgentSession<'a, I> {
    pub fn new(
        instance: &'a I,
        instructions: &'a str,
        panel: Panel,
        reporter: ProgressReporter,
        checks: &'a [Box<dyn Check<I>>],
        poll: PollOptions,
    ) -> Self {
        Self {
            instance,
            instructions,
            panel,
            runner: VerificationRunner::new(reporter),
            checks,
            poll,
            last_report: None,
        }
    }

    pub fn instance(&self) -> &I {
        self.instance
    }

    pub fn instructions(&self) -> &str {
        self.instructions
    }

    pub fn log(&self, line: &str) {
        self.panel.log(line, LineStyle::Normal);
    }

    /// Run a shell command, echoing it and its output into the agent panel.
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput, SnapError> {
        self.panel.log(&format!("$ {command}"), LineStyle::Normal);
        let mut stdout = String::new();
        let mut stderr = String::new();
        let completion = exec::run(self.instance, command, self.poll, |stream, text| match stream {
            Output::Stdout => {
                stdout.push_str(text);
                self.panel.append(text, LineStyle::Normal);
            }
            Output::Stderr => {
                stderr.push_str(text);
                self.panel.append(text, LineStyle::Error);
            }
        })
        .await?;
        Ok(CommandOutput {
            completion,
            stdout,
            stderr,
        })
    }

    pub fn has_checks(&self) -> bool {
        !self.checks.is_empty()
    }

    /// Run every verification check. The failures are kept so the loop can
    /// read them back as feedback.
    pub async fn verify(&mut self) -> VerificationReport {
        let report = self.runner.run(self.checks, self.instance).await;
        for (name, message) in report.failures() {
            self.panel
                .log(&format!("verification {name}: {message}"), LineStyle::Error);
        }
        self.last_report = Some(report.clone());
        report
    }

    /// `(name, message)` pairs from the most recent verification.
    pub fn last_failures(&self) -> Vec<(String, String)> {
        self.last_report
            .as_ref()
            .map(VerificationReport::failures)
            .unwrap_or_default()
    }

    /// Whether the most recent verification passed. `None` if none ran.
    pub fn verified(&self) -> Option<bool> {
        self.last_report.as_ref().map(VerificationReport::passed)
    }
}

/// Deterministic loop that runs a fixed list of shell commands and then
/// verifies. Useful for dry runs and tests where no model is available.
#[derive(Debug, Clone, Default)]
pub struct CommandAgent {
    commands: Vec<String>,
}

impl CommandAgent {
    pub fn new<S: Into<String>>(commands: impl IntoIterator<Item = S>) -> Self {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }
}

impl<I: RemoteInstance> AgentLoop<I> for CommandAgent {
    async fn run(&mut self, session: &mut AgentSession<'_, I>) -> Result<AgentOutcome, SnapError> {
        for command in &self.commands {
            let output = session.run_command(command).await?;
            if !output.success() {
                return Ok(AgentOutcome::incomplete(format!(
                    "{command} ended with {:?}",
                    output.completion
                )));
            }
        }
        if session.has_checks() && !session.verify().await.passed() {
            let failures = session
                .last_failures()
                .into_iter()
                .map(|(name, message)| format!("{name}: {message}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(AgentOutcome::incomplete(failures));
        }
        Ok(AgentOutcome::completed(format!(
            "ran {} command(s)",
            self.commands.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCloud, MemoryInstance, ScriptedRun};
    use crate::backend::{CloudApi, CreateSnapshot, Metadata, Resources, SnapshotSpec};
    use crate::verify::check_fn;

    async fn instance(cloud: &MemoryCloud) -> MemoryInstance {
        let snap = cloud
            .create_snapshot(CreateSnapshot {
                image_id: "img".into(),
                spec: SnapshotSpec {
                    vcpus: 1,
                    memory: 512,
                    disk_size: 1024,
                },
                digest: None,
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        cloud.boot_instance(&snap.id, Resources::default()).await.unwrap()
    }

    #[tokio::test]
    async fn command_agent_reports_failed_checks() {
        let cloud = MemoryCloud::new();
        cloud.on_command(|_| ScriptedRun::exit(0).stdout("done\n"));
        let inst = instance(&cloud).await;
        let reporter = ProgressReporter::hidden(24);
        let checks: Vec<Box<dyn Check<MemoryInstance>>> =
            vec![Box::new(check_fn::<MemoryInstance, _>("nginx_running", |_| Ok(false)))];

        let mut session = AgentSession::new(
            &inst,
            "install nginx",
            reporter.add_panel("install nginx"),
            reporter.clone(),
            &checks,
            PollOptions::default(),
        );
        let outcome = CommandAgent::new(["apt-get install -y nginx"])
            .run(&mut session)
            .await
            .unwrap();

        assert!(!outcome.completed);
        assert!(outcome.summary.contains("nginx_running"));
        assert_eq!(session.verified(), Some(false));
        assert_eq!(cloud.commands(), vec!["apt-get install -y nginx".to_string()]);
    }

    #[tokio::test]
    async fn failing_command_stops_the_loop() {
        let cloud = MemoryCloud::new();
        cloud.on_command(|cmd| if cmd == "false" { ScriptedRun::exit(1) } else { ScriptedRun::exit(0) });
        let inst = instance(&cloud).await;
        let reporter = ProgressReporter::hidden(24);
        let checks: Vec<Box<dyn Check<MemoryInstance>>> = Vec::new();
        let mut session = AgentSession::new(
            &inst,
            "x",
            reporter.add_panel("x"),
            reporter.clone(),
            &checks,
            PollOptions::default(),
        );

        let outcome = CommandAgent::new(["false", "true"]).run(&mut session).await.unwrap();
        assert!(!outcome.completed);
        assert_eq!(cloud.commands(), vec!["false".to_string()]);
        assert_eq!(session.verified(), None);
    }
}
