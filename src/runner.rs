//! Project runner - executes a project's registered commands in order and asks
//! the fix agent to repair each failure, within a per-command attempt budget.
//!
//! Per command: `Idle -> Running -> {Succeeded, Failed}`. A failure with budget
//! left requests a fix (`Patched` or `NoFix`) and reruns the command. A failure
//! on the last attempt ends the run with `RetriesExhausted`; a failure while the
//! agent is unready ends it with `Unrecoverable` without spending the budget.

use crate::config::{Settings, expand_home};
use crate::error::{Result, SandfixError};
use crate::fixer::{FixAgent, FixPayload};
use crate::patch::PatchApplier;
use crate::registry::ProjectRegistry;
use crate::vault::Vault;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

/// Captured result of one shell invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `command` through `sh -c` inside `cwd` and wait for it.
pub async fn run_shell(command: &str, cwd: &Path) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Retry bookkeeping for a single registered command.
#[derive(Debug)]
pub struct AttemptState {
    attempt: u32,
    limit: u32,
    last_output: CommandOutput,
}

impl AttemptState {
    pub fn new(limit: u32) -> Self {
        Self {
            attempt: 0,
            limit,
            last_output: CommandOutput::default(),
        }
    }

    /// Start the next attempt and return its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn record(&mut self, output: CommandOutput) {
        self.last_output = output;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.limit
    }

    pub fn last_output(&self) -> &CommandOutput {
        &self.last_output
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub attempts: u32,
}

/// Summary of a fully successful project run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub project: String,
    pub project_dir: PathBuf,
    pub commands: Vec<CommandOutcome>,
}

impl RunReport {
    pub fn total_attempts(&self) -> u32 {
        self.commands.iter().map(|c| c.attempts).sum()
    }
}

#[derive(Debug)]
enum FixOutcome {
    Patched,
    NoFix,
    Failed(String),
}

pub struct ProjectRunner {
    settings: Settings,
    vault: Vault,
    registry: ProjectRegistry,
}

impl ProjectRunner {
    pub fn new(settings: Settings) -> Result<Self> {
        let vault = Vault::new(settings.vault_path()?);
        let registry = ProjectRegistry::new(settings.registry_path()?);
        Ok(Self {
            settings,
            vault,
            registry,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_parts(settings: Settings, vault: Vault, registry: ProjectRegistry) -> Self {
        Self {
            settings,
            vault,
            registry,
        }
    }

    /// Run every registered command of `name`, repairing failures on the way.
    /// Progress and captured command output go to `progress`.
    pub async fn run_project(
        &self,
        name: &str,
        password: &str,
        max_attempts: Option<u32>,
        progress: &mut (dyn Write + Send),
    ) -> Result<RunReport> {
        let limit = max_attempts.unwrap_or(self.settings.runner.max_attempts);
        if limit == 0 {
            return Err(SandfixError::Validation(
                "The attempt limit must be at least 1".to_string(),
            ));
        }

        let record = self.vault.load_async(password).await?;
        let sandbox = record.sandbox_path.trim();
        if sandbox.is_empty() {
            return Err(SandfixError::Validation(
                "Sandbox path is not configured. Run `sandfix config` first.".to_string(),
            ));
        }

        let project = self.registry.get(name)?;
        if project.commands.is_empty() {
            return Err(SandfixError::Validation(format!(
                "Project '{}' has no registered commands",
                name
            )));
        }

        let project_dir = expand_home(sandbox).join(&project.name);
        if !project_dir.is_dir() {
            return Err(SandfixError::NotFound(format!(
                "Project directory {} does not exist",
                project_dir.display()
            )));
        }

        let mut agent =
            FixAgent::from_credential(record.service_api_key.as_deref(), &self.settings.service);
        if !agent.is_ready() {
            warn!(reason = %agent.explain_unavailable(), "Automatic fixes are disabled");
        }

        info!(project = name, limit, "Starting project run");
        let commands =
            run_commands(&project_dir, &project.commands, &mut agent, limit, progress).await?;

        Ok(RunReport {
            project: project.name,
            project_dir,
            commands,
        })
    }
}

/// Execute `commands` in order. Stops at the first command that cannot be made to pass.
pub async fn run_commands(
    project_dir: &Path,
    commands: &[String],
    agent: &mut FixAgent,
    limit: u32,
    progress: &mut (dyn Write + Send),
) -> Result<Vec<CommandOutcome>> {
    if commands.is_empty() {
        return Err(SandfixError::Validation(
            "No commands to run".to_string(),
        ));
    }
    if limit == 0 {
        return Err(SandfixError::Validation(
            "The attempt limit must be at least 1".to_string(),
        ));
    }

    let mut outcomes = Vec::with_capacity(commands.len());
    for command in commands {
        let attempts = run_command(project_dir, command, agent, limit, progress).await?;
        outcomes.push(CommandOutcome {
            command: command.clone(),
            attempts,
        });
    }
    Ok(outcomes)
}

async fn run_command(
    project_dir: &Path,
    command: &str,
    agent: &mut FixAgent,
    limit: u32,
    progress: &mut (dyn Write + Send),
) -> Result<u32> {
    let mut state = AttemptState::new(limit);

    loop {
        let attempt = state.begin();
        info!(command, attempt, limit, "Running command");
        writeln!(progress, "[{}/{}] $ {}", attempt, limit, command)?;

        let output = run_shell(command, project_dir).await?;
        if output.success() {
            info!(command, attempt, "Command succeeded");
            return Ok(attempt);
        }

        warn!(command, attempt, exit_code = ?output.exit_code, "Command failed");
        echo_output(progress, &output)?;
        state.record(output);

        if state.exhausted() {
            return Err(SandfixError::RetriesExhausted {
                command: command.to_string(),
                attempts: state.attempt(),
            });
        }

        if !agent.is_ready() {
            return Err(SandfixError::Unrecoverable {
                command: command.to_string(),
                reason: agent.explain_unavailable(),
            });
        }

        let last = state.last_output();
        let fix = agent
            .request_fix(project_dir, command, &last.stdout, &last.stderr)
            .await;

        match apply_fix(project_dir, fix, progress).await? {
            FixOutcome::Patched => info!(command, attempt, "Fix applied, retrying"),
            FixOutcome::NoFix => {
                warn!(command, attempt, reason = %agent.explain_unavailable(), "No fix available, retrying");
            }
            FixOutcome::Failed(reason) => {
                warn!(command, attempt, %reason, "Fix attempt failed, retrying");
            }
        }
    }
}

async fn apply_fix(
    project_dir: &Path,
    fix: Option<FixPayload>,
    progress: &mut (dyn Write + Send),
) -> Result<FixOutcome> {
    let Some(fix) = fix else {
        return Ok(FixOutcome::NoFix);
    };

    if let Some(notes) = fix.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        writeln!(progress, "AI notes: {}", notes)?;
    }

    let applier = PatchApplier::new(project_dir);
    if let Err(e) = applier.apply_all(&fix.files) {
        return Ok(FixOutcome::Failed(e.to_string()));
    }

    for remediation in &fix.commands {
        writeln!(progress, "-> {}", remediation)?;
        match run_shell(remediation, project_dir).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                echo_output(progress, &output)?;
                return Ok(FixOutcome::Failed(format!(
                    "remediation command '{}' exited with {:?}",
                    remediation, output.exit_code
                )));
            }
            Err(e) => {
                return Ok(FixOutcome::Failed(format!(
                    "remediation command '{}' could not be started: {}",
                    remediation, e
                )));
            }
        }
    }

    Ok(FixOutcome::Patched)
}

fn echo_output(progress: &mut (dyn Write + Send), output: &CommandOutput) -> Result<()> {
    if !output.stdout.trim().is_empty() {
        writeln!(progress, "{}", output.stdout.trim_end())?;
    }
    if !output.stderr.trim().is_empty() {
        writeln!(progress, "{}", output.stderr.trim_end())?;
    }
    Ok(())
}
