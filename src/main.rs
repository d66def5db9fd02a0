mod config;
mod error;
mod fixer;
mod git;
mod patch;
mod providers;
mod registry;
mod runner;
mod vault;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Settings, SettingsManager};
use dialoguer::{Input, Password};
use registry::ProjectRegistry;
use runner::{ProjectRunner, RunReport};
use std::collections::BTreeMap;
use std::io::{self, Write};
use vault::{ConfigRecord, Vault, resolve_inline_or_file};

const PASSWORD_ENV: &str = "SANDFIX_PASSWORD";
const EXIT_INTERRUPTED: i32 = 130;

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(
    name = "sandfix",
    version,
    about = "Sandfix - run sandbox projects and let an AI service repair failing commands"
)]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store credentials in the encrypted vault
    Config {
        /// Sandbox directory that holds cloned projects
        #[arg(long)]
        sandbox: Option<String>,
        #[arg(long)]
        git_username: Option<String>,
        #[arg(long)]
        git_email: Option<String>,
        #[arg(long)]
        git_token: Option<String>,
        /// AI service API key
        #[arg(long, alias = "openai-key")]
        api_key: Option<String>,
        /// Path to (or content of) the SSH private key
        #[arg(long)]
        ssh_private_key: Option<String>,
        /// Path to (or content of) the SSH public key
        #[arg(long)]
        ssh_public_key: Option<String>,
        /// Additional KEY=VALUE entry (repeatable)
        #[arg(long = "extra", value_parser = parse_key_val)]
        extra: Vec<(String, String)>,
    },
    /// Show the decrypted configuration with secrets masked
    ShowConfig,
    /// Clone a repository into the sandbox and register it
    CreateProject {
        #[arg(long)]
        name: String,
        /// Git repository URL
        #[arg(long)]
        repo: String,
        /// Start command (repeatable, run in order)
        #[arg(long = "start-cmd")]
        start_cmds: Vec<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Run a project's commands, repairing failures automatically
    RunProject {
        name: String,
        /// Attempts per command (defaults to runner.max_attempts)
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List registered projects
    ListProjects,
    /// Manage application settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the effective settings
    Show,
    /// Write a settings template with the defaults
    Init,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn json_output(success: bool, data: serde_json::Value, error: Option<&str>) -> String {
    serde_json::json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sandfix=info"));

    if std::env::var("SANDFIX_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }

    let cli = Cli::parse();
    let json_mode = cli.json;

    let outcome = async {
        let manager = SettingsManager::new().context("Failed to load settings")?;
        let job = prepare(cli.command)?;
        interruptible(execute(job, &manager, json_mode)).await
    }
    .await;

    if let Err(e) = outcome {
        if json_mode {
            println!(
                "{}",
                json_output(false, serde_json::Value::Null, Some(format!("{:#}", e).as_str()))
            );
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

/// Drive `work` until it finishes or Ctrl-C arrives. The signal branch is polled
/// first so the handler is installed before any work starts. On interrupt the
/// work future is dropped, which kills any child spawned with `kill_on_drop`.
async fn interruptible<F>(work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let finished = tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => None,
        result = work => Some(result),
    };

    match finished {
        Some(result) => result,
        None => {
            eprintln!("\nOperation cancelled");
            std::process::exit(EXIT_INTERRUPTED);
        }
    }
}

// ============================================================================
// Command Runner
// ============================================================================

/// A command with every interactive answer already collected.
enum Job {
    SaveConfig {
        record: ConfigRecord,
        password: String,
    },
    ShowConfig {
        password: String,
    },
    CreateProject {
        name: String,
        repo: String,
        commands: Vec<String>,
        branch: Option<String>,
        password: String,
    },
    RunProject {
        name: String,
        max_attempts: Option<u32>,
        password: String,
    },
    ListProjects,
    Settings(SettingsAction),
}

/// Run every prompt up front, before the interruptible part of the command.
fn prepare(command: Commands) -> Result<Job> {
    let job = match command {
        Commands::Config {
            sandbox,
            git_username,
            git_email,
            git_token,
            api_key,
            ssh_private_key,
            ssh_public_key,
            extra,
        } => {
            let sandbox = match sandbox.filter(|s| !s.trim().is_empty()) {
                Some(s) => s,
                None => prompt_text("Sandbox directory", false)?
                    .context("The sandbox path is required")?,
            };

            let mut record = ConfigRecord::new(sandbox.trim());
            record.git_username = or_prompt(git_username, "Git username (optional)", false)?;
            record.git_email = or_prompt(git_email, "Git email (optional)", false)?;
            record.git_token = or_prompt(git_token, "Git token (optional)", true)?;
            record.service_api_key = or_prompt(api_key, "AI service API key (optional)", true)?;
            record.ssh_private_key =
                or_prompt(ssh_private_key, "Path to SSH private key (optional)", false)?
                    .map(|v| resolve_inline_or_file(&v))
                    .transpose()?;
            record.ssh_public_key =
                or_prompt(ssh_public_key, "Path to SSH public key (optional)", false)?
                    .map(|v| resolve_inline_or_file(&v))
                    .transpose()?;
            record.extra = extra.into_iter().collect();
            record.validate()?;

            Job::SaveConfig {
                record,
                password: master_password(true)?,
            }
        }
        Commands::ShowConfig => Job::ShowConfig {
            password: master_password(false)?,
        },
        Commands::CreateProject {
            name,
            repo,
            start_cmds,
            branch,
        } => {
            let name = registry::validate_project_name(&name)?;
            let commands = collect_start_commands(start_cmds)?;
            Job::CreateProject {
                name,
                repo,
                commands,
                branch,
                password: master_password(false)?,
            }
        }
        Commands::RunProject { name, max_attempts } => Job::RunProject {
            name,
            max_attempts,
            password: master_password(false)?,
        },
        Commands::ListProjects => Job::ListProjects,
        Commands::Settings { action } => Job::Settings(action),
    };
    Ok(job)
}

async fn execute(job: Job, manager: &SettingsManager, json_mode: bool) -> Result<()> {
    let settings = manager.get().clone();

    match job {
        Job::SaveConfig { record, password } => {
            let vault = Vault::new(settings.vault_path()?);
            vault.save_async(&record, &password).await?;

            if json_mode {
                println!(
                    "{}",
                    json_output(
                        true,
                        serde_json::json!({ "path": vault.path().display().to_string() }),
                        None
                    )
                );
            } else {
                println!("Configuration saved to {}", vault.path().display());
            }
        }
        Job::ShowConfig { password } => {
            let record = Vault::new(settings.vault_path()?).load_async(&password).await?;
            let view = record.redacted_view();

            if json_mode {
                let data: serde_json::Map<String, serde_json::Value> = view
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!("{}", json_output(true, serde_json::Value::Object(data), None));
            } else {
                let width = view.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
                for (key, value) in view {
                    println!("{:<width$}  {}", key, value, width = width);
                }
            }
        }
        Job::CreateProject {
            name,
            repo,
            commands,
            branch,
            password,
        } => {
            let record = Vault::new(settings.vault_path()?).load_async(&password).await?;
            let sandbox = git::ensure_sandbox(&record.sandbox_path)?;
            let project_dir = sandbox.join(&name);

            if json_mode {
                eprintln!("Cloning {} into {}...", repo, project_dir.display());
            } else {
                println!("Cloning {} into {}...", repo, project_dir.display());
            }
            git::clone_repository(&repo, &project_dir, branch.as_deref()).await?;

            let mut metadata = BTreeMap::new();
            if let Some(branch) = branch {
                metadata.insert("branch".to_string(), serde_json::Value::String(branch));
            }
            let entry = ProjectRegistry::new(settings.registry_path()?)
                .register(&name, &repo, commands, metadata)?;

            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&entry)?, None));
            } else {
                println!("Project '{}' created in {}", entry.name, project_dir.display());
            }
        }
        Job::RunProject {
            name,
            max_attempts,
            password,
        } => {
            let runner = ProjectRunner::new(settings)?;
            run_project_job(
                &runner,
                &name,
                &password,
                max_attempts,
                json_mode,
                &mut io::stdout(),
                &mut io::stderr(),
            )
            .await?;
        }
        Job::ListProjects => {
            let projects = ProjectRegistry::new(settings.registry_path()?).list()?;
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&projects)?, None));
            } else if projects.is_empty() {
                println!("No projects registered. Use `sandfix create-project`.");
            } else {
                for project in projects {
                    println!(
                        "{}  {}  (created {})",
                        project.name,
                        project.repo_url,
                        project.created_at.format("%Y-%m-%d %H:%M UTC")
                    );
                    for cmd in &project.commands {
                        println!("    $ {}", cmd);
                    }
                }
            }
        }
        Job::Settings(action) => match action {
            SettingsAction::Show => print_settings(manager, &settings, json_mode)?,
            SettingsAction::Init => {
                let written = manager.write_template()?;
                let path = manager.settings_path().display().to_string();
                if json_mode {
                    println!(
                        "{}",
                        json_output(true, serde_json::json!({ "path": path, "written": written }), None)
                    );
                } else if written {
                    println!("Settings template written to {}", path);
                } else {
                    println!("Settings file already exists at {}", path);
                }
            }
        },
    }

    Ok(())
}

/// In JSON mode stdout carries only the final document; progress and the
/// captured command output go to stderr.
async fn run_project_job(
    runner: &ProjectRunner,
    name: &str,
    password: &str,
    max_attempts: Option<u32>,
    json_mode: bool,
    stdout: &mut (dyn Write + Send),
    stderr: &mut (dyn Write + Send),
) -> Result<()> {
    let progress: &mut (dyn Write + Send) = if json_mode { stderr } else { &mut *stdout };
    let report = runner
        .run_project(name, password, max_attempts, progress)
        .await?;
    write_report(stdout, &report, json_mode)?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn prompt_text(prompt: &str, secret: bool) -> Result<Option<String>> {
    let value: String = if secret {
        Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()?
    } else {
        Input::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()?
    };
    let value = value.trim();
    Ok(if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    })
}

fn or_prompt(value: Option<String>, prompt: &str, secret: bool) -> Result<Option<String>> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => Ok(Some(v)),
        None => prompt_text(prompt, secret),
    }
}

/// Master password from `SANDFIX_PASSWORD`, otherwise a hidden prompt.
fn master_password(confirm: bool) -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if password.is_empty() {
            anyhow::bail!("{} is set but empty", PASSWORD_ENV);
        }
        return Ok(password);
    }

    let mut prompt = Password::new().with_prompt("Master password");
    if confirm {
        prompt = prompt.with_confirmation("Confirm master password", "Passwords do not match");
    }
    let password = prompt.interact()?;
    if password.is_empty() {
        anyhow::bail!("The master password cannot be empty");
    }
    Ok(password)
}

fn collect_start_commands(initial: Vec<String>) -> Result<Vec<String>> {
    let mut commands: Vec<String> = initial
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    while commands.is_empty() {
        match prompt_text("Start command", false)? {
            Some(cmd) => commands.push(cmd),
            None => eprintln!("At least one start command is required."),
        }
    }
    Ok(commands)
}

fn write_report(out: &mut dyn Write, report: &RunReport, json_mode: bool) -> io::Result<()> {
    if json_mode {
        let commands: Vec<serde_json::Value> = report
            .commands
            .iter()
            .map(|c| serde_json::json!({ "command": c.command, "attempts": c.attempts }))
            .collect();
        return writeln!(
            out,
            "{}",
            json_output(
                true,
                serde_json::json!({
                    "project": report.project,
                    "project_dir": report.project_dir.display().to_string(),
                    "commands": commands,
                }),
                None
            )
        );
    }

    writeln!(
        out,
        "Project '{}' ran successfully ({} command(s), {} attempt(s)).",
        report.project,
        report.commands.len(),
        report.total_attempts()
    )?;
    for outcome in &report.commands {
        writeln!(out, "  {} attempt(s)  {}", outcome.attempts, outcome.command)?;
    }
    Ok(())
}

fn print_settings(manager: &SettingsManager, settings: &Settings, json_mode: bool) -> Result<()> {
    let home = settings.home_dir()?;
    if json_mode {
        let mut data = serde_json::to_value(settings)?;
        data["home"] = serde_json::Value::String(home.display().to_string());
        println!("{}", json_output(true, data, None));
        return Ok(());
    }

    println!("Settings file:     {}", manager.settings_path().display());
    println!("Home:              {}", home.display());
    println!("Max attempts:      {}", settings.runner.max_attempts);
    println!("Service URL:       {}", settings.service.base_url);
    println!("Model:             {}", settings.service.model);
    println!("Max output tokens: {}", settings.service.max_output_tokens);
    println!("Timeout:           {}s", settings.service.timeout_secs);
    Ok(())
}
