//! Command-line interface for codeport.
//!
//! Provides commands for running translations, approving or rejecting the
//! review gate, checking project status and listing projects.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::core::{CancellationSignal, Orchestrator, RunRequest};
use crate::domain::{ProjectStatus, RunResult, RunStatus};

/// codeport - Checkpointed codebase translation orchestrator
#[derive(Parser, Debug)]
#[command(name = "codeport")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .codeport/config.yaml, searched upwards)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "codeport=trace"
    #[arg(long, global = true, env = "CODEPORT_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Translate a project
    Run {
        /// Root directory of the source project
        project_root: PathBuf,

        /// Target language (e.g. go, rust, java)
        target_language: String,

        /// Write output to exactly this directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory under which `<project>-<language>` output is created
        #[arg(long)]
        output_root: Option<PathBuf>,

        /// Suspend for human review after the analysis stages
        #[arg(long)]
        review: bool,

        /// Run only the analysis stages
        #[arg(long)]
        dry_run: bool,

        /// Continue from existing checkpoints
        #[arg(long)]
        resume: bool,

        /// Source language hint, recorded when the project is registered
        #[arg(long)]
        source_language: Option<String>,
    },

    /// Approve the review gate and continue the translation
    Approve {
        project_root: PathBuf,
        target_language: String,

        /// Notes for the translation stages
        #[arg(short, long)]
        feedback: Option<String>,

        /// Record the approval without resuming
        #[arg(long)]
        no_resume: bool,
    },

    /// Reject the review gate, failing the project
    Reject {
        project_root: PathBuf,
        target_language: String,

        /// Why the analysis was rejected
        #[arg(short, long)]
        reason: String,
    },

    /// Show the status and checkpoints of a project
    Status {
        project_root: PathBuf,
        target_language: String,
    },

    /// List registered projects
    Projects {
        /// Only projects with this status
        #[arg(short, long)]
        status: Option<ProjectStatus>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load(self.config.as_deref())?;

        match self.command {
            Commands::Run {
                project_root,
                target_language,
                output,
                output_root,
                review,
                dry_run,
                resume,
                source_language,
            } => {
                let mut settings = settings;
                if let Some(root) = output_root {
                    settings.output_root = root;
                }
                let mut request = RunRequest::new(project_root, target_language)
                    .with_resume(resume)
                    .with_dry_run(dry_run)
                    .with_cancel(cancel_on_interrupt());
                if review {
                    request = request.with_review(true);
                }
                if let Some(output) = output {
                    request = request.with_output(output);
                }
                if let Some(language) = source_language {
                    request = request.with_source_language(language);
                }

                let orchestrator = Orchestrator::from_settings(settings)?;
                let result = orchestrator.run(request).await?;
                report_run(&result)
            }
            Commands::Approve {
                project_root,
                target_language,
                feedback,
                no_resume,
            } => {
                let orchestrator = Orchestrator::from_settings(settings)?;
                if no_resume {
                    orchestrator
                        .approve_review(&project_root, &target_language, feedback)
                        .await?;
                    eprintln!("[Review approved; resume with `codeport run --resume`]");
                    return Ok(());
                }

                let request = RunRequest::new(project_root, target_language)
                    .with_cancel(cancel_on_interrupt());
                let result = orchestrator.resume_after_approval(request, feedback).await?;
                report_run(&result)
            }
            Commands::Reject {
                project_root,
                target_language,
                reason,
            } => {
                let orchestrator = Orchestrator::from_settings(settings)?;
                let project = orchestrator
                    .reject_review(&project_root, &target_language, &reason)
                    .await?;
                eprintln!("[Project {} rejected at review]", project.id);
                Ok(())
            }
            Commands::Status {
                project_root,
                target_language,
            } => show_status(settings, &project_root, &target_language).await,
            Commands::Projects { status } => list_projects(settings, status).await,
            Commands::Config => show_config(settings).await,
        }
    }
}

/// Signal that fires on Ctrl-C
fn cancel_on_interrupt() -> CancellationSignal {
    let cancel = CancellationSignal::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Interrupted; finishing in-flight calls]");
            handle.cancel();
        }
    });
    cancel
}

/// Print a run outcome, exiting non-zero on failure
fn report_run(result: &RunResult) -> Result<()> {
    let executed = result.executed_stages.len();
    let restored = result.completed_stages.len().saturating_sub(executed);

    match result.status {
        RunStatus::Completed => {
            println!("{}", result.output_path.display());
            eprintln!(
                "\n[Run {} completed: {} stages executed, {} restored]",
                result.run_id, executed, restored
            );
        }
        RunStatus::AnalysisComplete => {
            eprintln!(
                "\n[Run {} finished analysis (dry run): {} stages executed, {} restored]",
                result.run_id, executed, restored
            );
        }
        RunStatus::AwaitingReview => {
            eprintln!(
                "\n[Run {} awaiting review; approve with `codeport approve`]",
                result.run_id
            );
        }
        RunStatus::Cancelled => {
            eprintln!(
                "\n[Run {} cancelled after {}; resume with `codeport run --resume`]",
                result.run_id,
                result
                    .last_completed()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no stages".to_string())
            );
        }
        RunStatus::Failed => {
            match &result.failure {
                Some(failure) => eprintln!(
                    "\n[Run {} failed at {} ({}): {}]",
                    result.run_id, failure.stage, failure.class, failure.message
                ),
                None => eprintln!("\n[Run {} failed]", result.run_id),
            }
        }
    }

    if !result.status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Show the status of a project
async fn show_status(settings: Settings, project_root: &Path, target_language: &str) -> Result<()> {
    let orchestrator = Orchestrator::from_settings(settings)?;
    let report = orchestrator.report(project_root, target_language).await?;
    let project = &report.project;

    println!("Project: {}", project.id);
    println!("Root: {}", project.root_path.display());
    println!("Output: {}", project.output_path.display());
    println!("Status: {}", project.status);
    println!("Created: {}", project.created_at);
    if let Some(completed) = project.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(failure) = &project.failure {
        let stage = failure
            .stage
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("Failed at: {} ({}): {}", stage, failure.class, failure.message);
    }
    if report.review_pending {
        println!("Review: pending");
    }

    println!("\nCheckpoints:");
    if report.checkpoints.is_empty() {
        println!("  (none)");
    }
    for checkpoint in &report.checkpoints {
        println!(
            "  {:<24} attempts={} {}",
            checkpoint.stage.as_str(),
            checkpoint.attempts,
            checkpoint.completed_at
        );
    }

    Ok(())
}

/// List registered projects
async fn list_projects(settings: Settings, status: Option<ProjectStatus>) -> Result<()> {
    let orchestrator = Orchestrator::from_settings(settings)?;
    let projects = orchestrator.projects(status).await?;

    if projects.is_empty() {
        println!("No projects found");
        return Ok(());
    }

    println!("{:<40} {:<12} {:<25}", "PROJECT", "STATUS", "CREATED");
    println!("{}", "-".repeat(77));

    for project in projects {
        println!(
            "{:<40} {:<12} {:<25}",
            project.id,
            project.status.as_str(),
            project.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config(settings: Settings) -> Result<()> {
    let yaml = serde_yaml::to_string(&settings).context("Failed to serialize settings")?;
    println!("{}", yaml);

    let orchestrator = Orchestrator::from_settings(settings)?;
    let provider = orchestrator.provider();
    match provider.health_check().await {
        Ok(()) => println!("provider '{}': ok", provider.name()),
        Err(e) => println!("provider '{}': unavailable ({})", provider.name(), e.message()),
    }

    Ok(())
}
