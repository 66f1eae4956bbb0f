//! `cortex` — CLI entry points for the self-improving agent harness.
//!
//! The orchestrator exit code reflects orchestration, not task outcome: a
//! session whose verdict is `fail` still exits 0; only provider-level or
//! setup failures are non-zero.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cortex_domains::{DomainOptions, resolve_adapter};
use cortex_harness::agent::{
    AgentRunConfig, ArchitectureMode, HarnessPaths, LearningMode, PosttaskMode, run_agent,
};
use cortex_harness::config::CortexConfig;
use cortex_harness::domain::ErrorStyle;
use cortex_harness::provider::AnthropicProvider;
use cortex_harness::skills::build_skill_manifest;
use cortex_memory::{LessonStore, TransferOptions};

#[derive(Parser)]
#[command(name = "cortex")]
#[command(about = "Self-improving agent harness: run tool-using sessions with lesson memory")]
#[command(version, long_about = None)]
struct Cli {
    /// Track root containing tasks/, skills/, learning/, sessions/
    #[arg(long, value_name = "DIR", default_value = ".")]
    track_root: PathBuf,

    /// Enable verbose logging (RUST_LOG still takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum LearningModeArg {
    Legacy,
    Strict,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ArchitectureModeArg {
    Full,
    Simplified,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PosttaskModeArg {
    Candidate,
    Direct,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent session against a task
    Run {
        /// Task id under tasks/
        #[arg(long)]
        task_id: String,

        /// Free-form task text (defaults to the task's built-in text)
        #[arg(long)]
        task: Option<String>,

        /// Session id; reusing an id resets its artifacts
        #[arg(long)]
        session: u64,

        /// Step budget for the loop
        #[arg(long, default_value_t = 12)]
        max_steps: u64,

        /// Tool domain: sqlite, gridtool, fluxtool, shell, artic
        #[arg(long, default_value = "sqlite")]
        domain: String,

        #[arg(long, value_enum, default_value_t = LearningModeArg::Legacy)]
        learning_mode: LearningModeArg,

        #[arg(long, value_enum, default_value_t = ArchitectureModeArg::Full)]
        architecture_mode: ArchitectureModeArg,

        /// Disable skill loading and the skill gate (pure exploration)
        #[arg(long)]
        bootstrap: bool,

        /// Obscure tool names/descriptions (dispatch/probe/catalog)
        #[arg(long)]
        opaque_tools: bool,

        /// Strip helpful hints from adapter error messages
        #[arg(long, conflicts_with_all = ["semi_helpful_errors", "mixed_errors"])]
        cryptic_errors: bool,

        /// Hint at fixes without giving full syntax
        #[arg(long, conflicts_with = "mixed_errors")]
        semi_helpful_errors: bool,

        /// Deterministic per-command mix of cryptic and semi-helpful
        #[arg(long)]
        mixed_errors: bool,

        /// Allow cross-domain lessons to backfill on-error retrieval
        #[arg(long)]
        enable_transfer_retrieval: bool,

        /// Transfer-lane backfill quota
        #[arg(long, default_value_t = 1)]
        transfer_retrieval_max_results: usize,

        /// Score multiplier applied to transfer-lane rows
        #[arg(long, default_value_t = 0.35)]
        transfer_retrieval_score_weight: f64,

        /// Suppress legacy skill patching; V2 memory stays fully active
        #[arg(long)]
        memory_v2_demo_mode: bool,

        #[arg(long, value_enum, default_value_t = PosttaskModeArg::Candidate)]
        posttask_mode: PosttaskModeArg,

        /// Skip the posttask critic/lesson pipeline entirely
        #[arg(long)]
        no_posttask_learn: bool,

        /// Do not require a skill read before the first executor call
        #[arg(long)]
        no_skill_gate: bool,

        /// Disable automatic critic-tier escalation
        #[arg(long)]
        no_auto_escalate: bool,
    },

    /// Lesson store maintenance
    Lessons {
        #[command(subcommand)]
        command: LessonCommands,
    },

    /// Rebuild the skills manifest
    Skills,
}

#[derive(Subcommand)]
enum LessonCommands {
    /// Print every lesson record as JSON lines
    List {
        /// Only records with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Archive lessons by id
    Archive {
        #[arg(long, required = true, num_args = 1..)]
        lesson_id: Vec<String>,
        #[arg(long, default_value = "archived via cli")]
        reason: String,
    },
    /// Migrate the legacy lessons.jsonl into the V2 store
    Migrate,
}

fn error_style(cryptic: bool, semi_helpful: bool, mixed: bool) -> ErrorStyle {
    if mixed {
        ErrorStyle::Mixed
    } else if cryptic {
        ErrorStyle::Cryptic
    } else if semi_helpful {
        ErrorStyle::SemiHelpful
    } else {
        ErrorStyle::Helpful
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let paths = HarnessPaths::new(&cli.track_root);

    match cli.command {
        Commands::Run {
            task_id,
            task,
            session,
            max_steps,
            domain,
            learning_mode,
            architecture_mode,
            bootstrap,
            opaque_tools,
            cryptic_errors,
            semi_helpful_errors,
            mixed_errors,
            enable_transfer_retrieval,
            transfer_retrieval_max_results,
            transfer_retrieval_score_weight,
            memory_v2_demo_mode,
            posttask_mode,
            no_posttask_learn,
            no_skill_gate,
            no_auto_escalate,
        } => {
            let config = CortexConfig::from_env().context("loading configuration")?;
            let provider =
                AnthropicProvider::new(&config.anthropic_api_key, config.enable_prompt_caching);

            let options = DomainOptions {
                error_style: error_style(cryptic_errors, semi_helpful_errors, mixed_errors),
                docs_root: Some(paths.track_root.join("docs")),
            };
            let adapter = resolve_adapter(&domain, &options).context("resolving domain adapter")?;

            let mut run_config = AgentRunConfig::new(task_id, session);
            run_config.task = task;
            run_config.max_steps = max_steps;
            run_config.domain = domain;
            run_config.learning_mode = match learning_mode {
                LearningModeArg::Legacy => LearningMode::Legacy,
                LearningModeArg::Strict => LearningMode::Strict,
            };
            run_config.architecture_mode = match architecture_mode {
                ArchitectureModeArg::Full => ArchitectureMode::Full,
                ArchitectureModeArg::Simplified => ArchitectureMode::Simplified,
            };
            run_config.bootstrap = bootstrap;
            run_config.opaque_tools = opaque_tools;
            run_config.posttask_mode = match posttask_mode {
                PosttaskModeArg::Candidate => PosttaskMode::Candidate,
                PosttaskModeArg::Direct => PosttaskMode::Direct,
            };
            run_config.posttask_learn = !no_posttask_learn;
            run_config.memory_v2_demo_mode = memory_v2_demo_mode;
            run_config.require_skill_read = !no_skill_gate;
            run_config.auto_escalate_critic = !no_auto_escalate;
            run_config.transfer = TransferOptions {
                enabled: enable_transfer_retrieval,
                max_results: transfer_retrieval_max_results,
                score_weight: transfer_retrieval_score_weight,
            };
            run_config.executor_model = config.model_executor.clone();
            run_config.critic_model = config.model_critic.clone();
            run_config.judge_model = config.model_judge.clone();

            let result = run_agent(&provider, adapter.as_ref(), &paths, &run_config)
                .await
                .context("running agent session")?;
            println!("{}", serde_json::to_string_pretty(&result.metrics)?);
            Ok(())
        }

        Commands::Lessons { command } => {
            let store = LessonStore::new(&paths.lessons_v2_path);
            match command {
                LessonCommands::List { status } => {
                    for record in store.load() {
                        if let Some(wanted) = &status {
                            if record.status.as_str() != wanted.trim().to_lowercase() {
                                continue;
                            }
                        }
                        println!("{}", serde_json::to_string(&record.to_row())?);
                    }
                    Ok(())
                }
                LessonCommands::Archive { lesson_id, reason } => {
                    let changed = store.archive(&lesson_id, &reason)?;
                    println!("archived {changed} lesson(s)");
                    Ok(())
                }
                LessonCommands::Migrate => {
                    let summary = store.migrate_legacy(&paths.lessons_path)?;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    Ok(())
                }
            }
        }

        Commands::Skills => {
            let entries = build_skill_manifest(&paths.skills_root, &paths.manifest_path)?;
            println!(
                "wrote {} entries to {}",
                entries.len(),
                paths.manifest_path.display()
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_full_run_flag_surface() {
        let cli = Cli::try_parse_from([
            "cortex",
            "--track-root",
            "/tmp/track",
            "run",
            "--task-id",
            "aggregate_report",
            "--session",
            "42",
            "--max-steps",
            "8",
            "--domain",
            "gridtool",
            "--learning-mode",
            "strict",
            "--architecture-mode",
            "simplified",
            "--bootstrap",
            "--cryptic-errors",
            "--enable-transfer-retrieval",
            "--transfer-retrieval-max-results",
            "2",
            "--transfer-retrieval-score-weight",
            "0.5",
            "--memory-v2-demo-mode",
            "--posttask-mode",
            "direct",
        ])
        .unwrap();
        let Commands::Run {
            task_id,
            session,
            domain,
            learning_mode,
            memory_v2_demo_mode,
            transfer_retrieval_max_results,
            ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(task_id, "aggregate_report");
        assert_eq!(session, 42);
        assert_eq!(domain, "gridtool");
        assert_eq!(learning_mode, LearningModeArg::Strict);
        assert!(memory_v2_demo_mode);
        assert_eq!(transfer_retrieval_max_results, 2);
    }

    #[test]
    fn conflicting_error_modes_are_rejected() {
        let parsed = Cli::try_parse_from([
            "cortex",
            "run",
            "--task-id",
            "t",
            "--session",
            "1",
            "--cryptic-errors",
            "--mixed-errors",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn error_style_resolution_prefers_mixed() {
        assert_eq!(error_style(false, false, false), ErrorStyle::Helpful);
        assert_eq!(error_style(true, false, false), ErrorStyle::Cryptic);
        assert_eq!(error_style(false, true, false), ErrorStyle::SemiHelpful);
        assert_eq!(error_style(false, false, true), ErrorStyle::Mixed);
    }
}
