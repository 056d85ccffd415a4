//! CLI route: single route table and run context. Dispatches to the
//! orchestrator and presentation.

use crate::api::Orchestrator;
use crate::config::{ConfigLoader, DarkroomConfig};
use crate::error::OrchestratorError;
use crate::model::{Parameters, SessionOrigin, PARAM_MODEL};
use crate::workflow::StepRequest;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::cli::command_name;
use crate::cli::parse::{Commands, SessionCommands, StepCommands, TaskCommands};
use crate::cli::presentation::{
    format_config, format_recovery_report, format_session, format_session_list, format_session_tree,
    format_step, format_step_view, format_sweep_report, format_task, format_tasks,
};

/// Runtime context for CLI execution: workspace, config and the orchestrator.
pub struct RunContext {
    orchestrator: Arc<Orchestrator>,
    workspace_root: PathBuf,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, OrchestratorError> {
        let config = load_config(&workspace_root, config_path.as_ref())?;
        let orchestrator = Orchestrator::open(config)?;
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            workspace_root,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, OrchestratorError> {
        let started = Instant::now();
        let name = command_name(command);
        let result = self.execute_inner(command).await;
        info!(
            command = %name,
            workspace = %self.workspace_root.display(),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        if let Err(e) = self.orchestrator.flush() {
            warn!(error = %e, "Failed to flush record store");
        }
        result
    }

    async fn execute_inner(&self, command: &Commands) -> Result<String, OrchestratorError> {
        let orchestrator = &self.orchestrator;
        match command {
            Commands::Run => self.run_until_interrupted().await,
            Commands::Sweep { format } => {
                let report = orchestrator.sweep_once().await?;
                format_sweep_report(&report, format)
            }
            Commands::Recover => {
                let report = orchestrator.recover_interrupted()?;
                Ok(format_recovery_report(&report))
            }
            Commands::Config => format_config(orchestrator.config()),
            Commands::Session { command } => self.handle_session(command),
            Commands::Step { command } => self.handle_step(command).await,
            Commands::Branch {
                artifact,
                prompt,
                params,
            } => {
                let overrides = if params.is_empty() {
                    None
                } else {
                    Some(parse_params(params)?)
                };
                let step = orchestrator.branch(artifact, prompt.clone(), overrides)?;
                Ok(format!("Created {}", format_step(&step)))
            }
            Commands::Select { artifact } => {
                let alternative = orchestrator.select(artifact)?;
                Ok(format!(
                    "Selected {} for {}",
                    alternative.artifact_ref, alternative.step_id
                ))
            }
            Commands::Tasks { all, format } => {
                let tasks = orchestrator.list_tasks(*all)?;
                let stats = orchestrator.retrieval_stats()?;
                format_tasks(&tasks, &stats, format)
            }
            Commands::Task { command } => match command {
                TaskCommands::Retry { task } => {
                    let task = orchestrator.retry_task(*task)?;
                    Ok(format!("Re-queued {}", format_task(&task)))
                }
                TaskCommands::Fetch { task } => {
                    let handle = orchestrator.retrieve_now(*task).await?;
                    Ok(format!(
                        "{} stored at {} ({} bytes)",
                        handle.key,
                        handle.path.display(),
                        handle.size_bytes
                    ))
                }
            },
        }
    }

    fn handle_session(&self, command: &SessionCommands) -> Result<String, OrchestratorError> {
        let orchestrator = &self.orchestrator;
        match command {
            SessionCommands::Start { from } => {
                let origin = match from {
                    Some(source) => SessionOrigin::Derived {
                        source_artifact_id: source.clone(),
                    },
                    None => SessionOrigin::Fresh,
                };
                let session = orchestrator.start_session(origin)?;
                Ok(format!("Started {}", format_session(&session)))
            }
            SessionCommands::Show { session, format } => {
                let record = orchestrator.get_session(*session)?;
                let steps = orchestrator.session_tree(*session)?;
                format_session_tree(&record, &steps, format)
            }
            SessionCommands::List => Ok(format_session_list(&orchestrator.list_sessions()?)),
            SessionCommands::Complete { session } => {
                Ok(format_session(&orchestrator.complete_session(*session)?))
            }
            SessionCommands::Abandon { session } => {
                Ok(format_session(&orchestrator.abandon_session(*session)?))
            }
        }
    }

    async fn handle_step(&self, command: &StepCommands) -> Result<String, OrchestratorError> {
        let orchestrator = &self.orchestrator;
        match command {
            StepCommands::Create {
                session,
                parent,
                prompt,
                negative,
                model,
                params,
                submit,
            } => {
                let mut parameters = parse_params(params)?;
                parameters.insert(PARAM_MODEL.to_string(), Value::String(model.clone()));
                let step = orchestrator.create_step(StepRequest {
                    session_id: *session,
                    parent_step_id: *parent,
                    prompt: prompt.clone(),
                    negative_prompt: negative.clone(),
                    parameters,
                })?;
                if *submit {
                    let step = orchestrator.submit(step.step_id).await?;
                    return Ok(format!("Submitted {}", format_step(&step)));
                }
                Ok(format!("Created {}", format_step(&step)))
            }
            StepCommands::Submit { step } => {
                let step = orchestrator.submit(*step).await?;
                Ok(format_step(&step))
            }
            StepCommands::Show { step, format } => {
                format_step_view(&orchestrator.step_view(*step)?, format)
            }
            StepCommands::Abandon { step } => Ok(format_step(&orchestrator.abandon(*step)?)),
            StepCommands::Resubmit { step } => {
                let retry = orchestrator.resubmit(*step).await?;
                Ok(format!("Resubmitted as {}", format_step(&retry)))
            }
        }
    }

    async fn run_until_interrupted(&self) -> Result<String, OrchestratorError> {
        let report = self.orchestrator.recover_interrupted()?;
        self.orchestrator.start_scheduler()?;
        let waited = tokio::signal::ctrl_c().await;
        self.orchestrator.stop_scheduler().await;
        waited.map_err(|e| {
            OrchestratorError::ConfigError(format!("Failed to listen for Ctrl-C: {}", e))
        })?;
        Ok(format!("Stopped.\n{}", format_recovery_report(&report)))
    }
}

fn load_config(
    workspace_root: &PathBuf,
    config_path: Option<&PathBuf>,
) -> Result<DarkroomConfig, OrchestratorError> {
    let config = match config_path {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load(workspace_root)?,
    };
    config.ensure_valid()?;
    Ok(config)
}

/// Parse `key=value` pairs; values that are valid JSON keep their type.
pub fn parse_params(pairs: &[String]) -> Result<Parameters, OrchestratorError> {
    let mut parameters = Parameters::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            OrchestratorError::Validation(format!("parameter '{}' is not key=value", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "parameter '{}' has an empty key",
                pair
            )));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        parameters.insert(key.to_string(), value);
    }
    Ok(parameters)
}
