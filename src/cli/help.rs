//! CLI command-name contract for logging and routing.

use crate::cli::parse::{Commands, SessionCommands, StepCommands, TaskCommands};

/// Command name string for logs (e.g. "step.submit", "tasks").
pub fn command_name(command: &Commands) -> String {
    match command {
        Commands::Run => "run".to_string(),
        Commands::Sweep { .. } => "sweep".to_string(),
        Commands::Recover => "recover".to_string(),
        Commands::Config => "config".to_string(),
        Commands::Session { command } => format!("session.{}", session_command_name(command)),
        Commands::Step { command } => format!("step.{}", step_command_name(command)),
        Commands::Branch { .. } => "branch".to_string(),
        Commands::Select { .. } => "select".to_string(),
        Commands::Tasks { .. } => "tasks".to_string(),
        Commands::Task { command } => format!("task.{}", task_command_name(command)),
    }
}

pub fn session_command_name(command: &SessionCommands) -> &'static str {
    match command {
        SessionCommands::Start { .. } => "start",
        SessionCommands::Show { .. } => "show",
        SessionCommands::List => "list",
        SessionCommands::Complete { .. } => "complete",
        SessionCommands::Abandon { .. } => "abandon",
    }
}

pub fn step_command_name(command: &StepCommands) -> &'static str {
    match command {
        StepCommands::Create { .. } => "create",
        StepCommands::Submit { .. } => "submit",
        StepCommands::Show { .. } => "show",
        StepCommands::Abandon { .. } => "abandon",
        StepCommands::Resubmit { .. } => "resubmit",
    }
}

pub fn task_command_name(command: &TaskCommands) -> &'static str {
    match command {
        TaskCommands::Retry { .. } => "retry",
        TaskCommands::Fetch { .. } => "fetch",
    }
}
