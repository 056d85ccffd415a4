//! CLI parse: clap types for darkroom. No behavior; definitions only.

use crate::types::{SessionId, StepId, TaskId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// darkroom - generation workflow orchestrator for the photo gallery
#[derive(Parser)]
#[command(name = "darkroom")]
#[command(about = "Drive image generation steps against an async backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recover interrupted work, then run the scheduler until Ctrl-C
    Run,
    /// Run one monitoring sweep and one retrieval sweep
    Sweep {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Repair steps and tasks interrupted by a previous process
    Recover,
    /// Print the effective configuration as TOML
    Config,
    /// Session operations
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Step operations
    Step {
        #[command(subcommand)]
        command: StepCommands,
    },
    /// Create a new step from an existing alternative
    Branch {
        /// Backend artifact id of the alternative to branch from
        artifact: String,
        /// Replacement prompt (default: inherited)
        #[arg(long)]
        prompt: Option<String>,
        /// Parameter overrides as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },
    /// Select an alternative of its step
    Select {
        /// Backend artifact id
        artifact: String,
    },
    /// List retrieval tasks
    Tasks {
        /// Include completed tasks
        #[arg(long)]
        all: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Retrieval task operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Start a session, optionally derived from an existing image
    Start {
        /// Source artifact id for a derived session
        #[arg(long)]
        from: Option<String>,
    },
    /// Show a session and its step tree
    Show {
        session: SessionId,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List sessions
    List,
    /// Close a session as completed
    Complete { session: SessionId },
    /// Close a session as abandoned
    Abandon { session: SessionId },
}

#[derive(Subcommand)]
pub enum StepCommands {
    /// Create a step (no backend call yet)
    Create {
        /// Owning session
        #[arg(long)]
        session: SessionId,
        /// Parent step (omit for a root step)
        #[arg(long)]
        parent: Option<StepId>,
        /// Prompt text
        #[arg(long)]
        prompt: String,
        /// Negative prompt text
        #[arg(long)]
        negative: Option<String>,
        /// Model reference
        #[arg(long)]
        model: String,
        /// Additional parameters as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
        /// Submit right after creation
        #[arg(long)]
        submit: bool,
    },
    /// Submit a created step
    Submit { step: StepId },
    /// Show a step and its alternatives
    Show {
        step: StepId,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Abandon an in-flight step
    Abandon { step: StepId },
    /// Create and submit a fresh sibling of a failed step
    Resubmit { step: StepId },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Give a terminally failed task a fresh set of attempts
    Retry { task: TaskId },
    /// Retrieve one task immediately
    Fetch { task: TaskId },
}
