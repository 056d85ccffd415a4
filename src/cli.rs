//! CLI domain: parse, route, help, output, and presentation only.
//! No workflow logic; the route table dispatches to the orchestrator.

mod help;
mod output;
mod parse;
mod presentation;
mod route;

pub use help::command_name;
pub use output::map_error;
pub use parse::{Cli, Commands, SessionCommands, StepCommands, TaskCommands};
pub use route::RunContext;
