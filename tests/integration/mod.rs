//! Integration tests for the darkroom generation workflow orchestrator

mod scheduler;
mod step_lifecycle;
mod test_utils;
mod tree_manager;
